//! Autodidact API Library Crate
//!
//! This library contains the HTTP service around the tutoring engine:
//! configuration, database access, API handlers and routing. The binaries
//! are thin wrappers around it.

pub mod config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
