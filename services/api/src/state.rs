//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds all shared,
//! clonable resources like database pools and the tutoring engine.

use autodidact_core::Orchestrator;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<crate::db::Db>,
    pub orchestrator: Arc<Orchestrator>,
    pub session_locks: Arc<SessionLocks>,
}

/// One async mutex per session, so at most one turn per session is in flight.
#[derive(Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    /// Waits until no other turn holds `session_id`. The lock is released when
    /// the guard is dropped.
    pub async fn acquire(&self, session_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Drop entries nobody is holding or waiting on.
            locks.retain(|id, lock| *id == session_id || Arc::strong_count(lock) > 1);
            locks.entry(session_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    pub async fn tracked_sessions(&self) -> usize {
        self.locks.lock().await.len()
    }
}
