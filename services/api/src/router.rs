//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the REST API and OpenAPI documentation.

use crate::{
    handlers,
    models::{
        CreateSessionPayload, CreateSessionResponse, ErrorResponse, ImagePayload, ImagesResponse,
        MessageView, NextNode, ProgressItemView, ProgressView, ResumeResponse, Session, SessionStateResponse,
        SessionStatus, TranscriptEntry, TurnPayload, TurnResponse,
    },
    state::AppState,
};

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::create_session,
        handlers::get_session,
        handlers::get_transcript,
        handlers::post_turn,
        handlers::request_exit,
        handlers::resume_session,
        handlers::force_complete,
        handlers::record_image,
        handlers::next_nodes,
    ),
    components(
        schemas(
            Session, SessionStatus, CreateSessionPayload, CreateSessionResponse, TurnPayload,
            TurnResponse, ProgressView, ProgressItemView, SessionStateResponse, MessageView,
            TranscriptEntry, ResumeResponse, ImagePayload, ImagesResponse, NextNode, ErrorResponse
        )
    ),
    tags(
        (name = "Autodidact API", description = "Adaptive tutoring sessions over a prerequisite graph")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/sessions", post(handlers::create_session))
        .route("/sessions/{id}", get(handlers::get_session))
        .route("/sessions/{id}/transcript", get(handlers::get_transcript))
        .route("/sessions/{id}/turns", post(handlers::post_turn))
        .route("/sessions/{id}/exit", post(handlers::request_exit))
        .route("/sessions/{id}/resume", post(handlers::resume_session))
        .route("/sessions/{id}/force-complete", post(handlers::force_complete))
        .route("/sessions/{id}/images", post(handlers::record_image))
        .route("/projects/{id}/next-nodes", get(handlers::next_nodes))
        // Apply the state ONLY to this group of routes.
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
