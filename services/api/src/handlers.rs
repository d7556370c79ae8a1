//! Axum Handlers for the REST API
//!
//! This module contains the logic for handling HTTP requests for tutoring sessions.
//! It uses `utoipa` doc comments to generate OpenAPI documentation.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use autodidact_core::curriculum::CurriculumStore;
use autodidact_core::persistence::SessionStore;
use autodidact_core::session::{ImageRef, SessionState};
use autodidact_core::{Orchestrator, TurnError, TurnOutcome};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    models::{
        CreateSessionPayload, CreateSessionResponse, ErrorResponse, ImagePayload, ImagesResponse,
        NextNode, ResumeResponse, SessionStateResponse, TranscriptEntry, TurnPayload,
        TurnResponse,
    },
    state::AppState,
};

/// Longest learner message accepted in one turn, in characters.
pub const MAX_MESSAGE_CHARS: usize = 8_000;

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    /// The text-generation provider failed or replied with something unusable.
    BadGateway(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::Conflict(message) => {
                (StatusCode::CONFLICT, Json(ErrorResponse { message })).into_response()
            }
            ApiError::BadGateway(message) => {
                (StatusCode::BAD_GATEWAY, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

impl ApiError {
    /// Maps an engine failure to a learner-safe response. Turn errors never
    /// leave partial state behind, so every one of these is retryable.
    pub fn from_turn(err: TurnError) -> Self {
        match err {
            TurnError::NodeNotFound(id) => Self::NotFound(format!("Node with id '{}' not found", id)),
            TurnError::SessionNotFound(id) => {
                Self::NotFound(format!("Session with id '{}' not found", id))
            }
            TurnError::SessionCompleted => {
                Self::Conflict("This session is already complete.".to_string())
            }
            TurnError::Generation(e) => {
                error!(error = %e, "Text generation failed");
                Self::BadGateway("The tutor is unavailable right now. Please try again.".to_string())
            }
            TurnError::Protocol(e) => {
                warn!(error = %e, "Tutor reply could not be interpreted");
                Self::BadGateway(
                    "The tutor's reply could not be understood. Please try again.".to_string(),
                )
            }
            TurnError::Storage(e) => Self::InternalServerError(e),
            err @ TurnError::InvariantViolation(_) => Self::InternalServerError(err.into()),
        }
    }
}

fn check_message(message: &str) -> Result<(), ApiError> {
    if message.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ApiError::BadRequest(format!(
            "message must be at most {} characters",
            MAX_MESSAGE_CHARS
        )));
    }
    Ok(())
}

/// Start a tutoring session on a curriculum node.
#[utoipa::path(
    post,
    path = "/sessions",
    request_body = CreateSessionPayload,
    responses(
        (status = 201, description = "Session created and first turn taken", body = CreateSessionResponse),
        (status = 404, description = "Node not found in project", body = ErrorResponse),
        (status = 502, description = "Text generation failed", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateSessionPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let not_found = || {
        ApiError::NotFound(format!(
            "Node '{}' not found in project '{}'",
            payload.node_id, payload.project_id
        ))
    };
    if !state
        .db
        .node_in_project(payload.project_id, payload.node_id)
        .await?
    {
        return Err(not_found());
    }

    let session_id = Uuid::new_v4();
    let outcome = first_turn(&state.orchestrator, session_id, &payload).await?;
    let session = state
        .db
        .create_session(session_id, payload.project_id, payload.node_id, &outcome.state)
        .await?
        .ok_or_else(not_found)?;
    info!(session_id = %session.id, session_number = session.session_number, "Session created");

    let turn = TurnResponse::from_outcome(session.id, outcome);
    Ok((StatusCode::CREATED, Json(CreateSessionResponse { session, turn })))
}

/// Runs the opening turn of a session that is not stored yet. Nothing is
/// written here, so a failed first turn leaves no session behind.
async fn first_turn(
    orchestrator: &Orchestrator,
    session_id: Uuid,
    payload: &CreateSessionPayload,
) -> Result<TurnOutcome, ApiError> {
    let initial = SessionState::new(
        session_id.to_string(),
        payload.project_id.to_string(),
        payload.node_id.to_string(),
    );
    orchestrator
        .advance(&initial, None)
        .await
        .map_err(ApiError::from_turn)
}

/// Get a session with its transcript and progress.
#[utoipa::path(
    get,
    path = "/sessions/{id}",
    responses(
        (status = 200, description = "Session details", body = SessionStateResponse),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID")
    )
)]
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionStateResponse>, ApiError> {
    let not_found = || ApiError::NotFound(format!("Session with id '{}' not found", id));
    let session = state.db.get_session(id).await?.ok_or_else(not_found)?;
    let engine_state = state.db.load(&id.to_string()).await?.ok_or_else(not_found)?;
    Ok(Json(SessionStateResponse::new(session, &engine_state)))
}

/// Get the stored transcript of a session.
#[utoipa::path(
    get,
    path = "/sessions/{id}/transcript",
    responses(
        (status = 200, description = "Transcript in turn order", body = [TranscriptEntry]),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID")
    )
)]
pub async fn get_transcript(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<TranscriptEntry>>, ApiError> {
    state
        .db
        .get_session(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Session with id '{}' not found", id)))?;
    Ok(Json(state.db.get_transcript(id).await?))
}

/// Send a learner message and receive the tutor's replies.
#[utoipa::path(
    post,
    path = "/sessions/{id}/turns",
    request_body = TurnPayload,
    responses(
        (status = 200, description = "Turn committed", body = TurnResponse),
        (status = 400, description = "Message too long", body = ErrorResponse),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 409, description = "Session already complete", body = ErrorResponse),
        (status = 502, description = "Text generation failed; nothing was committed", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID")
    )
)]
pub async fn post_turn(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<TurnPayload>,
) -> Result<Json<TurnResponse>, ApiError> {
    check_message(&payload.message)?;
    let _guard = state.session_locks.acquire(id).await;
    let outcome = state
        .orchestrator
        .take_turn(&id.to_string(), Some(&payload.message))
        .await
        .map_err(ApiError::from_turn)?;
    Ok(Json(TurnResponse::from_outcome(id, outcome)))
}

/// Stop teaching early and go to the final test on what was covered.
#[utoipa::path(
    post,
    path = "/sessions/{id}/exit",
    responses(
        (status = 200, description = "Exit applied", body = TurnResponse),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 409, description = "Session already complete", body = ErrorResponse),
        (status = 502, description = "Text generation failed; nothing was committed", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID")
    )
)]
pub async fn request_exit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TurnResponse>, ApiError> {
    let _guard = state.session_locks.acquire(id).await;
    let outcome = state
        .orchestrator
        .request_exit(&id.to_string())
        .await
        .map_err(ApiError::from_turn)?;
    Ok(Json(TurnResponse::from_outcome(id, outcome)))
}

/// Reopen a session, reporting whether the learner was away long enough to be greeted.
#[utoipa::path(
    post,
    path = "/sessions/{id}/resume",
    responses(
        (status = 200, description = "Session resumed", body = ResumeResponse),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID")
    )
)]
pub async fn resume_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ResumeResponse>, ApiError> {
    let _guard = state.session_locks.acquire(id).await;
    let outcome = state
        .orchestrator
        .resume(&id.to_string())
        .await
        .map_err(ApiError::from_turn)?;
    Ok(Json(ResumeResponse::new(
        outcome.interruption,
        outcome.welcome_back,
        &outcome.state,
    )))
}

/// Finish a session at once, overwriting the node's mastery with the override score.
#[utoipa::path(
    post,
    path = "/sessions/{id}/force-complete",
    responses(
        (status = 200, description = "Session completed", body = TurnResponse),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 409, description = "Session already complete", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID")
    )
)]
pub async fn force_complete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TurnResponse>, ApiError> {
    let _guard = state.session_locks.acquire(id).await;
    let outcome = state
        .orchestrator
        .force_complete(&id.to_string())
        .await
        .map_err(ApiError::from_turn)?;
    Ok(Json(TurnResponse::from_outcome(id, outcome)))
}

/// Report an image the learner is now looking at.
#[utoipa::path(
    post,
    path = "/sessions/{id}/images",
    request_body = ImagePayload,
    responses(
        (status = 200, description = "Image recorded", body = ImagesResponse),
        (status = 400, description = "Missing image url", body = ErrorResponse),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID")
    )
)]
pub async fn record_image(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ImagePayload>,
) -> Result<Json<ImagesResponse>, ApiError> {
    let image = image_ref(payload)?;
    let _guard = state.session_locks.acquire(id).await;
    let session = state
        .orchestrator
        .record_image(&id.to_string(), image)
        .await
        .map_err(ApiError::from_turn)?;
    Ok(Json(ImagesResponse {
        cached_images: session.displayed_images.len(),
    }))
}

fn image_ref(payload: ImagePayload) -> Result<ImageRef, ApiError> {
    let url = payload.url.trim();
    if url.is_empty() {
        return Err(ApiError::BadRequest("url must not be empty".to_string()));
    }
    Ok(ImageRef {
        url: url.to_string(),
        description: payload.description,
        context: payload.context,
    })
}

/// List unlocked nodes the learner has not mastered yet, weakest first.
#[utoipa::path(
    get,
    path = "/projects/{id}/next-nodes",
    responses(
        (status = 200, description = "Candidate nodes", body = [NextNode]),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Project ID")
    )
)]
pub async fn next_nodes(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<NextNode>>, ApiError> {
    let graph = state.db.project_graph(&id.to_string()).await?;
    Ok(Json(graph.next_nodes().into_iter().map(NextNode::from).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use autodidact_core::control::ControlError;
    use autodidact_core::curriculum::{InMemoryCurriculum, NodeRecord};
    use autodidact_core::llm_client::{
        Completion, GenerationError, GenerationOptions, Prompt, RetryPolicy, TextGenerator,
        TokenUsage,
    };
    use autodidact_core::objective::Objective;
    use autodidact_core::persistence::InMemorySessionStore;
    use autodidact_core::personalization::NoPersonalization;
    use autodidact_core::prompts::PromptLibrary;
    use autodidact_core::{OrchestratorSettings, Phase};
    use std::time::Duration;

    /// Replies with `reply`, or fails when it is `None`.
    struct FixedGenerator {
        reply: Option<&'static str>,
    }

    #[async_trait]
    impl TextGenerator for FixedGenerator {
        async fn complete(
            &self,
            _prompt: &Prompt,
            _options: &GenerationOptions,
        ) -> Result<Completion, GenerationError> {
            match self.reply {
                Some(text) => Ok(Completion {
                    text: text.to_string(),
                    usage: TokenUsage::default(),
                }),
                None => Err(GenerationError::Transient("provider unavailable".into())),
            }
        }
    }

    async fn engine(
        reply: Option<&'static str>,
        project_id: Uuid,
        node_id: Uuid,
    ) -> (Orchestrator, Arc<InMemorySessionStore>) {
        let curriculum = Arc::new(InMemoryCurriculum::new());
        curriculum
            .insert_node(NodeRecord {
                id: node_id.to_string(),
                original_id: "derivatives".into(),
                project_id: project_id.to_string(),
                title: "Derivatives".into(),
                topic: "Calculus".into(),
                references: vec![],
                objectives: vec![Objective::new("o1", "Define a derivative", 0.0)],
            })
            .await;
        let sessions = Arc::new(InMemorySessionStore::with_curriculum(curriculum.clone()));
        let settings = OrchestratorSettings {
            retry: RetryPolicy {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(1),
            },
            ..OrchestratorSettings::default()
        };
        let orchestrator = Orchestrator::new(
            Arc::new(FixedGenerator { reply }),
            curriculum,
            Arc::new(NoPersonalization),
            sessions.clone(),
            Arc::new(PromptLibrary::default()),
            settings,
        );
        (orchestrator, sessions)
    }

    #[tokio::test]
    async fn test_failed_first_turn_stores_nothing() {
        let (project_id, node_id) = (Uuid::new_v4(), Uuid::new_v4());
        let (orchestrator, sessions) = engine(None, project_id, node_id).await;
        let session_id = Uuid::new_v4();
        let payload = CreateSessionPayload { project_id, node_id };

        let err = first_turn(&orchestrator, session_id, &payload).await.err().unwrap();
        assert_eq!(status(err), StatusCode::BAD_GATEWAY);
        assert!(sessions.raw(&session_id.to_string()).await.is_none());
    }

    #[tokio::test]
    async fn test_first_turn_builds_the_opening_state() {
        let (project_id, node_id) = (Uuid::new_v4(), Uuid::new_v4());
        let (orchestrator, sessions) = engine(
            Some("What does a derivative measure? <control>{\"objective_complete\": false}</control>"),
            project_id,
            node_id,
        )
        .await;
        let session_id = Uuid::new_v4();
        let payload = CreateSessionPayload { project_id, node_id };

        let outcome = first_turn(&orchestrator, session_id, &payload).await.ok().unwrap();
        assert_eq!(outcome.state.session_id, session_id.to_string());
        assert_eq!(outcome.state.current_phase, Phase::Teaching);
        assert_eq!(outcome.replies.len(), 2);
        assert!(outcome.effects.is_empty());
        assert!(sessions.raw(&session_id.to_string()).await.is_none());
    }

    #[test]
    fn test_image_payload_requires_url() {
        let blank = ImagePayload {
            url: "  ".into(),
            description: "Tangent line".into(),
            context: String::new(),
        };
        assert!(matches!(image_ref(blank), Err(ApiError::BadRequest(_))));

        let image = image_ref(ImagePayload {
            url: " https://img/tangent.png ".into(),
            description: "Tangent line".into(),
            context: "slope".into(),
        })
        .ok()
        .unwrap();
        assert_eq!(image.url, "https://img/tangent.png");
        assert_eq!(image.context, "slope");
    }

    fn status(err: ApiError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn test_turn_errors_map_to_statuses() {
        assert_eq!(
            status(ApiError::from_turn(TurnError::SessionNotFound("s".into()))),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(ApiError::from_turn(TurnError::NodeNotFound("n".into()))),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(ApiError::from_turn(TurnError::SessionCompleted)),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(ApiError::from_turn(TurnError::Generation(
                GenerationError::AuthFailure("bad key".into())
            ))),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status(ApiError::from_turn(TurnError::Protocol(ControlError::Missing(
                "grading"
            )))),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status(ApiError::from_turn(TurnError::InvariantViolation("cursor".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status(ApiError::from_turn(TurnError::Storage(anyhow::anyhow!("db down")))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_generation_errors_do_not_leak_details() {
        let err = ApiError::from_turn(TurnError::Generation(GenerationError::AuthFailure(
            "sk-secret rejected".into(),
        )));
        match err {
            ApiError::BadGateway(message) => assert!(!message.contains("sk-secret")),
            _ => panic!("Expected BadGateway"),
        }
    }

    #[test]
    fn test_message_length_limit() {
        assert!(check_message("hello").is_ok());
        assert!(check_message(&"x".repeat(MAX_MESSAGE_CHARS)).is_ok());
        assert!(matches!(
            check_message(&"x".repeat(MAX_MESSAGE_CHARS + 1)),
            Err(ApiError::BadRequest(_))
        ));
    }
}
