//! API and Database Models
//!
//! This module defines the core data structures used for both database mapping
//! with `sqlx` and for generating OpenAPI documentation with `utoipa`.

use autodidact_core::interruption::Interruption;
use autodidact_core::orchestrator::TurnOutcome;
use autodidact_core::progression::GraphNode;
use autodidact_core::session::{ProgressInfo, ProgressStatus, Role, SessionState, Turn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(sqlx::Type, Debug, Serialize, Deserialize, ToSchema, Clone, Copy, PartialEq)]
#[sqlx(type_name = "session_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Completed,
}

/// A session's lifecycle row. The engine state lives next to it as a JSON blob.
#[derive(Serialize, Deserialize, ToSchema, FromRow, Debug, Clone)]
pub struct Session {
    #[schema(value_type = String, format = Uuid)]
    pub id: Uuid,
    #[schema(value_type = String, format = Uuid)]
    pub project_id: Uuid,
    #[schema(value_type = String, format = Uuid)]
    pub node_id: Uuid,
    /// 1-based, per project.
    pub session_number: i32,
    #[schema(value_type = String, example = "in_progress")]
    pub status: SessionStatus,
    pub final_score: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    pub turn_index: i32,
    #[schema(example = "assistant")]
    pub role: String,
    pub content: String,
}

#[derive(Deserialize, ToSchema)]
pub struct CreateSessionPayload {
    #[schema(value_type = String, format = Uuid)]
    pub project_id: Uuid,
    #[schema(value_type = String, format = Uuid)]
    pub node_id: Uuid,
}

#[derive(Deserialize, ToSchema)]
pub struct TurnPayload {
    #[schema(example = "A derivative measures how fast something changes.")]
    pub message: String,
}

/// An image that is now visible to the learner.
#[derive(Deserialize, ToSchema)]
pub struct ImagePayload {
    #[schema(example = "https://example.com/tangent-line.png")]
    pub url: String,
    #[serde(default)]
    #[schema(example = "Tangent line touching a curve")]
    pub description: String,
    /// What the image illustrates in the lesson.
    #[serde(default)]
    pub context: String,
}

#[derive(Serialize, ToSchema, Debug, Clone, PartialEq)]
pub struct ImagesResponse {
    /// Images the tutor currently remembers for this session.
    pub cached_images: usize,
}

#[derive(Serialize, ToSchema, Debug, Clone, PartialEq)]
pub struct ProgressItemView {
    pub description: String,
    #[schema(example = "current")]
    pub status: String,
    pub index: usize,
}

#[derive(Serialize, ToSchema, Debug, Clone, PartialEq)]
pub struct ProgressView {
    pub items: Vec<ProgressItemView>,
    pub total: usize,
    pub completed_count: usize,
    pub current_index: usize,
}

impl From<ProgressInfo> for ProgressView {
    fn from(info: ProgressInfo) -> Self {
        Self {
            items: info
                .items
                .into_iter()
                .map(|item| ProgressItemView {
                    description: item.description,
                    status: match item.status {
                        ProgressStatus::Completed => "completed",
                        ProgressStatus::Current => "current",
                        ProgressStatus::Upcoming => "upcoming",
                    }
                    .to_string(),
                    index: item.index,
                })
                .collect(),
            total: info.total,
            completed_count: info.completed_count,
            current_index: info.current_index,
        }
    }
}

/// The result of a learner turn, an exit request or session creation.
#[derive(Serialize, ToSchema, Debug, Clone)]
pub struct TurnResponse {
    #[schema(value_type = String, format = Uuid)]
    pub session_id: Uuid,
    #[schema(example = "teaching")]
    pub phase: String,
    /// Assistant messages produced by this turn, in order.
    pub replies: Vec<String>,
    /// True when the tutor's decision could not be read; the learner may simply continue.
    pub decision_pending: bool,
    pub progress: ProgressView,
    pub final_score: Option<f64>,
}

impl TurnResponse {
    pub fn from_outcome(session_id: Uuid, outcome: TurnOutcome) -> Self {
        let completed = outcome.state.current_phase == autodidact_core::Phase::Completed;
        Self {
            session_id,
            phase: outcome.state.current_phase.to_string(),
            replies: outcome.replies,
            decision_pending: outcome.pending_decision.is_some(),
            progress: outcome.state.progress_info().into(),
            final_score: completed.then(|| outcome.state.final_score()),
        }
    }
}

#[derive(Serialize, ToSchema, Debug, Clone)]
pub struct CreateSessionResponse {
    pub session: Session,
    pub turn: TurnResponse,
}

#[derive(Serialize, ToSchema, Debug, Clone, PartialEq)]
pub struct MessageView {
    #[schema(example = "assistant")]
    pub role: String,
    pub content: String,
}

impl From<&Turn> for MessageView {
    fn from(turn: &Turn) -> Self {
        Self {
            role: match turn.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            }
            .to_string(),
            content: turn.content.clone(),
        }
    }
}

/// A session together with the learner-visible parts of its engine state.
#[derive(Serialize, ToSchema, Debug, Clone)]
pub struct SessionStateResponse {
    pub session: Session,
    #[schema(example = "recap")]
    pub phase: String,
    pub node_title: String,
    pub history: Vec<MessageView>,
    pub progress: ProgressView,
    pub completed_objectives: Vec<String>,
    pub exit_requested: bool,
    pub interruption_detected: bool,
    pub duration_minutes: f64,
    pub completion_percentage: f64,
    /// Set once the session is graded.
    pub final_score: Option<f64>,
}

impl SessionStateResponse {
    pub fn new(session: Session, state: &SessionState) -> Self {
        let completion = state.completion_info();
        Self {
            session,
            phase: state.current_phase.to_string(),
            node_title: state.node_title.clone(),
            history: state.history.iter().map(MessageView::from).collect(),
            progress: state.progress_info().into(),
            completed_objectives: state.completed_objectives.clone(),
            exit_requested: state.exit_requested,
            interruption_detected: state.interruption_detected,
            duration_minutes: state.duration_minutes(),
            completion_percentage: completion.completion_percentage,
            final_score: completion.session_end.map(|_| completion.final_score),
        }
    }
}

#[derive(Serialize, ToSchema, Debug, Clone, PartialEq)]
pub struct ResumeResponse {
    pub interrupted: bool,
    pub minutes_elapsed: f64,
    pub welcome_back: Option<String>,
    #[schema(example = "teaching")]
    pub phase: String,
}

impl ResumeResponse {
    pub fn new(interruption: Interruption, welcome_back: Option<String>, state: &SessionState) -> Self {
        Self {
            interrupted: interruption.interrupted,
            minutes_elapsed: (interruption.minutes_elapsed * 10.0).round() / 10.0,
            welcome_back,
            phase: state.current_phase.to_string(),
        }
    }
}

/// A node the learner may study next.
#[derive(Serialize, ToSchema, Debug, Clone, PartialEq)]
pub struct NextNode {
    #[schema(value_type = String, format = Uuid)]
    pub id: String,
    pub label: String,
    pub mastery: f64,
}

impl From<&GraphNode> for NextNode {
    fn from(node: &GraphNode) -> Self {
        Self {
            id: node.id.clone(),
            label: node.label.clone(),
            mastery: node.mastery,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use autodidact_core::Phase;
    use autodidact_core::llm_client::TokenUsage;
    use autodidact_core::objective::Objective;
    use autodidact_core::persistence::TurnEffects;
    use chrono::TimeZone;

    fn sample_session() -> Session {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();
        Session {
            id: Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap(),
            project_id: Uuid::new_v4(),
            node_id: Uuid::new_v4(),
            session_number: 2,
            status: SessionStatus::InProgress,
            final_score: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn sample_state() -> SessionState {
        let mut state = SessionState::new("s1", "p1", "n1");
        state.partition_objectives(vec![
            Objective::new("o1", "Define a derivative", 0.2),
            Objective::new("o2", "Apply the power rule", 0.0),
        ]);
        state.completed_objectives.push("o1".into());
        state.objective_idx = 1;
        state.current_phase = Phase::Teaching;
        state.history = vec![Turn::assistant("Welcome"), Turn::user("Hi")];
        state
    }

    #[test]
    fn test_session_status_serialization() {
        assert_eq!(
            serde_json::to_string(&SessionStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert_eq!(
            serde_json::from_str::<SessionStatus>("\"completed\"").unwrap(),
            SessionStatus::Completed
        );
        assert!(serde_json::from_str::<SessionStatus>("\"Ended\"").is_err());
    }

    #[test]
    fn test_session_serialization() {
        let session = sample_session();
        let json = serde_json::to_string(&session).unwrap();
        assert!(json.contains("\"session_number\":2"));
        assert!(json.contains("in_progress"));

        let deserialized: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.id, session.id);
        assert_eq!(deserialized.created_at, session.created_at);
        assert_eq!(deserialized.final_score, None);
    }

    #[test]
    fn test_create_session_payload_requires_ids() {
        let project = Uuid::new_v4();
        let node = Uuid::new_v4();
        let json = format!(r#"{{"project_id": "{}", "node_id": "{}"}}"#, project, node);
        let payload: CreateSessionPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(payload.project_id, project);
        assert_eq!(payload.node_id, node);

        assert!(serde_json::from_str::<CreateSessionPayload>(r#"{"project_id": "nope"}"#).is_err());
    }

    #[test]
    fn test_progress_view_from_state() {
        let view: ProgressView = sample_state().progress_info().into();
        assert_eq!(view.total, 2);
        assert_eq!(view.completed_count, 1);
        assert_eq!(view.items[0].status, "completed");
        assert_eq!(view.items[1].status, "current");
    }

    #[test]
    fn test_turn_response_from_outcome() {
        let state = sample_state();
        let outcome = TurnOutcome {
            state,
            replies: vec!["Nice work!".into()],
            transitions: vec![],
            usage: TokenUsage::default(),
            pending_decision: None,
            effects: TurnEffects::default(),
        };
        let response = TurnResponse::from_outcome(Uuid::nil(), outcome);
        assert_eq!(response.phase, "teaching");
        assert_eq!(response.replies, ["Nice work!"]);
        assert!(!response.decision_pending);
        assert_eq!(response.final_score, None);
    }

    #[test]
    fn test_session_state_response_hides_engine_details() {
        let response = SessionStateResponse::new(sample_session(), &sample_state());
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["phase"], "teaching");
        assert_eq!(json["history"][0]["role"], "assistant");
        assert_eq!(json["history"][1]["content"], "Hi");
        assert_eq!(json["completion_percentage"], 50.0);
        assert!(json["final_score"].is_null());
        assert!(json.get("quiz").is_none());
        assert!(json.get("learner_profile_context").is_none());
    }

    #[test]
    fn test_image_payload_defaults() {
        let payload: ImagePayload =
            serde_json::from_str(r#"{"url": "https://img/tangent.png"}"#).unwrap();
        assert_eq!(payload.url, "https://img/tangent.png");
        assert!(payload.description.is_empty());
        assert!(payload.context.is_empty());
    }

    #[test]
    fn test_error_response_serialization() {
        let error = ErrorResponse {
            message: "Session not found".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&error).unwrap(),
            r#"{"message":"Session not found"}"#
        );
    }
}
