//! Session Persistence
//!
//! A session is stored as one versioned JSON record. Restoration is explicit:
//! the stored blob is never assumed to match the in-memory layout, so older
//! records are upgraded field by field before typed deserialization.

use crate::curriculum::InMemoryCurriculum;
use crate::objective::{MasteryUpdate, ScoreMap};
use crate::session::{SessionState, now_timestamp, parse_timestamp};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Layout version written by [`serialize_state`].
pub const RECORD_VERSION: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("failed to serialize session state: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to restore session state: {0}")]
    Restore(String),
    #[error("unsupported session record version {0}")]
    UnsupportedVersion(u32),
}

/// The durable envelope around a serialized `SessionState`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub version: u32,
    pub state: Value,
}

/// Serializes `state` into a versioned record.
pub fn serialize_state(state: &SessionState) -> Result<Value, PersistenceError> {
    let record = SessionRecord {
        version: RECORD_VERSION,
        state: serde_json::to_value(state).map_err(PersistenceError::Serialize)?,
    };
    serde_json::to_value(record).map_err(PersistenceError::Serialize)
}

/// Rebuilds a typed `SessionState` from a stored blob.
///
/// Accepts the current versioned envelope and the legacy flat layout
/// (version 1), where quiz questions and answers were stored as plain strings.
pub fn restore_state(blob: Value) -> Result<SessionState, PersistenceError> {
    let Value::Object(mut map) = blob else {
        return Err(PersistenceError::Restore("record is not an object".to_string()));
    };

    let is_envelope = map.contains_key("version") && map.contains_key("state");
    let (version, state) = if is_envelope {
        let version = map
            .get("version")
            .and_then(Value::as_u64)
            .ok_or_else(|| PersistenceError::Restore("invalid record version".to_string()))?;
        let state = map.remove("state").unwrap_or(Value::Null);
        (u32::try_from(version).unwrap_or(u32::MAX), state)
    } else {
        (1, Value::Object(map))
    };

    let state = match version {
        1 => upgrade_v1(state)?,
        RECORD_VERSION => state,
        other => return Err(PersistenceError::UnsupportedVersion(other)),
    };
    serde_json::from_value(state).map_err(|e| PersistenceError::Restore(e.to_string()))
}

/// Upgrades a version-1 flat state map to the current layout.
fn upgrade_v1(state: Value) -> Result<Value, PersistenceError> {
    let Value::Object(map) = state else {
        return Err(PersistenceError::Restore("legacy state is not an object".to_string()));
    };
    // Nulls fall back to field defaults.
    let mut map: Map<String, Value> = map.into_iter().filter(|(_, v)| !v.is_null()).collect();

    for key in ["session_start", "last_message_ts", "session_end"] {
        if let Some(normalized) = map
            .get(key)
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
            .map(|ts| ts.to_rfc3339())
        {
            map.insert(key.to_string(), Value::String(normalized));
        }
    }
    if !map.contains_key("session_start") {
        map.insert("session_start".to_string(), Value::String(now_timestamp()));
    }
    if !map.contains_key("current_phase") {
        map.insert("current_phase".to_string(), json!("load_context"));
    }

    let questions: Vec<Value> = match map.remove("final_test_questions") {
        Some(Value::Array(items)) => items.into_iter().map(upgrade_question).collect(),
        _ => Vec::new(),
    };
    let answered_at = map
        .get("last_message_ts")
        .or_else(|| map.get("session_start"))
        .cloned()
        .unwrap_or(Value::String(now_timestamp()));
    let answers: Vec<Value> = match map.remove("final_test_answers") {
        Some(Value::Array(items)) => items
            .into_iter()
            .enumerate()
            .map(|(idx, answer)| match answer {
                Value::String(text) => json!({
                    "question_idx": idx,
                    "question": questions.get(idx).cloned().unwrap_or_else(|| upgrade_question(json!(""))),
                    "answer": text,
                    "timestamp": answered_at,
                }),
                typed => typed,
            })
            .collect(),
        _ => Vec::new(),
    };

    if !map.contains_key("quiz") {
        let question_idx = map
            .remove("question_idx")
            .unwrap_or_else(|| json!(answers.len()));
        let awaiting_answer = map.remove("awaiting_answer").unwrap_or(json!(false));
        map.insert(
            "quiz".to_string(),
            json!({
                "questions": questions,
                "answers": answers,
                "question_idx": question_idx,
                "awaiting_answer": awaiting_answer,
            }),
        );
    }

    tracing::debug!("Upgraded version-1 session record");
    Ok(Value::Object(map))
}

fn upgrade_question(question: Value) -> Value {
    match question {
        Value::String(text) => json!({
            "q": text,
            "type": "free",
            "answer": "",
            "objective_ids": [],
        }),
        typed => typed,
    }
}

/// Result of a best-effort save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// The store has no session with this id; nothing was written.
    UnknownSession,
}

/// A mastery change to fold into a node's objectives.
#[derive(Debug, Clone, PartialEq)]
pub struct MasteryChange {
    pub node_id: String,
    pub scores: ScoreMap,
    pub mode: MasteryUpdate,
}

/// Durable writes a turn produces besides the session record itself.
///
/// They are handed to [`SessionStore::commit`] together with the new state so
/// that either all of them become visible or none do.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnEffects {
    pub mastery: Option<MasteryChange>,
    /// Final score of a session that finished during the turn.
    pub completed: Option<f64>,
}

impl TurnEffects {
    pub fn is_empty(&self) -> bool {
        self.mastery.is_none() && self.completed.is_none()
    }
}

/// Durable storage for session records.
///
/// The store is a backup of session state, not the authority on whether a
/// session exists: committing an unregistered session is a no-op.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Overwrites the stored record for `state.session_id` and applies
    /// `effects`, all or nothing.
    async fn commit(&self, state: &SessionState, effects: &TurnEffects) -> Result<SaveOutcome>;

    /// Overwrites the stored record without further effects.
    async fn save(&self, state: &SessionState) -> Result<SaveOutcome> {
        self.commit(state, &TurnEffects::default()).await
    }

    async fn load(&self, session_id: &str) -> Result<Option<SessionState>>;
}

#[derive(Debug, Default)]
struct StoredSession {
    record: Option<Value>,
    final_score: Option<f64>,
}

/// An in-memory `SessionStore` that keeps serialized records, for tests and
/// headless sessions.
///
/// Mastery effects are applied to the attached [`InMemoryCurriculum`]; a store
/// without one rejects them.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, StoredSession>>,
    curriculum: Option<Arc<InMemoryCurriculum>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_curriculum(curriculum: Arc<InMemoryCurriculum>) -> Self {
        Self {
            sessions: RwLock::default(),
            curriculum: Some(curriculum),
        }
    }

    /// Makes `session_id` known to the store so saves are kept.
    pub async fn register(&self, session_id: &str) {
        self.sessions
            .write()
            .await
            .entry(session_id.to_string())
            .or_default();
    }

    /// Stores a raw blob as-is.
    pub async fn insert_raw(&self, session_id: &str, record: Value) {
        self.sessions
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .record = Some(record);
    }

    pub async fn raw(&self, session_id: &str) -> Option<Value> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .and_then(|s| s.record.clone())
    }

    pub async fn final_score(&self, session_id: &str) -> Option<f64> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .and_then(|s| s.final_score)
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn commit(&self, state: &SessionState, effects: &TurnEffects) -> Result<SaveOutcome> {
        let record = serialize_state(state)?;
        let mut sessions = self.sessions.write().await;
        let Some(stored) = sessions.get_mut(&state.session_id) else {
            return Ok(SaveOutcome::UnknownSession);
        };
        if let Some(change) = &effects.mastery {
            let curriculum = self
                .curriculum
                .as_ref()
                .context("No curriculum attached for mastery updates")?;
            curriculum
                .apply_mastery(&change.node_id, &change.scores, change.mode)
                .await?;
        }
        stored.record = Some(record);
        if let Some(final_score) = effects.completed {
            stored.final_score = Some(final_score);
        }
        Ok(SaveOutcome::Saved)
    }

    async fn load(&self, session_id: &str) -> Result<Option<SessionState>> {
        match self.raw(session_id).await {
            Some(record) => Ok(Some(restore_state(record)?)),
            None => Ok(None),
        }
    }
}
