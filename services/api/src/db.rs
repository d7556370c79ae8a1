//! Data Access Layer
//!
//! This module contains all the functions for interacting with the PostgreSQL database.
//! `Db` also implements the engine's storage traits, so the orchestrator reads
//! curriculum data and writes session state through the same connection pool.

use anyhow::{Context, Result};
use async_trait::async_trait;
use autodidact_core::curriculum::{CurriculumStore, NodeRecord};
use autodidact_core::objective::{Objective, node_mastery, update_mastery};
use autodidact_core::persistence::{
    MasteryChange, SaveOutcome, SessionStore, TurnEffects, restore_state, serialize_state,
};
use autodidact_core::personalization::LearnerProfileStore;
use autodidact_core::progression::{Edge, GraphNode, ProjectGraph};
use autodidact_core::session::{Reference, Role, SessionState, Turn};
use serde_json::Value;
use sqlx::{PgConnection, PgPool};
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{Session, TranscriptEntry};

const SESSION_COLUMNS: &str = "id, project_id, node_id, session_number, status, final_score, \
     created_at, updated_at, completed_at";

/// A wrapper around the `PgPool` to provide a clear data access interface.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

/// Engine ids are strings; rows are keyed by UUID. Anything unparsable simply
/// does not exist.
fn parse_id(raw: &str) -> Option<Uuid> {
    Uuid::parse_str(raw).ok()
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

/// Appends the turns of `history` the transcript does not hold yet.
async fn append_transcript(conn: &mut PgConnection, session_id: Uuid, history: &[Turn]) -> Result<()> {
    let (stored,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM transcript WHERE session_id = $1")
        .bind(session_id)
        .fetch_one(&mut *conn)
        .await?;
    for (index, turn) in history.iter().enumerate().skip(stored as usize) {
        sqlx::query(
            "INSERT INTO transcript (session_id, turn_index, role, content) \
             VALUES ($1, $2, $3, $4) ON CONFLICT (session_id, turn_index) DO NOTHING",
        )
        .bind(session_id)
        .bind(index as i32)
        .bind(role_name(turn.role))
        .bind(&turn.content)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Folds a mastery change into the node's objectives and recomputes the node
/// mastery. Objective rows are locked until the caller's transaction ends.
async fn apply_mastery(conn: &mut PgConnection, change: &MasteryChange) -> Result<f64> {
    let id = parse_id(&change.node_id)
        .with_context(|| format!("Invalid node id {}", change.node_id))?;
    let rows: Vec<(String, String, f64)> = sqlx::query_as(
        "SELECT id, description, mastery FROM learning_objectives \
         WHERE node_id = $1 ORDER BY position ASC, id ASC FOR UPDATE",
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;
    let mut objectives: Vec<Objective> = rows
        .into_iter()
        .map(|(id, description, mastery)| Objective::new(id, description, mastery))
        .collect();
    let mastery = update_mastery(&mut objectives, &change.scores, change.mode);

    for objective in objectives.iter().filter(|o| change.scores.contains_key(&o.id)) {
        sqlx::query("UPDATE learning_objectives SET mastery = $1 WHERE id = $2 AND node_id = $3")
            .bind(objective.mastery)
            .bind(&objective.id)
            .bind(id)
            .execute(&mut *conn)
            .await?;
    }
    let updated = sqlx::query("UPDATE nodes SET mastery = $1 WHERE id = $2")
        .bind(mastery)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    if updated.rows_affected() == 0 {
        anyhow::bail!("Node {} not found", change.node_id);
    }
    Ok(mastery)
}

impl Db {
    /// Creates a new `Db` instance.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending `sqlx` migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Whether `node_id` is a node of `project_id`.
    pub async fn node_in_project(&self, project_id: Uuid, node_id: Uuid) -> Result<bool> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM nodes WHERE id = $1 AND project_id = $2")
                .bind(node_id)
                .bind(project_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    /// Creates the session row for `session_id`, numbered after the project's
    /// previous sessions, together with its first state and transcript.
    ///
    /// Returns `None` when the node does not belong to the project.
    pub async fn create_session(
        &self,
        session_id: Uuid,
        project_id: Uuid,
        node_id: Uuid,
        initial: &SessionState,
    ) -> Result<Option<Session>> {
        let blob = serialize_state(initial)?;
        let mut tx = self.pool.begin().await?;

        let node_exists: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM nodes WHERE id = $1 AND project_id = $2")
                .bind(node_id)
                .bind(project_id)
                .fetch_optional(&mut *tx)
                .await?;
        if node_exists.is_none() {
            return Ok(None);
        }

        let (session_number,): (i32,) = sqlx::query_as(
            "SELECT COALESCE(MAX(session_number), 0) + 1 FROM sessions WHERE project_id = $1",
        )
        .bind(project_id)
        .fetch_one(&mut *tx)
        .await?;

        let session = sqlx::query_as::<_, Session>(&format!(
            "INSERT INTO sessions (id, project_id, node_id, session_number, state_json) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {}",
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .bind(project_id)
        .bind(node_id)
        .bind(session_number)
        .bind(&blob)
        .fetch_one(&mut *tx)
        .await?;
        append_transcript(&mut tx, session_id, &initial.history).await?;

        tx.commit().await?;
        Ok(Some(session))
    }

    /// Retrieves a single session row by its ID.
    pub async fn get_session(&self, session_id: Uuid) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(&format!(
            "SELECT {} FROM sessions WHERE id = $1",
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    /// Retrieves the stored transcript for a session, ordered by turn.
    pub async fn get_transcript(&self, session_id: Uuid) -> Result<Vec<TranscriptEntry>> {
        let rows: Vec<(i32, String, String)> = sqlx::query_as(
            "SELECT turn_index, role, content FROM transcript \
             WHERE session_id = $1 ORDER BY turn_index ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(turn_index, role, content)| TranscriptEntry {
                turn_index,
                role,
                content,
            })
            .collect())
    }

    async fn node_objectives(&self, node_id: Uuid) -> Result<Vec<Objective>> {
        let rows: Vec<(String, String, f64)> = sqlx::query_as(
            "SELECT id, description, mastery FROM learning_objectives \
             WHERE node_id = $1 ORDER BY position ASC, id ASC",
        )
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, description, mastery)| {
                Objective::new(id, description, mastery).with_node(node_id.to_string())
            })
            .collect())
    }
}

#[async_trait]
impl CurriculumStore for Db {
    async fn load_node(&self, node_id: &str) -> Result<Option<NodeRecord>> {
        let Some(id) = parse_id(node_id) else {
            return Ok(None);
        };
        let row: Option<(Uuid, String, Uuid, String, String, Value)> = sqlx::query_as(
            "SELECT n.id, n.original_id, n.project_id, n.title, p.topic, n.references_json \
             FROM nodes n JOIN projects p ON p.id = n.project_id WHERE n.id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        let Some((id, original_id, project_id, title, topic, references_json)) = row else {
            return Ok(None);
        };

        let references: Vec<Reference> = match serde_json::from_value(references_json) {
            Ok(references) => references,
            Err(e) => {
                warn!(node_id = %id, error = %e, "Ignoring unreadable node references");
                Vec::new()
            }
        };
        Ok(Some(NodeRecord {
            id: id.to_string(),
            original_id,
            project_id: project_id.to_string(),
            title,
            topic,
            references,
            objectives: self.node_objectives(id).await?,
        }))
    }

    async fn prerequisite_objectives(
        &self,
        project_id: &str,
        node_original_id: &str,
    ) -> Result<Vec<Objective>> {
        let Some(project_id) = parse_id(project_id) else {
            return Ok(Vec::new());
        };
        let rows: Vec<(String, String, f64, Uuid)> = sqlx::query_as(
            "SELECT lo.id, lo.description, lo.mastery, n.id \
             FROM edges e \
             JOIN nodes n ON n.project_id = e.project_id AND n.original_id = e.source_id \
             JOIN learning_objectives lo ON lo.node_id = n.id \
             WHERE e.project_id = $1 AND e.target_id = $2 \
             ORDER BY n.original_id ASC, lo.position ASC, lo.id ASC",
        )
        .bind(project_id)
        .bind(node_original_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, description, mastery, node_id)| {
                Objective::new(id, description, mastery).with_node(node_id.to_string())
            })
            .collect())
    }

    async fn project_resources(&self, project_id: &str) -> Result<Vec<Value>> {
        let Some(project_id) = parse_id(project_id) else {
            return Ok(Vec::new());
        };
        let rows: Vec<(Value,)> = sqlx::query_as(
            "SELECT resource FROM project_resources WHERE project_id = $1 ORDER BY id ASC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(resource,)| resource).collect())
    }

    async fn project_graph(&self, project_id: &str) -> Result<ProjectGraph> {
        let Some(project_id) = parse_id(project_id) else {
            return Ok(ProjectGraph::default());
        };
        let node_rows: Vec<(Uuid, String)> = sqlx::query_as(
            "SELECT id, title FROM nodes WHERE project_id = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        let mut nodes = Vec::with_capacity(node_rows.len());
        for (id, title) in node_rows {
            let objectives = self.node_objectives(id).await?;
            nodes.push(GraphNode {
                id: id.to_string(),
                label: title,
                mastery: node_mastery(&objectives),
            });
        }

        // Edges whose endpoints do not resolve keep their original id, which
        // the unlock query treats as an unmet prerequisite.
        let edge_rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT COALESCE(s.id::text, e.source_id), COALESCE(t.id::text, e.target_id) \
             FROM edges e \
             LEFT JOIN nodes s ON s.project_id = e.project_id AND s.original_id = e.source_id \
             LEFT JOIN nodes t ON t.project_id = e.project_id AND t.original_id = e.target_id \
             WHERE e.project_id = $1",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        let edges = edge_rows
            .into_iter()
            .map(|(source, target)| Edge::new(source, target))
            .collect();
        Ok(ProjectGraph::new(nodes, edges))
    }
}

#[async_trait]
impl SessionStore for Db {
    /// Writes the state blob, appends any new transcript turns and applies the
    /// turn's mastery and completion effects in one transaction.
    async fn commit(&self, state: &SessionState, effects: &TurnEffects) -> Result<SaveOutcome> {
        let Some(id) = parse_id(&state.session_id) else {
            return Ok(SaveOutcome::UnknownSession);
        };
        let blob = serialize_state(state)?;
        let mut tx = self.pool.begin().await?;

        let updated =
            sqlx::query("UPDATE sessions SET state_json = $1, updated_at = NOW() WHERE id = $2")
                .bind(&blob)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(SaveOutcome::UnknownSession);
        }
        append_transcript(&mut tx, id, &state.history).await?;

        if let Some(change) = &effects.mastery {
            let mastery = apply_mastery(&mut tx, change).await?;
            info!(session_id = %id, node_id = %change.node_id, mastery, "Node mastery updated");
        }
        if let Some(final_score) = effects.completed {
            sqlx::query(
                "UPDATE sessions SET status = 'completed', final_score = $1, \
                 completed_at = NOW() WHERE id = $2",
            )
            .bind(final_score)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(SaveOutcome::Saved)
    }

    async fn load(&self, session_id: &str) -> Result<Option<SessionState>> {
        let Some(id) = parse_id(session_id) else {
            return Ok(None);
        };
        let row: Option<(Option<Value>,)> =
            sqlx::query_as("SELECT state_json FROM sessions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some((Some(blob),)) => Ok(Some(restore_state(blob)?)),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl LearnerProfileStore for Db {
    async fn learner_profile(&self, project_id: &str) -> Result<Option<String>> {
        let Some(project_id) = parse_id(project_id) else {
            return Ok(None);
        };
        let row: Option<(String,)> =
            sqlx::query_as("SELECT profile FROM learner_profiles WHERE project_id = $1")
                .bind(project_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(profile,)| profile))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id() {
        let id = Uuid::new_v4();
        assert_eq!(parse_id(&id.to_string()), Some(id));
        assert_eq!(parse_id("s1"), None);
        assert_eq!(parse_id(""), None);
    }

    #[test]
    fn test_role_names_match_transcript_check() {
        assert_eq!(role_name(Role::User), "user");
        assert_eq!(role_name(Role::Assistant), "assistant");
    }
}
