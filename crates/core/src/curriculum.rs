//! Curriculum Storage
//!
//! The engine never generates curricula itself; it reads nodes, objectives and
//! prerequisite edges that a separate pipeline produced. This module defines
//! that read/write seam and a deterministic in-memory implementation used by
//! tests and headless sessions.

use crate::objective::{MasteryUpdate, Objective, ScoreMap, update_mastery};
use crate::progression::{Edge, GraphNode, ProjectGraph};
use crate::session::Reference;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// A curriculum node as stored, with its objectives in teaching order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Storage identifier.
    pub id: String,
    /// Identifier from the generated graph; prerequisite edges refer to it.
    pub original_id: String,
    pub project_id: String,
    pub title: String,
    /// The project's topic.
    pub topic: String,
    #[serde(default)]
    pub references: Vec<Reference>,
    #[serde(default)]
    pub objectives: Vec<Objective>,
}

/// Defines the contract for any store holding curriculum nodes.
///
/// Mastery is written only as part of a session commit, see
/// [`crate::persistence::TurnEffects`].
///
/// This abstraction allows the engine to run against a database in the
/// service and against a static in-memory graph in tests.
#[async_trait]
pub trait CurriculumStore: Send + Sync {
    /// Loads a node and its objectives, or `None` when it does not exist.
    async fn load_node(&self, node_id: &str) -> Result<Option<NodeRecord>>;

    /// Objectives of every node that is a direct prerequisite of
    /// `node_original_id` within the project.
    async fn prerequisite_objectives(
        &self,
        project_id: &str,
        node_original_id: &str,
    ) -> Result<Vec<Objective>>;

    /// Project-level resources attached to every session of the project.
    async fn project_resources(&self, project_id: &str) -> Result<Vec<Value>>;

    /// The project's node graph with aggregate mastery per node.
    async fn project_graph(&self, project_id: &str) -> Result<ProjectGraph>;
}

#[derive(Debug, Default)]
struct CurriculumData {
    nodes: HashMap<String, NodeRecord>,
    /// Insertion order, so graphs list nodes deterministically.
    order: Vec<String>,
    /// Prerequisite edges by project, between original ids.
    edges: HashMap<String, Vec<Edge>>,
    resources: HashMap<String, Vec<Value>>,
}

/// An in-memory `CurriculumStore` for development and testing.
#[derive(Debug, Default)]
pub struct InMemoryCurriculum {
    data: RwLock<CurriculumData>,
}

impl InMemoryCurriculum {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_node(&self, node: NodeRecord) {
        let mut data = self.data.write().await;
        if !data.nodes.contains_key(&node.id) {
            data.order.push(node.id.clone());
        }
        data.nodes.insert(node.id.clone(), node);
    }

    /// Adds a prerequisite edge between two original ids.
    pub async fn insert_edge(&self, project_id: &str, source: &str, target: &str) {
        self.data
            .write()
            .await
            .edges
            .entry(project_id.to_string())
            .or_default()
            .push(Edge::new(source, target));
    }

    /// Folds `scores` into the node's objective mastery and returns the
    /// recomputed node mastery. Session stores call this when committing a
    /// graded turn.
    pub async fn apply_mastery(
        &self,
        node_id: &str,
        scores: &ScoreMap,
        mode: MasteryUpdate,
    ) -> Result<f64> {
        let mut data = self.data.write().await;
        let node = data
            .nodes
            .get_mut(node_id)
            .with_context(|| format!("Node {} not found", node_id))?;
        Ok(update_mastery(&mut node.objectives, scores, mode))
    }

    pub async fn insert_resource(&self, project_id: &str, resource: Value) {
        self.data
            .write()
            .await
            .resources
            .entry(project_id.to_string())
            .or_default()
            .push(resource);
    }
}

#[async_trait]
impl CurriculumStore for InMemoryCurriculum {
    async fn load_node(&self, node_id: &str) -> Result<Option<NodeRecord>> {
        Ok(self.data.read().await.nodes.get(node_id).cloned())
    }

    async fn prerequisite_objectives(
        &self,
        project_id: &str,
        node_original_id: &str,
    ) -> Result<Vec<Objective>> {
        let data = self.data.read().await;
        let Some(edges) = data.edges.get(project_id) else {
            return Ok(Vec::new());
        };
        let mut objectives = Vec::new();
        for edge in edges.iter().filter(|e| e.target == node_original_id) {
            let source = data.order.iter().filter_map(|id| data.nodes.get(id)).find(|n| {
                n.project_id == project_id && n.original_id == edge.source
            });
            if let Some(source) = source {
                objectives.extend(
                    source
                        .objectives
                        .iter()
                        .map(|o| o.clone().with_node(source.id.clone())),
                );
            }
        }
        Ok(objectives)
    }

    async fn project_resources(&self, project_id: &str) -> Result<Vec<Value>> {
        Ok(self
            .data
            .read()
            .await
            .resources
            .get(project_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn project_graph(&self, project_id: &str) -> Result<ProjectGraph> {
        let data = self.data.read().await;
        let project_nodes: Vec<&NodeRecord> = data
            .order
            .iter()
            .filter_map(|id| data.nodes.get(id))
            .filter(|n| n.project_id == project_id)
            .collect();

        let id_by_original: HashMap<&str, &str> = project_nodes
            .iter()
            .map(|n| (n.original_id.as_str(), n.id.as_str()))
            .collect();
        let resolve = |original: &str| {
            id_by_original
                .get(original)
                .map(|id| id.to_string())
                .unwrap_or_else(|| original.to_string())
        };

        let nodes = project_nodes
            .iter()
            .map(|n| GraphNode::from_objectives(n.id.clone(), n.title.clone(), &n.objectives))
            .collect();
        let edges = data
            .edges
            .get(project_id)
            .map(|edges| {
                edges
                    .iter()
                    .map(|e| Edge::new(resolve(&e.source), resolve(&e.target)))
                    .collect()
            })
            .unwrap_or_default();
        Ok(ProjectGraph::new(nodes, edges))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn node(id: &str, original_id: &str, objectives: Vec<Objective>) -> NodeRecord {
        NodeRecord {
            id: id.to_string(),
            original_id: original_id.to_string(),
            project_id: "p1".to_string(),
            title: format!("Node {}", original_id),
            topic: "Calculus".to_string(),
            references: vec![],
            objectives,
        }
    }

    async fn sample() -> InMemoryCurriculum {
        let store = InMemoryCurriculum::new();
        store
            .insert_node(node("n1", "limits", vec![Objective::new("l1", "Define a limit", 0.9)]))
            .await;
        store
            .insert_node(node(
                "n2",
                "derivatives",
                vec![
                    Objective::new("d1", "Define a derivative", 0.4),
                    Objective::new("d2", "Power rule", 0.0),
                ],
            ))
            .await;
        store.insert_edge("p1", "limits", "derivatives").await;
        store
    }

    #[tokio::test]
    async fn test_prerequisite_objectives_follow_edges() {
        let store = sample().await;
        let prereqs = store.prerequisite_objectives("p1", "derivatives").await.unwrap();
        assert_eq!(prereqs.len(), 1);
        assert_eq!(prereqs[0].id, "l1");
        assert_eq!(prereqs[0].node_id.as_deref(), Some("n1"));
        assert!(store.prerequisite_objectives("p1", "limits").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_mastery_updates_node() {
        let store = sample().await;
        let scores: ScoreMap = [("d1".to_string(), 1.0)].into_iter().collect();
        let node_mastery = store
            .apply_mastery("n2", &scores, MasteryUpdate::Damped)
            .await
            .unwrap();
        assert_relative_eq!(node_mastery, 0.35, epsilon = 1e-12);

        let node = store.load_node("n2").await.unwrap().unwrap();
        assert_relative_eq!(node.objectives[0].mastery, 0.7, epsilon = 1e-12);
        assert!(store.apply_mastery("ghost", &scores, MasteryUpdate::Direct).await.is_err());
    }

    #[tokio::test]
    async fn test_project_graph_resolves_original_ids() {
        let store = sample().await;
        let graph = store.project_graph("p1").await.unwrap();
        assert_eq!(graph.edges, vec![Edge::new("n1", "n2")]);
        assert!(graph.is_unlocked("n2"));
        let next: Vec<_> = graph.next_nodes().into_iter().map(|n| n.id.as_str()).collect();
        assert_eq!(next, ["n2"]);
    }
}
