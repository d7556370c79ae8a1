//! Prerequisite Unlock Query
//!
//! Given a project's node/edge graph and each node's aggregate mastery, works
//! out which nodes a learner may start a new session on. Used by the
//! surrounding application for "what next" lists, never during an active turn.

use crate::objective::{Objective, meets_threshold, node_mastery};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub label: String,
    /// Mean mastery of the node's objectives.
    pub mastery: f64,
}

impl GraphNode {
    pub fn from_objectives(
        id: impl Into<String>,
        label: impl Into<String>,
        objectives: &[Objective],
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            mastery: node_mastery(objectives),
        }
    }

    pub fn is_mastered(&self) -> bool {
        meets_threshold(self.mastery)
    }
}

/// A prerequisite edge: `source` must be mastered before `target` unlocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<Edge>,
}

impl ProjectGraph {
    pub fn new(nodes: Vec<GraphNode>, edges: Vec<Edge>) -> Self {
        Self { nodes, edges }
    }

    fn mastery_by_id(&self) -> HashMap<&str, f64> {
        self.nodes.iter().map(|n| (n.id.as_str(), n.mastery)).collect()
    }

    /// A node is unlocked when it has no incoming prerequisite edges, or every
    /// prerequisite node meets the mastery threshold.
    ///
    /// A prerequisite that is not part of the graph counts as unmet.
    pub fn is_unlocked(&self, node_id: &str) -> bool {
        let mastery = self.mastery_by_id();
        self.prerequisites_met(node_id, &mastery)
    }

    fn prerequisites_met(&self, node_id: &str, mastery: &HashMap<&str, f64>) -> bool {
        self.edges
            .iter()
            .filter(|edge| edge.target == node_id)
            .all(|edge| {
                mastery
                    .get(edge.source.as_str())
                    .is_some_and(|m| meets_threshold(*m))
            })
    }

    /// All unlocked nodes, in graph order.
    pub fn unlocked_nodes(&self) -> Vec<&GraphNode> {
        let mastery = self.mastery_by_id();
        self.nodes
            .iter()
            .filter(|node| self.prerequisites_met(&node.id, &mastery))
            .collect()
    }

    /// Unlocked nodes the learner has not mastered yet, weakest first.
    pub fn next_nodes(&self) -> Vec<&GraphNode> {
        let mut candidates: Vec<&GraphNode> = self
            .unlocked_nodes()
            .into_iter()
            .filter(|node| !node.is_mastered())
            .collect();
        candidates.sort_by(|a, b| a.mastery.total_cmp(&b.mastery));
        candidates
    }
}
