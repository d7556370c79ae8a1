//! Learning Objectives and the Mastery Model
//!
//! Objectives are the smallest learnable unit of a curriculum node. Each one
//! carries a mastery score in `[0, 1]` that only moves when a session is graded
//! (or when an operator overrides it directly).

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// The single cutoff at which an objective or a node counts as learned.
pub const MASTERY_THRESHOLD: f64 = 0.7;

/// Means of several float scores rarely land exactly on the threshold, so the
/// comparison tolerates representation error.
const MASTERY_EPSILON: f64 = 1e-9;

/// Scores keyed by objective id.
pub type ScoreMap = BTreeMap<String, f64>;

/// Returns `true` when a mastery value meets the inclusive threshold.
pub fn meets_threshold(mastery: f64) -> bool {
    mastery + MASTERY_EPSILON >= MASTERY_THRESHOLD
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}

fn deserialize_mastery<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<f64>::deserialize(deserializer)?;
    Ok(clamp_unit(raw.unwrap_or(0.0)))
}

/// A single learnable unit of a curriculum node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    /// Stable identifier, unique within its node.
    pub id: String,
    /// Learner-facing text.
    pub description: String,
    /// Current mastery, always within `[0, 1]`.
    #[serde(default, deserialize_with = "deserialize_mastery")]
    pub mastery: f64,
    /// The node this objective belongs to, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl Objective {
    /// Creates an objective, clamping `mastery` into `[0, 1]`.
    pub fn new(id: impl Into<String>, description: impl Into<String>, mastery: f64) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            mastery: clamp_unit(mastery),
            node_id: None,
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Checks if the objective is mastered (mastery >= 0.7).
    pub fn is_mastered(&self) -> bool {
        meets_threshold(self.mastery)
    }

    pub fn set_mastery(&mut self, mastery: f64) {
        self.mastery = clamp_unit(mastery);
    }
}

/// How a newly submitted score is folded into an objective's mastery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasteryUpdate {
    /// The new mastery is the mean of the previous mastery and the score.
    Damped,
    /// The score overwrites the previous mastery. Used by operator overrides.
    Direct,
}

impl MasteryUpdate {
    pub fn apply(self, previous: f64, score: f64) -> f64 {
        let score = clamp_unit(score);
        match self {
            MasteryUpdate::Damped => clamp_unit((clamp_unit(previous) + score) / 2.0),
            MasteryUpdate::Direct => score,
        }
    }
}

/// Applies `scores` to the matching objectives and returns the recomputed
/// node mastery.
///
/// Ids in `scores` that match no objective are ignored.
pub fn update_mastery(objectives: &mut [Objective], scores: &ScoreMap, mode: MasteryUpdate) -> f64 {
    for objective in objectives.iter_mut() {
        if let Some(score) = scores.get(&objective.id) {
            let updated = mode.apply(objective.mastery, *score);
            tracing::debug!(
                objective_id = %objective.id,
                previous = objective.mastery,
                updated,
                ?mode,
                "Objective mastery updated"
            );
            objective.mastery = updated;
        }
    }
    node_mastery(objectives)
}

/// A node's mastery is the arithmetic mean of its objectives' mastery.
pub fn node_mastery(objectives: &[Objective]) -> f64 {
    if objectives.is_empty() {
        return 0.0;
    }
    objectives.iter().map(|o| o.mastery).sum::<f64>() / objectives.len() as f64
}

/// Overall session score: the mean of the final per-objective scores.
pub fn calculate_final_score(scores: &ScoreMap) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    scores.values().sum::<f64>() / scores.len() as f64
}

/// The closed set of quiz question formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuestionKind {
    #[serde(rename = "mcq")]
    MultipleChoice,
    #[serde(rename = "free")]
    FreeResponse,
    #[serde(rename = "short")]
    ShortAnswer,
    #[serde(rename = "paraphrase")]
    Paraphrase,
}

/// A generated quiz question. Immutable once generated for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizQuestion {
    #[serde(rename = "q")]
    pub question: String,
    #[serde(rename = "type")]
    pub kind: QuestionKind,
    /// Present only for multiple-choice questions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<String>>,
    /// Expected answer text or pattern.
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub objective_ids: Vec<String>,
}

impl QuizQuestion {
    /// Formats the question for display, lettering multiple-choice options.
    pub fn format_for_display(&self) -> String {
        match (&self.kind, &self.choices) {
            (QuestionKind::MultipleChoice, Some(choices)) if !choices.is_empty() => {
                let options = choices
                    .iter()
                    .enumerate()
                    .map(|(i, choice)| format!("{}. {}", choice_letter(i), choice))
                    .collect::<Vec<_>>()
                    .join("\n");
                format!("{}\n\n{}", self.question, options)
            }
            _ => self.question.clone(),
        }
    }
}

/// `0 -> 'A'`, `1 -> 'B'`, ...
pub fn choice_letter(index: usize) -> char {
    (b'A' + (index % 26) as u8) as char
}

/// A learner's submitted answer to a final-test question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestAnswer {
    /// Position of the question in the test.
    pub question_idx: usize,
    pub question: QuizQuestion,
    pub answer: String,
    /// RFC 3339 submission time.
    pub timestamp: String,
}
