//! Session State
//!
//! `SessionState` is the aggregate root of a tutoring session. It is created
//! with a fixed template of empty fields, mutated only by the orchestrator,
//! and persisted after every completed turn.

use crate::objective::{Objective, QuizQuestion, ScoreMap, TestAnswer, calculate_final_score};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;

/// How many cached images are kept with a session.
pub const IMAGE_CACHE_CAPACITY: usize = 10;
/// How many of the most recent images are described to the tutor model.
pub const IMAGE_CONTEXT_WINDOW: usize = 3;

/// Current time as an RFC 3339 string, the format used for every session timestamp.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339()
}

/// Parses a session timestamp.
///
/// Accepts RFC 3339 and naive ISO-8601 (read as UTC). Returns `None` for
/// anything else.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// One state of the tutoring state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    LoadContext,
    Intro,
    Recap,
    Teaching,
    Testing,
    Grading,
    Wrap,
    Completed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::LoadContext => "load_context",
            Phase::Intro => "intro",
            Phase::Recap => "recap",
            Phase::Teaching => "teaching",
            Phase::Testing => "testing",
            Phase::Grading => "grading",
            Phase::Wrap => "wrap",
            Phase::Completed => "completed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A single transcript entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A resolved reference section attached to a curriculum node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub rid: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

impl Reference {
    /// One bullet for the reference list in tutor prompts.
    pub fn bullet(&self) -> String {
        let location = self.loc.as_deref().or(self.section.as_deref()).unwrap_or("");
        let mut line = format!("• [{}] {} - *{}*", self.rid, location, self.title);
        let year = self.date.as_deref().map(|d| d.chars().take(4).collect::<String>());
        match (self.kind.as_deref(), year) {
            (Some(kind), Some(year)) => line.push_str(&format!(" ({}, {})", kind, year)),
            (Some(kind), None) => line.push_str(&format!(" ({})", kind)),
            (None, Some(year)) => line.push_str(&format!(" ({})", year)),
            (None, None) => {}
        }
        line
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub context: String,
}

/// Bounded, url-deduplicated cache of images shown to the learner, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageCache {
    entries: VecDeque<ImageRef>,
}

impl ImageCache {
    /// Records an image; re-showing a known url moves it to the newest slot.
    pub fn record(&mut self, image: ImageRef) {
        self.entries.retain(|existing| existing.url != image.url);
        self.entries.push_back(image);
        while self.entries.len() > IMAGE_CACHE_CAPACITY {
            self.entries.pop_front();
        }
    }

    /// The newest `n` images, oldest first.
    pub fn recent(&self, n: usize) -> impl Iterator<Item = &ImageRef> {
        self.entries.iter().skip(self.entries.len().saturating_sub(n))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The block describing visible images for the teaching prompt, or an
    /// empty string when nothing has been shown.
    pub fn prompt_context(&self) -> String {
        if self.entries.is_empty() {
            return String::new();
        }
        let lines = self
            .recent(IMAGE_CONTEXT_WINDOW)
            .enumerate()
            .map(|(i, img)| {
                let description = if img.description.is_empty() {
                    "Educational image"
                } else {
                    img.description.as_str()
                };
                if img.context.is_empty() {
                    format!("{}. {}", i + 1, description)
                } else {
                    format!("{}. {} ({})", i + 1, description, img.context)
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        format!("\n\nIMAGES CURRENTLY VISIBLE TO STUDENT:\n{}", lines)
    }
}

/// Final-test progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuizState {
    #[serde(default)]
    pub questions: Vec<QuizQuestion>,
    #[serde(default)]
    pub answers: Vec<TestAnswer>,
    #[serde(default)]
    pub question_idx: usize,
    #[serde(default)]
    pub awaiting_answer: bool,
}

impl QuizState {
    pub fn current_question(&self) -> Option<&QuizQuestion> {
        self.questions.get(self.question_idx)
    }

    pub fn all_answered(&self) -> bool {
        !self.questions.is_empty() && self.answers.len() >= self.questions.len()
    }
}

/// The complete state of one tutoring session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub project_id: String,
    pub node_id: String,
    #[serde(default)]
    pub node_original_id: String,

    #[serde(default)]
    pub node_title: String,
    #[serde(default)]
    pub project_topic: String,
    #[serde(default)]
    pub references: Vec<Reference>,
    #[serde(default)]
    pub resources: Vec<serde_json::Value>,
    #[serde(default)]
    pub learner_profile_context: String,

    #[serde(default)]
    pub all_objectives: Vec<Objective>,
    #[serde(default)]
    pub objectives_to_teach: Vec<Objective>,
    #[serde(default)]
    pub objectives_already_known: Vec<Objective>,
    #[serde(default)]
    pub prerequisite_objectives: Vec<Objective>,
    /// Ids of objectives completed during this session, in completion order.
    #[serde(default)]
    pub completed_objectives: Vec<String>,

    pub current_phase: Phase,
    /// Index into `objectives_to_teach`. Never decreases.
    #[serde(default)]
    pub objective_idx: usize,
    #[serde(default)]
    pub exit_requested: bool,
    #[serde(default)]
    pub history: Vec<Turn>,
    #[serde(default)]
    pub displayed_images: ImageCache,
    #[serde(default)]
    pub quiz: QuizState,
    #[serde(default)]
    pub objective_scores: ScoreMap,

    #[serde(default)]
    pub turn_count: u32,
    pub session_start: String,
    #[serde(default)]
    pub last_message_ts: Option<String>,
    #[serde(default)]
    pub session_end: Option<String>,

    #[serde(default)]
    pub interruption_detected: bool,
    #[serde(default)]
    pub interruption_duration_minutes: Option<f64>,
}

impl SessionState {
    /// Creates the initial state for a session that has not loaded its context yet.
    pub fn new(
        session_id: impl Into<String>,
        project_id: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            project_id: project_id.into(),
            node_id: node_id.into(),
            node_original_id: String::new(),
            node_title: String::new(),
            project_topic: String::new(),
            references: Vec::new(),
            resources: Vec::new(),
            learner_profile_context: String::new(),
            all_objectives: Vec::new(),
            objectives_to_teach: Vec::new(),
            objectives_already_known: Vec::new(),
            prerequisite_objectives: Vec::new(),
            completed_objectives: Vec::new(),
            current_phase: Phase::LoadContext,
            objective_idx: 0,
            exit_requested: false,
            history: Vec::new(),
            displayed_images: ImageCache::default(),
            quiz: QuizState::default(),
            objective_scores: ScoreMap::new(),
            turn_count: 0,
            session_start: now_timestamp(),
            last_message_ts: None,
            session_end: None,
            interruption_detected: false,
            interruption_duration_minutes: None,
        }
    }

    /// Splits the node's objectives by mastery: mastered ones are already
    /// known, the rest are taught in their original order.
    pub fn partition_objectives(&mut self, objectives: Vec<Objective>) {
        let (known, to_teach): (Vec<_>, Vec<_>) =
            objectives.iter().cloned().partition(Objective::is_mastered);
        self.objectives_already_known = known;
        self.objectives_to_teach = to_teach;
        self.all_objectives = objectives;
    }

    pub fn current_objective(&self) -> Option<&Objective> {
        self.objectives_to_teach.get(self.objective_idx)
    }

    pub fn has_prerequisites(&self) -> bool {
        !self.prerequisite_objectives.is_empty()
    }

    pub fn all_objectives_completed(&self) -> bool {
        self.objective_idx >= self.objectives_to_teach.len()
    }

    /// Objectives covered by the final test: all objectives to teach, or after
    /// an early exit only those actually completed.
    pub fn objectives_for_testing(&self) -> Vec<Objective> {
        if self.exit_requested {
            let completed: HashSet<&str> =
                self.completed_objectives.iter().map(String::as_str).collect();
            self.objectives_to_teach
                .iter()
                .filter(|o| completed.contains(o.id.as_str()))
                .cloned()
                .collect()
        } else {
            self.objectives_to_teach.clone()
        }
    }

    /// Marks the current objective complete and advances the cursor.
    pub(crate) fn complete_current_objective(&mut self) -> Option<Objective> {
        let objective = self.current_objective()?.clone();
        if !self.completed_objectives.contains(&objective.id) {
            self.completed_objectives.push(objective.id.clone());
        }
        self.objective_idx += 1;
        Some(objective)
    }

    /// Asks the session to wrap up early. Takes effect on the next teaching step.
    pub fn request_exit(&mut self) {
        self.exit_requested = true;
    }

    pub fn record_image(
        &mut self,
        url: impl Into<String>,
        description: impl Into<String>,
        context: impl Into<String>,
    ) {
        self.displayed_images.record(ImageRef {
            url: url.into(),
            description: description.into(),
            context: context.into(),
        });
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.history.push(Turn::assistant(content));
    }

    pub fn final_score(&self) -> f64 {
        calculate_final_score(&self.objective_scores)
    }

    /// Session length in minutes, rounded to one decimal. Zero until the session ends.
    pub fn duration_minutes(&self) -> f64 {
        let start = parse_timestamp(&self.session_start);
        let end = self.session_end.as_deref().and_then(parse_timestamp);
        match (start, end) {
            (Some(start), Some(end)) => {
                let minutes = (end - start).num_milliseconds() as f64 / 60_000.0;
                (minutes * 10.0).round() / 10.0
            }
            _ => 0.0,
        }
    }

    pub fn progress_info(&self) -> ProgressInfo {
        let completed: HashSet<&str> = self.completed_objectives.iter().map(String::as_str).collect();
        let items: Vec<ProgressItem> = self
            .objectives_to_teach
            .iter()
            .enumerate()
            .map(|(index, objective)| {
                let status = if completed.contains(objective.id.as_str()) {
                    ProgressStatus::Completed
                } else if index == self.objective_idx {
                    ProgressStatus::Current
                } else {
                    ProgressStatus::Upcoming
                };
                ProgressItem {
                    description: objective.description.clone(),
                    status,
                    index,
                }
            })
            .collect();
        let completed_count = items
            .iter()
            .filter(|item| item.status == ProgressStatus::Completed)
            .count();
        ProgressInfo {
            total: items.len(),
            completed_count,
            current_index: self.objective_idx,
            items,
        }
    }

    pub fn completion_info(&self) -> CompletionInfo {
        let completed: HashSet<&str> = self.completed_objectives.iter().map(String::as_str).collect();
        let objectives: Vec<String> = self
            .objectives_to_teach
            .iter()
            .filter(|o| completed.contains(o.id.as_str()))
            .map(|o| o.description.clone())
            .collect();
        let total = self.objectives_to_teach.len();
        let completion_percentage = if total == 0 {
            100.0
        } else {
            objectives.len() as f64 / total as f64 * 100.0
        };
        CompletionInfo {
            completed_count: objectives.len(),
            objectives,
            total_objectives: total,
            final_score: self.final_score(),
            completion_percentage,
            session_start: self.session_start.clone(),
            session_end: self.session_end.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Completed,
    Current,
    Upcoming,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressItem {
    pub description: String,
    pub status: ProgressStatus,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressInfo {
    pub items: Vec<ProgressItem>,
    pub total: usize,
    pub completed_count: usize,
    pub current_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionInfo {
    pub objectives: Vec<String>,
    pub total_objectives: usize,
    pub completed_count: usize,
    pub final_score: f64,
    pub completion_percentage: f64,
    pub session_start: String,
    pub session_end: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_objectives() -> SessionState {
        let mut state = SessionState::new("s1", "p1", "n1");
        state.partition_objectives(vec![
            Objective::new("o1", "Define a limit", 0.1),
            Objective::new("o2", "Already known", 0.8),
            Objective::new("o3", "Compute a derivative", 0.69),
            Objective::new("o4", "Apply the chain rule", 0.0),
        ]);
        state
    }

    #[test]
    fn test_initial_state_template() {
        let state = SessionState::new("s1", "p1", "n1");
        assert_eq!(state.current_phase, Phase::LoadContext);
        assert_eq!(state.objective_idx, 0);
        assert!(state.history.is_empty());
        assert!(state.last_message_ts.is_none());
        assert!(parse_timestamp(&state.session_start).is_some());
    }

    #[test]
    fn test_partition_keeps_order_and_threshold() {
        let state = state_with_objectives();
        let teach: Vec<_> = state.objectives_to_teach.iter().map(|o| o.id.as_str()).collect();
        let known: Vec<_> = state.objectives_already_known.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(teach, ["o1", "o3", "o4"]);
        assert_eq!(known, ["o2"]);
        assert_eq!(state.all_objectives.len(), 4);
    }

    #[test]
    fn test_objectives_for_testing_after_early_exit() {
        let mut state = state_with_objectives();
        state.complete_current_objective();
        state.request_exit();
        let ids: Vec<_> = state.objectives_for_testing().into_iter().map(|o| o.id).collect();
        assert_eq!(ids, ["o1"]);

        state.exit_requested = false;
        assert_eq!(state.objectives_for_testing().len(), 3);
    }

    #[test]
    fn test_complete_current_objective_advances_once_per_call() {
        let mut state = state_with_objectives();
        assert_eq!(state.complete_current_objective().unwrap().id, "o1");
        assert_eq!(state.objective_idx, 1);
        assert_eq!(state.completed_objectives, ["o1"]);
        state.complete_current_objective();
        state.complete_current_objective();
        assert!(state.all_objectives_completed());
        assert!(state.complete_current_objective().is_none());
        assert_eq!(state.objective_idx, 3);
    }

    #[test]
    fn test_image_cache_dedupes_and_bounds() {
        let mut cache = ImageCache::default();
        for i in 0..12 {
            cache.record(ImageRef {
                url: format!("u{}", i),
                description: format!("img {}", i),
                context: String::new(),
            });
        }
        assert_eq!(cache.len(), IMAGE_CACHE_CAPACITY);

        cache.record(ImageRef {
            url: "u5".into(),
            description: "img 5 again".into(),
            context: "axes".into(),
        });
        assert_eq!(cache.len(), IMAGE_CACHE_CAPACITY);
        let recent: Vec<_> = cache.recent(3).map(|i| i.url.as_str()).collect();
        assert_eq!(recent, ["u10", "u11", "u5"]);
        assert!(cache.prompt_context().ends_with("3. img 5 again (axes)"));
        assert_eq!(ImageCache::default().prompt_context(), "");
    }

    #[test]
    fn test_progress_and_completion_info() {
        let mut state = state_with_objectives();
        state.complete_current_objective();
        let progress = state.progress_info();
        assert_eq!(progress.total, 3);
        assert_eq!(progress.completed_count, 1);
        assert_eq!(progress.items[0].status, ProgressStatus::Completed);
        assert_eq!(progress.items[1].status, ProgressStatus::Current);
        assert_eq!(progress.items[2].status, ProgressStatus::Upcoming);

        state.objective_scores.insert("o1".into(), 0.5);
        let completion = state.completion_info();
        assert_eq!(completion.objectives, ["Define a limit"]);
        assert!((completion.completion_percentage - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!(completion.final_score, 0.5);
    }

    #[test]
    fn test_duration_and_timestamp_parsing() {
        let mut state = SessionState::new("s1", "p1", "n1");
        state.session_start = "2024-01-15T10:00:00".to_string();
        assert_eq!(state.duration_minutes(), 0.0);
        state.session_end = Some("2024-01-15T10:42:30+00:00".to_string());
        assert_eq!(state.duration_minutes(), 42.5);
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_reference_bullet() {
        let reference = Reference {
            rid: "smith2020".into(),
            title: "Calculus Made Easy".into(),
            loc: Some("ch. 2".into()),
            section: None,
            kind: Some("book".into()),
            date: Some("2020-05-01".into()),
        };
        assert_eq!(reference.bullet(), "• [smith2020] ch. 2 - *Calculus Made Easy* (book, 2020)");
    }
}
