//! Phase State Machine
//!
//! Drives a tutoring session through
//! `load_context -> intro -> recap -> teaching -> testing -> grading -> wrap -> completed`.
//!
//! Every phase change goes through [`transition`], an explicit table of
//! `(phase, event) -> phase`. A turn works on a copy of the caller's state and
//! hands back the new state only when the whole turn succeeded. Durable side
//! effects (mastery, session completion) are collected as [`TurnEffects`] and
//! written in the same [`SessionStore::commit`] as the state, so a failed turn
//! never leaves a half-applied transcript, mastery update or phase change.

use crate::control::{ControlError, RecapControl, TeachingControl, extract, strip_control_blocks};
use crate::curriculum::CurriculumStore;
use crate::interruption::{Interruption, detect_interruption};
use crate::llm_client::{
    GenerationError, GenerationOptions, Prompt, RetryPolicy, TextGenerator, TokenUsage,
    complete_with_retry,
};
use crate::objective::{
    MasteryUpdate, Objective, ScoreMap, TestAnswer, meets_threshold, node_mastery, update_mastery,
};
use crate::persistence::{MasteryChange, SaveOutcome, SessionStore, TurnEffects};
use crate::personalization::PersonalizationSource;
use crate::prompts::{PromptLibrary, reference_bullets};
use crate::quiz::{self, GradingError};
use crate::session::{ImageRef, Phase, Role, SessionState, Turn, now_timestamp};
use serde::Serialize;
use std::sync::Arc;
use tracing::{Instrument, error, info, warn};

/// Prefix of the hand-off message shown when the cursor moves on.
pub const NEXT_OBJECTIVE_PREFIX: &str = "Let's move to the next objective:";
const TESTING_HANDOFF: &str =
    "Great job! You've mastered all the objectives for this node. Let's move to the testing phase!";
const TEST_SKIPPED: &str = "We didn't complete any objectives this time, so there's no final test. \
     You can pick up right where you left off next session.";

/// Score given to every objective when an operator force-completes a session.
pub const FORCED_COMPLETION_SCORE: f64 = 0.85;

/// Upper bound on phase steps within one turn.
const MAX_STEPS_PER_TURN: usize = 32;

/// What happened to drive a phase change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseEvent {
    ContextLoaded,
    IntroPresented,
    NoPrerequisites,
    PrerequisitesReviewed,
    /// The model replied without a usable decision; stay put.
    DecisionPending,
    ObjectiveAdvanced,
    ObjectivesExhausted,
    ExitRequested,
    QuestionPresented,
    AnswerRecorded,
    AllQuestionsAnswered,
    TestSkipped,
    Graded,
    Wrapped,
    /// Operator override: finish the session without teaching or testing.
    ForceCompleted,
}

/// The transition table. `None` means the event is illegal in that phase.
pub fn transition(from: Phase, event: PhaseEvent) -> Option<Phase> {
    use Phase::*;
    use PhaseEvent::*;
    match (from, event) {
        (LoadContext, ContextLoaded) => Some(Intro),
        (Intro, IntroPresented) => Some(Recap),
        (Recap, NoPrerequisites | PrerequisitesReviewed) => Some(Teaching),
        (Recap, DecisionPending) => Some(Recap),
        (Teaching, ObjectiveAdvanced | DecisionPending) => Some(Teaching),
        (Teaching, ObjectivesExhausted | ExitRequested) => Some(Testing),
        (Testing, QuestionPresented | AnswerRecorded) => Some(Testing),
        (Testing, AllQuestionsAnswered) => Some(Grading),
        (Testing, TestSkipped) => Some(Wrap),
        (Grading, Graded) => Some(Wrap),
        (Wrap, Wrapped) => Some(Completed),
        (Completed, ForceCompleted) => None,
        (_, ForceCompleted) => Some(Completed),
        _ => None,
    }
}

/// The orchestrator's error type. Any error means the turn was not committed.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("text generation failed: {0}")]
    Generation(#[from] GenerationError),
    #[error("storage failure: {0}")]
    Storage(#[source] anyhow::Error),
    #[error("node {0} not found")]
    NodeNotFound(String),
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("session is already completed")]
    SessionCompleted,
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] ControlError),
}

impl From<GradingError> for TurnError {
    fn from(err: GradingError) -> Self {
        match err {
            GradingError::Generation(e) => TurnError::Generation(e),
            GradingError::Protocol(e) => TurnError::Protocol(e),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub retry: RetryPolicy,
    pub generation: GenerationOptions,
    pub interruption_threshold_minutes: f64,
    pub max_test_questions: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            generation: GenerationOptions::default(),
            interruption_threshold_minutes: crate::interruption::DEFAULT_INTERRUPTION_THRESHOLD_MINUTES,
            max_test_questions: 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PhaseChange {
    pub from: Phase,
    pub to: Phase,
    pub event: PhaseEvent,
}

/// The result of one committed turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub state: SessionState,
    /// Assistant messages appended during this turn, in order.
    pub replies: Vec<String>,
    pub transitions: Vec<PhaseChange>,
    pub usage: TokenUsage,
    /// Set when the model's control block could not be decoded; the phase
    /// did not advance.
    pub pending_decision: Option<ControlError>,
    /// Writes to apply together with `state`.
    pub effects: TurnEffects,
}

#[derive(Debug, Clone)]
pub struct ResumeOutcome {
    pub state: SessionState,
    pub interruption: Interruption,
    pub welcome_back: Option<String>,
}

enum Step {
    Continue,
    AwaitLearner,
}

#[derive(Default)]
struct TurnContext {
    /// The learner said something this turn that has not been answered yet.
    pending_input: bool,
    /// Phase entered during this turn, which may act without fresh input.
    entered: Option<Phase>,
    transitions: Vec<PhaseChange>,
    usage: TokenUsage,
    pending_decision: Option<ControlError>,
    effects: TurnEffects,
}

impl TurnContext {
    fn may_respond(&self, phase: Phase) -> bool {
        self.pending_input || self.entered == Some(phase)
    }

    fn responded(&mut self) {
        self.pending_input = false;
        self.entered = None;
    }
}

/// Runs tutoring turns against its collaborators.
pub struct Orchestrator {
    generator: Arc<dyn TextGenerator>,
    curriculum: Arc<dyn CurriculumStore>,
    personalization: Arc<dyn PersonalizationSource>,
    sessions: Arc<dyn SessionStore>,
    prompts: Arc<PromptLibrary>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        curriculum: Arc<dyn CurriculumStore>,
        personalization: Arc<dyn PersonalizationSource>,
        sessions: Arc<dyn SessionStore>,
        prompts: Arc<PromptLibrary>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            generator,
            curriculum,
            personalization,
            sessions,
            prompts,
            settings,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Runs the first turn of a new session and stores the result.
    pub async fn start_session(&self, state: SessionState) -> Result<TurnOutcome, TurnError> {
        let outcome = self.advance(&state, None).await?;
        self.commit(&outcome.state, &outcome.effects).await?;
        Ok(outcome)
    }

    /// Loads a session, runs one turn with `input` and stores the result.
    pub async fn take_turn(
        &self,
        session_id: &str,
        input: Option<&str>,
    ) -> Result<TurnOutcome, TurnError> {
        let state = self.load(session_id).await?;
        let outcome = self.advance(&state, input).await?;
        self.commit(&outcome.state, &outcome.effects).await?;
        Ok(outcome)
    }

    /// Flags the session for early exit and moves it on to testing.
    pub async fn request_exit(&self, session_id: &str) -> Result<TurnOutcome, TurnError> {
        let mut state = self.load(session_id).await?;
        state.request_exit();
        let outcome = self.advance(&state, None).await?;
        self.commit(&outcome.state, &outcome.effects).await?;
        Ok(outcome)
    }

    /// Operator override: marks every objective of the node as learned with
    /// [`FORCED_COMPLETION_SCORE`] (a direct overwrite, not a damped update)
    /// and completes the session with that score.
    pub async fn force_complete(&self, session_id: &str) -> Result<TurnOutcome, TurnError> {
        let state = self.load(session_id).await?;
        let outcome = self.force_complete_state(&state)?;
        self.commit(&outcome.state, &outcome.effects).await?;
        Ok(outcome)
    }

    /// The pure part of [`Orchestrator::force_complete`].
    pub fn force_complete_state(&self, state: &SessionState) -> Result<TurnOutcome, TurnError> {
        if state.current_phase == Phase::Completed {
            return Err(TurnError::SessionCompleted);
        }
        let mut next = state.clone();
        let start_len = next.history.len();
        let mut ctx = TurnContext::default();

        let scores: ScoreMap = next
            .all_objectives
            .iter()
            .map(|o| (o.id.clone(), FORCED_COMPLETION_SCORE))
            .collect();
        update_mastery(&mut next.all_objectives, &scores, MasteryUpdate::Direct);
        update_mastery(&mut next.objectives_to_teach, &scores, MasteryUpdate::Direct);
        if !scores.is_empty() {
            ctx.effects.mastery = Some(MasteryChange {
                node_id: next.node_id.clone(),
                scores: scores.clone(),
                mode: MasteryUpdate::Direct,
            });
        }
        ctx.effects.completed = Some(FORCED_COMPLETION_SCORE);
        next.objective_scores = scores;
        next.session_end = Some(now_timestamp());
        next.push_assistant(format!(
            "🔧 Session force-completed with {}% score",
            (FORCED_COMPLETION_SCORE * 100.0).round()
        ));
        warn!(session_id = %next.session_id, objectives = next.objective_scores.len(), "Session force-completed");
        self.apply(&mut next, &mut ctx, PhaseEvent::ForceCompleted)?;
        next.last_message_ts = Some(now_timestamp());
        Ok(finish_turn(next, start_len, ctx))
    }

    /// Reloads a session after the learner comes back and, if the gap was long
    /// enough, greets them with a summary of where they were.
    pub async fn resume(&self, session_id: &str) -> Result<ResumeOutcome, TurnError> {
        let state = self.load(session_id).await?;
        let outcome = self.resume_state(&state);
        if outcome.state != state {
            self.commit(&outcome.state, &TurnEffects::default()).await?;
        }
        Ok(outcome)
    }

    /// Remembers an image the learner can now see, so later teaching prompts
    /// can refer to it.
    pub async fn record_image(
        &self,
        session_id: &str,
        image: ImageRef,
    ) -> Result<SessionState, TurnError> {
        let mut state = self.load(session_id).await?;
        state.record_image(image.url, image.description, image.context);
        self.commit(&state, &TurnEffects::default()).await?;
        Ok(state)
    }

    /// The pure part of [`Orchestrator::resume`].
    pub fn resume_state(&self, state: &SessionState) -> ResumeOutcome {
        let interruption =
            detect_interruption(state, self.settings.interruption_threshold_minutes);
        if state.current_phase == Phase::Completed || !interruption.interrupted {
            return ResumeOutcome {
                state: state.clone(),
                interruption,
                welcome_back: None,
            };
        }

        let mut next = state.clone();
        next.interruption_detected = true;
        next.interruption_duration_minutes =
            Some((interruption.minutes_elapsed * 10.0).round() / 10.0);
        let message = welcome_back_message(&next, interruption.minutes_elapsed);
        next.push_assistant(message.clone());
        next.last_message_ts = Some(now_timestamp());
        info!(
            session_id = %next.session_id,
            minutes = interruption.minutes_elapsed,
            "Session resumed after interruption"
        );
        ResumeOutcome {
            state: next,
            interruption,
            welcome_back: Some(message),
        }
    }

    async fn load(&self, session_id: &str) -> Result<SessionState, TurnError> {
        self.sessions
            .load(session_id)
            .await
            .map_err(TurnError::Storage)?
            .ok_or_else(|| TurnError::SessionNotFound(session_id.to_string()))
    }

    async fn commit(&self, state: &SessionState, effects: &TurnEffects) -> Result<(), TurnError> {
        match self
            .sessions
            .commit(state, effects)
            .await
            .map_err(TurnError::Storage)?
        {
            SaveOutcome::Saved => {}
            SaveOutcome::UnknownSession => {
                warn!(session_id = %state.session_id, "Session not registered with the store; state not saved");
            }
        }
        Ok(())
    }

    /// Runs one learner turn without touching the session store.
    ///
    /// `state` is never modified; on success the returned outcome carries the
    /// new state.
    pub async fn advance(
        &self,
        state: &SessionState,
        input: Option<&str>,
    ) -> Result<TurnOutcome, TurnError> {
        let span = tracing::info_span!(
            "turn",
            session_id = %state.session_id,
            phase = %state.current_phase
        );
        self.run_turn(state, input).instrument(span).await
    }

    async fn run_turn(
        &self,
        state: &SessionState,
        input: Option<&str>,
    ) -> Result<TurnOutcome, TurnError> {
        if state.current_phase == Phase::Completed {
            return Err(TurnError::SessionCompleted);
        }

        let mut next = state.clone();
        let start_len = next.history.len();
        let start_idx = next.objective_idx;
        let mut ctx = TurnContext::default();

        if let Some(text) = input.map(str::trim).filter(|t| !t.is_empty()) {
            next.history.push(Turn::user(text));
            next.turn_count += 1;
            next.last_message_ts = Some(now_timestamp());
            ctx.pending_input = true;
        }

        let mut steps = 0;
        loop {
            steps += 1;
            if steps > MAX_STEPS_PER_TURN {
                return Err(TurnError::InvariantViolation(format!(
                    "turn did not settle after {} steps",
                    MAX_STEPS_PER_TURN
                )));
            }
            let step = match next.current_phase {
                Phase::LoadContext => self.load_context(&mut next, &mut ctx).await?,
                Phase::Intro => self.intro(&mut next, &mut ctx)?,
                Phase::Recap => self.recap(&mut next, &mut ctx).await?,
                Phase::Teaching => self.teaching(&mut next, &mut ctx).await?,
                Phase::Testing => self.testing(&mut next, &mut ctx).await?,
                Phase::Grading => self.grading(&mut next, &mut ctx).await?,
                Phase::Wrap => self.wrap(&mut next, &mut ctx).await?,
                Phase::Completed => Step::AwaitLearner,
            };
            if let Step::AwaitLearner = step {
                break;
            }
        }

        if next.objective_idx < start_idx {
            return Err(TurnError::InvariantViolation(
                "objective cursor moved backwards".to_string(),
            ));
        }
        if next.history.len() > start_len {
            next.last_message_ts = Some(now_timestamp());
        }
        Ok(finish_turn(next, start_len, ctx))
    }

    fn apply(
        &self,
        state: &mut SessionState,
        ctx: &mut TurnContext,
        event: PhaseEvent,
    ) -> Result<(), TurnError> {
        let from = state.current_phase;
        let to = transition(from, event).ok_or_else(|| {
            TurnError::InvariantViolation(format!("no transition from {} on {:?}", from, event))
        })?;
        if to != from {
            info!(%from, %to, ?event, "Phase transition");
            ctx.entered = Some(to);
            ctx.transitions.push(PhaseChange { from, to, event });
        }
        state.current_phase = to;
        Ok(())
    }

    async fn generate(
        &self,
        system: String,
        history: &[Turn],
        nudge: Option<&str>,
        ctx: &mut TurnContext,
    ) -> Result<String, TurnError> {
        let mut messages = history.to_vec();
        if let Some(nudge) = nudge {
            messages.push(Turn::user(nudge));
        }
        let prompt = Prompt::new(system).with_messages(messages);
        let completion = complete_with_retry(
            self.generator.as_ref(),
            &prompt,
            &self.settings.generation,
            &self.settings.retry,
        )
        .await
        .inspect_err(|e| error!(error = %e, "Text generation failed; turn aborted"))?;
        ctx.usage += completion.usage;
        Ok(completion.text)
    }

    async fn load_context(
        &self,
        state: &mut SessionState,
        ctx: &mut TurnContext,
    ) -> Result<Step, TurnError> {
        let node = self
            .curriculum
            .load_node(&state.node_id)
            .await
            .map_err(TurnError::Storage)?
            .ok_or_else(|| TurnError::NodeNotFound(state.node_id.clone()))?;

        let objectives = node
            .objectives
            .into_iter()
            .map(|o| o.with_node(node.id.clone()))
            .collect();
        state.partition_objectives(objectives);
        state.node_original_id = node.original_id;
        state.node_title = node.title;
        state.project_topic = node.topic;
        state.references = node.references;
        state.prerequisite_objectives = self
            .curriculum
            .prerequisite_objectives(&state.project_id, &state.node_original_id)
            .await
            .map_err(TurnError::Storage)?;
        state.resources = self
            .curriculum
            .project_resources(&state.project_id)
            .await
            .map_err(TurnError::Storage)?;
        state.learner_profile_context = self
            .personalization
            .get_context(&state.project_id, &state.project_topic)
            .await;

        info!(
            objectives = state.all_objectives.len(),
            to_teach = state.objectives_to_teach.len(),
            already_known = state.objectives_already_known.len(),
            prerequisites = state.prerequisite_objectives.len(),
            "Session context loaded"
        );
        self.apply(state, ctx, PhaseEvent::ContextLoaded)?;
        Ok(Step::Continue)
    }

    fn intro(&self, state: &mut SessionState, ctx: &mut TurnContext) -> Result<Step, TurnError> {
        if !state.history.iter().any(|t| t.role == Role::Assistant) {
            let message = intro_message(&state.node_title, &state.objectives_to_teach);
            state.push_assistant(message);
        }
        self.apply(state, ctx, PhaseEvent::IntroPresented)?;
        Ok(Step::Continue)
    }

    async fn recap(
        &self,
        state: &mut SessionState,
        ctx: &mut TurnContext,
    ) -> Result<Step, TurnError> {
        if !state.has_prerequisites() {
            self.apply(state, ctx, PhaseEvent::NoPrerequisites)?;
            return Ok(Step::Continue);
        }
        if !ctx.may_respond(Phase::Recap) {
            return Ok(Step::AwaitLearner);
        }

        let recap_objectives: Vec<String> = state
            .prerequisite_objectives
            .iter()
            .chain(&state.objectives_already_known)
            .map(|o| o.description.clone())
            .collect();
        let next_objective = state
            .objectives_to_teach
            .first()
            .map(|o| o.description.as_str())
            .unwrap_or("our next topic");
        let system = self.prompts.recap(
            &recap_objectives,
            next_objective,
            &reference_bullets(&state.references),
            &state.learner_profile_context,
        );
        let nudge = last_is_assistant(state).then_some("I'm ready for a quick recap.");
        let raw = self.generate(system, &state.history, nudge, ctx).await?;
        ctx.responded();

        state.push_assistant(strip_control_blocks(&raw));
        match extract::<RecapControl>(&raw) {
            Ok(Some(RecapControl { prereq_complete: true })) => {
                self.apply(state, ctx, PhaseEvent::PrerequisitesReviewed)?;
                Ok(Step::Continue)
            }
            Ok(_) => {
                self.apply(state, ctx, PhaseEvent::DecisionPending)?;
                Ok(Step::AwaitLearner)
            }
            Err(e) => {
                warn!(error = %e, "Malformed recap control block; decision pending");
                ctx.pending_decision = Some(e);
                self.apply(state, ctx, PhaseEvent::DecisionPending)?;
                Ok(Step::AwaitLearner)
            }
        }
    }

    async fn teaching(
        &self,
        state: &mut SessionState,
        ctx: &mut TurnContext,
    ) -> Result<Step, TurnError> {
        if state.objective_idx > state.objectives_to_teach.len() {
            return Err(TurnError::InvariantViolation(format!(
                "objective cursor {} beyond {} objectives",
                state.objective_idx,
                state.objectives_to_teach.len()
            )));
        }
        if state.exit_requested {
            self.apply(state, ctx, PhaseEvent::ExitRequested)?;
            return Ok(Step::Continue);
        }
        let Some(objective) = state.current_objective().cloned() else {
            self.apply(state, ctx, PhaseEvent::ObjectivesExhausted)?;
            return Ok(Step::Continue);
        };
        if !ctx.may_respond(Phase::Teaching) {
            return Ok(Step::AwaitLearner);
        }

        let recent: Vec<String> = state
            .objectives_already_known
            .iter()
            .map(|o| o.description.clone())
            .collect();
        let remaining: Vec<String> = state.objectives_to_teach[state.objective_idx + 1..]
            .iter()
            .map(|o| o.description.clone())
            .collect();
        let system = self.prompts.teaching(
            &objective.id,
            &objective.description,
            &recent,
            &remaining,
            &reference_bullets(&state.references),
            &state.learner_profile_context,
            &state.displayed_images.prompt_context(),
        );
        let raw = self
            .generate(system, &state.history, teaching_nudge(state), ctx)
            .await?;
        ctx.responded();

        let display = if raw.trim().is_empty() {
            warn!(objective_id = %objective.id, "Empty model reply; using fallback");
            format!(
                "Let me introduce you to: {}. What do you think this concept might involve?",
                objective.description
            )
        } else {
            let stripped = strip_control_blocks(&raw);
            if stripped.is_empty() {
                format!(
                    "Let's explore: {}. What questions do you have about this topic?",
                    objective.description
                )
            } else {
                stripped
            }
        };
        state.push_assistant(display);

        let complete = match extract::<TeachingControl>(&raw) {
            Ok(control) => control.is_some_and(|c| c.objective_complete),
            Err(e) => {
                warn!(objective_id = %objective.id, error = %e, "Malformed teaching control block; decision pending");
                ctx.pending_decision = Some(e);
                false
            }
        };
        if !complete {
            self.apply(state, ctx, PhaseEvent::DecisionPending)?;
            return Ok(Step::AwaitLearner);
        }

        state.complete_current_objective();
        info!(objective_id = %objective.id, cursor = state.objective_idx, "Objective completed");
        let handoff = match state.current_objective() {
            Some(next) => format!("{} {}", NEXT_OBJECTIVE_PREFIX, next.description),
            None => TESTING_HANDOFF.to_string(),
        };
        state.push_assistant(handoff);
        self.apply(state, ctx, PhaseEvent::ObjectiveAdvanced)?;

        if state.all_objectives_completed() {
            Ok(Step::Continue)
        } else {
            Ok(Step::AwaitLearner)
        }
    }

    async fn testing(
        &self,
        state: &mut SessionState,
        ctx: &mut TurnContext,
    ) -> Result<Step, TurnError> {
        if state.quiz.questions.is_empty() {
            let objectives = state.objectives_for_testing();
            if objectives.is_empty() {
                state.push_assistant(TEST_SKIPPED);
                self.apply(state, ctx, PhaseEvent::TestSkipped)?;
                return Ok(Step::Continue);
            }
            let (questions, usage) = quiz::generate_final_test(
                self.generator.as_ref(),
                &self.prompts,
                &objectives,
                self.settings.max_test_questions,
                &self.settings.retry,
            )
            .await?;
            ctx.usage += usage;
            info!(questions = questions.len(), "Final test generated");
            state.quiz.questions = questions;
            state.quiz.answers.clear();
            state.quiz.question_idx = 0;
            state.quiz.awaiting_answer = false;
        }

        if state.quiz.awaiting_answer {
            if !ctx.pending_input {
                return Ok(Step::AwaitLearner);
            }
            let raw = state
                .history
                .last()
                .filter(|t| t.role == Role::User)
                .map(|t| t.content.clone())
                .unwrap_or_default();
            let idx = state.quiz.question_idx;
            let question = state.quiz.current_question().cloned().ok_or_else(|| {
                TurnError::InvariantViolation(format!("no question at index {}", idx))
            })?;
            state.quiz.answers.push(TestAnswer {
                question_idx: idx,
                answer: quiz::normalize_answer(&raw, &question),
                question,
                timestamp: now_timestamp(),
            });
            state.quiz.question_idx += 1;
            state.quiz.awaiting_answer = false;
            ctx.responded();
            self.apply(state, ctx, PhaseEvent::AnswerRecorded)?;
            return Ok(Step::Continue);
        }

        if state.quiz.all_answered() {
            self.apply(state, ctx, PhaseEvent::AllQuestionsAnswered)?;
            return Ok(Step::Continue);
        }

        let idx = state.quiz.question_idx;
        let total = state.quiz.questions.len();
        let question = state.quiz.current_question().ok_or_else(|| {
            TurnError::InvariantViolation(format!("question cursor {} beyond {} questions", idx, total))
        })?;
        let message = quiz::present_question(question, idx, total);
        state.push_assistant(message);
        state.quiz.awaiting_answer = true;
        self.apply(state, ctx, PhaseEvent::QuestionPresented)?;
        Ok(Step::AwaitLearner)
    }

    async fn grading(
        &self,
        state: &mut SessionState,
        ctx: &mut TurnContext,
    ) -> Result<Step, TurnError> {
        let questions = state.quiz.questions.len();
        if questions == 0 || state.quiz.answers.len() != questions {
            return Err(TurnError::InvariantViolation(format!(
                "grading {} answers for {} questions",
                state.quiz.answers.len(),
                questions
            )));
        }

        let graded = quiz::grade_answers(
            self.generator.as_ref(),
            &self.prompts,
            &state.quiz.answers,
            &self.settings.retry,
        )
        .await?;
        ctx.usage += graded.usage;

        let scores = quiz::scores_by_objective(&state.quiz.answers, &graded.per_question);
        update_mastery(&mut state.all_objectives, &scores, MasteryUpdate::Damped);
        update_mastery(&mut state.objectives_to_teach, &scores, MasteryUpdate::Damped);
        info!(
            node_mastery = node_mastery(&state.all_objectives),
            scored = scores.len(),
            "Mastery updated from final test"
        );
        ctx.effects.mastery = Some(MasteryChange {
            node_id: state.node_id.clone(),
            scores: scores.clone(),
            mode: MasteryUpdate::Damped,
        });

        let mut summary = quiz::results_summary(&graded.per_question);
        if !graded.feedback.is_empty() {
            summary = format!("{}\n\n{}", graded.feedback, summary);
        }
        state.push_assistant(summary);
        state.objective_scores = scores;
        state.session_end = Some(now_timestamp());
        self.apply(state, ctx, PhaseEvent::Graded)?;
        Ok(Step::Continue)
    }

    async fn wrap(&self, state: &mut SessionState, ctx: &mut TurnContext) -> Result<Step, TurnError> {
        if state.session_end.is_none() {
            state.session_end = Some(now_timestamp());
        }
        let final_score = state.final_score();
        ctx.effects.completed = Some(final_score);
        state.push_assistant(wrap_message(state, final_score));
        info!(final_score, duration_minutes = state.duration_minutes(), "Session completed");
        self.apply(state, ctx, PhaseEvent::Wrapped)?;
        Ok(Step::AwaitLearner)
    }
}

fn finish_turn(state: SessionState, start_len: usize, ctx: TurnContext) -> TurnOutcome {
    let replies = state.history[start_len..]
        .iter()
        .filter(|t| t.role == Role::Assistant)
        .map(|t| t.content.clone())
        .collect();
    TurnOutcome {
        state,
        replies,
        transitions: ctx.transitions,
        usage: ctx.usage,
        pending_decision: ctx.pending_decision,
        effects: ctx.effects,
    }
}

fn last_is_assistant(state: &SessionState) -> bool {
    state
        .history
        .last()
        .is_none_or(|t| t.role == Role::Assistant)
}

/// A stand-in learner message so the model always answers a user turn. It is
/// part of the prompt only, never of the transcript.
fn teaching_nudge(state: &SessionState) -> Option<&'static str> {
    if !last_is_assistant(state) {
        return None;
    }
    if !state.history.iter().any(|t| t.role == Role::User) {
        return Some("I'm ready to start learning.");
    }
    let after_handoff = state
        .history
        .last()
        .is_some_and(|t| t.content.starts_with(NEXT_OBJECTIVE_PREFIX));
    if after_handoff {
        Some("I'm ready to learn about this new topic.")
    } else {
        Some("Please continue.")
    }
}

fn intro_message(title: &str, objectives: &[Objective]) -> String {
    let title = if title.is_empty() { "Learning Session" } else { title };
    if objectives.is_empty() {
        return format!(
            "# 🎓 **Welcome to: {}**\n\nLet's begin this learning session! I'm here to guide you through the material.",
            title
        );
    }
    let list = objectives
        .iter()
        .map(|o| format!("• {}", o.description))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "# 🎓 **Welcome to: {}**\n\n## 📚 **In this lesson, you will learn:**\n\n{}\n\n\
         **Let's begin your learning journey!** 🚀\n\n\
         I'm here to guide you through each of these objectives step by step. Are you ready to start?",
        title, list
    )
}

fn wrap_message(state: &SessionState, final_score: f64) -> String {
    let encouragement = if meets_threshold(final_score) {
        "Great job! You've shown solid understanding of the material."
    } else {
        "Keep practicing! You're making progress."
    };
    format!(
        "## Session Complete! 🎉\n\n**Final Score:** {}%\n**Duration:** {} minutes\n\
         **Objectives Covered:** {}\n\n{}\n\nSee you next time!",
        (final_score * 100.0).round(),
        state.duration_minutes().round(),
        state.completed_objectives.len(),
        encouragement
    )
}

fn format_gap(minutes: f64) -> String {
    if minutes < 90.0 {
        format!("{} minutes", minutes.round())
    } else if minutes < 48.0 * 60.0 {
        format!("{} hours", (minutes / 60.0).round())
    } else {
        format!("{} days", (minutes / (24.0 * 60.0)).round())
    }
}

fn welcome_back_message(state: &SessionState, minutes: f64) -> String {
    let mut message = format!(
        "👋 Welcome back! It's been about {} since we last spoke.",
        format_gap(minutes)
    );
    match state.current_phase {
        Phase::Teaching => match state.current_objective() {
            Some(objective) => message.push_str(&format!(
                " We were working on: **{}**. Let's pick up where we left off.",
                objective.description
            )),
            None => message.push_str(" Let's pick up where we left off."),
        },
        Phase::Recap => message.push_str(" We were reviewing what you already know. Let's continue the recap."),
        Phase::Testing => match state.quiz.current_question().filter(|_| state.quiz.awaiting_answer) {
            Some(question) => message.push_str(&format!(
                " You were in the middle of the final test. Here's the question again:\n\n{}",
                quiz::present_question(question, state.quiz.question_idx, state.quiz.questions.len())
            )),
            None => message.push_str(" Let's continue with the final test."),
        },
        _ => message.push_str(" Let's pick up where we left off."),
    }
    message
}
