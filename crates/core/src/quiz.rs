//! Final-test generation, answer normalization and grading.

use crate::control::{ControlError, GradingControl, extract, strip_control_blocks};
use crate::llm_client::{
    GenerationError, GenerationOptions, Prompt, RetryPolicy, TextGenerator, TokenUsage,
    complete_with_retry,
};
use crate::objective::{Objective, QuestionKind, QuizQuestion, ScoreMap, TestAnswer};
use crate::prompts::PromptLibrary;
use crate::session::Turn;
use std::collections::{BTreeMap, HashSet};

/// Used when the model's question list cannot be parsed.
pub const FALLBACK_QUESTIONS: [&str; 3] = [
    "Can you explain the main concept we covered today in your own words?",
    "What was the most important thing you learned in this session?",
    "How would you apply what you learned to a real-world scenario?",
];

#[derive(Debug, thiserror::Error)]
pub enum GradingError {
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Protocol(#[from] ControlError),
}

/// Three generic free-response questions covering every tested objective.
pub fn fallback_questions(objectives: &[Objective]) -> Vec<QuizQuestion> {
    let ids: Vec<String> = objectives.iter().map(|o| o.id.clone()).collect();
    FALLBACK_QUESTIONS
        .iter()
        .map(|q| QuizQuestion {
            question: q.to_string(),
            kind: QuestionKind::FreeResponse,
            choices: None,
            answer: String::new(),
            objective_ids: ids.clone(),
        })
        .collect()
}

/// Parses the model's JSON question array.
///
/// Returns `None` when no usable question survives. Invalid entries and
/// multiple-choice questions without choices are dropped; objective ids that
/// are not under test are removed, and a question left with none is assigned
/// every tested objective.
pub fn parse_questions(
    raw: &str,
    objectives: &[Objective],
    max_questions: usize,
) -> Option<Vec<QuizQuestion>> {
    let start = raw.find('[')?;
    let end = raw.rfind(']')?;
    if end <= start {
        return None;
    }
    let items: Vec<serde_json::Value> = serde_json::from_str(&raw[start..=end]).ok()?;

    let known: HashSet<&str> = objectives.iter().map(|o| o.id.as_str()).collect();
    let questions: Vec<QuizQuestion> = items
        .into_iter()
        .filter_map(|item| serde_json::from_value::<QuizQuestion>(item).ok())
        .filter(|q| !q.question.trim().is_empty())
        .filter(|q| {
            q.kind != QuestionKind::MultipleChoice
                || q.choices.as_ref().is_some_and(|c| !c.is_empty())
        })
        .map(|mut q| {
            q.objective_ids.retain(|id| known.contains(id.as_str()));
            if q.objective_ids.is_empty() {
                q.objective_ids = objectives.iter().map(|o| o.id.clone()).collect();
            }
            q
        })
        .take(max_questions)
        .collect();

    if questions.is_empty() { None } else { Some(questions) }
}

fn objective_list(objectives: &[Objective]) -> String {
    objectives
        .iter()
        .map(|o| format!("- {}: {}", o.id, o.description))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Asks the model for up to `max_questions` questions on `objectives`.
///
/// Generation failures propagate; an unusable reply falls back to
/// [`fallback_questions`]. Either way the test has at least one question and
/// never more than `max_questions`.
pub async fn generate_final_test(
    generator: &dyn TextGenerator,
    prompts: &PromptLibrary,
    objectives: &[Objective],
    max_questions: usize,
    policy: &RetryPolicy,
) -> Result<(Vec<QuizQuestion>, TokenUsage), GenerationError> {
    let max_questions = max_questions.max(1);
    let system = prompts.final_test(max_questions, &objective_list(objectives));
    let prompt = Prompt::new(system).with_messages(vec![Turn::user("Write the test now.")]);
    let completion =
        complete_with_retry(generator, &prompt, &GenerationOptions::default(), policy).await?;

    let questions = match parse_questions(&completion.text, objectives, max_questions) {
        Some(questions) => questions,
        None => {
            tracing::warn!("Could not parse generated test; using fallback questions");
            let mut questions = fallback_questions(objectives);
            questions.truncate(max_questions);
            questions
        }
    };
    Ok((questions, completion.usage))
}

fn choice_index(answer: &str) -> Option<usize> {
    let mut chars = answer.chars();
    let c = chars.next()?;
    if chars.next().is_some() {
        return None;
    }
    if c.is_ascii_alphabetic() {
        Some((c.to_ascii_uppercase() as u8 - b'A') as usize)
    } else {
        c.to_digit(10)
            .filter(|d| *d >= 1)
            .map(|d| d as usize - 1)
    }
}

/// Expands a single-character answer (`"b"`, `"2"`) to the matching choice
/// text. Anything else is returned trimmed.
pub fn normalize_answer(raw: &str, question: &QuizQuestion) -> String {
    let answer = raw.trim();
    let choice = question
        .choices
        .as_ref()
        .zip(choice_index(answer))
        .and_then(|(choices, idx)| choices.get(idx));
    match choice {
        Some(text) => text.clone(),
        None => answer.to_string(),
    }
}

/// Scores a multiple-choice answer locally: 1.0 when it matches the expected
/// answer by letter or by text, otherwise 0.0.
pub fn score_choice(question: &QuizQuestion, answer: &str) -> f64 {
    let expected = normalize_answer(&question.answer, question);
    let given = normalize_answer(answer, question);
    if !expected.is_empty() && expected.eq_ignore_ascii_case(&given) {
        1.0
    } else {
        0.0
    }
}

fn grading_items(items: &[(usize, &TestAnswer)]) -> String {
    items
        .iter()
        .enumerate()
        .map(|(n, (_, a))| {
            let expected = if a.question.answer.is_empty() {
                "(open-ended; judge accuracy and completeness)"
            } else {
                a.question.answer.as_str()
            };
            format!(
                "Item {}\nQuestion: {}\nExpected answer: {}\nLearner answer: {}",
                n + 1,
                a.question.question,
                expected,
                a.answer
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// The graded final test.
#[derive(Debug, Clone, PartialEq)]
pub struct GradedTest {
    /// One score in `[0, 1]` per answer, in answer order.
    pub per_question: Vec<f64>,
    /// Learner-facing feedback from the grader, control block removed.
    pub feedback: String,
    pub usage: TokenUsage,
}

/// Grades every answer. Multiple-choice answers are scored locally; the rest
/// are scored in one model call whose reply must carry a grading control block.
pub async fn grade_answers(
    generator: &dyn TextGenerator,
    prompts: &PromptLibrary,
    answers: &[TestAnswer],
    policy: &RetryPolicy,
) -> Result<GradedTest, GradingError> {
    let mut per_question: Vec<f64> = answers
        .iter()
        .map(|a| match a.question.kind {
            QuestionKind::MultipleChoice => score_choice(&a.question, &a.answer),
            _ => 0.0,
        })
        .collect();

    let open: Vec<(usize, &TestAnswer)> = answers
        .iter()
        .enumerate()
        .filter(|(_, a)| a.question.kind != QuestionKind::MultipleChoice)
        .collect();
    if open.is_empty() {
        return Ok(GradedTest {
            per_question,
            feedback: String::new(),
            usage: TokenUsage::default(),
        });
    }

    let prompt = Prompt::new(prompts.grading(&grading_items(&open)))
        .with_messages(vec![Turn::user("Grade these answers.")]);
    let options = GenerationOptions {
        temperature: Some(0.0),
        ..GenerationOptions::default()
    };
    let completion = complete_with_retry(generator, &prompt, &options, policy).await?;

    let control = extract::<GradingControl>(&completion.text)?
        .ok_or(ControlError::Missing("grading"))?;
    if control.scores.len() != open.len() {
        return Err(ControlError::SchemaViolation {
            schema: "grading",
            reason: format!(
                "expected {} scores, got {}",
                open.len(),
                control.scores.len()
            ),
        }
        .into());
    }
    for ((idx, _), score) in open.iter().zip(control.scores) {
        per_question[*idx] = if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) };
    }

    Ok(GradedTest {
        per_question,
        feedback: strip_control_blocks(&completion.text),
        usage: completion.usage,
    })
}

/// Per-objective score: the mean of the scores of the questions exercising it.
pub fn scores_by_objective(answers: &[TestAnswer], per_question: &[f64]) -> ScoreMap {
    let mut totals: BTreeMap<String, (f64, usize)> = BTreeMap::new();
    for (answer, score) in answers.iter().zip(per_question) {
        for id in &answer.question.objective_ids {
            let entry = totals.entry(id.clone()).or_insert((0.0, 0));
            entry.0 += score;
            entry.1 += 1;
        }
    }
    totals
        .into_iter()
        .map(|(id, (sum, count))| (id, sum / count as f64))
        .collect()
}

/// The "Test Results" message shown after grading.
pub fn results_summary(per_question: &[f64]) -> String {
    let lines = per_question
        .iter()
        .enumerate()
        .map(|(i, s)| format!("Q{}: {}%", i + 1, (s * 100.0).round()))
        .collect::<Vec<_>>()
        .join("\n");
    let overall = if per_question.is_empty() {
        0.0
    } else {
        per_question.iter().sum::<f64>() / per_question.len() as f64
    };
    format!(
        "### Test Results\n{}\n\n**Overall score:** {}%",
        lines,
        (overall * 100.0).round()
    )
}

/// `"**Question 2/5:**"` followed by the formatted question.
pub fn present_question(question: &QuizQuestion, idx: usize, total: usize) -> String {
    format!(
        "**Question {}/{}:**\n\n{}",
        idx + 1,
        total,
        question.format_for_display()
    )
}
