//! Prompt templates for the tutor model.
//!
//! Templates use `{PLACEHOLDER}` markers. Built-in defaults cover every prompt;
//! a directory of `*.md` files can override them by file stem
//! (`teaching.md`, `recap.md`, `final_test.md`, `grading.md`).

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub const TEACHING: &str = "teaching";
pub const RECAP: &str = "recap";
pub const FINAL_TEST: &str = "final_test";
pub const GRADING: &str = "grading";

const DEFAULT_TEACHING: &str = r#"You are a patient one-on-one tutor teaching a single learning objective.

CURRENT OBJECTIVE ({OBJ_ID}): {OBJ_LABEL}

Topics the learner has recently mastered: {RECENT_TOPICS}
Objectives still to come (do NOT teach these yet): {REMAINING_OBJS}

Teach in short, conversational steps. Ask one question at a time and check the
learner's understanding before moving on. Cite references as [rid §section].

REFERENCES:
{REF_LIST_BULLETS}

{LEARNER_PROFILE_CONTEXT}{VISIBLE_IMAGES_CONTEXT}

When, and only when, the learner has demonstrated mastery of the current
objective, end your reply with exactly:
<control>{"objective_complete": true}</control>
Otherwise end with:
<control>{"objective_complete": false}</control>"#;

const DEFAULT_RECAP: &str = r#"You are a tutor opening a lesson with a brief recap of prerequisite knowledge.

Prerequisite objectives: {RECENT_LOS}
The lesson will continue with: {NEXT_OBJ}

Present up to three key take-aways from the prerequisites and ask the learner
one quick question to confirm they remember them.

REFERENCES:
{REF_LIST_BULLETS}

{LEARNER_PROFILE_CONTEXT}

When the learner has answered the recap satisfactorily, end your reply with:
<control>{"prereq_complete": true}</control>
Otherwise end with:
<control>{"prereq_complete": false}</control>"#;

const DEFAULT_FINAL_TEST: &str = r#"You are an assessment author.

Write {N} stand-alone quiz questions that test the learner's knowledge of the
following learning objectives (id: description):

{OBJ_LIST}

Rules
-----
1. Vary the type: "mcq" (with a "choices" list), "short", "free" or "paraphrase".
2. Cover every objective at least once; list the ids each question tests.
3. Reply with ONLY a JSON array of objects shaped like:
   {"q": "...", "type": "mcq", "choices": ["...", "..."], "answer": "B", "objective_ids": ["..."]}"#;

const DEFAULT_GRADING: &str = r#"You are grading a learner's answers to a short quiz.

For each numbered item, score the answer from 0.0 (wrong) to 1.0 (fully correct)
against the expected answer. Accept paraphrases that preserve the meaning.

{ITEMS}

Give one sentence of feedback per item, then end your reply with:
<control>{"scores": [<one number per item, in order>]}</control>"#;

/// Bullet list for the reference section of prompts.
pub fn reference_bullets(references: &[crate::session::Reference]) -> String {
    if references.is_empty() {
        return "No specific references".to_string();
    }
    references
        .iter()
        .map(|r| r.bullet())
        .collect::<Vec<_>>()
        .join("\n")
}

/// The set of prompt templates used by the orchestrator.
#[derive(Debug, Clone)]
pub struct PromptLibrary {
    templates: HashMap<String, String>,
}

impl Default for PromptLibrary {
    fn default() -> Self {
        let templates = [
            (TEACHING, DEFAULT_TEACHING),
            (RECAP, DEFAULT_RECAP),
            (FINAL_TEST, DEFAULT_FINAL_TEST),
            (GRADING, DEFAULT_GRADING),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self { templates }
    }
}

impl PromptLibrary {
    /// Loads the defaults, then overrides them with any `*.md` files in `dir`.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut library = Self::default();
        for entry in fs::read_dir(dir)
            .with_context(|| format!("Failed to read prompts directory {}", dir.display()))?
        {
            let path = entry?.path();
            if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
                let key = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .context("Could not get file stem")?
                    .to_string();
                let content = fs::read_to_string(&path)?;
                tracing::debug!(prompt = %key, "Loaded prompt override");
                library.templates.insert(key, content.trim().to_string());
            }
        }
        Ok(library)
    }

    /// Renders template `key`, substituting each `{NAME}` in `vars`.
    ///
    /// Unknown keys render as an empty string; every built-in key always exists.
    pub fn render(&self, key: &str, vars: &[(&str, &str)]) -> String {
        let Some(template) = self.templates.get(key) else {
            tracing::error!(prompt = %key, "Missing prompt template");
            return String::new();
        };
        vars.iter().fold(template.clone(), |acc, (name, value)| {
            acc.replace(&format!("{{{}}}", name), value)
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn teaching(
        &self,
        objective_id: &str,
        objective_label: &str,
        recent: &[String],
        remaining: &[String],
        references: &str,
        learner_profile: &str,
        visible_images: &str,
    ) -> String {
        self.render(
            TEACHING,
            &[
                ("OBJ_ID", objective_id),
                ("OBJ_LABEL", objective_label),
                ("RECENT_TOPICS", &recent.join("; ")),
                ("REMAINING_OBJS", &remaining.join("; ")),
                ("REF_LIST_BULLETS", references),
                ("LEARNER_PROFILE_CONTEXT", learner_profile),
                ("VISIBLE_IMAGES_CONTEXT", visible_images),
            ],
        )
    }

    pub fn recap(
        &self,
        recap_objectives: &[String],
        next_objective: &str,
        references: &str,
        learner_profile: &str,
    ) -> String {
        self.render(
            RECAP,
            &[
                ("RECENT_LOS", &recap_objectives.join("; ")),
                ("NEXT_OBJ", next_objective),
                ("REF_LIST_BULLETS", references),
                ("LEARNER_PROFILE_CONTEXT", learner_profile),
            ],
        )
    }

    pub fn final_test(&self, question_count: usize, objective_list: &str) -> String {
        self.render(
            FINAL_TEST,
            &[("N", &question_count.to_string()), ("OBJ_LIST", objective_list)],
        )
    }

    pub fn grading(&self, items: &str) -> String {
        self.render(GRADING, &[("ITEMS", items)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_teaching_prompt_substitution() {
        let library = PromptLibrary::default();
        let prompt = library.teaching(
            "o2",
            "Compute a derivative",
            &["Limits".to_string(), "Continuity".to_string()],
            &["Chain rule".to_string()],
            "No specific references",
            "Prefers worked examples.",
            "",
        );
        assert!(prompt.contains("CURRENT OBJECTIVE (o2): Compute a derivative"));
        assert!(prompt.contains("recently mastered: Limits; Continuity"));
        assert!(prompt.contains("do NOT teach these yet): Chain rule"));
        assert!(prompt.contains("Prefers worked examples."));
        assert!(prompt.contains(r#"<control>{"objective_complete": true}</control>"#));
        assert!(!prompt.contains("{OBJ_ID}"));
    }

    #[test]
    fn test_recap_prompt_substitution() {
        let library = PromptLibrary::default();
        let prompt = library.recap(&["Fractions".to_string()], "Ratios", "refs", "");
        assert!(prompt.contains("Prerequisite objectives: Fractions"));
        assert!(prompt.contains("continue with: Ratios"));
        assert!(prompt.contains(r#"{"prereq_complete": true}"#));
    }

    #[test]
    fn test_overrides_from_directory() {
        let dir = std::env::temp_dir().join(format!("autodidact-prompts-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("recap.md"), "Recap {RECENT_LOS} then {NEXT_OBJ}\n").unwrap();
        fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let library = PromptLibrary::from_dir(&dir).unwrap();
        assert_eq!(library.recap(&["A".into()], "B", "", ""), "Recap A then B");
        assert!(library.teaching("o", "l", &[], &[], "", "", "").contains("CURRENT OBJECTIVE"));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_unknown_template_renders_empty() {
        assert_eq!(PromptLibrary::default().render("missing", &[]), "");
    }
}
