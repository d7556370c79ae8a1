//! Control-Block Protocol
//!
//! The tutor model embeds structured decisions in its free-text replies as a
//! single inline span: `<control>{"objective_complete": true}</control>`.
//!
//! Two independent pure functions operate on the *raw* reply:
//!
//! - [`extract_control_block`] finds the first span, parses it as JSON and
//!   optionally validates it against a [`ControlSchema`].
//! - [`strip_control_blocks`] removes every span (well-formed or not) and
//!   tidies whitespace, producing the text shown to the learner.
//!
//! Neither consumes the other's output, so a block that fails to parse is still
//! hidden from the learner.

use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::LazyLock;

pub const CONTROL_OPEN: &str = "<control>";
pub const CONTROL_CLOSE: &str = "</control>";

static CONTROL_SPAN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<control>(.*?)</control>").expect("valid control regex"));
/// An opening sentinel that is never closed swallows the rest of its line only.
static DANGLING_OPEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<control>[^\n]*").expect("valid dangling regex"));
static INLINE_SPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]+").expect("valid space regex"));
static TRAILING_SPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]+\n").expect("valid trailing space regex"));
static BLANK_LINES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n\s*\n+").expect("valid blank line regex"));

/// Errors raised while decoding a control block.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ControlError {
    #[error("control block is malformed: {0}")]
    Malformed(String),
    #[error("control block violates the {schema} schema: {reason}")]
    SchemaViolation { schema: &'static str, reason: String },
    #[error("expected a {0} control block but none was present")]
    Missing(&'static str),
}

/// The per-phase payload schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSchema {
    /// `{ "objective_complete": bool }`
    Teaching,
    /// `{ "prereq_complete": bool }`
    Recap,
    /// `{ "scores": [number] }`
    Grading,
}

impl ControlSchema {
    pub fn name(self) -> &'static str {
        match self {
            ControlSchema::Teaching => "teaching",
            ControlSchema::Recap => "recap",
            ControlSchema::Grading => "grading",
        }
    }

    fn required_key(self) -> &'static str {
        match self {
            ControlSchema::Teaching => "objective_complete",
            ControlSchema::Recap => "prereq_complete",
            ControlSchema::Grading => "scores",
        }
    }

    fn violation(self, reason: impl Into<String>) -> ControlError {
        ControlError::SchemaViolation {
            schema: self.name(),
            reason: reason.into(),
        }
    }

    /// Checks required keys, their types, and rejects unknown keys.
    pub fn validate(self, payload: &Value) -> Result<(), ControlError> {
        let object = payload
            .as_object()
            .ok_or_else(|| self.violation("payload is not an object"))?;
        let key = self.required_key();

        if let Some(unknown) = object.keys().find(|k| k.as_str() != key) {
            return Err(self.violation(format!("unknown key '{}'", unknown)));
        }
        let value = object
            .get(key)
            .ok_or_else(|| self.violation(format!("missing required key '{}'", key)))?;

        let well_typed = match self {
            ControlSchema::Teaching | ControlSchema::Recap => value.is_boolean(),
            ControlSchema::Grading => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_number)),
        };
        if !well_typed {
            return Err(self.violation(format!("'{}' has the wrong type", key)));
        }
        Ok(())
    }
}

/// Extracts the first control block from `text`.
///
/// Returns `Ok(None)` when no block is present. A block whose body is not JSON,
/// or an opening sentinel that is never closed, is [`ControlError::Malformed`].
pub fn extract_control_block(
    text: &str,
    schema: Option<ControlSchema>,
) -> Result<Option<Value>, ControlError> {
    let Some(captures) = CONTROL_SPAN_RE.captures(text) else {
        if text.contains(CONTROL_OPEN) {
            return Err(ControlError::Malformed("unterminated control block".to_string()));
        }
        return Ok(None);
    };

    let body = captures.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
    let payload: Value =
        serde_json::from_str(body).map_err(|e| ControlError::Malformed(e.to_string()))?;

    if let Some(schema) = schema {
        schema.validate(&payload)?;
    }
    Ok(Some(payload))
}

/// Removes every control block from `text` and collapses leftover whitespace
/// to at most one blank line.
///
/// Stripping already-stripped text is a no-op.
pub fn strip_control_blocks(text: &str) -> String {
    let without_spans = CONTROL_SPAN_RE.replace_all(text, "");
    let without_dangling = DANGLING_OPEN_RE.replace_all(&without_spans, "");
    let spaced = INLINE_SPACE_RE.replace_all(&without_dangling, " ");
    let trimmed = TRAILING_SPACE_RE.replace_all(&spaced, "\n");
    let collapsed = BLANK_LINES_RE.replace_all(&trimmed, "\n\n");
    collapsed.trim().to_string()
}

/// A typed control payload bound to its schema.
pub trait ControlPayload: DeserializeOwned {
    const SCHEMA: ControlSchema;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TeachingControl {
    pub objective_complete: bool,
}

impl ControlPayload for TeachingControl {
    const SCHEMA: ControlSchema = ControlSchema::Teaching;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecapControl {
    pub prereq_complete: bool,
}

impl ControlPayload for RecapControl {
    const SCHEMA: ControlSchema = ControlSchema::Recap;
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GradingControl {
    pub scores: Vec<f64>,
}

impl ControlPayload for GradingControl {
    const SCHEMA: ControlSchema = ControlSchema::Grading;
}

/// Extracts and validates a typed control payload.
pub fn extract<T: ControlPayload>(text: &str) -> Result<Option<T>, ControlError> {
    match extract_control_block(text, Some(T::SCHEMA))? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| T::SCHEMA.violation(e.to_string())),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_teaching_block_is_extracted_and_stripped() {
        let raw = r#"Nice work! <control>{"objective_complete": true}</control>"#;

        assert_eq!(
            extract_control_block(raw, Some(ControlSchema::Teaching)).unwrap(),
            Some(json!({"objective_complete": true}))
        );
        assert_eq!(
            extract::<TeachingControl>(raw).unwrap(),
            Some(TeachingControl { objective_complete: true })
        );
        assert_eq!(strip_control_blocks(raw), "Nice work!");
    }

    #[test]
    fn test_absent_block_is_not_an_error() {
        assert_eq!(extract_control_block("Just text.", None).unwrap(), None);
        assert_eq!(extract::<RecapControl>("Just text.").unwrap(), None);
    }

    #[test]
    fn test_malformed_block_errors_but_is_still_hidden() {
        let raw = "Almost there.\n<control>{objective_complete: yes</control>\nKeep going.";
        let err = extract_control_block(raw, Some(ControlSchema::Teaching)).unwrap_err();
        assert!(matches!(err, ControlError::Malformed(_)));
        assert_eq!(strip_control_blocks(raw), "Almost there.\n\nKeep going.");
    }

    #[test]
    fn test_unterminated_block_is_malformed_and_hidden() {
        let raw = r#"Good. <control>{"objective_complete": tr"#;
        assert!(matches!(
            extract_control_block(raw, None),
            Err(ControlError::Malformed(_))
        ));
        assert_eq!(strip_control_blocks(raw), "Good.");
    }

    #[test]
    fn test_schema_rejects_unknown_keys_and_wrong_types() {
        let unknown = r#"<control>{"objective_complete": true, "confidence": 0.9}</control>"#;
        assert!(matches!(
            extract_control_block(unknown, Some(ControlSchema::Teaching)),
            Err(ControlError::SchemaViolation { schema: "teaching", .. })
        ));

        let wrong_type = r#"<control>{"prereq_complete": "yes"}</control>"#;
        assert!(matches!(
            extract::<RecapControl>(wrong_type),
            Err(ControlError::SchemaViolation { .. })
        ));

        let wrong_phase = r#"<control>{"objective_complete": true}</control>"#;
        assert!(extract::<RecapControl>(wrong_phase).is_err());

        // Without a schema any JSON value is accepted.
        assert_eq!(
            extract_control_block(unknown, None).unwrap(),
            Some(json!({"objective_complete": true, "confidence": 0.9}))
        );
    }

    #[test]
    fn test_grading_schema() {
        let raw = r#"Scored. <control>{"scores": [1, 0.5]}</control>"#;
        assert_eq!(
            extract::<GradingControl>(raw).unwrap(),
            Some(GradingControl { scores: vec![1.0, 0.5] })
        );
        let bad = r#"<control>{"scores": ["high"]}</control>"#;
        assert!(extract::<GradingControl>(bad).is_err());
    }

    #[test]
    fn test_strip_removes_every_block_and_keeps_content() {
        let raw = "Intro  text\t here.\n\n\n\n<control>{\"a\":1}</control>Middle\n<control>{}</control>\n\n\nEnd";
        assert_eq!(strip_control_blocks(raw), "Intro text here.\n\nMiddle\n\nEnd");
    }

    #[test]
    fn test_strip_is_idempotent() {
        let samples = [
            "Nice work! <control>{\"objective_complete\": true}</control>",
            "a\n \n \n \nb   c",
            "<control>{}</control>",
            "line one\n\nline two",
            "dangling <control>{\"x\"",
        ];
        for raw in samples {
            let once = strip_control_blocks(raw);
            assert_eq!(strip_control_blocks(&once), once);
        }
    }

    #[test]
    fn test_unterminated_block_keeps_following_lines() {
        let raw = "Good start. <control>{\"objective_complete\": tr\nNext, try the chain rule.";
        assert_eq!(strip_control_blocks(raw), "Good start.\nNext, try the chain rule.");
        assert!(extract::<TeachingControl>(raw).is_err());
    }

    #[test]
    fn test_multiline_block_body() {
        let raw = "Done.\n<control>\n{\n  \"prereq_complete\": false\n}\n</control>";
        assert_eq!(
            extract::<RecapControl>(raw).unwrap(),
            Some(RecapControl { prereq_complete: false })
        );
        assert_eq!(strip_control_blocks(raw), "Done.");
    }
}
