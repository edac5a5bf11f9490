//! Structured-output decoding and JSON Schema validation.

use std::sync::LazyLock;

use jsonschema::{Draft, Validator};
use regex::Regex;
use serde_json::Value;

use crate::core::error::ConfigError;

static FENCED_JSON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*\n(.*?)\n?```").expect("fenced json regex should be valid")
});

/// Compile a JSON Schema (Draft 2020-12).
pub fn compile_schema(schema: &Value) -> Result<Validator, ConfigError> {
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(schema)
        .map_err(|err| ConfigError::InvalidSchema(err.to_string()))
}

/// Validate an instance, collecting every violation into one message.
pub fn validate_instance(validator: &Validator, instance: &Value) -> Result<(), String> {
    let messages: Vec<String> = validator
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if messages.is_empty() {
        Ok(())
    } else {
        Err(format!("schema validation failed:\n- {}", messages.join("\n- ")))
    }
}

/// Find a JSON document in free-form agent output.
///
/// Tries, in order: the whole trimmed text, the first fenced code block, and
/// the outermost `{...}` or `[...]` span.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    if let Some(caps) = FENCED_JSON_RE.captures(trimmed)
        && let Some(body) = caps.get(1)
        && let Ok(value) = serde_json::from_str(body.as_str().trim())
    {
        return Some(value);
    }
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close))
            && start < end
            && let Ok(value) = serde_json::from_str(&trimmed[start..=end])
        {
            return Some(value);
        }
    }
    None
}

/// Decode and validate structured output for a schema-bearing call.
///
/// Candidates are tried in order: an already-decoded payload, JSON inside
/// that payload's `result` string (the CLI's json envelope), and JSON
/// extracted from the text output. The error describes the last candidate
/// that failed.
pub fn decode_structured(
    validator: &Validator,
    structured: Option<&Value>,
    output: &str,
) -> Result<Value, String> {
    let enveloped = structured
        .and_then(|value| value.get("result"))
        .and_then(Value::as_str)
        .and_then(extract_json);
    let candidates = structured
        .cloned()
        .into_iter()
        .chain(enveloped)
        .chain(extract_json(output));

    let mut last_error = None;
    for candidate in candidates {
        match validate_instance(validator, &candidate) {
            Ok(()) => return Ok(candidate),
            Err(err) => last_error = Some(err),
        }
    }
    Err(last_error.unwrap_or_else(|| "output does not contain valid JSON".to_string()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn answer_schema() -> Validator {
        compile_schema(&json!({
            "type": "object",
            "required": ["answer"],
            "properties": {"answer": {"type": "integer"}}
        }))
        .expect("compile")
    }

    #[test]
    fn extract_json_from_plain_fenced_and_embedded_text() {
        assert_eq!(extract_json(" {\"a\":1} "), Some(json!({"a": 1})));
        assert_eq!(
            extract_json("Here you go:\n```json\n{\"a\": [1, 2]}\n```\nthanks"),
            Some(json!({"a": [1, 2]}))
        );
        assert_eq!(
            extract_json("result => {\"ok\": true} <= end"),
            Some(json!({"ok": true}))
        );
        assert_eq!(extract_json("no json here"), None);
        assert_eq!(extract_json(""), None);
    }

    #[test]
    fn decode_prefers_valid_structured_payload() {
        let validator = answer_schema();
        let structured = json!({"answer": 1});
        let got = decode_structured(&validator, Some(&structured), "{\"answer\": 2}")
            .expect("valid");
        assert_eq!(got, json!({"answer": 1}));
    }

    #[test]
    fn decode_falls_back_to_text_when_structured_invalid() {
        let validator = answer_schema();
        let envelope = json!({"result": "...", "usage": {}});
        let got = decode_structured(&validator, Some(&envelope), "```json\n{\"answer\": 7}\n```")
            .expect("valid");
        assert_eq!(got, json!({"answer": 7}));
    }

    /// Verifies JSON embedded in the CLI's `result` string is found.
    #[test]
    fn decode_reads_json_inside_result_envelope() {
        let validator = answer_schema();
        let envelope = json!({"type": "result", "result": "Sure!\n{\"answer\": 3}"});
        let got = decode_structured(&validator, Some(&envelope), "irrelevant").expect("valid");
        assert_eq!(got, json!({"answer": 3}));
    }

    #[test]
    fn decode_reports_violations() {
        let validator = answer_schema();
        let err = decode_structured(&validator, None, "{\"answer\": \"seven\"}")
            .expect_err("invalid");
        assert!(err.contains("schema validation failed"), "got: {err}");

        let err = decode_structured(&validator, None, "plain words").expect_err("no json");
        assert_eq!(err, "output does not contain valid JSON");
    }
}
