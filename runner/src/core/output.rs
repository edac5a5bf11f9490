//! Final decoding of an invocation's stdout.
//!
//! Structured formats fall back to plain-text handling when they cannot be
//! decoded. This leniency is deliberate: a misbehaving CLI still yields its raw
//! output instead of failing the call.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::core::stream::MessageParser;
use crate::core::types::{OutputFormat, TokenUsage};

static TOKENS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)tokens:\s*(\d+)\s*input,\s*(\d+)\s*output")
        .expect("token label regex should be valid")
});
static TURNS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)turns:\s*(\d+)").expect("turn label regex should be valid"));

/// Normalized view of a finished invocation's stdout.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedOutput {
    pub output: String,
    pub structured: Option<Value>,
    pub tokens_used: TokenUsage,
    pub turns_used: u32,
    pub session_id: Option<String>,
}

/// Decode `stdout` according to the declared format.
pub fn parse_output(stdout: &str, format: OutputFormat) -> ParsedOutput {
    match format {
        OutputFormat::Text => parse_text(stdout),
        OutputFormat::Json => parse_json(stdout),
        OutputFormat::StreamJson => parse_stream(stdout),
    }
}

/// Token and turn counts visible in a buffer that may still be growing.
///
/// A JSON document is only decoded once the buffer looks complete; until then
/// the text labels are used. Event streams are accounted by
/// [`MessageParser`] instead.
pub fn live_accounting(stdout: &str, format: OutputFormat) -> (TokenUsage, u32) {
    match format {
        OutputFormat::Json if stdout.trim_end().ends_with('}') => {
            let parsed = parse_json(stdout);
            (parsed.tokens_used, parsed.turns_used)
        }
        _ => text_accounting(stdout),
    }
}

fn text_accounting(stdout: &str) -> (TokenUsage, u32) {
    let tokens_used = TOKENS_RE
        .captures(stdout)
        .map(|caps| TokenUsage::new(capture_u64(&caps, 1), capture_u64(&caps, 2)))
        .unwrap_or_default();
    let turns_used = TURNS_RE
        .captures(stdout)
        .map(|caps| u32::try_from(capture_u64(&caps, 1)).unwrap_or(u32::MAX))
        .unwrap_or(0);
    (tokens_used, turns_used)
}

fn parse_text(stdout: &str) -> ParsedOutput {
    let (tokens_used, turns_used) = text_accounting(stdout);
    ParsedOutput {
        output: stdout.to_string(),
        structured: None,
        tokens_used,
        turns_used,
        session_id: None,
    }
}

fn capture_u64(caps: &regex::Captures<'_>, idx: usize) -> u64 {
    caps.get(idx)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

fn parse_json(stdout: &str) -> ParsedOutput {
    let value: Value = match serde_json::from_str(stdout.trim()) {
        Ok(value) => value,
        Err(err) => {
            debug!(err = %err, "json output did not parse, treating as text");
            return parse_text(stdout);
        }
    };

    let usage = value.get("usage");
    let tokens_used = TokenUsage::new(
        usage
            .and_then(|u| u.get("input_tokens"))
            .and_then(Value::as_u64)
            .unwrap_or(0),
        usage
            .and_then(|u| u.get("output_tokens"))
            .and_then(Value::as_u64)
            .unwrap_or(0),
    );
    let turns_used = value
        .get("turns")
        .or_else(|| value.get("num_turns"))
        .and_then(Value::as_u64)
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
        .unwrap_or(0);
    let session_id = value
        .get("session_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    let output = match &value {
        Value::String(text) => text.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| stdout.to_string()),
    };

    ParsedOutput {
        output,
        structured: Some(value),
        tokens_used,
        turns_used,
        session_id,
    }
}

fn parse_stream(stdout: &str) -> ParsedOutput {
    let mut parser = MessageParser::new();
    parser.push(stdout.as_bytes());
    parser.flush();
    if parser.decoded_events() == 0 {
        debug!("no stream events decoded, treating as text");
        return parse_text(stdout);
    }
    ParsedOutput {
        output: parser.output().to_string(),
        structured: None,
        tokens_used: parser.final_usage(),
        turns_used: parser.final_turns(),
        session_id: parser.session_id().map(str::to_string),
    }
}
