//! Stop-condition evaluation against in-flight results.
//!
//! Conditions are checked in list order and the first match wins. Malformed
//! conditions (a limit that was not a number, a pattern that does not compile,
//! a custom predicate that panics) never match and never fail the caller.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::core::types::PartialResult;

/// Caller-supplied predicate over the partial result.
pub type CustomPredicate = Arc<dyn Fn(&PartialResult<'_>) -> bool + Send + Sync>;

/// A single early-termination rule.
#[derive(Clone, Debug)]
pub struct StopCondition {
    pub kind: ConditionKind,
    /// Reported instead of the default reason when the condition matches.
    pub message: Option<String>,
}

/// The predicate carried by a [`StopCondition`].
///
/// Limits are `None` when the configured value was not a non-negative integer;
/// such a limit never matches.
#[derive(Clone)]
pub enum ConditionKind {
    TokenLimit(Option<u64>),
    TimeLimit(Option<u64>),
    TurnLimit(Option<u64>),
    Pattern(Pattern),
    Custom(CustomPredicate),
}

impl fmt::Debug for ConditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionKind::TokenLimit(v) => f.debug_tuple("TokenLimit").field(v).finish(),
            ConditionKind::TimeLimit(v) => f.debug_tuple("TimeLimit").field(v).finish(),
            ConditionKind::TurnLimit(v) => f.debug_tuple("TurnLimit").field(v).finish(),
            ConditionKind::Pattern(p) => f.debug_tuple("Pattern").field(p).finish(),
            ConditionKind::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Output pattern, compiled once at construction.
#[derive(Clone, Debug)]
pub enum Pattern {
    Compiled(Regex),
    /// Source that failed to compile; never matches.
    Invalid(String),
}

impl Pattern {
    pub fn new(source: &str) -> Self {
        match Regex::new(source) {
            Ok(re) => Pattern::Compiled(re),
            Err(err) => {
                warn!(pattern = source, err = %err, "stop pattern does not compile, ignoring");
                Pattern::Invalid(source.to_string())
            }
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Pattern::Compiled(re) => re.as_str(),
            Pattern::Invalid(source) => source,
        }
    }
}

impl From<Regex> for Pattern {
    fn from(re: Regex) -> Self {
        Pattern::Compiled(re)
    }
}

impl StopCondition {
    pub fn token_limit(limit: u64) -> Self {
        Self::from_kind(ConditionKind::TokenLimit(Some(limit)))
    }

    pub fn time_limit_ms(limit_ms: u64) -> Self {
        Self::from_kind(ConditionKind::TimeLimit(Some(limit_ms)))
    }

    pub fn turn_limit(limit: u64) -> Self {
        Self::from_kind(ConditionKind::TurnLimit(Some(limit)))
    }

    pub fn pattern(pattern: impl Into<Pattern>) -> Self {
        Self::from_kind(ConditionKind::Pattern(pattern.into()))
    }

    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&PartialResult<'_>) -> bool + Send + Sync + 'static,
    {
        Self::from_kind(ConditionKind::Custom(Arc::new(predicate)))
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    fn from_kind(kind: ConditionKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    /// Build a condition from its JSON form:
    /// `{"type": "token_limit", "value": 100, "message": "..."}`.
    ///
    /// Returns `None` for an unknown or missing `type`. A `value` of the wrong
    /// shape yields a condition that never matches.
    pub fn from_json(value: &Value) -> Option<Self> {
        let kind = value.get("type").and_then(Value::as_str)?;
        let raw = value.get("value").unwrap_or(&Value::Null);
        let kind = match kind {
            "token_limit" => ConditionKind::TokenLimit(as_limit(raw)),
            "time_limit" => ConditionKind::TimeLimit(as_limit(raw)),
            "turn_limit" => ConditionKind::TurnLimit(as_limit(raw)),
            "pattern" => match raw.as_str() {
                Some(source) => ConditionKind::Pattern(Pattern::new(source)),
                None => ConditionKind::Pattern(Pattern::Invalid(raw.to_string())),
            },
            other => {
                warn!(condition_type = other, "unknown stop condition type");
                return None;
            }
        };
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string);
        Some(Self { kind, message })
    }

    /// Default reason when this condition matches, or `None` if it does not.
    fn check(&self, partial: &PartialResult<'_>) -> Option<String> {
        match &self.kind {
            ConditionKind::TokenLimit(Some(limit)) => {
                let total = partial.tokens_used.total();
                (total >= *limit).then(|| format!("Token limit reached ({total} >= {limit})"))
            }
            ConditionKind::TimeLimit(Some(limit)) => {
                let elapsed = partial.elapsed_ms;
                (elapsed >= *limit)
                    .then(|| format!("Time limit reached ({elapsed}ms >= {limit}ms)"))
            }
            ConditionKind::TurnLimit(Some(limit)) => {
                let turns = u64::from(partial.turns_used);
                (turns >= *limit).then(|| format!("Turn limit reached ({turns} >= {limit})"))
            }
            ConditionKind::TokenLimit(None)
            | ConditionKind::TimeLimit(None)
            | ConditionKind::TurnLimit(None) => None,
            ConditionKind::Pattern(Pattern::Compiled(re)) => (partial.has_output()
                && re.is_match(partial.output))
            .then(|| format!("Pattern matched: {}", re.as_str())),
            ConditionKind::Pattern(Pattern::Invalid(_)) => None,
            ConditionKind::Custom(predicate) => {
                if !partial.has_output() {
                    return None;
                }
                match catch_unwind(AssertUnwindSafe(|| predicate(partial))) {
                    Ok(true) => Some("Custom stop condition met".to_string()),
                    Ok(false) => None,
                    Err(_) => {
                        warn!("custom stop condition panicked, treating as non-matching");
                        None
                    }
                }
            }
        }
    }
}

fn as_limit(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|v| v.ceil() as u64)
    })
}

/// Outcome of evaluating a condition list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopCheck {
    pub should_stop: bool,
    pub reason: Option<String>,
}

impl StopCheck {
    fn stop(reason: String) -> Self {
        Self {
            should_stop: true,
            reason: Some(reason),
        }
    }
}

/// Evaluate `conditions` in order; the first matching condition decides.
pub fn evaluate(conditions: &[StopCondition], partial: &PartialResult<'_>) -> StopCheck {
    for condition in conditions {
        if let Some(default_reason) = condition.check(partial) {
            return StopCheck::stop(condition.message.clone().unwrap_or(default_reason));
        }
    }
    StopCheck::default()
}
