//! Shared data model for agent invocations.
//!
//! These types define stable contracts between the parsers, the stop-condition
//! evaluator, the launcher, and the retry controllers. They carry no I/O.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The process exited with status 0.
    Completed,
    /// A configured stop condition matched and the process was terminated.
    StopCondition,
    /// Spawn failure, non-zero exit, or an escalated schema failure.
    Error,
    /// Terminated by timeout or an external cancellation signal.
    Cancelled,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Completed => "completed",
            StopReason::StopCondition => "stop_condition",
            StopReason::Error => "error",
            StopReason::Cancelled => "cancelled",
        }
    }
}

/// Output format requested from the agent CLI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    StreamJson,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Text => "text",
            OutputFormat::Json => "json",
            OutputFormat::StreamJson => "stream-json",
        }
    }

    /// Whether stdout is a newline-delimited event stream.
    pub fn is_streaming(self) -> bool {
        matches!(self, OutputFormat::StreamJson)
    }
}

/// Permission mode passed to the agent CLI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    Bypass,
}

/// Credential mode used for a single invocation.
///
/// `Primary` strips the API-key variable from the child environment so the CLI
/// uses its subscription login; `Secondary` passes the API key through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    Primary,
    Secondary,
}

/// Token accounting reported by the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self { input, output }
    }

    pub fn total(&self) -> u64 {
        self.input.saturating_add(self.output)
    }

    pub fn is_zero(&self) -> bool {
        self.input == 0 && self.output == 0
    }

    /// Component-wise maximum; keeps aggregates monotonic across chunks.
    pub fn max(self, other: TokenUsage) -> TokenUsage {
        TokenUsage {
            input: self.input.max(other.input),
            output: self.output.max(other.output),
        }
    }
}

/// In-flight view of an invocation, used for live stop-condition checks.
///
/// Borrowed from the launcher's accumulator; every field is always populated
/// (missing accounting is zero) so predicates never observe unset state.
#[derive(Debug, Clone, Copy)]
pub struct PartialResult<'a> {
    /// Accumulated output text so far. Empty means no output yet.
    pub output: &'a str,
    pub tokens_used: TokenUsage,
    pub turns_used: u32,
    pub elapsed_ms: u64,
    /// Total stdout bytes observed so far.
    pub bytes: usize,
}

impl PartialResult<'_> {
    pub fn has_output(&self) -> bool {
        !self.output.is_empty()
    }
}

/// Terminal record of one or more invocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,
    pub tokens_used: TokenUsage,
    pub turns_used: u32,
    pub stop_reason: StopReason,
    /// Human-readable detail for non-completed results (matched condition, timeout, error).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_detail: Option<String>,
    pub duration_ms: u64,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    /// Set by the launcher when an auth/billing failure was detected under the
    /// primary credential mode.
    #[serde(default)]
    pub should_retry_with_fallback: bool,
}

impl AgentResult {
    /// An `error` result carrying a message and no accounting.
    pub fn error(message: impl Into<String>, exit_code: i32, duration_ms: u64) -> Self {
        let message = message.into();
        Self {
            output: message.clone(),
            structured: None,
            tokens_used: TokenUsage::default(),
            turns_used: 0,
            stop_reason: StopReason::Error,
            stop_detail: Some(message),
            duration_ms,
            exit_code,
            session_id: None,
            stderr: String::new(),
            should_retry_with_fallback: false,
        }
    }

    pub fn is_error(&self) -> bool {
        self.stop_reason == StopReason::Error
    }

    /// Stdout-derived output and stderr joined, for signature scans.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            return self.output.clone();
        }
        format!("{}\n{}", self.output, self.stderr)
    }
}
