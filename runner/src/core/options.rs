//! Per-call execution options.
//!
//! Options are built once per top-level call and passed down through the
//! retry controllers. Controllers never mutate a caller's options; they derive
//! a modified copy (new prompt, session continuation) for each re-invocation.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::cancel::CancelHandle;
use crate::core::error::ConfigError;
use crate::core::progress::{ProgressEvent, ProgressSink};
use crate::core::schema::compile_schema;
use crate::core::stop::StopCondition;
use crate::core::types::{AuthMode, OutputFormat, PermissionMode};

pub const DEFAULT_PROGRAM: &str = "claude";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_SCHEMA_RETRIES: u32 = 2;
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_CREDENTIAL_ENV: &str = "ANTHROPIC_API_KEY";

/// Exponential backoff for rate-limited invocations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Extra attempts after a rate-limited failure. Zero disables the retry.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay added as random jitter (0.0 – 1.0).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based). `jitter_sample` is in `[0, 1)`.
    pub fn delay_for(&self, attempt: u32, jitter_sample: f64) -> Duration {
        let exp = self.multiplier.max(1.0).powi(attempt.min(63) as i32);
        let base = (self.initial_backoff_ms as f64 * exp).min(self.max_backoff_ms as f64);
        let jitter = base * self.jitter_factor.clamp(0.0, 1.0) * jitter_sample.clamp(0.0, 1.0);
        Duration::from_millis((base + jitter).round() as u64)
    }
}

/// Immutable configuration for one agent call.
#[derive(Clone)]
pub struct ExecutionOptions {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    pub permission_mode: PermissionMode,
    pub output_format: OutputFormat,
    pub mcp_config: Option<PathBuf>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub timeout: Duration,
    pub cwd: Option<PathBuf>,
    /// Continue the most recent session in `cwd`.
    pub continue_session: bool,
    /// Resume an explicit session. Mutually exclusive with `continue_session`.
    pub resume_session_id: Option<String>,
    pub schema_retries: u32,
    pub rate_limit: RetryPolicy,
    pub stop_conditions: Vec<StopCondition>,
    /// JSON Schema the structured output must satisfy.
    pub schema: Option<Value>,
    pub progress: Option<Arc<dyn ProgressSink>>,
    /// Credential mode for the first invocation.
    pub auth: AuthMode,
    /// Program followed by any prefix arguments placed before `--print`.
    pub command: Vec<String>,
    /// Base environment for the child. `None` snapshots the current process.
    pub env: Option<BTreeMap<String, String>>,
    /// Variable holding the API key used by the secondary credential mode.
    pub credential_env: String,
    /// Write the prompt to stdin instead of passing it as the last argument.
    pub stdin_prompt: bool,
    pub output_limit_bytes: usize,
    pub cancel: Option<CancelHandle>,
}

impl fmt::Debug for ExecutionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionOptions")
            .field("prompt", &self.prompt)
            .field("model", &self.model)
            .field("output_format", &self.output_format)
            .field("timeout", &self.timeout)
            .field("cwd", &self.cwd)
            .field("continue_session", &self.continue_session)
            .field("resume_session_id", &self.resume_session_id)
            .field("schema_retries", &self.schema_retries)
            .field("stop_conditions", &self.stop_conditions.len())
            .field("schema", &self.schema.is_some())
            .field("progress", &self.progress.is_some())
            .field("auth", &self.auth)
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

impl ExecutionOptions {
    pub fn builder(prompt: impl Into<String>) -> ExecutionOptionsBuilder {
        ExecutionOptionsBuilder::new(prompt)
    }

    /// Reject configurations that cannot be spawned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prompt.trim().is_empty() {
            return Err(ConfigError::EmptyPrompt);
        }
        if self.command.first().is_none_or(|p| p.trim().is_empty()) {
            return Err(ConfigError::EmptyCommand);
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if let (true, Some(id)) = (self.continue_session, &self.resume_session_id) {
            return Err(ConfigError::ConflictingContinuation {
                resume_id: id.clone(),
            });
        }
        if let Some(schema) = &self.schema {
            compile_schema(schema)?;
        }
        Ok(())
    }

    /// Copy with a different prompt.
    pub fn with_prompt(&self, prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..self.clone()
        }
    }

    /// Copy that resumes `session_id`, clearing `continue`.
    pub fn resuming(&self, session_id: impl Into<String>) -> Self {
        Self {
            continue_session: false,
            resume_session_id: Some(session_id.into()),
            ..self.clone()
        }
    }

    /// Copy that continues the latest session, clearing any resume id.
    pub fn continuing(&self) -> Self {
        Self {
            continue_session: true,
            resume_session_id: None,
            ..self.clone()
        }
    }

    pub fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or(DEFAULT_PROGRAM)
    }

    pub(crate) fn notify(&self, event: ProgressEvent) {
        if let Some(sink) = &self.progress {
            sink.notify(&event);
        }
    }
}

/// Builder that validates on [`build`](ExecutionOptionsBuilder::build).
#[derive(Debug, Clone)]
pub struct ExecutionOptionsBuilder {
    options: ExecutionOptions,
}

impl ExecutionOptionsBuilder {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            options: ExecutionOptions {
                prompt: prompt.into(),
                system_prompt: None,
                model: None,
                max_turns: None,
                permission_mode: PermissionMode::Default,
                output_format: OutputFormat::Text,
                mcp_config: None,
                allowed_tools: Vec::new(),
                disallowed_tools: Vec::new(),
                timeout: DEFAULT_TIMEOUT,
                cwd: None,
                continue_session: false,
                resume_session_id: None,
                schema_retries: DEFAULT_SCHEMA_RETRIES,
                rate_limit: RetryPolicy::default(),
                stop_conditions: Vec::new(),
                schema: None,
                progress: None,
                auth: AuthMode::Primary,
                command: vec![DEFAULT_PROGRAM.to_string()],
                env: None,
                credential_env: DEFAULT_CREDENTIAL_ENV.to_string(),
                stdin_prompt: false,
                output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
                cancel: None,
            },
        }
    }

    pub fn system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.options.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.options.model = Some(model.into());
        self
    }

    pub fn max_turns(mut self, max_turns: u32) -> Self {
        self.options.max_turns = Some(max_turns);
        self
    }

    pub fn permission_mode(mut self, mode: PermissionMode) -> Self {
        self.options.permission_mode = mode;
        self
    }

    pub fn output_format(mut self, format: OutputFormat) -> Self {
        self.options.output_format = format;
        self
    }

    pub fn mcp_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.mcp_config = Some(path.into());
        self
    }

    pub fn allowed_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.allowed_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn disallowed_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.disallowed_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.options.cwd = Some(cwd.into());
        self
    }

    pub fn continue_session(mut self, value: bool) -> Self {
        self.options.continue_session = value;
        self
    }

    pub fn resume(mut self, session_id: impl Into<String>) -> Self {
        self.options.resume_session_id = Some(session_id.into());
        self
    }

    pub fn schema_retries(mut self, retries: u32) -> Self {
        self.options.schema_retries = retries;
        self
    }

    pub fn rate_limit(mut self, policy: RetryPolicy) -> Self {
        self.options.rate_limit = policy;
        self
    }

    pub fn stop_condition(mut self, condition: StopCondition) -> Self {
        self.options.stop_conditions.push(condition);
        self
    }

    pub fn stop_conditions(mut self, conditions: Vec<StopCondition>) -> Self {
        self.options.stop_conditions = conditions;
        self
    }

    pub fn schema(mut self, schema: Value) -> Self {
        self.options.schema = Some(schema);
        self
    }

    pub fn progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.options.progress = Some(sink);
        self
    }

    pub fn auth(mut self, auth: AuthMode) -> Self {
        self.options.auth = auth;
        self
    }

    pub fn command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.options.env = Some(env);
        self
    }

    pub fn credential_env(mut self, name: impl Into<String>) -> Self {
        self.options.credential_env = name.into();
        self
    }

    pub fn stdin_prompt(mut self, value: bool) -> Self {
        self.options.stdin_prompt = value;
        self
    }

    pub fn output_limit_bytes(mut self, limit: usize) -> Self {
        self.options.output_limit_bytes = limit;
        self
    }

    pub fn cancel(mut self, handle: CancelHandle) -> Self {
        self.options.cancel = Some(handle);
        self
    }

    pub fn build(self) -> Result<ExecutionOptions, ConfigError> {
        self.options.validate()?;
        Ok(self.options)
    }
}
