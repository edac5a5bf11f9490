//! Execution pipeline for external AI-agent CLI processes.
//!
//! A call launches the agent CLI, streams and incrementally parses its output,
//! evaluates stop conditions while the process runs, enforces a timeout, and
//! then hands the result to retry controllers for schema validation,
//! credential fallback, and rate-limit backoff. The layers are:
//!
//! - **[`core`]**: Pure, deterministic logic (argument building, output and
//!   event parsing, stop conditions, schema decoding). No I/O.
//! - **[`io`]**: Side effects (subprocess pump, child environment, config
//!   files, prompt rendering) and the single-invocation [`io::invoker`].
//! - **[`controllers`]**: Decorators over [`io::invoker::Invoke`] that decide
//!   whether to re-invoke.
//!
//! Every failure after option validation is reported as data in
//! [`AgentResult`]; only [`ConfigError`] is returned as `Err`.

pub mod controllers;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

use std::time::Instant;

use tracing::instrument;

pub use crate::core::error::ConfigError;
pub use crate::core::options::{ExecutionOptions, ExecutionOptionsBuilder, RetryPolicy};
pub use crate::core::stop::StopCondition;
pub use crate::core::types::{
    AgentResult, AuthMode, OutputFormat, PermissionMode, StopReason, TokenUsage,
};

use crate::io::invoker::{Invocation, Invoke};

/// Run a call through the full pipeline: auth fallback, schema retries,
/// rate-limit backoff, and the agent subprocess.
///
/// Safe to call concurrently with independent option sets.
#[instrument(skip_all, fields(format = options.output_format.as_str()))]
pub fn execute(options: ExecutionOptions) -> Result<AgentResult, ConfigError> {
    options.validate()?;
    Ok(controllers::pipeline().invoke(&Invocation::new(options)))
}

/// Run the agent exactly once, without any controller.
///
/// `started_at` anchors the result duration and time-limit conditions.
pub fn execute_once(
    options: ExecutionOptions,
    started_at: Instant,
    use_secondary_auth: bool,
) -> Result<AgentResult, ConfigError> {
    options.validate()?;
    let auth = if use_secondary_auth {
        AuthMode::Secondary
    } else {
        AuthMode::Primary
    };
    Ok(io::invoker::execute_once(&Invocation {
        options,
        started_at,
        auth,
    }))
}
