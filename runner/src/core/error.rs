//! Configuration-time contract violations.
//!
//! These are the only errors the public entry points return. Everything that
//! happens after spawn (process failures, timeouts, schema mismatches) is
//! reported as data inside [`AgentResult`](crate::core::types::AgentResult).

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("`continue` and `resume` are mutually exclusive (resume id: {resume_id})")]
    ConflictingContinuation { resume_id: String },

    #[error("prompt must not be empty")]
    EmptyPrompt,

    #[error("command must name a program")]
    EmptyCommand,

    #[error("timeout must be greater than zero")]
    ZeroTimeout,

    #[error("result schema does not compile: {0}")]
    InvalidSchema(String),
}
