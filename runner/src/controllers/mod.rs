//! Retry controllers layered over the [`Invoke`] capability.
//!
//! Each controller wraps an inner invoker and decides, from the result it
//! returns, whether to re-invoke. Invocations always run one after another
//! because each retry depends on the previous session id and output.
//!
//! The standard pipeline, outermost first:
//! `AuthFallback` → `SchemaRetry` → `RateLimitRetry` → [`ProcessInvoker`].

pub mod auth_fallback;
pub mod backoff;
pub mod schema_retry;

pub use auth_fallback::AuthFallback;
pub use backoff::RateLimitRetry;
pub use schema_retry::SchemaRetry;

use crate::io::invoker::{Invoke, ProcessInvoker};

/// The full controller chain over an arbitrary base invoker.
pub fn pipeline_with<I: Invoke>(base: I) -> AuthFallback<SchemaRetry<RateLimitRetry<I>>> {
    AuthFallback::new(SchemaRetry::new(RateLimitRetry::new(base)))
}

/// The full controller chain over the real agent subprocess.
pub fn pipeline() -> AuthFallback<SchemaRetry<RateLimitRetry<ProcessInvoker>>> {
    pipeline_with(ProcessInvoker)
}
