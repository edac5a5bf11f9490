//! Exponential backoff for rate-limited invocations.

use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::{instrument, warn};

use crate::core::progress::ProgressEvent;
use crate::core::signatures::rate_limit_signature;
use crate::core::types::AgentResult;
use crate::io::invoker::{Invocation, Invoke};

/// Retries the same invocation while it fails with a rate-limit signature,
/// up to `rate_limit.max_retries` times.
#[derive(Debug, Clone)]
pub struct RateLimitRetry<I> {
    inner: I,
    sleep: fn(Duration),
}

impl<I> RateLimitRetry<I> {
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            sleep: thread::sleep,
        }
    }

    /// Replace the sleep function (tests use a no-op).
    pub fn with_sleep(mut self, sleep: fn(Duration)) -> Self {
        self.sleep = sleep;
        self
    }
}

impl<I: Invoke> Invoke for RateLimitRetry<I> {
    #[instrument(skip_all, fields(max_retries = invocation.options.rate_limit.max_retries))]
    fn invoke(&self, invocation: &Invocation) -> AgentResult {
        let policy = invocation.options.rate_limit;
        let mut attempt = 0;
        loop {
            let result = self.inner.invoke(invocation);
            if !result.is_error() || result.should_retry_with_fallback || attempt >= policy.max_retries
            {
                return result;
            }
            let Some(signature) = rate_limit_signature(&result.combined_output()) else {
                return result;
            };
            if invocation
                .options
                .cancel
                .as_ref()
                .is_some_and(|cancel| cancel.is_cancelled())
            {
                return result;
            }

            let delay = policy.delay_for(attempt, rand::thread_rng().r#gen::<f64>());
            attempt += 1;
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            warn!(attempt, delay_ms, signature, "rate limited, backing off");
            invocation
                .options
                .notify(ProgressEvent::RateLimitBackoff { attempt, delay_ms });
            (self.sleep)(delay);
        }
    }
}
