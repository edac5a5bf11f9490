//! Re-runs a call once with the API-key credential after the primary login
//! was rejected.

use tracing::{info, instrument};

use crate::core::progress::ProgressEvent;
use crate::core::signatures::auth_failure_signature;
use crate::core::types::{AgentResult, AuthMode};
use crate::io::env::has_secondary_credential;
use crate::io::invoker::{Invocation, Invoke};

/// Falls back to [`AuthMode::Secondary`] at most once.
///
/// Triggers only when the inner result is flagged for fallback (non-zero exit
/// with an auth signature under the primary mode) and the credential variable
/// is set. Otherwise the original result is returned.
#[derive(Debug, Clone)]
pub struct AuthFallback<I> {
    inner: I,
}

impl<I> AuthFallback<I> {
    pub fn new(inner: I) -> Self {
        Self { inner }
    }
}

impl<I: Invoke> Invoke for AuthFallback<I> {
    #[instrument(skip_all, fields(auth = ?invocation.auth))]
    fn invoke(&self, invocation: &Invocation) -> AgentResult {
        let result = self.inner.invoke(invocation);
        if invocation.auth == AuthMode::Secondary || !result.should_retry_with_fallback {
            return result;
        }
        if !has_secondary_credential(&invocation.options) {
            info!(
                credential_env = %invocation.options.credential_env,
                "auth failure detected but no secondary credential is set"
            );
            return result;
        }

        let reason = auth_failure_signature(&result.combined_output())
            .unwrap_or("authorization failure")
            .to_string();
        info!(reason = %reason, "retrying with secondary credential");
        invocation
            .options
            .notify(ProgressEvent::AuthFallback { reason });

        let mut fallback = self.inner.invoke(&invocation.with_auth(AuthMode::Secondary));
        fallback.should_retry_with_fallback = false;
        fallback
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::core::options::ExecutionOptions;
    use crate::core::types::StopReason;
    use crate::test_support::{ScriptedInvoker, completed, failed};

    fn options(with_key: bool) -> ExecutionOptions {
        let mut env = BTreeMap::new();
        if with_key {
            env.insert("ANTHROPIC_API_KEY".to_string(), "sk-test".to_string());
        }
        ExecutionOptions::builder("x").env(env).build().expect("options")
    }

    fn billing_failure() -> AgentResult {
        let mut result = failed("Billing issue detected", 1);
        result.should_retry_with_fallback = true;
        result
    }

    #[test]
    fn falls_back_once_when_credential_present() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = Arc::clone(&events);
        let mut opts = options(true);
        opts.progress = Some(Arc::new(move |event: &ProgressEvent| {
            sink_events.lock().expect("lock").push(event.clone());
        }));

        let scripted = ScriptedInvoker::new(vec![billing_failure(), completed("ok")]);
        let result = AuthFallback::new(&scripted).invoke(&Invocation::new(opts));

        assert_eq!(result.stop_reason, StopReason::Completed);
        let calls = scripted.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].auth, AuthMode::Primary);
        assert_eq!(calls[1].auth, AuthMode::Secondary);
        assert_eq!(
            events.lock().expect("lock").as_slice(),
            &[ProgressEvent::AuthFallback {
                reason: "billing".to_string()
            }]
        );
    }

    #[test]
    fn no_fallback_without_credential() {
        let scripted = ScriptedInvoker::new(vec![billing_failure(), completed("ok")]);
        let result = AuthFallback::new(&scripted).invoke(&Invocation::new(options(false)));
        assert_eq!(scripted.call_count(), 1);
        assert_eq!(result.stop_reason, StopReason::Error);
        assert!(result.stderr.contains("Billing issue detected"));
    }

    /// Verifies a failing fallback is returned as-is without a second fallback.
    #[test]
    fn fallback_does_not_cascade() {
        let scripted = ScriptedInvoker::new(vec![billing_failure(), billing_failure()]);
        let result = AuthFallback::new(&scripted).invoke(&Invocation::new(options(true)));
        assert_eq!(scripted.call_count(), 2);
        assert!(result.is_error());
        assert!(!result.should_retry_with_fallback);
    }

    #[test]
    fn unflagged_results_pass_through() {
        let scripted = ScriptedInvoker::new(vec![completed("billing is fine")]);
        let result = AuthFallback::new(&scripted).invoke(&Invocation::new(options(true)));
        assert_eq!(scripted.call_count(), 1);
        assert_eq!(result.output, "billing is fine");
    }

    #[test]
    fn secondary_invocations_never_fall_back() {
        let scripted = ScriptedInvoker::new(vec![billing_failure()]);
        let invocation = Invocation::new(options(true)).with_auth(AuthMode::Secondary);
        AuthFallback::new(&scripted).invoke(&invocation);
        assert_eq!(scripted.call_count(), 1);
    }
}
