//! Validates structured output against the caller's schema and asks the agent
//! to correct itself through session continuation.

use tracing::{info, instrument, warn};

use crate::core::progress::ProgressEvent;
use crate::core::schema::{compile_schema, decode_structured};
use crate::core::types::{AgentResult, StopReason};
use crate::io::invoker::{Invocation, Invoke};
use crate::io::prompt::continuation_prompt;

/// Re-invokes with a continuation prompt until the output validates or
/// `schema_retries` continuation attempts have been spent.
///
/// Only `completed` results are validated. `error` and `cancelled` results
/// pass through untouched; `stop_condition` results pass through with a
/// validated payload attached when one can be decoded.
#[derive(Debug, Clone)]
pub struct SchemaRetry<I> {
    inner: I,
}

impl<I> SchemaRetry<I> {
    pub fn new(inner: I) -> Self {
        Self { inner }
    }
}

impl<I: Invoke> Invoke for SchemaRetry<I> {
    #[instrument(skip_all, fields(schema_retries = invocation.options.schema_retries))]
    fn invoke(&self, invocation: &Invocation) -> AgentResult {
        let Some(schema) = invocation.options.schema.as_ref() else {
            return self.inner.invoke(invocation);
        };
        let validator = match compile_schema(schema) {
            Ok(validator) => validator,
            Err(err) => return AgentResult::error(err.to_string(), -1, invocation.elapsed_ms()),
        };
        let max_retries = invocation.options.schema_retries;

        let mut current = invocation.clone();
        let mut session_id: Option<String> = None;
        let mut attempt = 0;
        loop {
            let mut result = self.inner.invoke(&current);
            if result.session_id.is_some() {
                session_id.clone_from(&result.session_id);
            } else {
                result.session_id.clone_from(&session_id);
            }

            match result.stop_reason {
                StopReason::Error | StopReason::Cancelled => return result,
                StopReason::StopCondition => {
                    if let Ok(value) =
                        decode_structured(&validator, result.structured.as_ref(), &result.output)
                    {
                        result.structured = Some(value);
                    }
                    return result;
                }
                StopReason::Completed => {}
            }

            let decoded = decode_structured(&validator, result.structured.as_ref(), &result.output);
            let error = match decoded {
                Ok(value) => {
                    if attempt > 0 {
                        info!(attempt, "structured output validated after retry");
                    }
                    result.structured = Some(value);
                    return result;
                }
                Err(error) => error,
            };

            if attempt >= max_retries {
                warn!(attempts = attempt + 1, "structured output never validated, escalating");
                return escalate(result, &error, attempt + 1);
            }
            attempt += 1;
            warn!(attempt, max_retries, error = %error, "structured output invalid, retrying");
            current.options.notify(ProgressEvent::SchemaRetry {
                attempt,
                max_attempts: max_retries,
                error: error.clone(),
            });

            let prompt = match continuation_prompt(&result.output, &error, schema) {
                Ok(prompt) => prompt,
                Err(err) => {
                    return AgentResult::error(
                        format!("failed to build continuation prompt: {err:#}"),
                        -1,
                        invocation.elapsed_ms(),
                    );
                }
            };
            let reprompted = invocation.options.with_prompt(prompt);
            let options = match &session_id {
                Some(id) => reprompted.resuming(id.clone()),
                None => reprompted.continuing(),
            };
            current = current.with_options(options);
        }
    }
}

/// Turn a completed-but-invalid result into an `error` carrying the
/// validation error and the last output.
fn escalate(last: AgentResult, error: &str, attempts: u32) -> AgentResult {
    let detail = format!("Structured output failed schema validation after {attempts} attempt(s)");
    AgentResult {
        output: format!("{detail}: {error}\n\nLast output:\n{}", last.output),
        structured: None,
        stop_reason: StopReason::Error,
        stop_detail: Some(detail),
        should_retry_with_fallback: false,
        ..last
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::options::ExecutionOptions;
    use crate::test_support::{ScriptedInvoker, completed, failed};

    fn schema_options(retries: u32) -> ExecutionOptions {
        ExecutionOptions::builder("give me an answer")
            .schema(json!({
                "type": "object",
                "required": ["answer"],
                "properties": {"answer": {"type": "integer"}}
            }))
            .schema_retries(retries)
            .build()
            .expect("options")
    }

    #[test]
    fn valid_first_attempt_attaches_structured() {
        let scripted = ScriptedInvoker::new(vec![completed("{\"answer\": 42}")]);
        let result = SchemaRetry::new(&scripted).invoke(&Invocation::new(schema_options(2)));
        assert_eq!(result.stop_reason, StopReason::Completed);
        assert_eq!(result.structured, Some(json!({"answer": 42})));
        assert_eq!(scripted.call_count(), 1);
    }

    /// Verifies exactly `schema_retries` continuations run before escalation.
    #[test]
    fn exhausted_retries_escalate_to_error() {
        let scripted = ScriptedInvoker::new(vec![
            completed("not json"),
            completed("{\"answer\": \"x\"}"),
            completed("still wrong"),
            completed("{\"answer\": 1}"),
        ]);
        let result = SchemaRetry::new(&scripted).invoke(&Invocation::new(schema_options(2)));
        assert_eq!(scripted.call_count(), 3);
        assert_eq!(result.stop_reason, StopReason::Error);
        assert!(result.structured.is_none());
        assert!(result.output.contains("output does not contain valid JSON"));
        assert!(result.output.contains("still wrong"));
    }

    #[test]
    fn success_on_last_allowed_attempt_is_returned() {
        let scripted = ScriptedInvoker::new(vec![
            completed("nope"),
            completed("nope again"),
            completed("{\"answer\": 5}"),
        ]);
        let result = SchemaRetry::new(&scripted).invoke(&Invocation::new(schema_options(2)));
        assert_eq!(scripted.call_count(), 3);
        assert_eq!(result.stop_reason, StopReason::Completed);
        assert_eq!(result.structured, Some(json!({"answer": 5})));
    }

    /// Verifies retries resume a captured session and continue otherwise.
    #[test]
    fn retries_use_session_continuation() {
        let mut with_session = completed("bad");
        with_session.session_id = Some("sess-9".to_string());
        let scripted = ScriptedInvoker::new(vec![
            completed("bad"),
            with_session,
            completed("{\"answer\": 1}"),
        ]);
        let result = SchemaRetry::new(&scripted).invoke(&Invocation::new(schema_options(2)));
        assert_eq!(result.session_id.as_deref(), Some("sess-9"));

        let calls = scripted.calls();
        assert_eq!(calls[0].options.prompt, "give me an answer");
        assert!(!calls[0].options.continue_session);

        assert!(calls[1].options.continue_session);
        assert!(calls[1].options.resume_session_id.is_none());
        assert!(calls[1].options.prompt.contains("output does not contain valid JSON"));

        assert!(!calls[2].options.continue_session);
        assert_eq!(calls[2].options.resume_session_id.as_deref(), Some("sess-9"));
    }

    #[test]
    fn error_results_short_circuit() {
        let scripted = ScriptedInvoker::new(vec![failed("boom", 2), completed("{\"answer\": 1}")]);
        let result = SchemaRetry::new(&scripted).invoke(&Invocation::new(schema_options(2)));
        assert_eq!(scripted.call_count(), 1);
        assert_eq!(result.stop_reason, StopReason::Error);
        assert_eq!(result.exit_code, 2);
    }

    #[test]
    fn stop_condition_results_are_not_retried() {
        let mut stopped = completed("{\"answer\": 3} and more");
        stopped.stop_reason = StopReason::StopCondition;
        let scripted = ScriptedInvoker::new(vec![stopped]);
        let result = SchemaRetry::new(&scripted).invoke(&Invocation::new(schema_options(2)));
        assert_eq!(scripted.call_count(), 1);
        assert_eq!(result.stop_reason, StopReason::StopCondition);
        assert_eq!(result.structured, Some(json!({"answer": 3})));
    }

    #[test]
    fn zero_retries_validates_once() {
        let scripted = ScriptedInvoker::new(vec![completed("nope")]);
        let result = SchemaRetry::new(&scripted).invoke(&Invocation::new(schema_options(0)));
        assert_eq!(scripted.call_count(), 1);
        assert!(result.is_error());
    }

    #[test]
    fn without_schema_passes_through() {
        let scripted = ScriptedInvoker::new(vec![completed("free text")]);
        let options = ExecutionOptions::builder("x").build().expect("options");
        let result = SchemaRetry::new(&scripted).invoke(&Invocation::new(options));
        assert_eq!(result.output, "free text");
        assert!(result.structured.is_none());
    }
}
