//! Single agent invocation and the [`Invoke`] seam the controllers wrap.
//!
//! [`ProcessInvoker`] runs exactly one subprocess per call and always returns
//! an [`AgentResult`]; spawn failures, non-zero exits, timeouts, and stop
//! conditions are all reported as data.

use std::process::Command;
use std::time::Instant;

use tracing::{info, instrument, warn};

use crate::core::args::{build_args, format_command};
use crate::core::options::ExecutionOptions;
use crate::core::output::{live_accounting, parse_output};
use crate::core::progress::ProgressEvent;
use crate::core::signatures::{auth_failure_signature, extract_session_id};
use crate::core::stop::evaluate;
use crate::core::stream::{MessageParser, TextAccumulator};
use crate::core::types::{
    AgentResult, AuthMode, OutputFormat, PartialResult, StopReason, TokenUsage,
};
use crate::io::env::child_env;
use crate::io::process::{PumpLimits, StreamObserver, Termination, run_command_streaming};

/// Label text re-read from before the previous scan boundary.
const LABEL_OVERLAP: usize = 128;

/// One request to the agent.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub options: ExecutionOptions,
    /// Start of the top-level call. Durations and time limits are measured
    /// from here, across retries.
    pub started_at: Instant,
    pub auth: AuthMode,
}

impl Invocation {
    pub fn new(options: ExecutionOptions) -> Self {
        let auth = options.auth;
        Self {
            options,
            started_at: Instant::now(),
            auth,
        }
    }

    /// Same call with different options, keeping the start time and auth mode.
    pub fn with_options(&self, options: ExecutionOptions) -> Self {
        Self {
            options,
            started_at: self.started_at,
            auth: self.auth,
        }
    }

    pub fn with_auth(&self, auth: AuthMode) -> Self {
        Self {
            auth,
            ..self.clone()
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        millis(self.started_at)
    }
}

/// Capability to run an invocation to a terminal result.
pub trait Invoke {
    fn invoke(&self, invocation: &Invocation) -> AgentResult;
}

impl<T: Invoke + ?Sized> Invoke for &T {
    fn invoke(&self, invocation: &Invocation) -> AgentResult {
        (**self).invoke(invocation)
    }
}

/// Spawns the agent CLI once per invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessInvoker;

impl Invoke for ProcessInvoker {
    fn invoke(&self, invocation: &Invocation) -> AgentResult {
        execute_once(invocation)
    }
}

fn millis(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Per-chunk accounting fed by the stream pump.
///
/// Owns the partial result: stop conditions always see a prefix of the final
/// output because chunks arrive here in order on a single thread.
struct LiveAccounting<'a> {
    invocation: &'a Invocation,
    text: TextAccumulator,
    parser: Option<MessageParser>,
    tokens_used: TokenUsage,
    turns_used: u32,
    bytes: usize,
    /// Length of text already scanned for labels.
    scanned: usize,
}

impl<'a> LiveAccounting<'a> {
    fn new(invocation: &'a Invocation) -> Self {
        let options = &invocation.options;
        Self {
            invocation,
            text: TextAccumulator::new(options.output_limit_bytes),
            parser: options
                .output_format
                .is_streaming()
                .then(MessageParser::new),
            tokens_used: TokenUsage::default(),
            turns_used: 0,
            bytes: 0,
            scanned: 0,
        }
    }

    fn output(&self) -> &str {
        match &self.parser {
            Some(parser) => parser.output(),
            None => self.text.as_str(),
        }
    }

    /// Account for text appended since the last scan, re-reading
    /// `LABEL_OVERLAP` bytes so a label split across chunks is still seen.
    /// A complete JSON document is decoded whole.
    fn scan_new_text(&mut self) -> (TokenUsage, u32) {
        let text = self.text.as_str();
        let format = self.invocation.options.output_format;
        if format == OutputFormat::Json && text.trim_end().ends_with('}') {
            return live_accounting(text, format);
        }
        let mut start = self.scanned.saturating_sub(LABEL_OVERLAP);
        while !text.is_char_boundary(start) {
            start -= 1;
        }
        self.scanned = text.len();
        live_accounting(&text[start..], OutputFormat::Text)
    }

    fn watching(&self) -> bool {
        let options = &self.invocation.options;
        !options.stop_conditions.is_empty() || options.progress.is_some()
    }
}

impl StreamObserver for LiveAccounting<'_> {
    fn on_stdout(&mut self, chunk: &[u8]) -> Option<String> {
        self.bytes += chunk.len();
        let watching = self.watching();
        match &mut self.parser {
            Some(parser) => {
                parser.push(chunk);
                self.tokens_used = self.tokens_used.max(parser.tokens_used());
                self.turns_used = self.turns_used.max(parser.turns_used());
            }
            None => {
                self.text.push(chunk);
                if watching {
                    let (tokens, turns) = self.scan_new_text();
                    self.tokens_used = self.tokens_used.max(tokens);
                    self.turns_used = self.turns_used.max(turns);
                }
            }
        }

        let options = &self.invocation.options;
        if options.progress.is_some() {
            options.notify(ProgressEvent::Output {
                bytes: self.bytes,
                tokens_used: self.tokens_used,
                turns_used: self.turns_used,
                chunk: String::from_utf8_lossy(chunk).into_owned(),
            });
        }

        if options.stop_conditions.is_empty() {
            return None;
        }
        let partial = PartialResult {
            output: self.output(),
            tokens_used: self.tokens_used,
            turns_used: self.turns_used,
            elapsed_ms: self.invocation.elapsed_ms(),
            bytes: self.bytes,
        };
        let check = evaluate(&options.stop_conditions, &partial);
        if check.should_stop {
            check.reason
        } else {
            None
        }
    }
}

/// Run the agent exactly once and fold everything that happened into a result.
#[instrument(skip_all, fields(auth = ?invocation.auth, format = invocation.options.output_format.as_str()))]
pub fn execute_once(invocation: &Invocation) -> AgentResult {
    let options = &invocation.options;
    let args = match build_args(options) {
        Ok(args) => args,
        Err(err) => return AgentResult::error(err.to_string(), -1, invocation.elapsed_ms()),
    };
    let program = options.program();
    let full_args: Vec<String> = options
        .command
        .iter()
        .skip(1)
        .cloned()
        .chain(args)
        .collect();
    let rendered = format_command(program, &full_args);

    let mut cmd = Command::new(program);
    cmd.args(&full_args)
        .env_clear()
        .envs(child_env(options, invocation.auth));
    if let Some(cwd) = &options.cwd {
        cmd.current_dir(cwd);
    }
    let stdin = options
        .stdin_prompt
        .then(|| options.prompt.clone().into_bytes());

    info!(
        program,
        resumed = options.resume_session_id.is_some(),
        continued = options.continue_session,
        "invoking agent"
    );
    let mut live = LiveAccounting::new(invocation);
    let limits = PumpLimits {
        timeout: options.timeout,
        output_limit_bytes: options.output_limit_bytes,
        cancel: options.cancel.as_ref(),
    };
    let streamed = match run_command_streaming(cmd, stdin, limits, &mut live) {
        Ok(streamed) => streamed,
        Err(err) => {
            let message = format!("{err:#}");
            warn!(err = %message, "agent invocation failed before completion");
            return AgentResult::error(
                format!("Failed to run {rendered}: {message}"),
                -1,
                invocation.elapsed_ms(),
            );
        }
    };

    let stdout = streamed.stdout_lossy();
    let stderr = streamed.stderr_lossy();
    let parsed = parse_output(&stdout, options.output_format);
    let session_id = parsed
        .session_id
        .clone()
        .or_else(|| extract_session_id(&stderr));
    let duration_ms = invocation.elapsed_ms();
    // Event streams report the terminal event's usage as is; mixing in the
    // running maximum could pair counts that no single event reported.
    let (tokens_used, turns_used) = if options.output_format.is_streaming() {
        (parsed.tokens_used, parsed.turns_used)
    } else {
        (
            parsed.tokens_used.max(live.tokens_used),
            parsed.turns_used.max(live.turns_used),
        )
    };

    let mut result = AgentResult {
        output: parsed.output,
        structured: parsed.structured,
        tokens_used,
        turns_used,
        stop_reason: StopReason::Completed,
        stop_detail: None,
        duration_ms,
        exit_code: 0,
        session_id,
        stderr,
        should_retry_with_fallback: false,
    };

    match streamed.termination {
        Termination::Exited(status) if status.success() => {}
        Termination::Exited(status) => {
            let code = status.code().unwrap_or(-1);
            result.stop_reason = StopReason::Error;
            result.exit_code = code;
            result.stop_detail = Some(format!("Command failed with exit code {code}: {rendered}"));
            result.output = format!("stdout:\n{stdout}\n\nstderr:\n{}", result.stderr);
            if invocation.auth == AuthMode::Primary
                && let Some(signature) = auth_failure_signature(&result.output)
            {
                info!(signature, "auth failure detected under primary credentials");
                result.should_retry_with_fallback = true;
            }
        }
        Termination::Stopped(reason) => {
            result.stop_reason = StopReason::StopCondition;
            result.stop_detail = Some(reason);
            result.exit_code = -1;
        }
        Termination::TimedOut => {
            result.stop_reason = StopReason::Cancelled;
            result.stop_detail = Some(format!(
                "Timed out after {}ms",
                options.timeout.as_millis()
            ));
            result.exit_code = -1;
        }
        Termination::Cancelled => {
            result.stop_reason = StopReason::Cancelled;
            result.stop_detail = Some("Cancelled".to_string());
            result.exit_code = -1;
        }
    }

    info!(
        stop_reason = result.stop_reason.as_str(),
        exit_code = result.exit_code,
        duration_ms,
        tokens = result.tokens_used.total(),
        "agent invocation finished"
    );
    result
}
