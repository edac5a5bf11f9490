//! Test-only helpers: scripted invokers and fake agent executables.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tempfile::TempDir;

use crate::core::types::{AgentResult, StopReason, TokenUsage};
use crate::io::invoker::{Invocation, Invoke};

/// A `completed` result with the given output.
pub fn completed(output: &str) -> AgentResult {
    AgentResult {
        output: output.to_string(),
        structured: None,
        tokens_used: TokenUsage::default(),
        turns_used: 0,
        stop_reason: StopReason::Completed,
        stop_detail: None,
        duration_ms: 0,
        exit_code: 0,
        session_id: None,
        stderr: String::new(),
        should_retry_with_fallback: false,
    }
}

/// An `error` result shaped like a non-zero process exit with `stderr`.
pub fn failed(stderr: &str, exit_code: i32) -> AgentResult {
    AgentResult {
        output: format!("stdout:\n\n\nstderr:\n{stderr}"),
        stop_reason: StopReason::Error,
        stop_detail: Some(format!("Command failed with exit code {exit_code}")),
        exit_code,
        stderr: stderr.to_string(),
        ..completed("")
    }
}

/// Invoker that returns queued results and records every invocation.
///
/// Once the queue is empty it returns an `error` result.
#[derive(Debug, Default)]
pub struct ScriptedInvoker {
    results: Mutex<VecDeque<AgentResult>>,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedInvoker {
    pub fn new(results: Vec<AgentResult>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Invoke for ScriptedInvoker {
    fn invoke(&self, invocation: &Invocation) -> AgentResult {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(invocation.clone());
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| AgentResult::error("scripted invoker exhausted", -1, 0))
    }
}

/// A shell script standing in for the agent CLI.
///
/// The script runs through `/bin/sh` so it never needs the executable bit.
/// Each invocation's arguments are available to the script as `"$@"`, and the
/// directory is available for state files (counters, argument logs).
#[derive(Debug)]
pub struct FakeAgent {
    dir: TempDir,
    script: PathBuf,
}

impl FakeAgent {
    /// Write `body` (shell source) as the agent script.
    pub fn new(body: &str) -> Self {
        let dir = tempfile::tempdir().expect("create fake agent dir");
        let script = dir.path().join("agent.sh");
        fs::write(&script, format!("#!/bin/sh\n{body}\n")).expect("write fake agent script");
        Self { dir, script }
    }

    /// Command vector running the script.
    pub fn command(&self) -> Vec<String> {
        vec!["/bin/sh".to_string(), self.script.display().to_string()]
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Path of a file inside the agent's directory.
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

/// The current process environment as a map (UTF-8 entries only), for tests
/// that need to control exactly which variables a child sees.
pub fn process_env() -> BTreeMap<String, String> {
    std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect()
}
