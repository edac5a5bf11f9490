//! CLI tests for `agent-runner run`.
//!
//! Spawns the binary against fake agent scripts and verifies exit codes and
//! the JSON result printed on stdout.

use std::process::{Command, Output};

use agent_runner::exit_codes;
use agent_runner::io::config::{RunnerConfig, write_config};
use agent_runner::test_support::FakeAgent;
use serde_json::Value;

fn run(agent: &FakeAgent, extra: &[&str]) -> Output {
    let agent_command = agent.command().join(" ");
    let config = agent.path("missing.toml");
    Command::new(env!("CARGO_BIN_EXE_agent-runner"))
        .arg("run")
        .arg("--config")
        .arg(&config)
        .arg("--agent-command")
        .arg(&agent_command)
        .args(extra)
        .output()
        .expect("agent-runner run")
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("result json on stdout")
}

#[test]
fn completed_run_prints_result_and_exits_zero() {
    let agent = FakeAgent::new("echo 'all done'");

    let output = run(&agent, &["do it"]);

    assert_eq!(output.status.code(), Some(exit_codes::COMPLETED));
    let result = stdout_json(&output);
    assert_eq!(result["stop_reason"], "completed");
    assert_eq!(result["output"], "all done\n");
}

#[test]
fn failing_agent_exits_with_error_code() {
    let agent = FakeAgent::new("echo 'boom' >&2\nexit 7");

    let output = run(&agent, &["do it"]);

    assert_eq!(output.status.code(), Some(exit_codes::ERROR));
    let result = stdout_json(&output);
    assert_eq!(result["stop_reason"], "error");
    assert_eq!(result["exit_code"], 7);
}

#[test]
fn stop_pattern_exits_with_stop_condition_code() {
    let agent = FakeAgent::new("echo 'BLOCKED: needs review'\nexec sleep 5");

    let output = run(&agent, &["--stop-pattern", "BLOCKED", "do it"]);

    assert_eq!(output.status.code(), Some(exit_codes::STOP_CONDITION));
    let result = stdout_json(&output);
    assert_eq!(result["stop_reason"], "stop_condition");
}

#[test]
fn timeout_exits_with_cancelled_code() {
    let agent = FakeAgent::new("exec sleep 5");

    let output = run(&agent, &["--timeout-secs", "1", "do it"]);

    assert_eq!(output.status.code(), Some(exit_codes::CANCELLED));
    let result = stdout_json(&output);
    assert_eq!(result["stop_reason"], "cancelled");
}

/// Verifies option conflicts are reported before anything is spawned.
#[test]
fn continue_with_resume_is_a_config_error() {
    let agent = FakeAgent::new("DIR=$(dirname \"$0\")\ntouch \"$DIR/ran\"");

    let output = run(&agent, &["--continue", "--resume", "abc123", "do it"]);

    assert_eq!(output.status.code(), Some(exit_codes::CONFIG));
    assert!(output.stdout.is_empty());
    assert!(String::from_utf8_lossy(&output.stderr).contains("mutually exclusive"));
    assert!(!agent.path("ran").exists());
}

#[test]
fn missing_prompt_is_a_config_error() {
    let agent = FakeAgent::new("echo unused");

    let output = run(&agent, &[]);

    assert_eq!(output.status.code(), Some(exit_codes::CONFIG));
    assert!(String::from_utf8_lossy(&output.stderr).contains("prompt is required"));
}

#[test]
fn invalid_stop_condition_is_a_config_error() {
    let agent = FakeAgent::new("echo unused");

    let output = run(&agent, &["--stop", r#"{"type":"vibes"}"#, "do it"]);

    assert_eq!(output.status.code(), Some(exit_codes::CONFIG));
}

#[test]
fn dry_run_prints_argv_without_spawning() {
    let agent = FakeAgent::new("DIR=$(dirname \"$0\")\ntouch \"$DIR/ran\"");

    let output = run(
        &agent,
        &["--dry-run", "--model", "sonnet", "--resume", "abc123", "do it"],
    );

    assert_eq!(output.status.code(), Some(exit_codes::COMPLETED));
    assert!(!agent.path("ran").exists());
    let argv: Vec<String> = serde_json::from_slice(&output.stdout).expect("argv json");
    let mut expected = agent.command();
    expected.extend(
        [
            "--print",
            "--model",
            "claude-3-5-sonnet-20241022",
            "--output-format",
            "text",
            "--resume",
            "abc123",
            "do it",
        ]
        .map(String::from),
    );
    assert_eq!(argv, expected);
}

#[test]
fn config_file_supplies_command_and_format() {
    let agent = FakeAgent::new(r#"printf '%s' '{"answer":1}'"#);
    let config_path = agent.path("agent-runner.toml");
    let config = RunnerConfig {
        command: agent.command(),
        output_format: agent_runner::OutputFormat::Json,
        ..RunnerConfig::default()
    };
    write_config(&config_path, &config).expect("write config");

    let output = Command::new(env!("CARGO_BIN_EXE_agent-runner"))
        .arg("run")
        .arg("--config")
        .arg(&config_path)
        .arg("do it")
        .output()
        .expect("agent-runner run");

    assert_eq!(output.status.code(), Some(exit_codes::COMPLETED));
    let result = stdout_json(&output);
    assert_eq!(result["structured"]["answer"], 1);
}
