//! Command-line wrapper around the agent execution pipeline.
//!
//! `agent-runner run` builds [`ExecutionOptions`] from the config file and
//! flags, runs the pipeline, prints the [`AgentResult`] as JSON on stdout, and
//! exits with a code derived from the stop reason (see [`exit_codes`]).

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use agent_runner::core::args::build_args;
use agent_runner::core::progress::BoundedSink;
use agent_runner::io::config::{DEFAULT_CONFIG_FILE, load_config};
use agent_runner::{
    AgentResult, AuthMode, ExecutionOptions, OutputFormat, PermissionMode, StopCondition,
    exit_codes, logging,
};
use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;

const PROGRESS_BUFFER: usize = 256;

#[derive(Parser)]
#[command(
    name = "agent-runner",
    version,
    about = "Run an AI-agent CLI with stop conditions, timeouts, and structured-output retries"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent once through the full pipeline and print the result as JSON.
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Prompt text. Use `--prompt-file` for long prompts.
    prompt: Option<String>,

    /// Read the prompt from a file.
    #[arg(long, value_name = "PATH")]
    prompt_file: Option<PathBuf>,

    /// Configuration file (missing file means defaults).
    #[arg(long, value_name = "PATH", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Agent program and prefix arguments, split on whitespace (e.g. "npx claude").
    #[arg(long, value_name = "COMMAND")]
    agent_command: Option<String>,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    max_turns: Option<u32>,

    #[arg(long, value_enum)]
    permission_mode: Option<PermissionArg>,

    #[arg(long, value_enum)]
    output_format: Option<FormatArg>,

    #[arg(long)]
    system_prompt: Option<String>,

    #[arg(long, value_name = "PATH")]
    mcp_config: Option<PathBuf>,

    /// Tool the agent may use (repeatable).
    #[arg(long = "allowed-tool", value_name = "TOOL")]
    allowed_tools: Vec<String>,

    /// Tool the agent must not use (repeatable).
    #[arg(long = "disallowed-tool", value_name = "TOOL")]
    disallowed_tools: Vec<String>,

    /// Per-invocation timeout in seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Working directory for the agent.
    #[arg(long, value_name = "DIR")]
    cwd: Option<PathBuf>,

    /// Continue the most recent session.
    #[arg(long = "continue")]
    continue_session: bool,

    /// Resume an explicit session id.
    #[arg(long, value_name = "SESSION_ID")]
    resume: Option<String>,

    /// JSON Schema file the structured output must satisfy.
    #[arg(long, value_name = "PATH")]
    schema_file: Option<PathBuf>,

    /// Continuation attempts after structured output fails validation.
    #[arg(long)]
    schema_retries: Option<u32>,

    /// Stop condition as JSON, e.g. '{"type":"token_limit","value":1000}' (repeatable).
    #[arg(long = "stop", value_name = "JSON")]
    stop_conditions: Vec<String>,

    /// Stop as soon as the output matches this regex (repeatable).
    #[arg(long = "stop-pattern", value_name = "REGEX")]
    stop_patterns: Vec<String>,

    /// Retries for rate-limited failures (overrides `[rate_limit] max_retries`).
    #[arg(long)]
    rate_limit_retries: Option<u32>,

    /// Send the prompt on stdin instead of as the last argument.
    #[arg(long)]
    stdin_prompt: bool,

    /// Use the API-key credential from the first invocation.
    #[arg(long)]
    api_key: bool,

    /// Print progress events as JSON lines on stderr.
    #[arg(long)]
    progress: bool,

    /// Print the command line that would be run and exit.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Text,
    Json,
    StreamJson,
}

impl From<FormatArg> for OutputFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Text => OutputFormat::Text,
            FormatArg::Json => OutputFormat::Json,
            FormatArg::StreamJson => OutputFormat::StreamJson,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum PermissionArg {
    Default,
    AcceptEdits,
    Bypass,
}

impl From<PermissionArg> for PermissionMode {
    fn from(arg: PermissionArg) -> Self {
        match arg {
            PermissionArg::Default => PermissionMode::Default,
            PermissionArg::AcceptEdits => PermissionMode::AcceptEdits,
            PermissionArg::Bypass => PermissionMode::Bypass,
        }
    }
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run(args) => match cmd_run(args) {
            Ok(code) => code,
            Err(err) => {
                eprintln!("{err:#}");
                exit_codes::CONFIG
            }
        },
    };
    std::process::exit(code);
}

/// Errors returned from here are configuration problems; agent failures are
/// reported through the printed result and the exit code.
fn cmd_run(args: RunArgs) -> Result<i32> {
    let prompt = read_prompt(&args)?;
    let config = load_config(&args.config)?;
    let mut builder = config.options_builder(prompt);

    if let Some(command) = &args.agent_command {
        builder = builder.command(command.split_whitespace());
    }
    if let Some(model) = args.model {
        builder = builder.model(model);
    }
    if let Some(max_turns) = args.max_turns {
        builder = builder.max_turns(max_turns);
    }
    if let Some(mode) = args.permission_mode {
        builder = builder.permission_mode(mode.into());
    }
    if let Some(format) = args.output_format {
        builder = builder.output_format(format.into());
    }
    if let Some(system_prompt) = args.system_prompt {
        builder = builder.system_prompt(system_prompt);
    }
    if let Some(path) = args.mcp_config {
        builder = builder.mcp_config(path);
    }
    if !args.allowed_tools.is_empty() {
        builder = builder.allowed_tools(args.allowed_tools);
    }
    if !args.disallowed_tools.is_empty() {
        builder = builder.disallowed_tools(args.disallowed_tools);
    }
    if let Some(secs) = args.timeout_secs {
        builder = builder.timeout(Duration::from_secs(secs));
    }
    if let Some(cwd) = args.cwd {
        builder = builder.cwd(cwd);
    }
    if args.continue_session {
        builder = builder.continue_session(true);
    }
    if let Some(id) = args.resume {
        builder = builder.resume(id);
    }
    if let Some(path) = &args.schema_file {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read schema {}", path.display()))?;
        let schema: Value = serde_json::from_str(&raw)
            .with_context(|| format!("parse schema {}", path.display()))?;
        builder = builder.schema(schema);
    }
    if let Some(retries) = args.schema_retries {
        builder = builder.schema_retries(retries);
    }
    for raw in &args.stop_conditions {
        builder = builder.stop_condition(parse_stop_condition(raw)?);
    }
    for pattern in &args.stop_patterns {
        builder = builder.stop_condition(StopCondition::pattern(
            regex::Regex::new(pattern).with_context(|| format!("compile stop pattern {pattern}"))?,
        ));
    }
    if let Some(retries) = args.rate_limit_retries {
        let mut policy = config.rate_limit;
        policy.max_retries = retries;
        builder = builder.rate_limit(policy);
    }
    if args.stdin_prompt {
        builder = builder.stdin_prompt(true);
    }
    if args.api_key {
        builder = builder.auth(AuthMode::Secondary);
    }

    let printer = if args.progress {
        let (sink, rx) = BoundedSink::new(PROGRESS_BUFFER);
        builder = builder.progress(Arc::new(sink));
        Some(thread::spawn(move || {
            for event in rx {
                if let Ok(line) = serde_json::to_string(&event) {
                    let _ = writeln!(std::io::stderr(), "{line}");
                }
            }
        }))
    } else {
        None
    };

    let options = builder.build()?;
    if args.dry_run {
        print_dry_run(&options)?;
        return Ok(exit_codes::COMPLETED);
    }

    // The pipeline drops the options (and the progress sender) when it returns,
    // which ends the printer thread.
    let result = agent_runner::execute(options)?;
    if let Some(handle) = printer
        && handle.join().is_err()
    {
        eprintln!("progress printer panicked");
    }
    print_result(&result)?;
    Ok(exit_codes::for_stop_reason(result.stop_reason))
}

fn read_prompt(args: &RunArgs) -> Result<String> {
    match (&args.prompt, &args.prompt_file) {
        (Some(prompt), None) => Ok(prompt.clone()),
        (None, Some(path)) => {
            fs::read_to_string(path).with_context(|| format!("read prompt {}", path.display()))
        }
        (Some(_), Some(_)) => bail!("pass either a prompt or --prompt-file, not both"),
        (None, None) => bail!("a prompt is required (positional or --prompt-file)"),
    }
}

fn parse_stop_condition(raw: &str) -> Result<StopCondition> {
    let value: Value =
        serde_json::from_str(raw).with_context(|| format!("parse stop condition {raw}"))?;
    StopCondition::from_json(&value).ok_or_else(|| anyhow!("unknown stop condition type in {raw}"))
}

fn print_dry_run(options: &ExecutionOptions) -> Result<()> {
    let mut argv: Vec<String> = options.command.clone();
    argv.extend(build_args(options)?);
    println!(
        "{}",
        serde_json::to_string_pretty(&argv).context("serialize argv")?
    );
    Ok(())
}

fn print_result(result: &AgentResult) -> Result<()> {
    let payload = serde_json::to_string_pretty(result).context("serialize result")?;
    println!("{payload}");
    Ok(())
}
