//! Argument vector construction for the agent CLI.

use crate::core::error::ConfigError;
use crate::core::options::ExecutionOptions;
use crate::core::types::{OutputFormat, PermissionMode};

/// Shorthand model names and their canonical identifiers. Unknown names pass through.
const MODEL_ALIASES: &[(&str, &str)] = &[
    ("sonnet", "claude-3-5-sonnet-20241022"),
    ("opus", "claude-3-opus-20240229"),
    ("haiku", "claude-3-5-haiku-20241022"),
];

pub fn resolve_model(name: &str) -> &str {
    MODEL_ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(name)
}

fn permission_flag(mode: PermissionMode) -> Option<&'static str> {
    match mode {
        PermissionMode::Default => None,
        PermissionMode::AcceptEdits => Some("--permission-mode=acceptEdits"),
        PermissionMode::Bypass => Some("--dangerously-skip-permissions"),
    }
}

/// Build the CLI arguments (program and prefix arguments excluded).
///
/// `--print` is always first. The prompt is always last unless it is sent on
/// stdin. Fails only when `continue` and `resume` are both set.
pub fn build_args(options: &ExecutionOptions) -> Result<Vec<String>, ConfigError> {
    if let (true, Some(id)) = (options.continue_session, &options.resume_session_id) {
        return Err(ConfigError::ConflictingContinuation {
            resume_id: id.clone(),
        });
    }

    let mut args = vec!["--print".to_string()];
    if let Some(model) = &options.model {
        args.push("--model".to_string());
        args.push(resolve_model(model).to_string());
    }
    if let Some(max_turns) = options.max_turns {
        args.push("--max-turns".to_string());
        args.push(max_turns.to_string());
    }
    if let Some(flag) = permission_flag(options.permission_mode) {
        args.push(flag.to_string());
    }
    if let Some(system_prompt) = &options.system_prompt {
        args.push("--system-prompt".to_string());
        args.push(system_prompt.clone());
    }
    args.push("--output-format".to_string());
    args.push(options.output_format.as_str().to_string());
    if options.output_format == OutputFormat::StreamJson {
        // The CLI refuses stream-json in print mode without it.
        args.push("--verbose".to_string());
    }
    if let Some(path) = &options.mcp_config {
        args.push("--mcp-config".to_string());
        args.push(path.display().to_string());
    }
    for tool in &options.allowed_tools {
        args.push("--allowedTools".to_string());
        args.push(tool.clone());
    }
    for tool in &options.disallowed_tools {
        args.push("--disallowedTools".to_string());
        args.push(tool.clone());
    }
    if options.continue_session {
        args.push("--continue".to_string());
    } else if let Some(id) = &options.resume_session_id {
        args.push("--resume".to_string());
        args.push(id.clone());
    }
    if !options.stdin_prompt {
        args.push(options.prompt.clone());
    }
    Ok(args)
}

/// Render a command line for error messages.
pub fn format_command(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .map(|arg| {
            if arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || c == '"' || c == '\'') {
                format!("{arg:?}")
            } else {
                arg.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
