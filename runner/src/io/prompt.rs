//! Continuation prompt sent when structured output fails validation.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde_json::Value;

const CONTINUATION_TEMPLATE: &str = include_str!("prompts/continuation.md");

/// Previous output beyond this many bytes is cut before embedding.
const PREVIOUS_OUTPUT_BUDGET: usize = 16 * 1024;

static ENGINE: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.add_template("continuation", CONTINUATION_TEMPLATE)
        .expect("continuation template should be valid");
    env
});

/// Render the prompt asking the agent to correct its structured output.
pub fn continuation_prompt(previous_output: &str, error: &str, schema: &Value) -> Result<String> {
    let schema = serde_json::to_string_pretty(schema).context("serialize schema")?;
    let template = ENGINE
        .get_template("continuation")
        .context("load continuation template")?;
    let rendered = template
        .render(context! {
            error => error.trim(),
            previous_output => truncate_output(previous_output.trim()),
            schema => schema,
        })
        .context("render continuation prompt")?;
    Ok(rendered)
}

fn truncate_output(output: &str) -> String {
    if output.len() <= PREVIOUS_OUTPUT_BUDGET {
        return output.to_string();
    }
    let mut end = PREVIOUS_OUTPUT_BUDGET;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{}\n[truncated {} bytes]",
        &output[..end],
        output.len() - end
    )
}
