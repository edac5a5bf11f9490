//! Runner configuration stored as TOML (default `agent-runner.toml`).

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::options::{
    DEFAULT_CREDENTIAL_ENV, DEFAULT_OUTPUT_LIMIT_BYTES, DEFAULT_PROGRAM, DEFAULT_SCHEMA_RETRIES,
    DEFAULT_TIMEOUT, ExecutionOptions, ExecutionOptionsBuilder, RetryPolicy,
};
use crate::core::types::{OutputFormat, PermissionMode};

pub const DEFAULT_CONFIG_FILE: &str = "agent-runner.toml";

/// Runner configuration (TOML).
///
/// Intended to be edited by humans. Missing fields take the defaults below;
/// CLI flags override whatever the file sets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Agent program followed by prefix arguments (e.g. `["npx", "claude"]`).
    pub command: Vec<String>,

    pub model: Option<String>,

    /// Per-invocation wall-clock limit in seconds.
    pub timeout_secs: u64,

    pub output_format: OutputFormat,

    pub permission_mode: PermissionMode,

    /// Continuation attempts after structured output fails validation.
    pub schema_retries: u32,

    /// Keep at most this many bytes of stdout/stderr per invocation.
    pub output_limit_bytes: usize,

    /// Variable holding the API key used by the fallback credential mode.
    pub credential_env: String,

    pub rate_limit: RetryPolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            command: vec![DEFAULT_PROGRAM.to_string()],
            model: None,
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            output_format: OutputFormat::Text,
            permission_mode: PermissionMode::Default,
            schema_retries: DEFAULT_SCHEMA_RETRIES,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            credential_env: DEFAULT_CREDENTIAL_ENV.to_string(),
            rate_limit: RetryPolicy::default(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.command.first().is_none_or(|p| p.trim().is_empty()) {
            return Err(anyhow!("command must be a non-empty array"));
        }
        if self.timeout_secs == 0 {
            return Err(anyhow!("timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.credential_env.trim().is_empty() {
            return Err(anyhow!("credential_env must not be empty"));
        }
        if self.rate_limit.multiplier.is_nan() || self.rate_limit.multiplier < 1.0 {
            return Err(anyhow!("rate_limit.multiplier must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&self.rate_limit.jitter_factor) {
            return Err(anyhow!("rate_limit.jitter_factor must be within 0.0..=1.0"));
        }
        Ok(())
    }

    /// An options builder seeded from this configuration.
    pub fn options_builder(&self, prompt: impl Into<String>) -> ExecutionOptionsBuilder {
        let builder = ExecutionOptions::builder(prompt)
            .command(self.command.clone())
            .timeout(Duration::from_secs(self.timeout_secs))
            .output_format(self.output_format)
            .permission_mode(self.permission_mode)
            .schema_retries(self.schema_retries)
            .output_limit_bytes(self.output_limit_bytes)
            .credential_env(self.credential_env.clone())
            .rate_limit(self.rate_limit);
        match &self.model {
            Some(model) => builder.model(model.clone()),
            None => builder,
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        let cfg = RunnerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunnerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RunnerConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("agent-runner.toml");
        let cfg = RunnerConfig {
            model: Some("opus".to_string()),
            output_format: OutputFormat::StreamJson,
            ..RunnerConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("agent-runner.toml");
        fs::write(
            &path,
            "command = [\"npx\", \"claude\"]\noutput_format = \"json\"\n\n[rate_limit]\nmax_retries = 3\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.command, vec!["npx".to_string(), "claude".to_string()]);
        assert_eq!(cfg.output_format, OutputFormat::Json);
        assert_eq!(cfg.rate_limit.max_retries, 3);
        assert_eq!(cfg.rate_limit.initial_backoff_ms, 1_000);
        assert_eq!(cfg.timeout_secs, 600);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("agent-runner.toml");
        fs::write(&path, "command = []\n").expect("write");
        let err = load_config(&path).expect_err("empty command");
        assert!(format!("{err:#}").contains("command must be a non-empty array"));

        let cfg = RunnerConfig {
            timeout_secs: 0,
            ..RunnerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn options_builder_applies_config() {
        let cfg = RunnerConfig {
            command: vec!["npx".to_string(), "claude".to_string()],
            model: Some("haiku".to_string()),
            timeout_secs: 30,
            schema_retries: 5,
            ..RunnerConfig::default()
        };
        let options = cfg.options_builder("hi").build().expect("options");
        assert_eq!(options.program(), "npx");
        assert_eq!(options.model.as_deref(), Some("haiku"));
        assert_eq!(options.timeout, Duration::from_secs(30));
        assert_eq!(options.schema_retries, 5);
    }
}
