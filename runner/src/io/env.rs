//! Per-call child environment construction.
//!
//! The launcher never mutates the process environment. Each invocation builds
//! its own map and spawns the child with `env_clear()` plus that map, so
//! concurrent calls with different credential modes stay isolated.

use std::collections::BTreeMap;

use crate::core::options::ExecutionOptions;
use crate::core::types::AuthMode;

/// The base environment for `options`: the explicit map, or a snapshot of the
/// current process environment (non UTF-8 entries are skipped).
pub fn base_env(options: &ExecutionOptions) -> BTreeMap<String, String> {
    match &options.env {
        Some(env) => env.clone(),
        None => std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect(),
    }
}

/// Environment for one invocation under `auth`.
///
/// The primary mode removes the credential variable so the agent uses its own
/// login; the secondary mode keeps it.
pub fn child_env(options: &ExecutionOptions, auth: AuthMode) -> BTreeMap<String, String> {
    let mut env = base_env(options);
    if auth == AuthMode::Primary {
        env.remove(&options.credential_env);
    }
    env
}

/// Whether the secondary credential is available for a fallback invocation.
pub fn has_secondary_credential(options: &ExecutionOptions) -> bool {
    base_env(options)
        .get(&options.credential_env)
        .is_some_and(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(env: &[(&str, &str)]) -> ExecutionOptions {
        ExecutionOptions::builder("x")
            .env(
                env.iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
            )
            .build()
            .expect("options")
    }

    #[test]
    fn primary_mode_strips_credential() {
        let opts = options(&[("ANTHROPIC_API_KEY", "sk-test"), ("PATH", "/bin")]);
        let env = child_env(&opts, AuthMode::Primary);
        assert!(!env.contains_key("ANTHROPIC_API_KEY"));
        assert_eq!(env.get("PATH").map(String::as_str), Some("/bin"));
    }

    #[test]
    fn secondary_mode_keeps_credential() {
        let opts = options(&[("ANTHROPIC_API_KEY", "sk-test")]);
        let env = child_env(&opts, AuthMode::Secondary);
        assert_eq!(
            env.get("ANTHROPIC_API_KEY").map(String::as_str),
            Some("sk-test")
        );
        // The caller's map is untouched.
        assert!(opts.env.as_ref().is_some_and(|e| e.contains_key("ANTHROPIC_API_KEY")));
    }

    #[test]
    fn custom_credential_variable_is_honored() {
        let mut opts = options(&[("MY_KEY", "k"), ("ANTHROPIC_API_KEY", "other")]);
        opts.credential_env = "MY_KEY".to_string();
        let env = child_env(&opts, AuthMode::Primary);
        assert!(!env.contains_key("MY_KEY"));
        assert!(env.contains_key("ANTHROPIC_API_KEY"));
        assert!(has_secondary_credential(&opts));
    }

    #[test]
    fn blank_credential_is_not_available() {
        assert!(!has_secondary_credential(&options(&[("ANTHROPIC_API_KEY", " ")])));
        assert!(!has_secondary_credential(&options(&[])));
    }
}
