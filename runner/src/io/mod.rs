//! Side-effecting layer: subprocesses, environment, configuration files, prompts.

pub mod config;
pub mod env;
pub mod invoker;
pub mod process;
pub mod prompt;
