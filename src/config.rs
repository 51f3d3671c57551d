//! Environment-driven configuration.
//!
//! All `CLAUDE_TODO_*` variables are read once at process start into an
//! immutable [`QueueConfig`] that is shared by reference with the queue,
//! executor, and worker. Unset or unparseable values fall back to the
//! documented defaults.

use std::path::PathBuf;
use std::time::Duration;

/// Default model passed to the CLI when none is configured.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Default per-task retry budget for rate-limited executions.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Default poll interval when the queue is empty.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(3);

/// Immutable queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Path to the Claude CLI executable.
    pub cli_path: String,
    /// Model name passed as `--model=<value>` unless overridden per call.
    pub model: String,
    /// Maximum execution attempts per task (rate-limit retries).
    pub max_attempts: u32,
    /// Sentinel file checked on idle ticks; its existence stops the worker.
    pub stop_file: PathBuf,
    /// Extra CLI arguments appended after the fixed flags.
    pub extra_args: Vec<String>,
    /// Poll interval when no task is claimable.
    pub check_interval: Duration,
    /// Working directory for CLI invocations (current dir when unset).
    pub project_root: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            cli_path: "claude".to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            stop_file: PathBuf::from("claude-runner.stop"),
            extra_args: Vec::new(),
            check_interval: DEFAULT_CHECK_INTERVAL,
            project_root: None,
        }
    }
}

impl QueueConfig {
    /// Build a configuration from `CLAUDE_TODO_*` environment variables,
    /// falling back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let max_attempts = std::env::var("CLAUDE_TODO_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_attempts);

        let check_interval = std::env::var("CLAUDE_TODO_CHECK_INTERVAL")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.check_interval);

        let extra_args = std::env::var("CLAUDE_TODO_EXTRA_ARGS")
            .ok()
            .map(|v| parse_extra_args(&v))
            .unwrap_or_default();

        Self {
            cli_path: std::env::var("CLAUDE_TODO_CLI_PATH").unwrap_or(defaults.cli_path),
            model: std::env::var("CLAUDE_TODO_MODEL").unwrap_or(defaults.model),
            max_attempts,
            stop_file: std::env::var("CLAUDE_TODO_STOP_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.stop_file),
            extra_args,
            check_interval,
            project_root: std::env::var("CLAUDE_TODO_PROJECT_ROOT").ok().map(PathBuf::from),
        }
    }
}

/// Split the space-delimited extra-args string, dropping empty segments.
fn parse_extra_args(raw: &str) -> Vec<String> {
    raw.split(' ')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
