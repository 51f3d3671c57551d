//! Execution engine — runs a claimed task through the Claude CLI.
//!
//! The executor owns the whole subprocess lifecycle: building the
//! invocation, streaming stdout/stderr line-by-line, classifying
//! usage-limit output, and turning the exit status into a typed result.
//! It never mutates task state; persistence is the worker's job.

mod rate_limit;
mod stream;

pub use rate_limit::{is_usage_limit, parse_reset_time};
pub use stream::extract_text;

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::error::ExecutorError;
use crate::events::TaskEvent;
use crate::task::Task;

/// Timeout for the `--version` availability probe.
const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a successful CLI run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Accumulated human-readable output.
    pub output: String,
    /// Wall-clock execution time in fractional seconds.
    pub duration_secs: f64,
}

impl ExecutionResult {
    pub fn new(output: impl Into<String>, duration_secs: f64) -> Self {
        Self {
            output: output.into(),
            duration_secs,
        }
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        format!("Success ({:.2}s)", self.duration_secs)
    }
}

/// Per-call execution options.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Model override; falls back to the configured default.
    pub model: Option<String>,
}

/// Abstraction over the execution engine, so the worker can be driven
/// against a scripted executor in tests.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Execute the task's description and classify the outcome.
    async fn execute(
        &self,
        task: &Task,
        options: &ExecuteOptions,
    ) -> Result<ExecutionResult, ExecutorError>;

    /// Probe whether the CLI can be launched at all.
    async fn is_available(&self) -> bool;
}

/// Executor that shells out to the Claude CLI.
pub struct ClaudeExecutor {
    config: Arc<QueueConfig>,
    events: broadcast::Sender<TaskEvent>,
}

impl ClaudeExecutor {
    pub fn new(config: Arc<QueueConfig>, events: broadcast::Sender<TaskEvent>) -> Self {
        Self { config, events }
    }

    /// Build the argument list: fixed flags, model, configured extras,
    /// then the task description as the final positional argument.
    fn build_args(&self, task: &Task, options: &ExecuteOptions) -> Vec<String> {
        let model = options
            .model
            .clone()
            .unwrap_or_else(|| self.config.model.clone());

        let mut args = vec![
            "--dangerously-skip-permissions".to_string(),
            "--print".to_string(),
            "--output-format=stream-json".to_string(),
            format!("--model={model}"),
            "--verbose".to_string(),
        ];
        args.extend(self.config.extra_args.iter().cloned());
        args.push(task.description.clone());
        args
    }

    /// Spawn the CLI, drain its output, and classify the exit.
    async fn run(
        &self,
        task: &Task,
        options: &ExecuteOptions,
    ) -> Result<ExecutionResult, ExecutorError> {
        let args = self.build_args(task, options);
        info!(
            task_id = %task.id,
            command = %format!("{} {}", self.config.cli_path, args.join(" ")),
            "Executing CLI command"
        );

        let start = Instant::now();

        let mut cmd = Command::new(&self.config.cli_path);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(root) = &self.config.project_root {
            cmd.current_dir(root);
        }

        let mut child = cmd.spawn()?;

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let (stdout_raw, stderr_raw) =
            tokio::join!(drain_lines(stdout_pipe), drain_lines(stderr_pipe));

        // The CLI may run indefinitely; only the wait itself can fail.
        let status = child.wait().await?;
        let duration_secs = start.elapsed().as_secs_f64();

        let combined = format!("{stdout_raw}\n{stderr_raw}");
        if is_usage_limit(&combined) {
            return Err(ExecutorError::RateLimited {
                resume_at: parse_reset_time(&combined),
            });
        }

        if !status.success() {
            let trimmed = stderr_raw.trim();
            let reason = if trimmed.is_empty() {
                "Unknown error".to_string()
            } else {
                trimmed.to_string()
            };
            return Err(ExecutorError::Failed {
                task_id: task.id,
                reason,
            });
        }

        Ok(ExecutionResult::new(
            extract_text(&stdout_raw),
            duration_secs,
        ))
    }
}

#[async_trait]
impl TaskExecutor for ClaudeExecutor {
    async fn execute(
        &self,
        task: &Task,
        options: &ExecuteOptions,
    ) -> Result<ExecutionResult, ExecutorError> {
        match self.run(task, options).await {
            Ok(result) => {
                let _ = self.events.send(TaskEvent::Executed {
                    task: task.clone(),
                    result: result.clone(),
                });
                Ok(result)
            }
            Err(err) => {
                // A usage limit is transient; only real failures notify.
                if !matches!(err, ExecutorError::RateLimited { .. }) {
                    let _ = self.events.send(TaskEvent::Failed {
                        task: task.clone(),
                        error: err.to_string(),
                    });
                }
                Err(err)
            }
        }
    }

    async fn is_available(&self) -> bool {
        let mut cmd = Command::new(&self.config.cli_path);
        cmd.arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(root) = &self.config.project_root {
            cmd.current_dir(root);
        }

        match tokio::time::timeout(AVAILABILITY_TIMEOUT, cmd.status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to check CLI availability");
                false
            }
            Err(_) => {
                warn!("CLI availability check timed out");
                false
            }
        }
    }
}

/// Read a pipe to completion line-by-line, keeping the raw text.
async fn drain_lines<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let Some(pipe) = pipe else {
        return String::new();
    };

    let mut lines = BufReader::new(pipe).lines();
    let mut buf = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(line = %line, "CLI output");
        buf.push_str(&line);
        buf.push('\n');
    }
    buf
}
