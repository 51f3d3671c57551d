//! Worker loop — claim, execute, retry, finalize.
//!
//! One worker processes tasks strictly sequentially. Rate-limited
//! executions are retried in place after a cancellable countdown (the task
//! stays in-progress); execution failures finalize the task as failed but
//! keep the loop alive; anything unexpected logs and pauses one interval.
//! Shutdown is cooperative: a flag checked between claims and inside every
//! sleep, so an in-flight CLI call always finishes before the loop exits.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::{Error, ExecutorError, TaskError};
use crate::executor::{ExecuteOptions, TaskExecutor};
use crate::queue::TaskQueue;
use crate::task::{Task, TaskStatus};

/// Granularity of cancellable sleeps.
const SLEEP_GRANULARITY: Duration = Duration::from_millis(250);

/// Age after which an in-progress task is reported as likely orphaned.
const STUCK_THRESHOLD: Duration = Duration::from_secs(24 * 3600);

/// Options for a worker run.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Only claim tasks from this group.
    pub group: Option<String>,
    /// Poll interval when no task is claimable.
    pub check_interval: Duration,
    /// Stop after this long without claiming anything (zero = never).
    pub idle_timeout: Duration,
    /// Execution attempts per task before giving up on rate limits.
    pub max_attempts: u32,
    /// Model override for this run.
    pub model: Option<String>,
    /// Bounds of the randomized delay added after a rate-limit wait.
    pub jitter_min: Duration,
    pub jitter_max: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            group: None,
            check_interval: Duration::from_secs(3),
            idle_timeout: Duration::ZERO,
            max_attempts: 10,
            model: None,
            jitter_min: Duration::from_secs(60),
            jitter_max: Duration::from_secs(300),
        }
    }
}

impl WorkerOptions {
    /// Derive run options from the process configuration.
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            check_interval: config.check_interval,
            max_attempts: config.max_attempts,
            ..Self::default()
        }
    }
}

/// Outcome of driving a single task to rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Task completed and was persisted with its result.
    Completed,
    /// Task failed terminally and was persisted with the diagnostic.
    Failed(String),
    /// Rate-limit retries ran out; the task is left in-progress so an
    /// operator can resume it later.
    AttemptsExhausted,
}

/// Counters returned when the loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub processed: u64,
    pub failed: u64,
}

/// Single-task and continuous task processing.
pub struct Worker {
    queue: Arc<TaskQueue>,
    executor: Arc<dyn TaskExecutor>,
    config: Arc<QueueConfig>,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(
        queue: Arc<TaskQueue>,
        executor: Arc<dyn TaskExecutor>,
        config: Arc<QueueConfig>,
    ) -> Self {
        Self {
            queue,
            executor,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that requests a graceful stop when set. Wire this to SIGINT or
    /// SIGTERM outside the core.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Continuously claim and process tasks until idle timeout, the stop
    /// file, or a shutdown request ends the loop.
    pub async fn run(&self, options: &WorkerOptions) -> WorkerStats {
        info!(
            group = ?options.group,
            check_interval_secs = options.check_interval.as_secs(),
            idle_timeout_secs = options.idle_timeout.as_secs(),
            "Worker started"
        );

        self.report_stuck_tasks().await;

        let mut stats = WorkerStats::default();
        let mut last_activity = Instant::now();

        while !self.is_shutdown() {
            match self.queue.claim(options.group.as_deref()).await {
                Ok(Some(mut task)) => {
                    last_activity = Instant::now();
                    match self.execute_with_retry(&mut task, options).await {
                        Ok(TaskOutcome::Completed) => {
                            stats.processed += 1;
                        }
                        Ok(outcome) => {
                            warn!(task_id = %task.id, ?outcome, "Task did not complete");
                            stats.failed += 1;
                        }
                        Err(e) => {
                            // Persistence hiccup mid-task; pause and move on.
                            error!(task_id = %task.id, error = %e, "Unexpected error processing task");
                            self.sleep_cancellable(options.check_interval).await;
                        }
                    }
                }
                Ok(None) => {
                    if let Some(reason) = self.stop_reason(options, last_activity) {
                        info!("{reason}");
                        break;
                    }
                    self.sleep_cancellable(options.check_interval).await;
                }
                Err(e) => {
                    error!(error = %e, "Unexpected error in worker loop");
                    self.sleep_cancellable(options.check_interval).await;
                }
            }
        }

        info!(
            processed = stats.processed,
            failed = stats.failed,
            "Worker stopped"
        );
        stats
    }

    /// Drive one task through execution.
    ///
    /// A pending task is first transitioned to in-progress; an in-progress
    /// task (e.g. fresh from `claim`) proceeds as-is; any other status is a
    /// precondition failure with no side effects.
    pub async fn run_one(
        &self,
        task: &mut Task,
        options: &WorkerOptions,
    ) -> Result<TaskOutcome, Error> {
        match task.status {
            TaskStatus::Pending => self.queue.mark_in_progress(task).await?,
            TaskStatus::InProgress => {}
            other => {
                return Err(TaskError::InvalidTransition {
                    from: other,
                    to: TaskStatus::InProgress,
                }
                .into());
            }
        }

        self.execute_with_retry(task, options).await
    }

    /// Execution attempt loop: retry rate limits in place, finalize
    /// everything else.
    async fn execute_with_retry(
        &self,
        task: &mut Task,
        options: &WorkerOptions,
    ) -> Result<TaskOutcome, Error> {
        let exec_options = ExecuteOptions {
            model: options.model.clone(),
        };

        for attempt in 1..=options.max_attempts {
            debug!(
                task_id = %task.id,
                attempt,
                max_attempts = options.max_attempts,
                "Execution attempt"
            );

            match self.executor.execute(task, &exec_options).await {
                Ok(result) => {
                    self.queue.complete(task, result.output.clone()).await?;
                    info!(task_id = %task.id, outcome = %result.summary(), "Task completed");
                    return Ok(TaskOutcome::Completed);
                }
                Err(ExecutorError::RateLimited { resume_at }) => {
                    if attempt >= options.max_attempts {
                        warn!(task_id = %task.id, "Max retry attempts reached for usage limit");
                        return Ok(TaskOutcome::AttemptsExhausted);
                    }

                    warn!(task_id = %task.id, resume_at = %resume_at, "Usage limit reached, waiting");
                    self.wait_until(resume_at).await;
                    self.random_jitter(options).await;
                }
                Err(ExecutorError::Failed { reason, .. }) => {
                    self.queue.fail(task, reason.clone()).await?;
                    error!(task_id = %task.id, reason = %reason, "Task execution failed");
                    return Ok(TaskOutcome::Failed(reason));
                }
                Err(e) => {
                    let reason = format!("Unexpected error: {e}");
                    self.queue.fail(task, reason.clone()).await?;
                    error!(task_id = %task.id, reason = %reason, "Task execution failed");
                    return Ok(TaskOutcome::Failed(reason));
                }
            }
        }

        Ok(TaskOutcome::AttemptsExhausted)
    }

    /// Why the idle loop should stop, if it should.
    fn stop_reason(&self, options: &WorkerOptions, last_activity: Instant) -> Option<String> {
        if !options.idle_timeout.is_zero() && last_activity.elapsed() >= options.idle_timeout {
            return Some("Idle timeout reached. Stopping worker.".to_string());
        }

        if self.config.stop_file.exists() {
            return Some(format!(
                "Stop file detected ({}). Stopping worker.",
                self.config.stop_file.display()
            ));
        }

        None
    }

    /// Countdown until the rate-limit reset, interruptible by shutdown.
    async fn wait_until(&self, resume_at: DateTime<Utc>) {
        loop {
            if self.is_shutdown() {
                return;
            }
            let remaining_ms = (resume_at - Utc::now()).num_milliseconds();
            if remaining_ms <= 0 {
                break;
            }
            debug!(remaining_secs = remaining_ms / 1000, "Waiting for rate limit reset");
            tokio::time::sleep(Duration::from_millis(remaining_ms.min(1000) as u64)).await;
        }

        if !self.is_shutdown() {
            info!("Wait time completed. Retrying...");
        }
    }

    /// Randomized delay after a rate-limit wait, to spread out retries
    /// across workers.
    async fn random_jitter(&self, options: &WorkerOptions) {
        let min = options.jitter_min.min(options.jitter_max).as_millis() as u64;
        let max = options.jitter_max.max(options.jitter_min).as_millis() as u64;
        let delay_ms = rand::thread_rng().gen_range(min..=max);
        if delay_ms > 0 {
            debug!(delay_ms, "Adding random delay before retry");
            self.sleep_cancellable(Duration::from_millis(delay_ms)).await;
        }
    }

    /// Sleep that wakes early when shutdown is requested.
    async fn sleep_cancellable(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.is_shutdown() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            tokio::time::sleep(remaining.min(SLEEP_GRANULARITY)).await;
        }
    }

    /// Log in-progress tasks that look orphaned by a crashed worker. They
    /// are reported only; their groups stay serialized until an operator
    /// intervenes.
    async fn report_stuck_tasks(&self) {
        match self.queue.stuck_tasks(STUCK_THRESHOLD).await {
            Ok(stuck) => {
                for task in &stuck {
                    warn!(
                        task_id = %task.id,
                        group = %task.group,
                        "In-progress task with no recent update; previous worker may have crashed"
                    );
                }
            }
            Err(e) => warn!(error = %e, "Failed to check for stuck tasks"),
        }
    }
}
