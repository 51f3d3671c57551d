//! Error types for the task queue.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::task::TaskStatus;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Task model errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Cannot transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Invalid priority: {0}")]
    InvalidPriority(String),

    #[error("Task {id} not found")]
    NotFound { id: Uuid },
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open store: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Task {id} does not exist in the store")]
    Missing { id: Uuid },

    #[error("Version conflict on task {id}: expected {expected}, found {actual}")]
    VersionConflict { id: Uuid, expected: i64, actual: i64 },
}

/// Claim protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Failed to claim a task after {attempts} attempts")]
    ClaimFailed { attempts: u32 },
}

/// External CLI execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("CLI process error: {0}")]
    Process(#[from] std::io::Error),

    #[error("Failed to execute task {task_id}: {reason}")]
    Failed { task_id: Uuid, reason: String },

    #[error("Claude AI usage limit reached, retry after {resume_at}")]
    RateLimited { resume_at: DateTime<Utc> },
}

impl ExecutorError {
    /// Seconds left until the rate limit resets (0 for other variants or
    /// when the reset time has already passed).
    pub fn wait_seconds(&self) -> u64 {
        match self {
            Self::RateLimited { resume_at } => {
                (*resume_at - Utc::now()).num_seconds().max(0) as u64
            }
            _ => 0,
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Result type alias for the queue.
pub type Result<T> = std::result::Result<T, Error>;
