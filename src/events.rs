//! Task lifecycle events, broadcast to external subscribers.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::executor::ExecutionResult;
use crate::task::Task;

/// Default broadcast channel capacity.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle events emitted by the queue and the executor.
///
/// Delivery is fire-and-forget: senders ignore the "no subscribers" error,
/// and slow subscribers may observe lagged receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// A task was pushed onto the queue.
    Created { task: Task },
    /// The CLI executed a task successfully.
    Executed { task: Task, result: ExecutionResult },
    /// The CLI failed to execute a task.
    Failed { task: Task, error: String },
}

impl TaskEvent {
    /// The task this event refers to.
    pub fn task(&self) -> &Task {
        match self {
            Self::Created { task }
            | Self::Executed { task, .. }
            | Self::Failed { task, .. } => task,
        }
    }

    /// Event type name (matches the serde tag).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Executed { .. } => "executed",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Create a broadcast channel for task events.
pub fn channel() -> (broadcast::Sender<TaskEvent>, broadcast::Receiver<TaskEvent>) {
    broadcast::channel(EVENT_CHANNEL_CAPACITY)
}
