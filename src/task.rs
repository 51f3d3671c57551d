//! Task model — the unit of work handed to the Claude CLI.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TaskError;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task is waiting to be claimed.
    Pending,
    /// Task has been claimed and is being executed.
    InProgress,
    /// Task finished successfully.
    Completed,
    /// Task failed and will not be retried.
    Failed,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    ///
    /// Completed and Failed are terminal; same-state transitions are
    /// never valid.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, InProgress) | (Pending, Failed) | (InProgress, Completed) | (InProgress, Failed)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Queue ordering priority. Does not affect transition logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
}

impl TaskPriority {
    /// Numeric weight used for queue ordering (higher runs first).
    pub fn weight(&self) -> i32 {
        match self {
            Self::Low => 1,
            Self::Normal => 2,
            Self::High => 3,
        }
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TaskPriority {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            other => Err(TaskError::InvalidPriority(other.to_string())),
        }
    }
}

/// A single queued task.
///
/// All status changes go through [`Task::set_status`], which enforces the
/// transition table and stamps `updated_at` (and `completed_at` when the
/// task completes). The `version` column is bumped by the store on every
/// successful write and is the basis for optimistic-lock conflict
/// detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique ID.
    pub id: Uuid,
    /// Group name used to partition concurrency (one in-flight task per group).
    pub group: String,
    /// Free-text instruction passed verbatim to the CLI.
    pub description: String,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Queue ordering priority.
    pub priority: TaskPriority,
    /// When the task was created. Immutable.
    pub created_at: DateTime<Utc>,
    /// When the status last changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// When the task was claimed for execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    /// When the task completed. Non-null iff status is Completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Outcome or diagnostic text, set on completion or failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Optimistic-lock version, incremented by the store on every write.
    pub version: i64,
}

impl Task {
    /// Create a new pending task.
    pub fn new(group: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            group: group.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            priority: TaskPriority::Normal,
            created_at: Utc::now(),
            updated_at: None,
            executed_at: None,
            completed_at: None,
            result: None,
            version: 1,
        }
    }

    /// Builder: set priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Transition to a new status.
    ///
    /// Stamps `updated_at`; transitioning to Completed also stamps
    /// `completed_at`.
    pub fn set_status(&mut self, status: TaskStatus) -> Result<(), TaskError> {
        if !self.status.can_transition_to(status) {
            return Err(TaskError::InvalidTransition {
                from: self.status,
                to: status,
            });
        }

        self.status = status;
        self.updated_at = Some(Utc::now());

        if status == TaskStatus::Completed {
            self.completed_at = Some(Utc::now());
        }

        Ok(())
    }

    /// Claim the task: transition to InProgress and stamp `executed_at`.
    pub fn start(&mut self) -> Result<(), TaskError> {
        self.set_status(TaskStatus::InProgress)?;
        self.executed_at = Some(Utc::now());
        Ok(())
    }

    /// Complete the task with its result text.
    pub fn complete(&mut self, result: impl Into<String>) -> Result<(), TaskError> {
        self.set_status(TaskStatus::Completed)?;
        self.result = Some(result.into());
        Ok(())
    }

    /// Fail the task with a diagnostic.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), TaskError> {
        self.set_status(TaskStatus::Failed)?;
        self.result = Some(reason.into());
        Ok(())
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {} - {}", self.group, self.id, self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    #[test]
    fn transition_table_exhaustive() {
        let valid = [
            (TaskStatus::Pending, TaskStatus::InProgress),
            (TaskStatus::Pending, TaskStatus::Failed),
            (TaskStatus::InProgress, TaskStatus::Completed),
            (TaskStatus::InProgress, TaskStatus::Failed),
        ];

        for from in ALL {
            for to in ALL {
                let expected = valid.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "{from} -> {to} should be {expected}"
                );
            }
        }
    }

    #[test]
    fn identity_transitions_invalid() {
        for status in ALL {
            assert!(!status.can_transition_to(status));
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_finished());
        assert!(TaskStatus::Failed.is_finished());
        assert!(!TaskStatus::Pending.is_finished());
        assert!(!TaskStatus::InProgress.is_finished());
    }

    #[test]
    fn new_task_defaults() {
        let task = Task::new("user-bundle", "Fix the login bug");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, TaskPriority::Normal);
        assert_eq!(task.version, 1);
        assert!(task.updated_at.is_none());
        assert!(task.executed_at.is_none());
        assert!(task.completed_at.is_none());
        assert!(task.result.is_none());
    }

    #[test]
    fn start_stamps_executed_at() {
        let mut task = Task::new("g", "d");
        task.start().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert!(task.executed_at.is_some());
        assert!(task.updated_at.is_some());
        assert!(task.completed_at.is_none());
    }

    #[test]
    fn complete_stamps_completed_at_and_result() {
        let mut task = Task::new("g", "d");
        task.start().unwrap();
        task.complete("All done").unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
        assert_eq!(task.result.as_deref(), Some("All done"));
    }

    #[test]
    fn only_completion_sets_completed_at() {
        let mut task = Task::new("g", "d");
        task.start().unwrap();
        task.fail("boom").unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.completed_at.is_none());
        assert_eq!(task.result.as_deref(), Some("boom"));
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let mut task = Task::new("g", "d");
        task.start().unwrap();
        task.complete("ok").unwrap();

        let err = task.set_status(TaskStatus::InProgress).unwrap_err();
        match err {
            TaskError::InvalidTransition { from, to } => {
                assert_eq!(from, TaskStatus::Completed);
                assert_eq!(to, TaskStatus::InProgress);
            }
            other => panic!("expected InvalidTransition, got {other}"),
        }
        // Task untouched
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[test]
    fn pending_can_fail_directly() {
        let mut task = Task::new("g", "d");
        task.fail("rejected before execution").unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[test]
    fn priority_weights_ordered() {
        assert!(TaskPriority::High.weight() > TaskPriority::Normal.weight());
        assert!(TaskPriority::Normal.weight() > TaskPriority::Low.weight());
    }

    #[test]
    fn priority_from_str() {
        assert_eq!("high".parse::<TaskPriority>().unwrap(), TaskPriority::High);
        assert_eq!("normal".parse::<TaskPriority>().unwrap(), TaskPriority::Normal);
        assert_eq!("low".parse::<TaskPriority>().unwrap(), TaskPriority::Low);

        let err = "urgent".parse::<TaskPriority>().unwrap_err();
        assert!(matches!(err, TaskError::InvalidPriority(ref s) if s == "urgent"));
    }

    #[test]
    fn status_serde_snake_case() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");

        let parsed: TaskStatus = serde_json::from_str("\"completed\"").unwrap();
        assert_eq!(parsed, TaskStatus::Completed);
    }

    #[test]
    fn status_display_matches_serde() {
        for status in ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
        }
    }

    #[test]
    fn task_serde_roundtrip() {
        let task = Task::new("docs", "Write the changelog").with_priority(TaskPriority::High);
        let json = serde_json::to_string(&task).unwrap();
        let parsed: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, task.id);
        assert_eq!(parsed.group, "docs");
        assert_eq!(parsed.priority, TaskPriority::High);
        assert_eq!(parsed.status, TaskStatus::Pending);
    }

    #[test]
    fn task_optional_fields_omitted() {
        let task = Task::new("g", "d");
        let json = serde_json::to_string(&task).unwrap();
        assert!(!json.contains("\"updated_at\""));
        assert!(!json.contains("\"executed_at\""));
        assert!(!json.contains("\"completed_at\""));
        assert!(!json.contains("\"result\""));
    }
}
