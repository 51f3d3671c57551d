//! Task queue — producer API and the claim protocol.
//!
//! `claim` is the only path from Pending to InProgress. It excludes groups
//! that already have a task in flight, picks the best candidate by
//! priority then age, and persists the transition with a version-checked
//! write. Losing the write race means another worker got there first; the
//! whole selection is retried against fresh store state, with a short
//! linear backoff, up to a fixed budget.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, QueueError, StoreError, TaskError};
use crate::events::TaskEvent;
use crate::store::TaskStore;
use crate::task::{Task, TaskPriority, TaskStatus};

/// Selection retries before a claim gives up.
const CLAIM_MAX_ATTEMPTS: u32 = 3;

/// Base backoff between claim retries (multiplied by the attempt number).
const CLAIM_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Producer and claimer over a [`TaskStore`].
pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    events: broadcast::Sender<TaskEvent>,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn TaskStore>, events: broadcast::Sender<TaskEvent>) -> Self {
        Self { store, events }
    }

    /// Subscribe to task lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Create a pending task and persist it.
    pub async fn push(
        &self,
        group: &str,
        description: &str,
        priority: TaskPriority,
    ) -> Result<Task, Error> {
        let task = Task::new(group, description).with_priority(priority);
        self.store.insert(&task).await?;

        let _ = self.events.send(TaskEvent::Created { task: task.clone() });
        info!(task_id = %task.id, group = %group, priority = %priority, "Task created");
        Ok(task)
    }

    /// Claim the next eligible pending task, if any.
    ///
    /// Returns `Ok(None)` when nothing is claimable. Fails with
    /// [`QueueError::ClaimFailed`] only when version conflicts persist
    /// through the whole retry budget.
    pub async fn claim(&self, group: Option<&str>) -> Result<Option<Task>, Error> {
        for attempt in 1..=CLAIM_MAX_ATTEMPTS {
            let busy_groups = self.store.groups_with_in_progress().await?;

            let Some(mut task) = self.store.find_next_pending(group, &busy_groups).await? else {
                return Ok(None);
            };

            let expected = task.version;
            task.start()?;

            match self.store.save(&task, expected).await {
                Ok(version) => {
                    task.version = version;
                    info!(task_id = %task.id, group = %task.group, "Task claimed");
                    return Ok(Some(task));
                }
                Err(StoreError::VersionConflict { .. }) => {
                    warn!(attempt, group = ?group, "Optimistic lock conflict on claim");
                    if attempt < CLAIM_MAX_ATTEMPTS {
                        tokio::time::sleep(CLAIM_RETRY_DELAY * attempt).await;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(QueueError::ClaimFailed {
            attempts: CLAIM_MAX_ATTEMPTS,
        }
        .into())
    }

    /// Look up a task, failing when it does not exist.
    pub async fn get_task(&self, id: Uuid) -> Result<Task, Error> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| TaskError::NotFound { id }.into())
    }

    /// Transition a pending task to in-progress and persist.
    pub async fn mark_in_progress(&self, task: &mut Task) -> Result<(), Error> {
        task.start()?;
        self.persist(task).await
    }

    /// Mark a task completed with its result text and persist.
    pub async fn complete(&self, task: &mut Task, result: impl Into<String>) -> Result<(), Error> {
        task.complete(result)?;
        self.persist(task).await
    }

    /// Mark a task failed with a diagnostic and persist.
    pub async fn fail(&self, task: &mut Task, reason: impl Into<String>) -> Result<(), Error> {
        task.fail(reason)?;
        self.persist(task).await
    }

    /// Per-status counts for a group.
    pub async fn stats(&self, group: &str) -> Result<HashMap<TaskStatus, u64>, Error> {
        Ok(self.store.stats_by_group(group).await?)
    }

    /// In-progress tasks that have not been touched within `threshold`.
    pub async fn stuck_tasks(&self, threshold: Duration) -> Result<Vec<Task>, Error> {
        Ok(self.store.find_stuck_in_progress(threshold).await?)
    }

    async fn persist(&self, task: &mut Task) -> Result<(), Error> {
        task.version = self.store.save(task, task.version).await?;
        info!(
            task_id = %task.id,
            status = %task.status,
            has_result = task.result.is_some(),
            "Task status updated"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use crate::store::MemoryStore;

    fn queue() -> TaskQueue {
        let (tx, _rx) = events::channel();
        TaskQueue::new(Arc::new(MemoryStore::new()), tx)
    }

    #[tokio::test]
    async fn push_then_claim_roundtrip() {
        let queue = queue();
        queue.push("g", "d", TaskPriority::High).await.unwrap();

        let task = queue.claim(None).await.unwrap().unwrap();
        assert_eq!(task.group, "g");
        assert_eq!(task.description, "d");
        assert_eq!(task.priority, TaskPriority::High);
        assert_eq!(task.status, TaskStatus::InProgress);
        assert!(task.executed_at.is_some());
        assert_eq!(task.version, 2);
    }

    #[tokio::test]
    async fn push_emits_created_event() {
        let queue = queue();
        let mut rx = queue.subscribe();
        queue.push("g", "d", TaskPriority::Normal).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "created");
        assert_eq!(event.task().group, "g");
    }

    #[tokio::test]
    async fn claim_empty_queue_returns_none() {
        let queue = queue();
        assert!(queue.claim(None).await.unwrap().is_none());
        assert!(queue.claim(Some("g")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_excludes_busy_group() {
        let queue = queue();
        queue.push("g", "first", TaskPriority::Normal).await.unwrap();
        queue.push("g", "second", TaskPriority::Normal).await.unwrap();
        queue.push("other", "third", TaskPriority::Low).await.unwrap();

        let first = queue.claim(None).await.unwrap().unwrap();
        assert_eq!(first.description, "first");

        // "g" now has an in-flight task; only "other" is claimable.
        let next = queue.claim(None).await.unwrap().unwrap();
        assert_eq!(next.group, "other");

        assert!(queue.claim(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_age() {
        let queue = queue();
        queue.push("a", "low", TaskPriority::Low).await.unwrap();
        queue.push("b", "normal-old", TaskPriority::Normal).await.unwrap();
        queue.push("c", "normal-new", TaskPriority::Normal).await.unwrap();
        queue.push("d", "high", TaskPriority::High).await.unwrap();

        let order: Vec<String> = [
            queue.claim(None).await.unwrap().unwrap(),
            queue.claim(None).await.unwrap().unwrap(),
            queue.claim(None).await.unwrap().unwrap(),
            queue.claim(None).await.unwrap().unwrap(),
        ]
        .iter()
        .map(|t| t.description.clone())
        .collect();

        assert_eq!(order, vec!["high", "normal-old", "normal-new", "low"]);
    }

    #[tokio::test]
    async fn claim_with_group_filter() {
        let queue = queue();
        queue.push("alpha", "a", TaskPriority::High).await.unwrap();
        queue.push("beta", "b", TaskPriority::Low).await.unwrap();

        let task = queue.claim(Some("beta")).await.unwrap().unwrap();
        assert_eq!(task.group, "beta");

        assert!(queue.claim(Some("missing")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_claims_single_candidate() {
        let queue = Arc::new(queue());
        queue.push("g", "only", TaskPriority::Normal).await.unwrap();

        let (a, b) = tokio::join!(queue.claim(None), queue.claim(None));
        let a = a.unwrap();
        let b = b.unwrap();

        // Exactly one side wins; the loser re-selects and finds the group
        // busy (or nothing pending) rather than double-claiming.
        assert!(
            a.is_some() ^ b.is_some(),
            "expected exactly one successful claim, got {a:?} and {b:?}"
        );
    }

    #[tokio::test]
    async fn get_task_not_found() {
        let queue = queue();
        let err = queue.get_task(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::Task(TaskError::NotFound { .. })));
    }

    #[tokio::test]
    async fn complete_persists_result_and_version() {
        let queue = queue();
        queue.push("g", "d", TaskPriority::Normal).await.unwrap();
        let mut task = queue.claim(None).await.unwrap().unwrap();

        queue.complete(&mut task, "answer").await.unwrap();
        assert_eq!(task.version, 3);

        let stored = queue.get_task(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.result.as_deref(), Some("answer"));
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn fail_persists_reason() {
        let queue = queue();
        queue.push("g", "d", TaskPriority::Normal).await.unwrap();
        let mut task = queue.claim(None).await.unwrap().unwrap();

        queue.fail(&mut task, "exit code 1").await.unwrap();

        let stored = queue.get_task(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.result.as_deref(), Some("exit code 1"));
        assert!(stored.completed_at.is_none());
    }

    #[tokio::test]
    async fn stats_roundtrip() {
        let queue = queue();
        queue.push("g", "a", TaskPriority::Normal).await.unwrap();
        queue.push("g", "b", TaskPriority::Normal).await.unwrap();
        let mut task = queue.claim(None).await.unwrap().unwrap();
        queue.complete(&mut task, "done").await.unwrap();

        let stats = queue.stats("g").await.unwrap();
        assert_eq!(stats[&TaskStatus::Pending], 1);
        assert_eq!(stats[&TaskStatus::Completed], 1);
        assert_eq!(stats[&TaskStatus::InProgress], 0);
    }
}
