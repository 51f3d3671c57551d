//! In-memory `TaskStore` backend for tests and ephemeral runs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::traits::TaskStore;
use crate::task::{Task, TaskStatus};

/// Map-backed store with the same optimistic-lock semantics as the
/// relational backend.
#[derive(Default)]
pub struct MemoryStore {
    tasks: RwLock<HashMap<Uuid, Task>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tasks.
    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Whether the store holds no tasks.
    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}

/// Queue order: priority weight descending, then creation time ascending.
fn queue_order(a: &Task, b: &Task) -> std::cmp::Ordering {
    b.priority
        .weight()
        .cmp(&a.priority.weight())
        .then(a.created_at.cmp(&b.created_at))
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert(&self, task: &Task) -> Result<(), StoreError> {
        self.tasks.write().await.insert(task.id, task.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn save(&self, task: &Task, expected_version: i64) -> Result<i64, StoreError> {
        let mut tasks = self.tasks.write().await;
        let stored = tasks
            .get_mut(&task.id)
            .ok_or(StoreError::Missing { id: task.id })?;

        if stored.version != expected_version {
            return Err(StoreError::VersionConflict {
                id: task.id,
                expected: expected_version,
                actual: stored.version,
            });
        }

        let new_version = expected_version + 1;
        *stored = task.clone();
        stored.version = new_version;
        Ok(new_version)
    }

    async fn groups_with_in_progress(&self) -> Result<Vec<String>, StoreError> {
        let tasks = self.tasks.read().await;
        let mut groups: Vec<String> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::InProgress)
            .map(|t| t.group.clone())
            .collect();
        groups.sort();
        groups.dedup();
        Ok(groups)
    }

    async fn find_next_pending(
        &self,
        group: Option<&str>,
        exclude_groups: &[String],
    ) -> Result<Option<Task>, StoreError> {
        let tasks = self.tasks.read().await;
        let mut candidates: Vec<&Task> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| group.is_none_or(|g| t.group == g))
            .filter(|t| !exclude_groups.contains(&t.group))
            .collect();
        candidates.sort_by(|a, b| queue_order(a, b));
        Ok(candidates.first().map(|t| (*t).clone()))
    }

    async fn list_by_group_and_status(
        &self,
        group: &str,
        status: TaskStatus,
    ) -> Result<Vec<Task>, StoreError> {
        let tasks = self.tasks.read().await;
        let mut found: Vec<Task> = tasks
            .values()
            .filter(|t| t.group == group && t.status == status)
            .cloned()
            .collect();
        found.sort_by(queue_order);
        Ok(found)
    }

    async fn stats_by_group(&self, group: &str) -> Result<HashMap<TaskStatus, u64>, StoreError> {
        let tasks = self.tasks.read().await;
        let mut stats: HashMap<TaskStatus, u64> = HashMap::from([
            (TaskStatus::Pending, 0),
            (TaskStatus::InProgress, 0),
            (TaskStatus::Completed, 0),
            (TaskStatus::Failed, 0),
        ]);
        for task in tasks.values().filter(|t| t.group == group) {
            *stats.entry(task.status).or_insert(0) += 1;
        }
        Ok(stats)
    }

    async fn find_stuck_in_progress(&self, threshold: Duration) -> Result<Vec<Task>, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(threshold)
                .map_err(|e| StoreError::Query(format!("threshold out of range: {e}")))?;

        let tasks = self.tasks.read().await;
        let mut stuck: Vec<Task> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::InProgress)
            .filter(|t| t.updated_at.unwrap_or(t.created_at) < cutoff)
            .cloned()
            .collect();
        stuck.sort_by_key(|t| t.created_at);
        Ok(stuck)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskPriority;

    async fn insert_pending(store: &MemoryStore, group: &str, priority: TaskPriority) -> Task {
        let task = Task::new(group, "work").with_priority(priority);
        store.insert(&task).await.unwrap();
        task
    }

    #[tokio::test]
    async fn insert_and_find() {
        let store = MemoryStore::new();
        let task = insert_pending(&store, "g", TaskPriority::Normal).await;

        let found = store.find_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(found.id, task.id);
        assert!(store.find_by_id(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_bumps_version() {
        let store = MemoryStore::new();
        let mut task = insert_pending(&store, "g", TaskPriority::Normal).await;

        task.start().unwrap();
        let v = store.save(&task, task.version).await.unwrap();
        assert_eq!(v, 2);

        let stored = store.find_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn save_stale_version_conflicts() {
        let store = MemoryStore::new();
        let mut task = insert_pending(&store, "g", TaskPriority::Normal).await;

        task.start().unwrap();
        store.save(&task, 1).await.unwrap();

        // A second writer holding the original snapshot must fail.
        let err = store.save(&task, 1).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict { expected: 1, actual: 2, .. }
        ));

        // The conflicting write must not have clobbered anything.
        let stored = store.find_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn save_missing_task() {
        let store = MemoryStore::new();
        let task = Task::new("g", "d");
        let err = store.save(&task, 1).await.unwrap_err();
        assert!(matches!(err, StoreError::Missing { .. }));
    }

    #[tokio::test]
    async fn next_pending_prefers_priority_then_age() {
        let store = MemoryStore::new();
        let _low = insert_pending(&store, "g", TaskPriority::Low).await;
        let normal_old = insert_pending(&store, "g", TaskPriority::Normal).await;
        let _normal_new = insert_pending(&store, "g", TaskPriority::Normal).await;
        let high = insert_pending(&store, "g", TaskPriority::High).await;

        let next = store.find_next_pending(None, &[]).await.unwrap().unwrap();
        assert_eq!(next.id, high.id);

        // Claim the high one out of the way; oldest normal comes next.
        let mut claimed = next;
        claimed.start().unwrap();
        store.save(&claimed, claimed.version).await.unwrap();

        let next = store
            .find_next_pending(None, &["g".to_string()])
            .await
            .unwrap();
        assert!(next.is_none(), "busy group must be excluded");

        let next = store.find_next_pending(None, &[]).await.unwrap().unwrap();
        assert_eq!(next.id, normal_old.id);
    }

    #[tokio::test]
    async fn next_pending_group_filter() {
        let store = MemoryStore::new();
        let _a = insert_pending(&store, "alpha", TaskPriority::High).await;
        let b = insert_pending(&store, "beta", TaskPriority::Low).await;

        let next = store
            .find_next_pending(Some("beta"), &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.id, b.id);

        assert!(store
            .find_next_pending(Some("gamma"), &[])
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn groups_with_in_progress_deduped() {
        let store = MemoryStore::new();
        for _ in 0..2 {
            let mut task = insert_pending(&store, "busy", TaskPriority::Normal).await;
            task.start().unwrap();
            store.save(&task, 1).await.unwrap();
        }
        insert_pending(&store, "idle", TaskPriority::Normal).await;

        let groups = store.groups_with_in_progress().await.unwrap();
        assert_eq!(groups, vec!["busy".to_string()]);
    }

    #[tokio::test]
    async fn stats_by_group_counts() {
        let store = MemoryStore::new();
        insert_pending(&store, "g", TaskPriority::Normal).await;
        let mut task = insert_pending(&store, "g", TaskPriority::Normal).await;
        task.start().unwrap();
        store.save(&task, 1).await.unwrap();
        insert_pending(&store, "other", TaskPriority::Normal).await;

        let stats = store.stats_by_group("g").await.unwrap();
        assert_eq!(stats[&TaskStatus::Pending], 1);
        assert_eq!(stats[&TaskStatus::InProgress], 1);
        assert_eq!(stats[&TaskStatus::Completed], 0);
        assert_eq!(stats[&TaskStatus::Failed], 0);
    }

    #[tokio::test]
    async fn stuck_in_progress_detection() {
        let store = MemoryStore::new();
        let mut task = insert_pending(&store, "g", TaskPriority::Normal).await;
        task.start().unwrap();
        store.save(&task, 1).await.unwrap();

        // Fresh in-progress task is not stuck against a 1-hour threshold.
        let stuck = store
            .find_stuck_in_progress(Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(stuck.is_empty());

        // With a zero threshold everything in-progress is stale.
        let stuck = store
            .find_stuck_in_progress(Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(stuck.len(), 1);
    }
}
