//! `TaskStore` trait — the repository interface over the relational store.
//!
//! All coordination between concurrent workers happens through the
//! version-checked [`TaskStore::save`]; the store is the single source of
//! truth and no in-process locks are shared across workers.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::task::{Task, TaskStatus};

/// Backend-agnostic task repository.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a newly created task.
    async fn insert(&self, task: &Task) -> Result<(), StoreError>;

    /// Look up a task by ID.
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Task>, StoreError>;

    /// Persist a task with an optimistic version check.
    ///
    /// Fails with [`StoreError::VersionConflict`] when the stored version
    /// no longer matches `expected_version`; a stale write never silently
    /// overwrites. Returns the new (incremented) version on success.
    async fn save(&self, task: &Task, expected_version: i64) -> Result<i64, StoreError>;

    /// Distinct group names that currently have an in-progress task.
    async fn groups_with_in_progress(&self) -> Result<Vec<String>, StoreError>;

    /// Best next pending candidate: optionally scoped to `group`, never in
    /// `exclude_groups`, ordered by priority descending then creation time
    /// ascending.
    async fn find_next_pending(
        &self,
        group: Option<&str>,
        exclude_groups: &[String],
    ) -> Result<Option<Task>, StoreError>;

    /// All tasks in a group with the given status, queue-ordered.
    async fn list_by_group_and_status(
        &self,
        group: &str,
        status: TaskStatus,
    ) -> Result<Vec<Task>, StoreError>;

    /// Per-status task counts for a group.
    async fn stats_by_group(&self, group: &str) -> Result<HashMap<TaskStatus, u64>, StoreError>;

    /// In-progress tasks whose last update is older than `threshold`.
    ///
    /// These are likely orphans from a crashed worker; they are reported,
    /// never auto-reset.
    async fn find_stuck_in_progress(&self, threshold: Duration) -> Result<Vec<Task>, StoreError>;
}
