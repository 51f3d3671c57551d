//! libSQL backend — async `TaskStore` implementation.
//!
//! Supports local file and in-memory databases. Timestamps are stored as
//! RFC 3339 text; the optimistic-lock version is an INTEGER column checked
//! in the UPDATE's WHERE clause, so a stale write changes zero rows.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::migrations;
use crate::store::traits::TaskStore;
use crate::task::{Task, TaskPriority, TaskStatus};

const TASK_COLUMNS: &str =
    "id, group_name, description, status, priority, created_at, updated_at, executed_at, completed_at, result, version";

/// Priority ordering expression shared by the candidate queries.
const PRIORITY_ORDER: &str =
    "CASE priority WHEN 'high' THEN 3 WHEN 'normal' THEN 2 WHEN 'low' THEN 1 ELSE 0 END DESC, created_at ASC";

/// libSQL task store.
pub struct LibSqlStore {
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("create database directory: {e}")))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("open database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("connect: {e}")))?;

        migrations::run_migrations(&conn).await?;
        info!(path = %path.display(), "Task store opened");
        Ok(Self { conn })
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("open in-memory database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("connect: {e}")))?;

        migrations::run_migrations(&conn).await?;
        Ok(Self { conn })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Row mapping helpers ─────────────────────────────────────────────

/// Parse an RFC 3339 timestamp column.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_datetime(&s))
}

fn status_to_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::InProgress => "in_progress",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
    }
}

fn str_to_status(s: &str) -> TaskStatus {
    match s {
        "in_progress" => TaskStatus::InProgress,
        "completed" => TaskStatus::Completed,
        "failed" => TaskStatus::Failed,
        _ => TaskStatus::Pending,
    }
}

fn priority_to_str(priority: TaskPriority) -> &'static str {
    match priority {
        TaskPriority::Low => "low",
        TaskPriority::Normal => "normal",
        TaskPriority::High => "high",
    }
}

fn str_to_priority(s: &str) -> TaskPriority {
    match s {
        "low" => TaskPriority::Low,
        "high" => TaskPriority::High,
        _ => TaskPriority::Normal,
    }
}

/// Map a row (in `TASK_COLUMNS` order) to a `Task`.
fn row_to_task(row: &libsql::Row) -> Result<Task, StoreError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| StoreError::Query(format!("id column: {e}")))?;
    let status_str: String = row
        .get(3)
        .map_err(|e| StoreError::Query(format!("status column: {e}")))?;
    let priority_str: String = row
        .get(4)
        .map_err(|e| StoreError::Query(format!("priority column: {e}")))?;
    let created_str: String = row
        .get(5)
        .map_err(|e| StoreError::Query(format!("created_at column: {e}")))?;

    Ok(Task {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| StoreError::Serialization(format!("task id: {e}")))?,
        group: row
            .get(1)
            .map_err(|e| StoreError::Query(format!("group_name column: {e}")))?,
        description: row
            .get(2)
            .map_err(|e| StoreError::Query(format!("description column: {e}")))?,
        status: str_to_status(&status_str),
        priority: str_to_priority(&priority_str),
        created_at: parse_datetime(&created_str),
        updated_at: parse_optional_datetime(row.get(6).ok()),
        executed_at: parse_optional_datetime(row.get(7).ok()),
        completed_at: parse_optional_datetime(row.get(8).ok()),
        result: row.get(9).ok(),
        version: row
            .get(10)
            .map_err(|e| StoreError::Query(format!("version column: {e}")))?,
    })
}

/// Convert an optional timestamp to a libsql value.
fn opt_datetime(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(dt.to_rfc3339()),
        None => libsql::Value::Null,
    }
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl TaskStore for LibSqlStore {
    async fn insert(&self, task: &Task) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO tasks (id, group_name, description, status, priority, created_at, updated_at, executed_at, completed_at, result, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    task.id.to_string(),
                    task.group.as_str(),
                    task.description.as_str(),
                    status_to_str(task.status),
                    priority_to_str(task.priority),
                    task.created_at.to_rfc3339(),
                    opt_datetime(task.updated_at),
                    opt_datetime(task.executed_at),
                    opt_datetime(task.completed_at),
                    opt_text(task.result.as_deref()),
                    task.version,
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("insert task: {e}")))?;
        debug!(task_id = %task.id, group = %task.group, "Task inserted");
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("find task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("find task row: {e}"))),
        }
    }

    async fn save(&self, task: &Task, expected_version: i64) -> Result<i64, StoreError> {
        let new_version = expected_version + 1;
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET group_name = ?1, description = ?2, status = ?3, priority = ?4,
                        updated_at = ?5, executed_at = ?6, completed_at = ?7, result = ?8, version = ?9
                 WHERE id = ?10 AND version = ?11",
                params![
                    task.group.as_str(),
                    task.description.as_str(),
                    status_to_str(task.status),
                    priority_to_str(task.priority),
                    opt_datetime(task.updated_at),
                    opt_datetime(task.executed_at),
                    opt_datetime(task.completed_at),
                    opt_text(task.result.as_deref()),
                    new_version,
                    task.id.to_string(),
                    expected_version,
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("save task: {e}")))?;

        if affected == 0 {
            // Distinguish a stale version from a missing row.
            return match self.find_by_id(task.id).await? {
                Some(current) => Err(StoreError::VersionConflict {
                    id: task.id,
                    expected: expected_version,
                    actual: current.version,
                }),
                None => Err(StoreError::Missing { id: task.id }),
            };
        }

        Ok(new_version)
    }

    async fn groups_with_in_progress(&self) -> Result<Vec<String>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT DISTINCT group_name FROM tasks WHERE status = 'in_progress' ORDER BY group_name",
                (),
            )
            .await
            .map_err(|e| StoreError::Query(format!("busy groups: {e}")))?;

        let mut groups = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            groups.push(
                row.get(0)
                    .map_err(|e| StoreError::Query(format!("busy groups row: {e}")))?,
            );
        }
        Ok(groups)
    }

    async fn find_next_pending(
        &self,
        group: Option<&str>,
        exclude_groups: &[String],
    ) -> Result<Option<Task>, StoreError> {
        let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'pending'");
        let mut args: Vec<libsql::Value> = Vec::new();

        if let Some(group) = group {
            sql.push_str(&format!(" AND group_name = ?{}", args.len() + 1));
            args.push(libsql::Value::Text(group.to_string()));
        }

        if !exclude_groups.is_empty() {
            let placeholders: Vec<String> = exclude_groups
                .iter()
                .enumerate()
                .map(|(i, _)| format!("?{}", args.len() + i + 1))
                .collect();
            sql.push_str(&format!(" AND group_name NOT IN ({})", placeholders.join(", ")));
            args.extend(
                exclude_groups
                    .iter()
                    .map(|g| libsql::Value::Text(g.clone())),
            );
        }

        sql.push_str(&format!(" ORDER BY {PRIORITY_ORDER} LIMIT 1"));

        let mut rows = self
            .conn()
            .query(&sql, libsql::params_from_iter(args))
            .await
            .map_err(|e| StoreError::Query(format!("next pending: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("next pending row: {e}"))),
        }
    }

    async fn list_by_group_and_status(
        &self,
        group: &str,
        status: TaskStatus,
    ) -> Result<Vec<Task>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE group_name = ?1 AND status = ?2 ORDER BY {PRIORITY_ORDER}"
                ),
                params![group, status_to_str(status)],
            )
            .await
            .map_err(|e| StoreError::Query(format!("list by status: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn stats_by_group(&self, group: &str) -> Result<HashMap<TaskStatus, u64>, StoreError> {
        let mut stats: HashMap<TaskStatus, u64> = HashMap::from([
            (TaskStatus::Pending, 0),
            (TaskStatus::InProgress, 0),
            (TaskStatus::Completed, 0),
            (TaskStatus::Failed, 0),
        ]);

        let mut rows = self
            .conn()
            .query(
                "SELECT status, COUNT(*) FROM tasks WHERE group_name = ?1 GROUP BY status",
                params![group],
            )
            .await
            .map_err(|e| StoreError::Query(format!("stats: {e}")))?;

        while let Ok(Some(row)) = rows.next().await {
            let status_str: String = row
                .get(0)
                .map_err(|e| StoreError::Query(format!("stats status: {e}")))?;
            let count: i64 = row
                .get(1)
                .map_err(|e| StoreError::Query(format!("stats count: {e}")))?;
            stats.insert(str_to_status(&status_str), count.max(0) as u64);
        }
        Ok(stats)
    }

    async fn find_stuck_in_progress(&self, threshold: Duration) -> Result<Vec<Task>, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(threshold)
                .map_err(|e| StoreError::Query(format!("threshold out of range: {e}")))?;

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE status = 'in_progress' AND COALESCE(updated_at, created_at) < ?1
                     ORDER BY created_at ASC"
                ),
                params![cutoff.to_rfc3339()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("stuck tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }
}
