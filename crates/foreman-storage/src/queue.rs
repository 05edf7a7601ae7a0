//! Durable failed-task queue and alert window state.

use std::sync::Arc;

use rusqlite::OptionalExtension;
use serde::Serialize;
use tracing::{debug, info};

use foreman_core::error::ForemanError;
use foreman_core::types::{AlertWindowState, FailedTaskRecord, FailedTaskStatus, Timestamp};

use crate::db::{storage_err, Database};

const TASK_COLUMNS: &str = "task_id, source, error, retry_count, max_attempts, next_retry_at, \
     status, context, created_at, updated_at";

/// Record counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub retrying: usize,
    pub failed: usize,
    pub resolved: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.pending + self.retrying + self.failed + self.resolved
    }

    /// Records that may still be retried.
    pub fn active(&self) -> usize {
        self.pending + self.retrying
    }
}

/// Persistent queue of failing tasks, keyed by task id.
pub struct FailedTaskQueue {
    db: Arc<Database>,
}

impl FailedTaskQueue {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn get(&self, task_id: &str) -> Result<Option<FailedTaskRecord>, ForemanError> {
        self.db.with_conn(|conn| {
            let result = conn
                .query_row(
                    &format!("SELECT {} FROM failed_tasks WHERE task_id = ?1", TASK_COLUMNS),
                    [task_id],
                    |row| Ok(row_to_record(row)),
                )
                .optional()
                .map_err(storage_err)?;
            match result {
                Some(record) => Ok(Some(record?)),
                None => Ok(None),
            }
        })
    }

    /// Insert or replace the record for `record.task_id`.
    pub fn upsert(&self, record: &FailedTaskRecord) -> Result<(), ForemanError> {
        let context = serde_json::to_string(&record.context)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO failed_tasks (task_id, source, error, retry_count, max_attempts,
                        next_retry_at, status, context, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(task_id) DO UPDATE SET
                    source = excluded.source,
                    error = excluded.error,
                    retry_count = excluded.retry_count,
                    max_attempts = excluded.max_attempts,
                    next_retry_at = excluded.next_retry_at,
                    status = excluded.status,
                    context = excluded.context,
                    updated_at = excluded.updated_at",
                rusqlite::params![
                    record.task_id,
                    record.source,
                    record.error,
                    i64::from(record.retry_count),
                    i64::from(record.max_attempts),
                    record.next_retry_at.0,
                    record.status.as_str(),
                    context,
                    record.created_at.0,
                    record.updated_at.0,
                ],
            )
            .map_err(|e| ForemanError::Storage(format!("Failed to upsert failed task: {}", e)))?;
            debug!(task_id = %record.task_id, status = %record.status, "Failed task recorded");
            Ok(())
        })
    }

    /// Non-terminal records whose retry time has arrived, earliest first.
    pub fn due(&self, now: Timestamp) -> Result<Vec<FailedTaskRecord>, ForemanError> {
        self.query(
            &format!(
                "SELECT {} FROM failed_tasks
                 WHERE status IN ('pending', 'retrying') AND next_retry_at <= ?1
                 ORDER BY next_retry_at ASC, task_id ASC",
                TASK_COLUMNS
            ),
            rusqlite::params![now.0],
        )
    }

    /// All records, or only those with `status`.
    pub fn list(
        &self,
        status: Option<FailedTaskStatus>,
    ) -> Result<Vec<FailedTaskRecord>, ForemanError> {
        match status {
            Some(status) => self.query(
                &format!(
                    "SELECT {} FROM failed_tasks WHERE status = ?1 ORDER BY created_at ASC, task_id ASC",
                    TASK_COLUMNS
                ),
                rusqlite::params![status.as_str()],
            ),
            None => self.query(
                &format!(
                    "SELECT {} FROM failed_tasks ORDER BY created_at ASC, task_id ASC",
                    TASK_COLUMNS
                ),
                rusqlite::params![],
            ),
        }
    }

    /// Mark every record whose task id starts with `prefix` as resolved.
    /// Returns how many records changed.
    pub fn resolve_by_prefix(&self, prefix: &str, now: Timestamp) -> Result<usize, ForemanError> {
        self.db.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE failed_tasks SET status = 'resolved', updated_at = ?2
                     WHERE substr(task_id, 1, length(?1)) = ?1 AND status != 'resolved'",
                    rusqlite::params![prefix, now.0],
                )
                .map_err(storage_err)?;
            if changed > 0 {
                info!(prefix, changed, "Failed tasks resolved");
            }
            Ok(changed)
        })
    }

    pub fn stats(&self) -> Result<QueueStats, ForemanError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM failed_tasks GROUP BY status")
                .map_err(storage_err)?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .map_err(storage_err)?;

            let mut stats = QueueStats::default();
            for row in rows {
                let (status, count) = row.map_err(storage_err)?;
                let count = count as usize;
                match status.parse::<FailedTaskStatus>().map_err(ForemanError::Storage)? {
                    FailedTaskStatus::Pending => stats.pending = count,
                    FailedTaskStatus::Retrying => stats.retrying = count,
                    FailedTaskStatus::Failed => stats.failed = count,
                    FailedTaskStatus::Resolved => stats.resolved = count,
                }
            }
            Ok(stats)
        })
    }

    /// Delete terminal records last updated before `older_than`.
    pub fn cleanup(&self, older_than: Timestamp) -> Result<usize, ForemanError> {
        self.db.with_conn(|conn| {
            let removed = conn
                .execute(
                    "DELETE FROM failed_tasks
                     WHERE status IN ('resolved', 'failed') AND updated_at < ?1",
                    [older_than.0],
                )
                .map_err(storage_err)?;
            if removed > 0 {
                info!(removed, "Old failed-task records cleaned up");
            }
            Ok(removed)
        })
    }

    fn query(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<FailedTaskRecord>, ForemanError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql).map_err(storage_err)?;
            let rows = stmt
                .query_map(params, |row| Ok(row_to_record(row)))
                .map_err(storage_err)?;

            let mut records = Vec::new();
            for row in rows {
                records.push(row.map_err(storage_err)??);
            }
            Ok(records)
        })
    }
}

/// Persistent alert throttling windows, one per error source.
pub struct AlertWindows {
    db: Arc<Database>,
}

impl AlertWindows {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn get(&self, source: &str) -> Result<Option<AlertWindowState>, ForemanError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT source, error_count, window_start, last_alert_fired
                 FROM alert_windows WHERE source = ?1",
                [source],
                |row| {
                    Ok(AlertWindowState {
                        source: row.get(0)?,
                        error_count: row.get::<_, i64>(1)?.max(0) as u32,
                        window_start: Timestamp(row.get(2)?),
                        last_alert_fired: row.get::<_, Option<i64>>(3)?.map(Timestamp),
                    })
                },
            )
            .optional()
            .map_err(storage_err)
        })
    }

    pub fn put(&self, state: &AlertWindowState) -> Result<(), ForemanError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO alert_windows (source, error_count, window_start, last_alert_fired)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(source) DO UPDATE SET
                    error_count = excluded.error_count,
                    window_start = excluded.window_start,
                    last_alert_fired = excluded.last_alert_fired",
                rusqlite::params![
                    state.source,
                    i64::from(state.error_count),
                    state.window_start.0,
                    state.last_alert_fired.map(|t| t.0),
                ],
            )
            .map_err(storage_err)?;
            Ok(())
        })
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<FailedTaskRecord, ForemanError> {
    let retry_count: i64 = row.get(3).map_err(storage_err)?;
    let max_attempts: i64 = row.get(4).map_err(storage_err)?;
    let status: String = row.get(6).map_err(storage_err)?;
    let context: String = row.get(7).map_err(storage_err)?;

    Ok(FailedTaskRecord {
        task_id: row.get(0).map_err(storage_err)?,
        source: row.get(1).map_err(storage_err)?,
        error: row.get(2).map_err(storage_err)?,
        retry_count: retry_count.max(0) as u32,
        max_attempts: max_attempts.max(0) as u32,
        next_retry_at: Timestamp(row.get(5).map_err(storage_err)?),
        status: status.parse().map_err(ForemanError::Storage)?,
        context: serde_json::from_str(&context)?,
        created_at: Timestamp(row.get(8).map_err(storage_err)?),
        updated_at: Timestamp(row.get(9).map_err(storage_err)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: Timestamp = Timestamp(1_700_000_000);

    fn queue() -> FailedTaskQueue {
        FailedTaskQueue::new(Arc::new(Database::in_memory().unwrap()))
    }

    fn record(task_id: &str, status: FailedTaskStatus, next: Timestamp) -> FailedTaskRecord {
        FailedTaskRecord {
            task_id: task_id.to_string(),
            source: "capability.review".into(),
            error: "timeout".into(),
            retry_count: 1,
            max_attempts: 3,
            next_retry_at: next,
            status,
            context: serde_json::Map::new(),
            created_at: T0,
            updated_at: T0,
        }
    }

    #[test]
    fn test_upsert_and_get() {
        let q = queue();
        let mut rec = record("a::step-1", FailedTaskStatus::Pending, T0);
        rec.context
            .insert("item_id".into(), serde_json::Value::String("inbox/a".into()));
        q.upsert(&rec).unwrap();
        assert_eq!(q.get("a::step-1").unwrap(), Some(rec.clone()));

        rec.retry_count = 2;
        rec.status = FailedTaskStatus::Retrying;
        q.upsert(&rec).unwrap();
        let stored = q.get("a::step-1").unwrap().unwrap();
        assert_eq!(stored.retry_count, 2);
        assert_eq!(q.list(None).unwrap().len(), 1);
    }

    #[test]
    fn test_due_excludes_future_and_terminal() {
        let q = queue();
        q.upsert(&record("due", FailedTaskStatus::Pending, T0)).unwrap();
        q.upsert(&record("later", FailedTaskStatus::Retrying, T0.plus_secs(60)))
            .unwrap();
        q.upsert(&record("dead", FailedTaskStatus::Failed, T0)).unwrap();
        q.upsert(&record("done", FailedTaskStatus::Resolved, T0)).unwrap();

        let due: Vec<String> = q.due(T0).unwrap().into_iter().map(|r| r.task_id).collect();
        assert_eq!(due, vec!["due".to_string()]);
        assert_eq!(q.due(T0.plus_secs(60)).unwrap().len(), 2);
    }

    #[test]
    fn test_resolve_by_prefix_is_literal() {
        let q = queue();
        q.upsert(&record("inbox/a_b::step-1", FailedTaskStatus::Pending, T0))
            .unwrap();
        q.upsert(&record("inbox/a_b::step-2", FailedTaskStatus::Failed, T0))
            .unwrap();
        q.upsert(&record("inbox/axb::step-1", FailedTaskStatus::Pending, T0))
            .unwrap();

        let changed = q.resolve_by_prefix("inbox/a_b::", T0).unwrap();
        assert_eq!(changed, 2);
        assert_eq!(
            q.get("inbox/axb::step-1").unwrap().unwrap().status,
            FailedTaskStatus::Pending
        );
    }

    #[test]
    fn test_stats_and_cleanup() {
        let q = queue();
        q.upsert(&record("p", FailedTaskStatus::Pending, T0)).unwrap();
        q.upsert(&record("f", FailedTaskStatus::Failed, T0)).unwrap();
        q.upsert(&record("r", FailedTaskStatus::Resolved, T0)).unwrap();

        let stats = q.stats().unwrap();
        assert_eq!(stats.total(), 3);
        assert_eq!(stats.active(), 1);

        let removed = q.cleanup(T0.plus_secs(1)).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(q.list(None).unwrap().len(), 1);
        assert_eq!(q.list(Some(FailedTaskStatus::Pending)).unwrap().len(), 1);
    }

    #[test]
    fn test_alert_windows_round_trip() {
        let windows = AlertWindows::new(Arc::new(Database::in_memory().unwrap()));
        assert!(windows.get("capability.review").unwrap().is_none());

        let mut state = AlertWindowState::new("capability.review", T0);
        state.error_count = 2;
        windows.put(&state).unwrap();
        state.last_alert_fired = Some(T0.plus_secs(5));
        windows.put(&state).unwrap();

        assert_eq!(windows.get("capability.review").unwrap(), Some(state));
    }
}
