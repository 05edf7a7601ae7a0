//! Database schema migrations.
//!
//! Version 1 creates the item index, per-stage entries, the append-only
//! move log, plans, the failed-task queue, alert windows, and the job ledger.
//! Version 2 records which checklist entries each plan step covers.

use rusqlite::Connection;
use tracing::info;

use foreman_core::error::ForemanError;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), ForemanError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| ForemanError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| ForemanError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: initial_schema");
    }
    if current_version < 2 {
        apply_v2(conn)?;
        info!("Applied migration v2: plan_step_entries");
    }

    Ok(())
}

/// Version 1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<(), ForemanError> {
    conn.execute_batch(
        "
        -- One row per item identity; the current view of the item.
        CREATE TABLE IF NOT EXISTS items (
            id                      TEXT PRIMARY KEY NOT NULL,
            origin                  TEXT NOT NULL,
            stage                   TEXT NOT NULL
                                    CHECK (stage IN ('received', 'working', 'archived')),
            entry_name              TEXT NOT NULL,
            title                   TEXT NOT NULL,
            body                    TEXT NOT NULL,
            triage_rule             INTEGER,
            status                  TEXT NOT NULL DEFAULT 'open',
            failure_count           INTEGER NOT NULL DEFAULT 0,
            blocked_reason          TEXT,
            approval_requested_at   INTEGER,
            notes                   TEXT NOT NULL DEFAULT '[]',
            created_at              INTEGER NOT NULL,
            updated_at              INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_items_stage
            ON items (stage, created_at ASC);

        -- Named entries per stage. Entries are never deleted or overwritten;
        -- the origin of a move is only flagged as superseded.
        CREATE TABLE IF NOT EXISTS stage_entries (
            stage       TEXT NOT NULL,
            entry_name  TEXT NOT NULL,
            item_id     TEXT NOT NULL REFERENCES items(id),
            content     TEXT NOT NULL,
            superseded  INTEGER NOT NULL DEFAULT 0,
            written_at  INTEGER NOT NULL,
            PRIMARY KEY (stage, entry_name)
        );

        CREATE INDEX IF NOT EXISTS idx_stage_entries_item
            ON stage_entries (item_id, stage);

        -- Append-only change log of every receive and move.
        CREATE TABLE IF NOT EXISTS item_log (
            seq         INTEGER PRIMARY KEY AUTOINCREMENT,
            item_id     TEXT NOT NULL REFERENCES items(id),
            from_stage  TEXT,
            to_stage    TEXT NOT NULL,
            entry_name  TEXT NOT NULL,
            recorded_at INTEGER NOT NULL
        );

        CREATE TRIGGER IF NOT EXISTS item_log_no_update
            BEFORE UPDATE ON item_log
            BEGIN SELECT RAISE(ABORT, 'item_log is append-only'); END;

        CREATE TRIGGER IF NOT EXISTS item_log_no_delete
            BEFORE DELETE ON item_log
            BEGIN SELECT RAISE(ABORT, 'item_log is append-only'); END;

        CREATE TRIGGER IF NOT EXISTS items_no_delete
            BEFORE DELETE ON items
            BEGIN SELECT RAISE(ABORT, 'items are never deleted'); END;

        CREATE TRIGGER IF NOT EXISTS stage_entries_no_delete
            BEFORE DELETE ON stage_entries
            BEGIN SELECT RAISE(ABORT, 'stage entries are never deleted'); END;

        -- At most one plan per item, stored as its plan document.
        CREATE TABLE IF NOT EXISTS plans (
            item_id         TEXT PRIMARY KEY NOT NULL REFERENCES items(id),
            original_task   TEXT NOT NULL,
            document        TEXT NOT NULL,
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL
        );

        -- Durable retry queue.
        CREATE TABLE IF NOT EXISTS failed_tasks (
            task_id         TEXT PRIMARY KEY NOT NULL,
            source          TEXT NOT NULL,
            error           TEXT NOT NULL,
            retry_count     INTEGER NOT NULL DEFAULT 0,
            max_attempts    INTEGER NOT NULL,
            next_retry_at   INTEGER NOT NULL,
            status          TEXT NOT NULL
                            CHECK (status IN ('pending', 'retrying', 'failed', 'resolved')),
            context         TEXT NOT NULL DEFAULT '{}',
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_failed_tasks_due
            ON failed_tasks (status, next_retry_at ASC);

        -- Per-source alert throttling state.
        CREATE TABLE IF NOT EXISTS alert_windows (
            source              TEXT PRIMARY KEY NOT NULL,
            error_count         INTEGER NOT NULL,
            window_start        INTEGER NOT NULL,
            last_alert_fired    INTEGER
        );

        -- Last run of each scheduled job.
        CREATE TABLE IF NOT EXISTS job_runs (
            job         TEXT PRIMARY KEY NOT NULL,
            last_run    INTEGER NOT NULL
        );

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (1, 'initial_schema');
        ",
    )
    .map_err(|e| ForemanError::Storage(format!("Failed to apply migration v1: {}", e)))?;

    Ok(())
}

/// Version 2: checklist positions per plan step, as a JSON array of arrays.
fn apply_v2(conn: &Connection) -> Result<(), ForemanError> {
    conn.execute_batch(
        "
        ALTER TABLE plans ADD COLUMN step_entries TEXT NOT NULL DEFAULT '[]';

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (2, 'plan_step_entries');
        ",
    )
    .map_err(|e| ForemanError::Storage(format!("Failed to apply migration v2: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        conn
    }

    fn insert_item(conn: &Connection, id: &str) {
        conn.execute(
            "INSERT INTO items (id, origin, stage, entry_name, title, body, created_at, updated_at)
             VALUES (?1, 'inbox', 'received', 'a.md', 'A', 'body', 1, 1)",
            [id],
        )
        .unwrap();
    }

    #[test]
    fn test_migrations_run_once() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, 2);
    }

    #[test]
    fn test_items_cannot_be_deleted() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();
        insert_item(&conn, "inbox/a.md");

        let err = conn
            .execute("DELETE FROM items WHERE id = 'inbox/a.md'", [])
            .unwrap_err();
        assert!(err.to_string().contains("never deleted"));
    }

    #[test]
    fn test_item_log_is_append_only() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();
        insert_item(&conn, "inbox/a.md");
        conn.execute(
            "INSERT INTO item_log (item_id, to_stage, entry_name, recorded_at)
             VALUES ('inbox/a.md', 'received', 'a.md', 1)",
            [],
        )
        .unwrap();

        assert!(conn.execute("UPDATE item_log SET to_stage = 'working'", []).is_err());
        assert!(conn.execute("DELETE FROM item_log", []).is_err());
    }

    #[test]
    fn test_stage_entry_names_unique_per_stage() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();
        insert_item(&conn, "inbox/a.md");

        let insert = "INSERT INTO stage_entries (stage, entry_name, item_id, content, written_at)
                      VALUES (?1, 'a.md', 'inbox/a.md', 'x', 1)";
        conn.execute(insert, ["working"]).unwrap();
        assert!(conn.execute(insert, ["working"]).is_err());
        conn.execute(insert, ["archived"]).unwrap();
    }

    #[test]
    fn test_failed_task_status_checked() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();
        let result = conn.execute(
            "INSERT INTO failed_tasks (task_id, source, error, max_attempts, next_retry_at, status, created_at, updated_at)
             VALUES ('t', 's', 'e', 3, 0, 'bogus', 0, 0)",
            [],
        );
        assert!(result.is_err());
    }
}
