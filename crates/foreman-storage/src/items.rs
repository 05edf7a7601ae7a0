//! Durable item store.
//!
//! Items are indexed by identity in `items`. Each stage holds named entries
//! in `stage_entries`, and every receive or move is appended to `item_log`.
//! A move writes the destination entry, flags the origin entry superseded,
//! and updates the index inside one transaction.

use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

use foreman_core::document::render_item_document;
use foreman_core::error::ForemanError;
use foreman_core::types::{ItemId, ItemStatus, NewItem, Stage, Timestamp, WorkItem};

use crate::db::{storage_err, Database};

const ITEM_COLUMNS: &str = "id, origin, stage, entry_name, title, body, triage_rule, status, \
     failure_count, blocked_reason, approval_requested_at, notes, created_at, updated_at";

/// Result of recording a new item.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiveOutcome {
    Recorded(WorkItem),
    /// The identity was already known; nothing was written.
    Duplicate(WorkItem),
}

impl ReceiveOutcome {
    pub fn item(&self) -> &WorkItem {
        match self {
            ReceiveOutcome::Recorded(item) | ReceiveOutcome::Duplicate(item) => item,
        }
    }
}

/// Result of a move.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveResult {
    pub item: WorkItem,
    /// True when the destination already held the item and the call only
    /// finished or confirmed an earlier move.
    pub replayed: bool,
}

/// A named entry in one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageEntry {
    pub stage: Stage,
    pub entry_name: String,
    pub item_id: ItemId,
    pub content: String,
    pub superseded: bool,
    pub written_at: Timestamp,
}

/// One row of the change log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveRecord {
    pub seq: i64,
    pub item_id: ItemId,
    pub from_stage: Option<Stage>,
    pub to_stage: Stage,
    pub entry_name: String,
    pub recorded_at: Timestamp,
}

/// Item counts per stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StageCounts {
    pub received: usize,
    pub working: usize,
    pub archived: usize,
}

impl StageCounts {
    pub fn total(&self) -> usize {
        self.received + self.working + self.archived
    }
}

/// Store that exclusively owns work item and plan persistence.
pub struct ItemStore {
    pub(crate) db: Arc<Database>,
}

impl ItemStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    // =========================================================================
    // Intake
    // =========================================================================

    /// Record a new item in the Received stage.
    ///
    /// A second notification for the same identity returns the existing
    /// record untouched.
    pub fn receive(&self, new: &NewItem, now: Timestamp) -> Result<ReceiveOutcome, ForemanError> {
        if new.name.trim().is_empty() {
            return Err(ForemanError::Validation("item name must not be empty".into()));
        }
        let id = new.id();

        self.db.with_tx(|tx| {
            if let Some(existing) = load_item(tx, &id)? {
                debug!(item_id = %id, "Duplicate item notification ignored");
                return Ok(ReceiveOutcome::Duplicate(existing));
            }

            let entry_name = unique_entry_name(tx, Stage::Received, new.name.trim())?;
            let item = WorkItem {
                id: id.clone(),
                origin: new.origin.trim().to_string(),
                stage: Stage::Received,
                entry_name: entry_name.clone(),
                title: new.title.clone(),
                body: new.body.clone(),
                triage_rule: None,
                status: ItemStatus::Open,
                failure_count: 0,
                blocked_reason: None,
                approval_requested_at: None,
                notes: Vec::new(),
                created_at: now,
                updated_at: now,
            };

            tx.execute(
                "INSERT INTO items (id, origin, stage, entry_name, title, body, status, notes, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, '[]', ?8, ?8)",
                rusqlite::params![
                    id.as_str(),
                    item.origin,
                    Stage::Received.as_str(),
                    entry_name,
                    item.title,
                    item.body,
                    item.status.as_str(),
                    now.0,
                ],
            )
            .map_err(|e| ForemanError::Storage(format!("Failed to record item: {}", e)))?;

            write_entry(tx, &item, now)?;
            append_log(tx, &id, None, Stage::Received, &entry_name, now)?;
            info!(item_id = %id, entry = %entry_name, "Item received");
            Ok(ReceiveOutcome::Recorded(item))
        })
    }

    // =========================================================================
    // Moves
    // =========================================================================

    /// Move an item forward from `from` to `to`.
    ///
    /// If the destination already holds a live entry for this item, the call
    /// completes the earlier move instead of writing a second copy. Name
    /// collisions at the destination get a `_2`, `_3`, ... suffix.
    pub fn move_item(
        &self,
        id: &ItemId,
        from: Stage,
        to: Stage,
        now: Timestamp,
    ) -> Result<MoveResult, ForemanError> {
        self.db.with_tx(|tx| {
            let item = load_item(tx, id)?
                .ok_or_else(|| ForemanError::NotFound(format!("item {}", id)))?;

            if let Some(entry) = live_entry(tx, id, to)? {
                // Destination already written: supersede every other live entry.
                tx.execute(
                    "UPDATE stage_entries SET superseded = 1
                     WHERE item_id = ?1 AND stage != ?2 AND superseded = 0",
                    rusqlite::params![id.as_str(), to.as_str()],
                )
                .map_err(storage_err)?;

                let mut current = item;
                if current.stage != to {
                    tx.execute(
                        "UPDATE items SET stage = ?2, entry_name = ?3, updated_at = ?4 WHERE id = ?1",
                        rusqlite::params![id.as_str(), to.as_str(), entry.entry_name, now.0],
                    )
                    .map_err(storage_err)?;
                    append_log(tx, id, Some(current.stage), to, &entry.entry_name, now)?;
                    current.stage = to;
                    current.entry_name = entry.entry_name;
                    current.updated_at = now;
                }
                info!(item_id = %id, stage = %to, "Move already complete; replayed");
                return Ok(MoveResult {
                    item: current,
                    replayed: true,
                });
            }

            if item.stage != from {
                return Err(ForemanError::Validation(format!(
                    "item {} is in stage {}, not {}",
                    id, item.stage, from
                )));
            }
            if !from.can_advance_to(to) {
                return Err(ForemanError::Validation(format!(
                    "invalid stage transition {} -> {}",
                    from, to
                )));
            }

            let base = item
                .id
                .source_name(&item.origin)
                .unwrap_or(&item.entry_name)
                .to_string();
            let entry_name = unique_entry_name(tx, to, &base)?;
            let moved = WorkItem {
                stage: to,
                entry_name: entry_name.clone(),
                updated_at: now,
                ..item
            };

            // Destination first, then the origin is flagged.
            write_entry(tx, &moved, now)?;
            tx.execute(
                "UPDATE stage_entries SET superseded = 1
                 WHERE item_id = ?1 AND stage = ?2 AND superseded = 0",
                rusqlite::params![id.as_str(), from.as_str()],
            )
            .map_err(storage_err)?;
            tx.execute(
                "UPDATE items SET stage = ?2, entry_name = ?3, updated_at = ?4 WHERE id = ?1",
                rusqlite::params![id.as_str(), to.as_str(), entry_name, now.0],
            )
            .map_err(storage_err)?;
            append_log(tx, id, Some(from), to, &entry_name, now)?;

            info!(item_id = %id, from = %from, to = %to, entry = %entry_name, "Item moved");
            Ok(MoveResult {
                item: moved,
                replayed: false,
            })
        })
    }

    // =========================================================================
    // Updates
    // =========================================================================

    /// Persist the mutable fields of `item` and refresh its live entry.
    ///
    /// Stage and identity never change here. The body may only change
    /// in place (same length or longer) and notes may only be appended.
    pub fn update_item(&self, item: &WorkItem, now: Timestamp) -> Result<WorkItem, ForemanError> {
        self.db.with_tx(|tx| {
            let stored = load_item(tx, &item.id)?
                .ok_or_else(|| ForemanError::NotFound(format!("item {}", item.id)))?;

            if stored.stage != item.stage || stored.entry_name != item.entry_name {
                return Err(ForemanError::Validation(format!(
                    "item {}: stage changes must go through move_item",
                    item.id
                )));
            }
            if item.body.len() < stored.body.len() {
                return Err(ForemanError::Validation(format!(
                    "item {}: body may not be truncated",
                    item.id
                )));
            }
            if !item.notes.starts_with(&stored.notes) {
                return Err(ForemanError::Validation(format!(
                    "item {}: notes are append-only",
                    item.id
                )));
            }

            let updated = WorkItem {
                updated_at: now,
                ..item.clone()
            };
            let notes = serde_json::to_string(&updated.notes)?;
            tx.execute(
                "UPDATE items SET body = ?2, triage_rule = ?3, status = ?4, failure_count = ?5,
                        blocked_reason = ?6, approval_requested_at = ?7, notes = ?8, updated_at = ?9
                 WHERE id = ?1",
                rusqlite::params![
                    updated.id.as_str(),
                    updated.body,
                    updated.triage_rule.map(i64::from),
                    updated.status.as_str(),
                    i64::from(updated.failure_count),
                    updated.blocked_reason,
                    updated.approval_requested_at.map(|t| t.0),
                    notes,
                    now.0,
                ],
            )
            .map_err(|e| ForemanError::Storage(format!("Failed to update item: {}", e)))?;

            tx.execute(
                "UPDATE stage_entries SET content = ?3
                 WHERE item_id = ?1 AND stage = ?2 AND superseded = 0",
                rusqlite::params![
                    updated.id.as_str(),
                    updated.stage.as_str(),
                    render_item_document(&updated)
                ],
            )
            .map_err(storage_err)?;

            Ok(updated)
        })
    }

    /// Append a note to an item.
    pub fn append_note(
        &self,
        id: &ItemId,
        note: &str,
        now: Timestamp,
    ) -> Result<WorkItem, ForemanError> {
        let mut item = self.require(id)?;
        item.notes.push(note.to_string());
        self.update_item(&item, now)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get(&self, id: &ItemId) -> Result<Option<WorkItem>, ForemanError> {
        self.db.with_conn(|conn| load_item(conn, id))
    }

    /// Like `get`, but a missing item is an error.
    pub fn require(&self, id: &ItemId) -> Result<WorkItem, ForemanError> {
        self.get(id)?
            .ok_or_else(|| ForemanError::NotFound(format!("item {}", id)))
    }

    pub fn exists(&self, id: &ItemId) -> Result<bool, ForemanError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT 1 FROM items WHERE id = ?1",
                [id.as_str()],
                |_| Ok(()),
            )
            .optional()
            .map(|r| r.is_some())
            .map_err(storage_err)
        })
    }

    /// Items currently in `stage`, oldest first.
    pub fn list_by_stage(&self, stage: Stage) -> Result<Vec<WorkItem>, ForemanError> {
        self.query_items(
            &format!(
                "SELECT {} FROM items WHERE stage = ?1 ORDER BY created_at ASC, id ASC",
                ITEM_COLUMNS
            ),
            stage.as_str(),
        )
    }

    /// Items with `status`, oldest first.
    pub fn list_by_status(&self, status: ItemStatus) -> Result<Vec<WorkItem>, ForemanError> {
        self.query_items(
            &format!(
                "SELECT {} FROM items WHERE status = ?1 ORDER BY created_at ASC, id ASC",
                ITEM_COLUMNS
            ),
            status.as_str(),
        )
    }

    pub fn stage_counts(&self) -> Result<StageCounts, ForemanError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT stage, COUNT(*) FROM items GROUP BY stage")
                .map_err(storage_err)?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .map_err(storage_err)?;

            let mut counts = StageCounts::default();
            for row in rows {
                let (stage, count) = row.map_err(storage_err)?;
                let count = count as usize;
                match stage.parse::<Stage>().map_err(ForemanError::Storage)? {
                    Stage::Received => counts.received = count,
                    Stage::Working => counts.working = count,
                    Stage::Archived => counts.archived = count,
                }
            }
            Ok(counts)
        })
    }

    /// Every entry ever written to `stage`, including superseded ones.
    pub fn entries(&self, stage: Stage) -> Result<Vec<StageEntry>, ForemanError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT stage, entry_name, item_id, content, superseded, written_at
                     FROM stage_entries WHERE stage = ?1 ORDER BY written_at ASC, entry_name ASC",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map([stage.as_str()], |row| Ok(row_to_entry(row)))
                .map_err(storage_err)?;

            let mut entries = Vec::new();
            for row in rows {
                entries.push(row.map_err(storage_err)??);
            }
            Ok(entries)
        })
    }

    /// Change log of one item, in order.
    pub fn history(&self, id: &ItemId) -> Result<Vec<MoveRecord>, ForemanError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT seq, item_id, from_stage, to_stage, entry_name, recorded_at
                     FROM item_log WHERE item_id = ?1 ORDER BY seq ASC",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map([id.as_str()], |row| Ok(row_to_move(row)))
                .map_err(storage_err)?;

            let mut records = Vec::new();
            for row in rows {
                records.push(row.map_err(storage_err)??);
            }
            Ok(records)
        })
    }

    fn query_items(&self, sql: &str, param: &str) -> Result<Vec<WorkItem>, ForemanError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql).map_err(storage_err)?;
            let rows = stmt
                .query_map([param], |row| Ok(row_to_item(row)))
                .map_err(storage_err)?;

            let mut items = Vec::new();
            for row in rows {
                items.push(row.map_err(storage_err)??);
            }
            Ok(items)
        })
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn load_item(conn: &Connection, id: &ItemId) -> Result<Option<WorkItem>, ForemanError> {
    let result = conn
        .query_row(
            &format!("SELECT {} FROM items WHERE id = ?1", ITEM_COLUMNS),
            [id.as_str()],
            |row| Ok(row_to_item(row)),
        )
        .optional()
        .map_err(storage_err)?;

    match result {
        Some(item) => Ok(Some(item?)),
        None => Ok(None),
    }
}

/// Non-superseded entry for `id` in `stage`, if one holds content.
fn live_entry(
    conn: &Connection,
    id: &ItemId,
    stage: Stage,
) -> Result<Option<StageEntry>, ForemanError> {
    let result = conn
        .query_row(
            "SELECT stage, entry_name, item_id, content, superseded, written_at
             FROM stage_entries
             WHERE item_id = ?1 AND stage = ?2 AND superseded = 0 AND length(content) > 0",
            rusqlite::params![id.as_str(), stage.as_str()],
            |row| Ok(row_to_entry(row)),
        )
        .optional()
        .map_err(storage_err)?;

    match result {
        Some(entry) => Ok(Some(entry?)),
        None => Ok(None),
    }
}

fn write_entry(conn: &Connection, item: &WorkItem, now: Timestamp) -> Result<(), ForemanError> {
    conn.execute(
        "INSERT INTO stage_entries (stage, entry_name, item_id, content, superseded, written_at)
         VALUES (?1, ?2, ?3, ?4, 0, ?5)",
        rusqlite::params![
            item.stage.as_str(),
            item.entry_name,
            item.id.as_str(),
            render_item_document(item),
            now.0,
        ],
    )
    .map_err(|e| ForemanError::Storage(format!("Failed to write {} entry: {}", item.stage, e)))?;
    Ok(())
}

fn append_log(
    conn: &Connection,
    id: &ItemId,
    from: Option<Stage>,
    to: Stage,
    entry_name: &str,
    now: Timestamp,
) -> Result<(), ForemanError> {
    conn.execute(
        "INSERT INTO item_log (item_id, from_stage, to_stage, entry_name, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            id.as_str(),
            from.map(|s| s.as_str()),
            to.as_str(),
            entry_name,
            now.0
        ],
    )
    .map_err(storage_err)?;
    Ok(())
}

/// First free name in `stage`: `name`, then `stem_2.ext`, `stem_3.ext`, ...
fn unique_entry_name(conn: &Connection, stage: Stage, name: &str) -> Result<String, ForemanError> {
    let taken = |candidate: &str| -> Result<bool, ForemanError> {
        conn.query_row(
            "SELECT 1 FROM stage_entries WHERE stage = ?1 AND entry_name = ?2",
            rusqlite::params![stage.as_str(), candidate],
            |_| Ok(()),
        )
        .optional()
        .map(|r| r.is_some())
        .map_err(storage_err)
    };

    if !taken(name)? {
        return Ok(name.to_string());
    }
    let (stem, ext) = split_ext(name);
    let mut n = 2;
    loop {
        let candidate = format!("{}_{}{}", stem, n, ext);
        if !taken(&candidate)? {
            return Ok(candidate);
        }
        n += 1;
    }
}

/// Split `report.md` into (`report`, `.md`). Dotfiles keep their name as stem.
fn split_ext(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    }
}

fn row_to_item(row: &rusqlite::Row<'_>) -> Result<WorkItem, ForemanError> {
    let id: String = row.get(0).map_err(storage_err)?;
    let stage: String = row.get(2).map_err(storage_err)?;
    let triage_rule: Option<i64> = row.get(6).map_err(storage_err)?;
    let status: String = row.get(7).map_err(storage_err)?;
    let failure_count: i64 = row.get(8).map_err(storage_err)?;
    let approval_requested_at: Option<i64> = row.get(10).map_err(storage_err)?;
    let notes: String = row.get(11).map_err(storage_err)?;

    Ok(WorkItem {
        id: ItemId::from_raw(id),
        origin: row.get(1).map_err(storage_err)?,
        stage: stage.parse().map_err(ForemanError::Storage)?,
        entry_name: row.get(3).map_err(storage_err)?,
        title: row.get(4).map_err(storage_err)?,
        body: row.get(5).map_err(storage_err)?,
        triage_rule: triage_rule.map(|r| r as u8),
        status: status.parse().map_err(ForemanError::Storage)?,
        failure_count: failure_count.max(0) as u32,
        blocked_reason: row.get(9).map_err(storage_err)?,
        approval_requested_at: approval_requested_at.map(Timestamp),
        notes: serde_json::from_str(&notes)?,
        created_at: Timestamp(row.get(12).map_err(storage_err)?),
        updated_at: Timestamp(row.get(13).map_err(storage_err)?),
    })
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> Result<StageEntry, ForemanError> {
    let stage: String = row.get(0).map_err(storage_err)?;
    let item_id: String = row.get(2).map_err(storage_err)?;
    let superseded: i64 = row.get(4).map_err(storage_err)?;
    Ok(StageEntry {
        stage: stage.parse().map_err(ForemanError::Storage)?,
        entry_name: row.get(1).map_err(storage_err)?,
        item_id: ItemId::from_raw(item_id),
        content: row.get(3).map_err(storage_err)?,
        superseded: superseded != 0,
        written_at: Timestamp(row.get(5).map_err(storage_err)?),
    })
}

fn row_to_move(row: &rusqlite::Row<'_>) -> Result<MoveRecord, ForemanError> {
    let item_id: String = row.get(1).map_err(storage_err)?;
    let from: Option<String> = row.get(2).map_err(storage_err)?;
    let to: String = row.get(3).map_err(storage_err)?;
    Ok(MoveRecord {
        seq: row.get(0).map_err(storage_err)?,
        item_id: ItemId::from_raw(item_id),
        from_stage: from
            .map(|s| s.parse::<Stage>())
            .transpose()
            .map_err(ForemanError::Storage)?,
        to_stage: to.parse().map_err(ForemanError::Storage)?,
        entry_name: row.get(4).map_err(storage_err)?,
        recorded_at: Timestamp(row.get(5).map_err(storage_err)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ItemStore {
        ItemStore::new(Arc::new(Database::in_memory().unwrap()))
    }

    fn new_item(origin: &str, name: &str, body: &str) -> NewItem {
        NewItem {
            origin: origin.to_string(),
            name: name.to_string(),
            title: name.trim_end_matches(".md").to_string(),
            body: body.to_string(),
        }
    }

    const T0: Timestamp = Timestamp(1_700_000_000);

    #[test]
    fn test_receive_records_item_and_entry() {
        let store = store();
        let outcome = store.receive(&new_item("inbox", "a.md", "Fix it"), T0).unwrap();
        let item = outcome.item().clone();
        assert!(matches!(outcome, ReceiveOutcome::Recorded(_)));
        assert_eq!(item.stage, Stage::Received);
        assert!(store.exists(&item.id).unwrap());

        let entries = store.entries(Stage::Received).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].content.contains("Fix it"));
        assert_eq!(store.history(&item.id).unwrap().len(), 1);
    }

    #[test]
    fn test_receive_duplicate_returns_existing() {
        let store = store();
        store.receive(&new_item("inbox", "a.md", "first"), T0).unwrap();
        let again = store
            .receive(&new_item("inbox", "a.md", "second"), T0.plus_secs(5))
            .unwrap();
        assert!(matches!(again, ReceiveOutcome::Duplicate(_)));
        assert_eq!(again.item().body, "first");
        assert_eq!(store.stage_counts().unwrap().total(), 1);
    }

    #[test]
    fn test_receive_rejects_empty_name() {
        let store = store();
        let err = store.receive(&new_item("inbox", "  ", "x"), T0).unwrap_err();
        assert!(matches!(err, ForemanError::Validation(_)));
    }

    #[test]
    fn test_move_forward_writes_destination_and_supersedes_origin() {
        let store = store();
        let item = store
            .receive(&new_item("inbox", "a.md", "Fix it"), T0)
            .unwrap()
            .item()
            .clone();

        let result = store
            .move_item(&item.id, Stage::Received, Stage::Working, T0.plus_secs(1))
            .unwrap();
        assert!(!result.replayed);
        assert_eq!(result.item.stage, Stage::Working);

        let received = store.entries(Stage::Received).unwrap();
        assert!(received[0].superseded);
        assert!(received[0].content.contains("Fix it"));
        let working = store.entries(Stage::Working).unwrap();
        assert_eq!(working.len(), 1);
        assert!(!working[0].superseded);
        assert!(working[0].content.contains("- **Stage:** working"));
    }

    #[test]
    fn test_move_collision_gets_suffix_and_keeps_existing_entry() {
        let store = store();
        let a = store
            .receive(&new_item("inbox", "report.md", "one"), T0)
            .unwrap()
            .item()
            .clone();
        let b = store
            .receive(&new_item("mail", "report.md", "two"), T0)
            .unwrap()
            .item()
            .clone();
        assert_eq!(b.entry_name, "report_2.md");

        store
            .move_item(&a.id, Stage::Received, Stage::Working, T0)
            .unwrap();
        let before = store.entries(Stage::Working).unwrap();

        let moved = store
            .move_item(&b.id, Stage::Received, Stage::Working, T0)
            .unwrap();
        // Suffix is recomputed from the source name at the destination.
        assert_eq!(moved.item.entry_name, "report_2.md");

        let after = store.entries(Stage::Working).unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0], before[0]);
    }

    #[test]
    fn test_third_collision_uses_suffix_three() {
        let store = store();
        for origin in ["a", "b", "c"] {
            store
                .receive(&new_item(origin, "note.md", origin), T0)
                .unwrap();
        }
        let names: Vec<String> = store
            .entries(Stage::Received)
            .unwrap()
            .into_iter()
            .map(|e| e.entry_name)
            .collect();
        assert_eq!(names, vec!["note.md", "note_2.md", "note_3.md"]);
    }

    #[test]
    fn test_move_keeps_numeric_tail_in_genuine_name() {
        let store = store();
        let item = store
            .receive(&new_item("inbox", "invoice_2024.md", "Update the ledger\nfor the year"), T0)
            .unwrap()
            .item()
            .clone();
        let moved = store
            .move_item(&item.id, Stage::Received, Stage::Working, T0)
            .unwrap();
        assert_eq!(moved.item.entry_name, "invoice_2024.md");

        let archived = store
            .move_item(&item.id, Stage::Working, Stage::Archived, T0.plus_secs(1))
            .unwrap();
        assert_eq!(archived.item.entry_name, "invoice_2024.md");
    }

    #[test]
    fn test_repeated_move_is_replayed_not_duplicated() {
        let store = store();
        let item = store
            .receive(&new_item("inbox", "a.md", "Fix it"), T0)
            .unwrap()
            .item()
            .clone();
        store
            .move_item(&item.id, Stage::Received, Stage::Working, T0)
            .unwrap();

        let again = store
            .move_item(&item.id, Stage::Received, Stage::Working, T0)
            .unwrap();
        assert!(again.replayed);
        assert_eq!(store.entries(Stage::Working).unwrap().len(), 1);
        assert_eq!(store.history(&item.id).unwrap().len(), 2);
    }

    #[test]
    fn test_interrupted_move_completes_on_replay() {
        let store = store();
        let item = store
            .receive(&new_item("inbox", "a.md", "Fix it"), T0)
            .unwrap()
            .item()
            .clone();

        // Simulate a crash after the destination write but before the
        // origin was superseded and the index updated.
        store
            .db
            .with_conn(|conn| {
                let mut partial = item.clone();
                partial.stage = Stage::Working;
                write_entry(conn, &partial, T0)
            })
            .unwrap();

        let result = store
            .move_item(&item.id, Stage::Received, Stage::Working, T0.plus_secs(1))
            .unwrap();
        assert!(result.replayed);
        assert_eq!(store.require(&item.id).unwrap().stage, Stage::Working);
        assert_eq!(store.entries(Stage::Working).unwrap().len(), 1);
        assert!(store.entries(Stage::Received).unwrap()[0].superseded);
    }

    #[test]
    fn test_backward_move_rejected_and_origin_untouched() {
        let store = store();
        let item = store
            .receive(&new_item("inbox", "a.md", "done"), T0)
            .unwrap()
            .item()
            .clone();
        store
            .move_item(&item.id, Stage::Received, Stage::Archived, T0)
            .unwrap();

        let err = store
            .move_item(&item.id, Stage::Archived, Stage::Working, T0)
            .unwrap_err();
        assert!(matches!(err, ForemanError::Validation(_)));
        assert_eq!(store.require(&item.id).unwrap().stage, Stage::Archived);
    }

    #[test]
    fn test_move_from_wrong_stage_rejected() {
        let store = store();
        let item = store
            .receive(&new_item("inbox", "a.md", "x"), T0)
            .unwrap()
            .item()
            .clone();
        let err = store
            .move_item(&item.id, Stage::Working, Stage::Archived, T0)
            .unwrap_err();
        assert!(err.to_string().contains("not working"));
        assert!(store.entries(Stage::Archived).unwrap().is_empty());
    }

    #[test]
    fn test_move_unknown_item_is_not_found() {
        let store = store();
        let err = store
            .move_item(&ItemId::derive("x", "y"), Stage::Received, Stage::Working, T0)
            .unwrap_err();
        assert!(matches!(err, ForemanError::NotFound(_)));
    }

    #[test]
    fn test_item_count_never_decreases_across_moves() {
        let store = store();
        let mut last_total = 0;
        for i in 0..4 {
            let item = store
                .receive(&new_item("inbox", &format!("{}.md", i), "x"), T0)
                .unwrap()
                .item()
                .clone();
            let total = store.stage_counts().unwrap().total();
            assert!(total >= last_total);
            last_total = total;

            store
                .move_item(&item.id, Stage::Received, Stage::Working, T0)
                .unwrap();
            store
                .move_item(&item.id, Stage::Working, Stage::Archived, T0)
                .unwrap();
            assert_eq!(store.stage_counts().unwrap().total(), last_total);
        }
        let counts = store.stage_counts().unwrap();
        assert_eq!(counts.archived, 4);
        // Every entry ever written is still present.
        let all = store.entries(Stage::Received).unwrap().len()
            + store.entries(Stage::Working).unwrap().len()
            + store.entries(Stage::Archived).unwrap().len();
        assert_eq!(all, 12);
    }

    #[test]
    fn test_update_item_refreshes_live_entry() {
        let store = store();
        let mut item = store
            .receive(&new_item("inbox", "a.md", "- [ ] one"), T0)
            .unwrap()
            .item()
            .clone();
        item.body = "- [x] one".to_string();
        item.status = ItemStatus::Blocked;
        item.blocked_reason = Some("stuck".into());
        let updated = store.update_item(&item, T0.plus_secs(9)).unwrap();
        assert_eq!(updated.updated_at, T0.plus_secs(9));

        let entry = &store.entries(Stage::Received).unwrap()[0];
        assert!(entry.content.contains("- [x] one"));
        assert!(entry.content.contains("- **Blocked:** stuck"));
    }

    #[test]
    fn test_update_item_rejects_truncation_and_stage_change() {
        let store = store();
        let item = store
            .receive(&new_item("inbox", "a.md", "long body text"), T0)
            .unwrap()
            .item()
            .clone();

        let mut shorter = item.clone();
        shorter.body = "short".into();
        assert!(matches!(
            store.update_item(&shorter, T0).unwrap_err(),
            ForemanError::Validation(_)
        ));

        let mut moved = item.clone();
        moved.stage = Stage::Working;
        assert!(store.update_item(&moved, T0).is_err());

        let mut rewritten = item;
        rewritten.notes = vec!["a".into()];
        let saved = store.update_item(&rewritten, T0).unwrap();
        let mut dropped = saved;
        dropped.notes.clear();
        assert!(store.update_item(&dropped, T0).is_err());
    }

    #[test]
    fn test_append_note() {
        let store = store();
        let item = store
            .receive(&new_item("inbox", "a.md", "x"), T0)
            .unwrap()
            .item()
            .clone();
        store.append_note(&item.id, "first", T0).unwrap();
        let item = store.append_note(&item.id, "second", T0).unwrap();
        assert_eq!(item.notes, vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn test_list_by_stage_and_status() {
        let store = store();
        let a = store
            .receive(&new_item("inbox", "a.md", "x"), T0)
            .unwrap()
            .item()
            .clone();
        store
            .receive(&new_item("inbox", "b.md", "y"), T0.plus_secs(1))
            .unwrap();
        store
            .move_item(&a.id, Stage::Received, Stage::Working, T0)
            .unwrap();

        let working = store.list_by_stage(Stage::Working).unwrap();
        assert_eq!(working.len(), 1);
        assert_eq!(working[0].id, a.id);
        assert_eq!(store.list_by_stage(Stage::Received).unwrap().len(), 1);
        assert_eq!(store.list_by_status(ItemStatus::Open).unwrap().len(), 2);
    }

    #[test]
    fn test_split_ext() {
        assert_eq!(split_ext("a.md"), ("a", ".md"));
        assert_eq!(split_ext("archive.tar.gz"), ("archive.tar", ".gz"));
        assert_eq!(split_ext("README"), ("README", ""));
        assert_eq!(split_ext(".env"), (".env", ""));
    }
}
