//! Approval gate for plans that must not run unattended.
//!
//! Items whose plan requires approval are held in `awaiting_approval` until
//! an operator approves or rejects them, or until the approval timeout
//! elapses. Rejected and timed-out items are archived with the outcome
//! appended to their notes.

use std::sync::Arc;

use tracing::{error, info};

use foreman_core::events::{DomainEvent, EventDispatcher};
use foreman_core::types::{ItemId, ItemStatus, Stage, Timestamp, WorkItem};
use foreman_storage::ItemStore;

use crate::error::TransitionError;

/// Outcome of one timeout sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: Vec<ItemId>,
    /// Items past the deadline that could not be closed; retried next sweep.
    pub errors: usize,
}

pub struct ApprovalGate {
    store: Arc<ItemStore>,
    dispatcher: Arc<EventDispatcher>,
    timeout_secs: i64,
}

impl ApprovalGate {
    pub fn new(store: Arc<ItemStore>, dispatcher: Arc<EventDispatcher>, timeout_hours: u64) -> Self {
        Self {
            store,
            dispatcher,
            timeout_secs: i64::try_from(timeout_hours.saturating_mul(3600)).unwrap_or(i64::MAX),
        }
    }

    /// Hold an open item until someone decides on it.
    ///
    /// Requesting again for an item already waiting is a no-op.
    pub fn request(
        &self,
        id: &ItemId,
        reason: &str,
        now: Timestamp,
    ) -> Result<WorkItem, TransitionError> {
        let mut item = self.store.require(id)?;
        match item.status {
            ItemStatus::AwaitingApproval => return Ok(item),
            ItemStatus::Open => {}
            actual => {
                return Err(TransitionError::InvalidStatus {
                    item: id.clone(),
                    actual,
                    expected: ItemStatus::Open,
                })
            }
        }

        item.status = ItemStatus::AwaitingApproval;
        item.approval_requested_at = Some(now);
        item.notes
            .push(format!("{} Approval requested: {}", now.display(), reason));
        let item = self.store.update_item(&item, now)?;

        info!(item_id = %id, reason, "Approval requested");
        self.dispatcher.publish(DomainEvent::ApprovalRequested {
            item_id: id.clone(),
            reason: reason.to_string(),
        });
        Ok(item)
    }

    /// Release a waiting item for execution.
    pub fn approve(&self, id: &ItemId, now: Timestamp) -> Result<WorkItem, TransitionError> {
        let mut item = self.awaiting(id)?;
        item.status = ItemStatus::Approved;
        item.notes.push(format!("{} Approved", now.display()));
        let item = self.store.update_item(&item, now)?;

        info!(item_id = %id, "Item approved");
        self.publish_outcome(id, ItemStatus::Approved);
        Ok(item)
    }

    /// Reject a waiting item and archive it.
    pub fn reject(
        &self,
        id: &ItemId,
        reason: Option<&str>,
        now: Timestamp,
    ) -> Result<WorkItem, TransitionError> {
        let item = self.awaiting(id)?;
        let note = match reason {
            Some(reason) => format!("{} Rejected: {}", now.display(), reason),
            None => format!("{} Rejected", now.display()),
        };
        self.close(item, ItemStatus::Rejected, note, now)
    }

    /// Time out every item that has waited longer than the approval timeout.
    ///
    /// A failure closing one item is logged and counted; the sweep carries on.
    pub fn sweep_timeouts(&self, now: Timestamp) -> Result<SweepReport, TransitionError> {
        let mut report = SweepReport::default();
        for item in self.pending()? {
            let requested = item.approval_requested_at.unwrap_or(item.updated_at);
            if now.seconds_since(requested) < self.timeout_secs {
                continue;
            }
            let note = format!(
                "{} Approval timed out after {} hours without a decision",
                now.display(),
                self.timeout_secs / 3600
            );
            let id = item.id.clone();
            match self.close(item, ItemStatus::TimedOut, note, now) {
                Ok(_) => report.expired.push(id),
                Err(e) => {
                    error!(item_id = %id, error = %e, "Approval timeout could not be applied");
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    /// Items currently waiting for a decision.
    pub fn pending(&self) -> Result<Vec<WorkItem>, TransitionError> {
        Ok(self.store.list_by_status(ItemStatus::AwaitingApproval)?)
    }

    fn awaiting(&self, id: &ItemId) -> Result<WorkItem, TransitionError> {
        let item = self.store.require(id)?;
        if item.status != ItemStatus::AwaitingApproval {
            return Err(TransitionError::InvalidStatus {
                item: id.clone(),
                actual: item.status,
                expected: ItemStatus::AwaitingApproval,
            });
        }
        Ok(item)
    }

    fn close(
        &self,
        mut item: WorkItem,
        status: ItemStatus,
        note: String,
        now: Timestamp,
    ) -> Result<WorkItem, TransitionError> {
        item.status = status;
        item.notes.push(note);
        let item = self.store.update_item(&item, now)?;
        let id = item.id.clone();
        let archived = archive_item(&self.store, &self.dispatcher, item, now)?;

        info!(item_id = %id, outcome = %status, "Approval closed");
        self.publish_outcome(&id, status);
        Ok(archived)
    }

    fn publish_outcome(&self, id: &ItemId, status: ItemStatus) {
        self.dispatcher.publish(DomainEvent::ApprovalResolved {
            item_id: id.clone(),
            outcome: status.as_str().to_string(),
        });
    }
}

/// Move an item to Archived from wherever it is and announce the move.
pub(crate) fn archive_item(
    store: &ItemStore,
    dispatcher: &EventDispatcher,
    item: WorkItem,
    now: Timestamp,
) -> Result<WorkItem, foreman_core::ForemanError> {
    if item.stage == Stage::Archived {
        return Ok(item);
    }
    let from = item.stage;
    let moved = store.move_item(&item.id, from, Stage::Archived, now)?;
    dispatcher.publish(DomainEvent::ItemMoved {
        item_id: moved.item.id.clone(),
        from,
        to: Stage::Archived,
        entry_name: moved.item.entry_name.clone(),
        replayed: moved.replayed,
    });
    Ok(moved.item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::events::topics;
    use foreman_core::types::NewItem;
    use foreman_storage::Database;
    use std::sync::Mutex;

    const T0: Timestamp = Timestamp(1_700_000_000);

    struct Fixture {
        gate: ApprovalGate,
        db: Arc<Database>,
        store: Arc<ItemStore>,
        outcomes: Arc<Mutex<Vec<String>>>,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::in_memory().unwrap());
        let store = Arc::new(ItemStore::new(Arc::clone(&db)));
        let dispatcher = Arc::new(EventDispatcher::new());
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&outcomes);
        dispatcher.subscribe(topics::APPROVAL_RESOLVED, move |e| {
            sink.lock()
                .unwrap()
                .push(e.str_field("outcome").unwrap_or_default().to_string());
            Ok(())
        });
        Fixture {
            gate: ApprovalGate::new(Arc::clone(&store), dispatcher, 24),
            db,
            store,
            outcomes,
        }
    }

    fn working_item(store: &ItemStore, name: &str) -> ItemId {
        let new = NewItem {
            origin: "inbox".into(),
            name: name.into(),
            title: "Pay invoice".into(),
            body: "Pay the $5,000 invoice".into(),
        };
        let id = store.receive(&new, T0).unwrap().item().id.clone();
        store
            .move_item(&id, Stage::Received, Stage::Working, T0)
            .unwrap();
        id
    }

    #[test]
    fn test_request_then_approve() {
        let f = fixture();
        let id = working_item(&f.store, "a.md");

        let item = f.gate.request(&id, "Involves a payment", T0).unwrap();
        assert_eq!(item.status, ItemStatus::AwaitingApproval);
        assert_eq!(item.approval_requested_at, Some(T0));
        assert_eq!(f.gate.pending().unwrap().len(), 1);

        let item = f.gate.approve(&id, T0.plus_secs(60)).unwrap();
        assert_eq!(item.status, ItemStatus::Approved);
        assert_eq!(item.stage, Stage::Working);
        assert!(f.gate.pending().unwrap().is_empty());
        assert_eq!(*f.outcomes.lock().unwrap(), vec!["approved".to_string()]);
    }

    #[test]
    fn test_request_is_idempotent() {
        let f = fixture();
        let id = working_item(&f.store, "a.md");
        f.gate.request(&id, "first", T0).unwrap();
        let item = f.gate.request(&id, "second", T0.plus_secs(5)).unwrap();
        assert_eq!(item.approval_requested_at, Some(T0));
        assert_eq!(item.notes.len(), 1);
    }

    #[test]
    fn test_reject_archives_with_note() {
        let f = fixture();
        let id = working_item(&f.store, "a.md");
        f.gate.request(&id, "Involves a payment", T0).unwrap();

        let item = f.gate.reject(&id, Some("not in budget"), T0).unwrap();
        assert_eq!(item.status, ItemStatus::Rejected);
        assert_eq!(item.stage, Stage::Archived);
        assert!(item.notes.last().unwrap().ends_with("Rejected: not in budget"));
        assert_eq!(*f.outcomes.lock().unwrap(), vec!["rejected".to_string()]);
    }

    #[test]
    fn test_approve_requires_waiting_status() {
        let f = fixture();
        let id = working_item(&f.store, "a.md");
        let err = f.gate.approve(&id, T0).unwrap_err();
        assert!(matches!(
            err,
            TransitionError::InvalidStatus {
                actual: ItemStatus::Open,
                ..
            }
        ));
        assert_eq!(
            err.to_string(),
            "Item inbox/a.md is open, expected awaiting_approval"
        );
    }

    #[test]
    fn test_unknown_item_is_storage_not_found() {
        let f = fixture();
        let err = f
            .gate
            .approve(&ItemId::derive("inbox", "missing.md"), T0)
            .unwrap_err();
        assert!(matches!(
            err,
            TransitionError::Storage(foreman_core::ForemanError::NotFound(_))
        ));
    }

    #[test]
    fn test_sweep_times_out_after_deadline() {
        let f = fixture();
        let old = working_item(&f.store, "old.md");
        let fresh = working_item(&f.store, "fresh.md");
        f.gate.request(&old, "payment", T0).unwrap();
        f.gate.request(&fresh, "payment", T0.plus_secs(12 * 3600)).unwrap();

        assert_eq!(
            f.gate.sweep_timeouts(T0.plus_secs(23 * 3600)).unwrap(),
            SweepReport::default()
        );

        let sweep = f.gate.sweep_timeouts(T0.plus_secs(24 * 3600)).unwrap();
        assert_eq!(sweep.expired, vec![old.clone()]);
        assert_eq!(sweep.errors, 0);

        let item = f.store.require(&old).unwrap();
        assert_eq!(item.status, ItemStatus::TimedOut);
        assert_eq!(item.stage, Stage::Archived);
        assert!(item.notes.last().unwrap().contains("timed out after 24 hours"));
        assert_eq!(f.gate.pending().unwrap().len(), 1);
    }

    #[test]
    fn test_sweep_continues_past_item_that_cannot_close() {
        let f = fixture();
        let stuck = working_item(&f.store, "stuck.md");
        let late = working_item(&f.store, "late.md");
        f.gate.request(&stuck, "payment", T0).unwrap();
        f.gate.request(&late, "payment", T0).unwrap();
        f.db
            .with_conn(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER stuck_item BEFORE UPDATE ON items
                     WHEN OLD.id = 'inbox/stuck.md'
                     BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
                )
                .map_err(|e| foreman_core::ForemanError::Storage(e.to_string()))
            })
            .unwrap();

        let sweep = f.gate.sweep_timeouts(T0.plus_secs(25 * 3600)).unwrap();
        assert_eq!(sweep.expired, vec![late.clone()]);
        assert_eq!(sweep.errors, 1);
        assert_eq!(f.store.require(&late).unwrap().stage, Stage::Archived);
        assert_eq!(
            f.store.require(&stuck).unwrap().status,
            ItemStatus::AwaitingApproval
        );
    }
}
