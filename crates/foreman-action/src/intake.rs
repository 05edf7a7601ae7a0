//! Pull-based notification sources.

use async_trait::async_trait;
use tracing::{error, info, warn};

use foreman_core::error::ForemanError;
use foreman_core::events::Payload;
use foreman_core::types::{ItemId, NewItem, Timestamp};
use foreman_storage::ReceiveOutcome;

use crate::error::LoopError;
use crate::processor::{intake_source, intake_task_id, Processor};
use crate::types::IntakeReport;

/// A source of new items, polled once per scheduler tick.
#[async_trait]
pub trait NotificationSource: Send + Sync {
    fn name(&self) -> &str;

    /// Items that arrived since the last poll. Re-reporting an item is
    /// harmless; the store deduplicates by identity.
    async fn poll(&self) -> Result<Vec<NewItem>, ForemanError>;
}

/// Poll `source` once and admit everything it reports.
///
/// An item that fails before it is stored is queued for retry under the
/// source's intake recovery source, carrying the notification itself.
pub async fn ingest(
    source: &dyn NotificationSource,
    processor: &Processor,
    now: Timestamp,
) -> Result<IntakeReport, ForemanError> {
    let mut report = IntakeReport::default();

    for new in source.poll().await? {
        match processor.admit(&new, now) {
            Ok(ReceiveOutcome::Recorded(_)) => report.received += 1,
            Ok(ReceiveOutcome::Duplicate(_)) => report.duplicates += 1,
            Err(e) => {
                warn!(source = source.name(), name = %new.name, error = %e, "Item intake failed");
                report.errors += 1;
                if let Err(e) = queue_admission(source.name(), &new, &e, processor, now) {
                    error!(source = source.name(), name = %new.name, error = %e, "Failed admission could not be queued");
                }
            }
        }
    }

    if report.received > 0 || report.errors > 0 {
        info!(
            source = source.name(),
            received = report.received,
            duplicates = report.duplicates,
            errors = report.errors,
            "Intake poll finished"
        );
    }
    Ok(report)
}

/// Queue an admission that failed before the item was stored. Stored
/// items that failed triage are already queued under the triage source.
fn queue_admission(
    source: &str,
    new: &NewItem,
    err: &LoopError,
    processor: &Processor,
    now: Timestamp,
) -> Result<(), ForemanError> {
    let id = ItemId::derive(&new.origin, &new.name);
    if processor.store().exists(&id)? {
        return Ok(());
    }
    processor.recovery().note_failure(
        &intake_task_id(&id),
        &intake_source(source),
        &err.to_retry_error(),
        notification_context(new),
        now,
    )?;
    Ok(())
}

/// Recovery context that lets a retry rebuild the notification.
pub fn notification_context(new: &NewItem) -> Payload {
    let mut context = Payload::new();
    context.insert("origin".into(), new.origin.clone().into());
    context.insert("name".into(), new.name.clone().into());
    context.insert("title".into(), new.title.clone().into());
    context.insert("body".into(), new.body.clone().into());
    context
}

/// Rebuild a notification from the context `notification_context` stored.
pub fn notification_from_context(context: &Payload) -> Option<NewItem> {
    let field = |key: &str| context.get(key)?.as_str().map(str::to_string);
    Some(NewItem {
        origin: field("origin")?,
        name: field("name")?,
        title: field("title")?,
        body: field("body")?,
    })
}

/// A fixed list of items, handed out on the first poll only.
pub struct StaticSource {
    name: String,
    items: std::sync::Mutex<Vec<NewItem>>,
}

impl StaticSource {
    pub fn new(name: impl Into<String>, items: Vec<NewItem>) -> Self {
        Self {
            name: name.into(),
            items: std::sync::Mutex::new(items),
        }
    }
}

#[async_trait]
impl NotificationSource for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn poll(&self) -> Result<Vec<NewItem>, ForemanError> {
        let mut items = self
            .items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(std::mem::take(&mut *items))
    }
}
