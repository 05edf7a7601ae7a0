//! Jobs run by the master scheduler.
//!
//! - `CycleJob`: intake poll, recovery pass, one processing cycle
//! - `RotationJob`: journal rotation and failed-task cleanup
//! - `ReportJob`: daily or weekly status summary

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use foreman_core::error::ForemanError;
use foreman_core::events::{DomainEvent, EventDispatcher, Payload};
use foreman_core::journal::Journal;
use foreman_core::types::{ItemId, ItemStatus, Timestamp};
use foreman_storage::{QueueStats, StageCounts};

use crate::error::SchedulerError;
use crate::intake::{ingest, NotificationSource};
use crate::processor::Processor;
use crate::recovery::RecoveryManager;

/// A unit of scheduled work.
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, now: Timestamp) -> Result<(), SchedulerError>;
}

// =============================================================================
// Processing cycle
// =============================================================================

pub struct CycleJob {
    processor: Arc<Processor>,
    sources: Vec<Arc<dyn NotificationSource>>,
    cycles: AtomicU32,
}

impl CycleJob {
    pub const NAME: &'static str = "cycle";

    pub fn new(processor: Arc<Processor>, sources: Vec<Arc<dyn NotificationSource>>) -> Self {
        Self {
            processor,
            sources,
            cycles: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ScheduledJob for CycleJob {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self, now: Timestamp) -> Result<(), SchedulerError> {
        for source in &self.sources {
            // One broken source must not starve the rest.
            if let Err(e) = ingest(source.as_ref(), &self.processor, now).await {
                warn!(source = source.name(), error = %e, "Intake poll failed");
            }
        }
        self.processor.triage_pending(now)?;
        self.processor.recovery().run_recovery(now).await?;

        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        self.processor.run_cycle(cycle, now).await?;
        Ok(())
    }
}

// =============================================================================
// Rotation
// =============================================================================

pub struct RotationJob {
    journal: Arc<Journal>,
    recovery: Arc<RecoveryManager>,
}

impl RotationJob {
    pub const NAME: &'static str = "rotation";

    pub fn new(journal: Arc<Journal>, recovery: Arc<RecoveryManager>) -> Self {
        Self { journal, recovery }
    }
}

#[async_trait]
impl ScheduledJob for RotationJob {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self, now: Timestamp) -> Result<(), SchedulerError> {
        let rotated = self.journal.rotate_if_needed()?;
        let removed = self
            .recovery
            .cleanup(self.recovery.config().keep_days, now)?;
        if !rotated.is_empty() || removed > 0 {
            info!(rotated = rotated.len(), removed, "Rotation finished");
        }
        Ok(())
    }
}

// =============================================================================
// Reports
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportPeriod {
    Daily,
    Weekly,
}

impl ReportPeriod {
    pub fn job_name(&self) -> &'static str {
        match self {
            ReportPeriod::Daily => "daily_report",
            ReportPeriod::Weekly => "weekly_report",
        }
    }

    /// How far back the recent-error count looks.
    pub fn lookback_secs(&self) -> i64 {
        match self {
            ReportPeriod::Daily => 86_400,
            ReportPeriod::Weekly => 7 * 86_400,
        }
    }
}

pub struct ReportJob {
    period: ReportPeriod,
    processor: Arc<Processor>,
    journal: Arc<Journal>,
    dispatcher: Arc<EventDispatcher>,
}

impl ReportJob {
    pub fn new(
        period: ReportPeriod,
        processor: Arc<Processor>,
        journal: Arc<Journal>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            period,
            processor,
            journal,
            dispatcher,
        }
    }
}

#[async_trait]
impl ScheduledJob for ReportJob {
    fn name(&self) -> &str {
        self.period.job_name()
    }

    async fn run(&self, now: Timestamp) -> Result<(), SchedulerError> {
        let since = now.plus_secs(-self.period.lookback_secs());
        let summary = StatusSummary::collect(&self.processor, &self.journal, since, now)?;
        let value = serde_json::to_value(&summary).map_err(ForemanError::from)?;

        let details = match &value {
            Value::Object(map) => map.clone(),
            _ => Payload::new(),
        };
        self.journal
            .audit(&format!("report.{}", self.period.job_name()), "generated", details)?;

        info!(report = self.period.job_name(), "{}", summary.render());
        self.dispatcher.publish(match self.period {
            ReportPeriod::Daily => DomainEvent::DailyReport { summary: value },
            ReportPeriod::Weekly => DomainEvent::WeeklyReport { summary: value },
        });
        Ok(())
    }
}

/// A blocked item and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedItem {
    pub id: ItemId,
    pub reason: String,
}

/// Point-in-time view of the store, queue, and journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub generated_at: Timestamp,
    pub stages: StageCounts,
    pub blocked: Vec<BlockedItem>,
    pub awaiting_approval: usize,
    pub queue: QueueStats,
    /// Journal errors since the start of the reporting period.
    pub recent_errors: usize,
}

impl StatusSummary {
    pub fn collect(
        processor: &Processor,
        journal: &Journal,
        since: Timestamp,
        now: Timestamp,
    ) -> Result<Self, ForemanError> {
        let store = processor.store();
        let blocked = store
            .list_by_status(ItemStatus::Blocked)?
            .into_iter()
            .map(|item| BlockedItem {
                reason: item.blocked_reason.unwrap_or_default(),
                id: item.id,
            })
            .collect();

        Ok(Self {
            generated_at: now,
            stages: store.stage_counts()?,
            blocked,
            awaiting_approval: store.list_by_status(ItemStatus::AwaitingApproval)?.len(),
            queue: processor.recovery().stats()?,
            recent_errors: journal.error_count_since(since.to_datetime())?,
        })
    }

    /// Plain-text rendering for logs and the CLI.
    pub fn render(&self) -> String {
        let mut out = format!(
            "Status at {}\n  received: {}  working: {}  archived: {}\n  awaiting approval: {}\n  failed tasks: {} pending, {} retrying, {} failed, {} resolved\n  recent errors: {}\n",
            self.generated_at.display(),
            self.stages.received,
            self.stages.working,
            self.stages.archived,
            self.awaiting_approval,
            self.queue.pending,
            self.queue.retrying,
            self.queue.failed,
            self.queue.resolved,
            self.recent_errors,
        );
        if self.blocked.is_empty() {
            out.push_str("  blocked: none\n");
        } else {
            out.push_str(&format!("  blocked: {}\n", self.blocked.len()));
            for item in &self.blocked {
                out.push_str(&format!("    - {}: {}\n", item.id, item.reason));
            }
        }
        out
    }
}
