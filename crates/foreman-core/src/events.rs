//! In-process event dispatcher and the domain events it relays.
//!
//! Delivery is synchronous, in subscription order, on the emitting thread.
//! Nothing is persisted or replayed; a handler that fails or panics is
//! logged and the remaining handlers still run.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error};

use crate::types::{ItemId, Priority, Stage, Timestamp};

/// Key/value payload carried by every event.
pub type Payload = Map<String, Value>;

/// Handler signature. An `Err` is reported as a dispatcher error.
pub type EventHandler = Arc<dyn Fn(&EventRecord) -> Result<(), String> + Send + Sync>;

const DEFAULT_HISTORY_LIMIT: usize = 200;

// =============================================================================
// Records
// =============================================================================

/// A single emitted event.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EventRecord {
    pub topic: String,
    pub payload: Payload,
    pub timestamp: Timestamp,
}

impl EventRecord {
    /// Look up a string field in the payload.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn u64_field(&self, key: &str) -> Option<u64> {
        self.payload.get(key).and_then(Value::as_u64)
    }
}

/// Summary of one `emit` call, kept in the bounded history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EmitReport {
    pub topic: String,
    pub timestamp: Timestamp,
    pub handler_count: usize,
    pub errors: usize,
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    pattern: String,
    handler: EventHandler,
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Synchronous publish/subscribe bus.
///
/// One instance is created by the composition root and handed to every
/// component that emits or observes events.
pub struct EventDispatcher {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
    history: Mutex<VecDeque<EmitReport>>,
    history_limit: usize,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            history: Mutex::new(VecDeque::new()),
            history_limit,
        }
    }

    /// Register `handler` for `pattern`.
    ///
    /// A pattern is an exact topic, `prefix.*` for every topic under
    /// `prefix`, or `*` for everything.
    pub fn subscribe<F>(&self, pattern: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&EventRecord) -> Result<(), String> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subs.push(Subscription {
            id,
            pattern: pattern.to_string(),
            handler: Arc::new(handler),
        });
        debug!(pattern, "Event handler subscribed");
        id
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Number of handlers that would receive `topic`.
    pub fn handler_count(&self, topic: &str) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|s| topic_matches(&s.pattern, topic))
            .count()
    }

    /// Deliver an event to every matching handler, in subscription order.
    pub fn emit(&self, topic: &str, payload: Payload) -> EmitReport {
        let record = EventRecord {
            topic: topic.to_string(),
            payload,
            timestamp: Timestamp::now(),
        };

        // Snapshot so handlers may subscribe or unsubscribe while running.
        let handlers: Vec<EventHandler> = self
            .subscriptions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|s| topic_matches(&s.pattern, topic))
            .map(|s| Arc::clone(&s.handler))
            .collect();

        let mut errors = 0;
        for handler in &handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&record))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    errors += 1;
                    error!(source = "event_dispatcher", topic, error = %e, "Event handler failed");
                }
                Err(_) => {
                    errors += 1;
                    error!(source = "event_dispatcher", topic, "Event handler panicked");
                }
            }
        }

        let report = EmitReport {
            topic: record.topic,
            timestamp: record.timestamp,
            handler_count: handlers.len(),
            errors,
        };
        self.remember(report.clone());
        report
    }

    /// Emit a typed domain event under its topic.
    pub fn publish(&self, event: DomainEvent) -> EmitReport {
        self.emit(event.topic(), event.payload())
    }

    /// Most recent emissions, oldest first.
    pub fn history(&self) -> Vec<EmitReport> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    fn remember(&self, report: EmitReport) {
        if self.history_limit == 0 {
            return;
        }
        let mut history = self
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if history.len() >= self.history_limit {
            history.pop_front();
        }
        history.push_back(report);
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .subscriptions
            .read()
            .map(|s| s.len())
            .unwrap_or_default();
        f.debug_struct("EventDispatcher")
            .field("subscriptions", &count)
            .finish()
    }
}

fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == "*" || pattern == topic {
        return true;
    }
    match pattern.strip_suffix(".*") {
        Some(prefix) => topic
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.')),
        None => false,
    }
}

// =============================================================================
// Domain events
// =============================================================================

/// Every observable state change in Foreman.
///
/// Converted to a topic plus payload by `publish`. Consumers subscribe by
/// topic string so they never depend on this enum.
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
#[non_exhaustive]
pub enum DomainEvent {
    // =========================================================================
    // Item lifecycle
    // =========================================================================
    ItemReceived {
        item_id: ItemId,
        entry_name: String,
    },
    ItemTriaged {
        item_id: ItemId,
        rule_id: u8,
        destination: Stage,
    },
    ItemMoved {
        item_id: ItemId,
        from: Stage,
        to: Stage,
        entry_name: String,
        replayed: bool,
    },
    PlanCreated {
        item_id: ItemId,
        priority: Priority,
        approval_required: bool,
        step_count: usize,
    },
    StepCompleted {
        item_id: ItemId,
        step_index: usize,
        description: String,
    },
    StepFailed {
        item_id: ItemId,
        step_index: usize,
        error: String,
        retryable: bool,
        failure_count: u32,
    },
    ItemBlocked {
        item_id: ItemId,
        reason: String,
    },
    ItemReset {
        item_id: ItemId,
    },
    ApprovalRequested {
        item_id: ItemId,
        reason: String,
    },
    ApprovalResolved {
        item_id: ItemId,
        outcome: String,
    },
    ItemCompleted {
        item_id: ItemId,
        entry_name: String,
    },

    // =========================================================================
    // Processing loop
    // =========================================================================
    LoopStarted {
        run_id: String,
        max_cycles: u32,
    },
    CycleCompleted {
        cycle: u32,
        processed: usize,
        completed: usize,
        retried: usize,
        blocked: usize,
        awaiting_approval: usize,
        remaining: usize,
    },
    LoopFinished {
        run_id: String,
        cycles: u32,
        completed: usize,
        blocked: usize,
        remaining: usize,
        stop_reason: String,
    },

    // =========================================================================
    // Recovery
    // =========================================================================
    TaskRecovered {
        task_id: String,
        source: String,
    },
    TaskExhausted {
        task_id: String,
        source: String,
        retry_count: u32,
    },
    AlertTriggered {
        source: String,
        error_count: u32,
        window_seconds: u64,
    },

    // =========================================================================
    // Scheduler
    // =========================================================================
    JobSkipped {
        job: String,
        reason: String,
    },
    JobFailed {
        job: String,
        error: String,
    },
    DailyReport {
        summary: Value,
    },
    WeeklyReport {
        summary: Value,
    },
}

impl DomainEvent {
    /// Dot-separated topic this event is published under.
    pub fn topic(&self) -> &'static str {
        match self {
            DomainEvent::ItemReceived { .. } => topics::ITEM_RECEIVED,
            DomainEvent::ItemTriaged { .. } => topics::ITEM_TRIAGED,
            DomainEvent::ItemMoved { .. } => topics::ITEM_MOVED,
            DomainEvent::PlanCreated { .. } => topics::PLAN_CREATED,
            DomainEvent::StepCompleted { .. } => topics::STEP_COMPLETED,
            DomainEvent::StepFailed { .. } => topics::STEP_FAILED,
            DomainEvent::ItemBlocked { .. } => topics::ITEM_BLOCKED,
            DomainEvent::ItemReset { .. } => topics::ITEM_RESET,
            DomainEvent::ApprovalRequested { .. } => topics::APPROVAL_REQUESTED,
            DomainEvent::ApprovalResolved { .. } => topics::APPROVAL_RESOLVED,
            DomainEvent::ItemCompleted { .. } => topics::ITEM_COMPLETED,
            DomainEvent::LoopStarted { .. } => topics::LOOP_STARTED,
            DomainEvent::CycleCompleted { .. } => topics::LOOP_CYCLE_COMPLETED,
            DomainEvent::LoopFinished { .. } => topics::LOOP_FINISHED,
            DomainEvent::TaskRecovered { .. } => topics::TASK_RECOVERED,
            DomainEvent::TaskExhausted { .. } => topics::TASK_EXHAUSTED,
            DomainEvent::AlertTriggered { .. } => topics::ALERT_TRIGGERED,
            DomainEvent::JobSkipped { .. } => topics::JOB_SKIPPED,
            DomainEvent::JobFailed { .. } => topics::JOB_FAILED,
            DomainEvent::DailyReport { .. } => topics::REPORT_DAILY,
            DomainEvent::WeeklyReport { .. } => topics::REPORT_WEEKLY,
        }
    }

    /// Event fields as a flat key/value payload.
    pub fn payload(&self) -> Payload {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Payload::new(),
        }
    }
}

/// Topic names, for subscribers.
pub mod topics {
    pub const ITEM_RECEIVED: &str = "item.received";
    pub const ITEM_TRIAGED: &str = "item.triaged";
    pub const ITEM_MOVED: &str = "item.moved";
    pub const PLAN_CREATED: &str = "plan.created";
    pub const STEP_COMPLETED: &str = "step.completed";
    pub const STEP_FAILED: &str = "step.failed";
    pub const ITEM_BLOCKED: &str = "item.blocked";
    pub const ITEM_RESET: &str = "item.reset";
    pub const APPROVAL_REQUESTED: &str = "approval.requested";
    pub const APPROVAL_RESOLVED: &str = "approval.resolved";
    pub const ITEM_COMPLETED: &str = "item.completed";
    pub const LOOP_STARTED: &str = "loop.started";
    pub const LOOP_CYCLE_COMPLETED: &str = "loop.cycle_completed";
    pub const LOOP_FINISHED: &str = "loop.finished";
    pub const TASK_RECOVERED: &str = "recovery.task.recovered";
    pub const TASK_EXHAUSTED: &str = "recovery.task.exhausted";
    pub const ALERT_TRIGGERED: &str = "error.alert_triggered";
    pub const JOB_SKIPPED: &str = "scheduler.job_skipped";
    pub const JOB_FAILED: &str = "scheduler.job_failed";
    pub const REPORT_DAILY: &str = "report.daily.generated";
    pub const REPORT_WEEKLY: &str = "report.weekly.generated";
}
