//! Autonomous processing loop.
//!
//! Admits new items (receive, triage, move, plan), then works through the
//! Working stage one cycle at a time: execute every undone plan step through
//! the configured capability, check off the matching checklist entries, and
//! archive an item once its plan and checklist are both complete.
//!
//! A cycle never fails because of one item. Step failures feed the item's
//! consecutive failure counter and block it at the threshold; unexpected
//! per-item errors are logged and counted.

use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use foreman_core::config::{CapabilityConfig, ProcessingConfig};
use foreman_core::error::ForemanError;
use foreman_core::events::{DomainEvent, EventDispatcher, Payload};
use foreman_core::types::{
    check_entry_at, ItemId, ItemStatus, NewItem, Plan, Stage, Timestamp, WorkItem,
};
use foreman_storage::{ItemStore, PlanInsert, ReceiveOutcome};

use crate::approval::{archive_item, ApprovalGate};
use crate::error::{ExecutorError, LoopError, TransitionError};
use crate::handler::CapabilityRegistry;
use crate::planner::PlanGenerator;
use crate::recovery::RecoveryManager;
use crate::triage::TriageClassifier;
use crate::types::{ActionKind, CycleReport, RunSummary, StepRequest, StopReason};

/// Recovery source for items whose triage failed.
pub const TRIAGE_SOURCE: &str = "triage";
/// Recovery source for items whose plan could not be generated or stored.
pub const PLAN_SOURCE: &str = "planner";

/// Recovery source for admissions from the notification source `name`.
pub fn intake_source(name: &str) -> String {
    format!("intake.{}", name)
}

pub fn triage_task_id(id: &ItemId) -> String {
    format!("{}::triage", id)
}

pub fn plan_task_id(id: &ItemId) -> String {
    format!("{}::plan", id)
}

pub fn intake_task_id(id: &ItemId) -> String {
    format!("{}::intake", id)
}

/// Plan lookup result with whether this call created it.
struct Prepared {
    plan: Plan,
    item: WorkItem,
    created: bool,
}

pub struct Processor {
    store: Arc<ItemStore>,
    dispatcher: Arc<EventDispatcher>,
    registry: Arc<CapabilityRegistry>,
    recovery: Arc<RecoveryManager>,
    approvals: ApprovalGate,
    classifier: TriageClassifier,
    planner: PlanGenerator,
    config: ProcessingConfig,
    capabilities: CapabilityConfig,
}

impl Processor {
    pub fn new(
        store: Arc<ItemStore>,
        dispatcher: Arc<EventDispatcher>,
        registry: Arc<CapabilityRegistry>,
        recovery: Arc<RecoveryManager>,
        config: ProcessingConfig,
        capabilities: CapabilityConfig,
    ) -> Self {
        let approvals = ApprovalGate::new(
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            config.approval_timeout_hours,
        );
        Self {
            store,
            dispatcher,
            registry,
            recovery,
            approvals,
            classifier: TriageClassifier::new(),
            planner: PlanGenerator::new(),
            config,
            capabilities,
        }
    }

    pub fn store(&self) -> &Arc<ItemStore> {
        &self.store
    }

    pub fn approvals(&self) -> &ApprovalGate {
        &self.approvals
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    pub fn config(&self) -> &ProcessingConfig {
        &self.config
    }

    // =========================================================================
    // Intake
    // =========================================================================

    /// Receive a new item and route it.
    ///
    /// A duplicate notification returns the stored record. If an earlier
    /// admission stopped before triage, triage runs now.
    pub fn admit(&self, new: &NewItem, now: Timestamp) -> Result<ReceiveOutcome, LoopError> {
        let outcome = self.store.receive(new, now)?;
        let duplicate = matches!(outcome, ReceiveOutcome::Duplicate(_));
        let item = match outcome {
            ReceiveOutcome::Recorded(item) => {
                self.dispatcher.publish(DomainEvent::ItemReceived {
                    item_id: item.id.clone(),
                    entry_name: item.entry_name.clone(),
                });
                item
            }
            ReceiveOutcome::Duplicate(item) => item,
        };

        let item = if item.stage == Stage::Received {
            let id = item.id.clone();
            let task_id = triage_task_id(&id);
            self.triage(item, now)
                .inspect_err(|e| self.track_failure(&task_id, TRIAGE_SOURCE, &id, e, now))?
        } else {
            item
        };

        Ok(if duplicate {
            ReceiveOutcome::Duplicate(item)
        } else {
            ReceiveOutcome::Recorded(item)
        })
    }

    /// Triage every item still sitting in Received.
    ///
    /// Items with an open triage record are left to the recovery queue.
    pub fn triage_pending(&self, now: Timestamp) -> Result<usize, LoopError> {
        let mut triaged = 0;
        for item in self.store.list_by_stage(Stage::Received)? {
            let id = item.id.clone();
            let task_id = triage_task_id(&id);
            if self.recovery.is_tracked(&task_id)? {
                debug!(item_id = %id, "Triage owned by recovery; skipped");
                continue;
            }
            match self.triage(item, now) {
                Ok(_) => triaged += 1,
                Err(e) => {
                    error!(item_id = %id, error = %e, "Triage failed");
                    self.track_failure(&task_id, TRIAGE_SOURCE, &id, &e, now);
                }
            }
        }
        Ok(triaged)
    }

    /// Carry a stored item through whatever admission work it still lacks:
    /// triage while in Received, a plan while in Working.
    pub fn resume_admission(&self, id: &ItemId, now: Timestamp) -> Result<WorkItem, LoopError> {
        let item = self.store.require(id)?;
        match item.stage {
            Stage::Received => self.triage(item, now),
            Stage::Working => Ok(self.prepare(item, now)?.item),
            Stage::Archived => Ok(item),
        }
    }

    /// Queue a failed admission step for retry. A failure to record is only logged.
    pub(crate) fn track_failure(
        &self,
        task_id: &str,
        source: &str,
        id: &ItemId,
        err: &LoopError,
        now: Timestamp,
    ) {
        let mut context = Payload::new();
        context.insert("item_id".into(), id.as_str().into());
        if let Err(e) = self
            .recovery
            .note_failure(task_id, source, &err.to_retry_error(), context, now)
        {
            error!(task_id, error = %e, "Failure could not be recorded");
        }
    }

    fn triage(&self, mut item: WorkItem, now: Timestamp) -> Result<WorkItem, LoopError> {
        let decision = self.classifier.classify(&item.body);
        item.triage_rule = Some(decision.rule_id);
        if decision.destination == Stage::Archived {
            item.status = ItemStatus::Completed;
            item.notes.push(format!(
                "{} Archived at triage (rule {})",
                now.display(),
                decision.rule_id
            ));
        }
        let item = self.store.update_item(&item, now)?;
        self.dispatcher.publish(DomainEvent::ItemTriaged {
            item_id: item.id.clone(),
            rule_id: decision.rule_id,
            destination: decision.destination,
        });

        let moved = self
            .store
            .move_item(&item.id, Stage::Received, decision.destination, now)?;
        self.dispatcher.publish(DomainEvent::ItemMoved {
            item_id: moved.item.id.clone(),
            from: Stage::Received,
            to: decision.destination,
            entry_name: moved.item.entry_name.clone(),
            replayed: moved.replayed,
        });
        info!(item_id = %moved.item.id, rule = decision.rule_id, to = %decision.destination, "Item triaged");

        if decision.destination == Stage::Working {
            return Ok(self.prepare(moved.item, now)?.item);
        }
        Ok(moved.item)
    }

    /// Plan for `item`, generating and storing one if none exists yet.
    pub fn ensure_plan(&self, item: &WorkItem, now: Timestamp) -> Result<Plan, LoopError> {
        Ok(self.prepare(item.clone(), now)?.plan)
    }

    fn prepare(&self, item: WorkItem, now: Timestamp) -> Result<Prepared, LoopError> {
        let (plan, created) = match self.store.find_by_source(&item.id)? {
            Some(plan) => (plan, false),
            None => {
                let plan = self.planner.generate_for(&item, now);
                match self.store.insert_plan(&plan, &item.body, now)? {
                    PlanInsert::Inserted => {
                        self.dispatcher.publish(DomainEvent::PlanCreated {
                            item_id: item.id.clone(),
                            priority: plan.priority,
                            approval_required: plan.approval_required,
                            step_count: plan.steps.len(),
                        });
                        (plan, true)
                    }
                    PlanInsert::Duplicate(existing) => (existing, false),
                }
            }
        };

        let item = if plan.approval_required && item.status == ItemStatus::Open {
            self.approvals.request(&item.id, &plan.approval_reason, now)?
        } else {
            item
        };
        Ok(Prepared {
            plan,
            item,
            created,
        })
    }

    // =========================================================================
    // Cycles
    // =========================================================================

    /// Run one pass over the Working stage.
    pub async fn run_cycle(&self, cycle: u32, now: Timestamp) -> Result<CycleReport, LoopError> {
        let mut report = CycleReport {
            cycle,
            ..CycleReport::default()
        };

        let sweep = self.approvals.sweep_timeouts(now)?;
        if !sweep.expired.is_empty() {
            report.progressed = true;
        }
        report.errors += sweep.errors;

        for item in self.store.list_by_stage(Stage::Working)? {
            let id = item.id.clone();
            match self.process_item(item, now, &mut report).await {
                Ok(()) => {}
                Err(LoopError::UnknownCapability(tag)) => {
                    return Err(LoopError::UnknownCapability(tag));
                }
                Err(e) => {
                    error!(item_id = %id, error = %e, "Item processing failed");
                    report.errors += 1;
                }
            }
        }

        let (remaining, blocked, awaiting) = self.working_counts()?;
        report.remaining = remaining;
        report.blocked = blocked;
        report.awaiting_approval = awaiting;

        info!(
            cycle,
            processed = report.processed,
            completed = report.completed,
            retried = report.retried,
            blocked,
            awaiting_approval = awaiting,
            remaining,
            "Cycle completed"
        );
        self.dispatcher.publish(DomainEvent::CycleCompleted {
            cycle,
            processed: report.processed,
            completed: report.completed,
            retried: report.retried,
            blocked,
            awaiting_approval: awaiting,
            remaining,
        });
        Ok(report)
    }

    async fn process_item(
        &self,
        item: WorkItem,
        now: Timestamp,
        report: &mut CycleReport,
    ) -> Result<(), LoopError> {
        // Finish a close-out that stopped before the move.
        if matches!(
            item.status,
            ItemStatus::Completed | ItemStatus::Rejected | ItemStatus::TimedOut
        ) {
            archive_item(&self.store, &self.dispatcher, item, now)?;
            report.progressed = true;
            return Ok(());
        }
        if !item.status.is_executable() {
            return Ok(());
        }

        let plan_task = plan_task_id(&item.id);
        if self.recovery.is_tracked(&plan_task)? {
            debug!(task_id = %plan_task, "Planning owned by recovery; skipped this cycle");
            return Ok(());
        }
        let id = item.id.clone();
        let Prepared {
            mut plan,
            mut item,
            created,
        } = self
            .prepare(item, now)
            .inspect_err(|e| self.track_failure(&plan_task, PLAN_SOURCE, &id, e, now))?;
        if created {
            report.progressed = true;
        }
        if !item.status.is_executable() {
            report.progressed = true;
            return Ok(());
        }

        let kind = ActionKind::for_item(&item);
        let tag = CapabilityRegistry::tag_for(kind, &self.capabilities);
        let capability = self
            .registry
            .get(tag)
            .ok_or_else(|| LoopError::UnknownCapability(tag.to_string()))?;
        let source = format!("capability.{}", tag);
        report.processed += 1;

        let pending: Vec<usize> = plan.undone_steps().map(|(i, _)| i).collect();
        for index in pending {
            let task_id = StepRequest::task_id_for(&item.id, index);
            if self.recovery.in_backoff(&task_id, now)? {
                debug!(task_id = %task_id, "Step in retry backoff; skipped this cycle");
                break;
            }

            let description = plan.steps[index].description.clone();
            let request = StepRequest {
                task_id: task_id.clone(),
                item_id: item.id.clone(),
                item_title: item.title.clone(),
                step_index: index,
                description: description.clone(),
                kind,
            };
            let mut context = Payload::new();
            context.insert("item_id".into(), item.id.as_str().into());
            context.insert("step_index".into(), index.into());
            context.insert("description".into(), description.clone().into());

            let cap = Arc::clone(&capability);
            let result = self
                .recovery
                .invoke(&task_id, &source, context, now, move || async move {
                    cap.execute(&request).await
                })
                .await;

            match result {
                Ok(outcome) => {
                    plan.steps[index].done = true;
                    self.store.update_plan_steps(&plan, now)?;
                    check_off(&mut item, &plan.steps[index].covers);
                    item.failure_count = 0;
                    item = self.store.update_item(&item, now)?;
                    report.progressed = true;

                    debug!(task_id = %task_id, message = %outcome.message, "Step completed");
                    self.dispatcher.publish(DomainEvent::StepCompleted {
                        item_id: item.id.clone(),
                        step_index: index,
                        description,
                    });
                }
                Err(ExecutorError::Storage(e)) => return Err(e.into()),
                Err(err) => {
                    item = self.record_step_failure(item, index, &err, now, report)?;
                    report.progressed = true;
                    break;
                }
            }
        }

        if plan.is_complete() && item.status.is_executable() {
            if item.checklist_complete() {
                self.complete(item, plan.steps.len(), now)?;
                report.completed += 1;
            } else {
                let open: Vec<String> = item
                    .checklist()
                    .into_iter()
                    .filter(|e| !e.checked && !e.text.is_empty())
                    .map(|e| e.text)
                    .collect();
                let reason = format!(
                    "Plan finished but checklist entries remain open: {}",
                    open.join("; ")
                );
                self.block(item, reason, now)?;
            }
            report.progressed = true;
        }
        Ok(())
    }

    fn record_step_failure(
        &self,
        mut item: WorkItem,
        index: usize,
        err: &ExecutorError,
        now: Timestamp,
        report: &mut CycleReport,
    ) -> Result<WorkItem, LoopError> {
        item.failure_count += 1;
        let retryable = err.is_retryable();
        if retryable {
            report.retried += 1;
        }
        warn!(item_id = %item.id, step = index + 1, failure_count = item.failure_count, error = %err, "Step failed");
        self.dispatcher.publish(DomainEvent::StepFailed {
            item_id: item.id.clone(),
            step_index: index,
            error: err.to_string(),
            retryable,
            failure_count: item.failure_count,
        });

        if !retryable {
            let reason = format!("Step {} failed: {}", index + 1, err);
            return self.block(item, reason, now);
        }
        if item.failure_count >= self.config.failure_threshold {
            let reason = format!(
                "{} consecutive step failures; last error: {}",
                item.failure_count, err
            );
            return self.block(item, reason, now);
        }
        Ok(self.store.update_item(&item, now)?)
    }

    fn block(&self, mut item: WorkItem, reason: String, now: Timestamp) -> Result<WorkItem, LoopError> {
        item.status = ItemStatus::Blocked;
        item.notes.push(format!("{} Blocked: {}", now.display(), reason));
        item.blocked_reason = Some(reason.clone());
        let item = self.store.update_item(&item, now)?;

        warn!(item_id = %item.id, reason = %reason, "Item blocked");
        self.dispatcher.publish(DomainEvent::ItemBlocked {
            item_id: item.id.clone(),
            reason,
        });
        Ok(item)
    }

    fn complete(&self, mut item: WorkItem, steps: usize, now: Timestamp) -> Result<WorkItem, LoopError> {
        item.status = ItemStatus::Completed;
        item.notes.push(format!(
            "{} Completed: all {} plan steps done",
            now.display(),
            steps
        ));
        let item = self.store.update_item(&item, now)?;
        let archived = archive_item(&self.store, &self.dispatcher, item, now)?;

        info!(item_id = %archived.id, entry = %archived.entry_name, "Item completed");
        self.dispatcher.publish(DomainEvent::ItemCompleted {
            item_id: archived.id.clone(),
            entry_name: archived.entry_name.clone(),
        });
        Ok(archived)
    }

    /// Items in Working, and how many of them are blocked or waiting.
    pub fn working_counts(&self) -> Result<(usize, usize, usize), ForemanError> {
        let working = self.store.list_by_stage(Stage::Working)?;
        let blocked = working
            .iter()
            .filter(|i| i.status == ItemStatus::Blocked)
            .count();
        let awaiting = working
            .iter()
            .filter(|i| i.status == ItemStatus::AwaitingApproval)
            .count();
        Ok((working.len(), blocked, awaiting))
    }

    // =========================================================================
    // Bounded run
    // =========================================================================

    /// Cycle until Working is empty, a cycle changes nothing, or
    /// `max_cycles` is reached.
    pub async fn run(&self, max_cycles: u32) -> Result<RunSummary, LoopError> {
        let run_id = Uuid::new_v4().to_string();
        info!(run_id = %run_id, max_cycles, "Processing run started");
        self.dispatcher.publish(DomainEvent::LoopStarted {
            run_id: run_id.clone(),
            max_cycles,
        });

        let mut summary = RunSummary {
            run_id: run_id.clone(),
            cycles: 0,
            processed: 0,
            completed: 0,
            retried: 0,
            errors: 0,
            blocked: 0,
            awaiting_approval: 0,
            remaining: 0,
            stop_reason: StopReason::MaxCycles,
        };

        summary.stop_reason = loop {
            if self.store.stage_counts()?.working == 0 {
                break StopReason::QueueEmpty;
            }
            if summary.cycles >= max_cycles {
                break StopReason::MaxCycles;
            }

            summary.cycles += 1;
            let report = self.run_cycle(summary.cycles, Timestamp::now()).await?;
            summary.processed += report.processed;
            summary.completed += report.completed;
            summary.retried += report.retried;
            summary.errors += report.errors;

            if !report.progressed {
                break StopReason::NoProgress;
            }
        };

        let (remaining, blocked, awaiting) = self.working_counts()?;
        summary.remaining = remaining;
        summary.blocked = blocked;
        summary.awaiting_approval = awaiting;

        info!(
            run_id = %run_id,
            cycles = summary.cycles,
            completed = summary.completed,
            blocked,
            remaining,
            stop_reason = %summary.stop_reason,
            "Processing run finished"
        );
        self.dispatcher.publish(DomainEvent::LoopFinished {
            run_id,
            cycles: summary.cycles,
            completed: summary.completed,
            blocked,
            remaining,
            stop_reason: summary.stop_reason.as_str().to_string(),
        });
        Ok(summary)
    }

    // =========================================================================
    // Operator actions
    // =========================================================================

    /// Return a blocked item to the loop and release its failed step records.
    pub fn reset_blocked(&self, id: &ItemId, now: Timestamp) -> Result<WorkItem, TransitionError> {
        let mut item = self.store.require(id)?;
        if item.status != ItemStatus::Blocked {
            return Err(TransitionError::InvalidStatus {
                item: id.clone(),
                actual: item.status,
                expected: ItemStatus::Blocked,
            });
        }

        // An item that was approved before blocking stays approved.
        let was_approved = item.approval_requested_at.is_some()
            && item.notes.iter().any(|n| n.ends_with(" Approved"));
        item.status = if was_approved {
            ItemStatus::Approved
        } else {
            ItemStatus::Open
        };
        item.failure_count = 0;
        item.blocked_reason = None;
        item.notes.push(format!("{} Reset by operator", now.display()));
        let item = self.store.update_item(&item, now)?;

        let released = self.recovery.release(&format!("{}::", id), now)?;
        info!(item_id = %id, released, "Blocked item reset");
        self.dispatcher
            .publish(DomainEvent::ItemReset { item_id: id.clone() });
        Ok(item)
    }
}

/// Check the checklist entries a completed step accounts for.
fn check_off(item: &mut WorkItem, positions: &[usize]) {
    for &pos in positions {
        if let Some(body) = check_entry_at(&item.body, pos) {
            item.body = body;
        }
    }
}
