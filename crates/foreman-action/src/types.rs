//! Domain types for the action engine.

use std::fmt;

use serde::{Deserialize, Serialize};

use foreman_core::types::{ItemId, WorkItem};

// =============================================================================
// Enums
// =============================================================================

/// Kind of work an item needs, used to pick a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// The item carries checklist entries to work through.
    PlanExecution,
    Generic,
}

impl ActionKind {
    pub fn for_item(item: &WorkItem) -> Self {
        if item.has_checklist() {
            ActionKind::PlanExecution
        } else {
            ActionKind::Generic
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::PlanExecution => "plan_execution",
            ActionKind::Generic => "generic",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan_execution" => Ok(ActionKind::PlanExecution),
            "generic" => Ok(ActionKind::Generic),
            other => Err(format!("unknown action kind: {}", other)),
        }
    }
}

/// Why an autonomous run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Nothing left in the Working stage.
    QueueEmpty,
    MaxCycles,
    /// A full cycle changed no item record.
    NoProgress,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::QueueEmpty => "queue_empty",
            StopReason::MaxCycles => "max_cycles",
            StopReason::NoProgress => "no_progress",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Capability I/O
// =============================================================================

/// One plan step handed to a capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRequest {
    /// Stable id of this step, also the failed-task queue key.
    pub task_id: String,
    pub item_id: ItemId,
    pub item_title: String,
    /// Zero-based index into the plan steps.
    pub step_index: usize,
    pub description: String,
    pub kind: ActionKind,
}

impl StepRequest {
    pub fn task_id_for(item_id: &ItemId, step_index: usize) -> String {
        format!("{}::step-{}", item_id, step_index + 1)
    }
}

/// What a capability reports after finishing a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub message: String,
    /// Id of the external artifact produced, if any (message id, post id).
    pub reference_id: Option<String>,
}

impl StepOutcome {
    pub fn done(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            reference_id: None,
        }
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Counters for one processing cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub cycle: u32,
    /// Items whose steps were attempted this cycle.
    pub processed: usize,
    pub completed: usize,
    /// Retryable step failures recorded this cycle.
    pub retried: usize,
    /// Items in Working that are blocked after the cycle.
    pub blocked: usize,
    pub awaiting_approval: usize,
    /// Items still in Working after the cycle.
    pub remaining: usize,
    /// Items skipped because of an unexpected error.
    pub errors: usize,
    /// Whether any item record changed.
    pub progressed: bool,
}

/// Result of a bounded autonomous run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub cycles: u32,
    pub processed: usize,
    pub completed: usize,
    pub retried: usize,
    pub errors: usize,
    pub blocked: usize,
    pub awaiting_approval: usize,
    pub remaining: usize,
    pub stop_reason: StopReason,
}

/// Counters for one pass over the failed-task queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryStats {
    pub attempted: usize,
    pub recovered: usize,
    pub failed: usize,
    /// Due records with no handler for their source.
    pub skipped: usize,
}

/// Counters for one poll of a notification source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IntakeReport {
    pub received: usize,
    pub duplicates: usize,
    pub errors: usize,
}
