//! Work-item engine for Foreman.
//!
//! Triages incoming items, generates plans, executes plan steps through
//! pluggable capabilities under retry and recovery, and drives it all from
//! a multi-cadence scheduler.

pub mod approval;
pub mod error;
pub mod handler;
pub mod intake;
pub mod jobs;
pub mod planner;
pub mod processor;
pub mod recovery;
pub mod retry;
pub mod rules;
pub mod scheduler;
pub mod triage;
pub mod types;

pub use approval::{ApprovalGate, SweepReport};
pub use error::{ExecutorError, LoopError, SchedulerError, TransitionError};
pub use handler::{Capability, CapabilityRegistry, DryRunCapability, ReviewCapability};
pub use intake::{ingest, NotificationSource, StaticSource};
pub use jobs::{
    BlockedItem, CycleJob, ReportJob, ReportPeriod, RotationJob, ScheduledJob, StatusSummary,
};
pub use planner::PlanGenerator;
pub use processor::{Processor, PLAN_SOURCE, TRIAGE_SOURCE};
pub use recovery::{RecoveryManager, RetryHandler};
pub use retry::{register_retry_handlers, AdmissionRetry, IntakeRetry};
pub use rules::{RuleMatch, RuleTable};
pub use scheduler::{Cadence, MasterScheduler, TickReport};
pub use triage::{TriageClassifier, TriageDecision};
pub use types::{
    ActionKind, CycleReport, IntakeReport, RecoveryStats, RunSummary, StepOutcome, StepRequest,
    StopReason,
};
