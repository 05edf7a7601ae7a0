//! Dry-run capability.
//!
//! Logs every step and reports it done without touching anything.

use async_trait::async_trait;

use crate::error::ExecutorError;
use crate::handler::Capability;
use crate::types::{StepOutcome, StepRequest};

pub struct DryRunCapability;

#[async_trait]
impl Capability for DryRunCapability {
    fn tag(&self) -> &'static str {
        "dry_run"
    }

    async fn authenticate(&self) -> bool {
        true
    }

    async fn execute(&self, step: &StepRequest) -> Result<StepOutcome, ExecutorError> {
        tracing::info!(
            task_id = %step.task_id,
            kind = %step.kind,
            step = %step.description,
            "Dry run: step not executed"
        );
        Ok(StepOutcome::done(format!("Dry run: {}", step.description)))
    }
}
