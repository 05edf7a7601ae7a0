//! Review capability.
//!
//! Completes steps that need no outside mechanism (reading, verifying,
//! archiving, reporting) and refuses everything else, so an item with real
//! work in it ends up blocked with a clear reason instead of being faked.

use async_trait::async_trait;

use crate::error::ExecutorError;
use crate::handler::Capability;
use crate::types::{StepOutcome, StepRequest};

/// Step prefixes this capability completes on its own.
pub const SAFE_PREFIXES: &[&str] = &[
    "verify",
    "mark task as done",
    "archive",
    "confirm",
    "notify",
    "send notification",
    "log",
    "report",
    "review",
    "read",
    "check",
    "inspect",
    "scan",
    "analyze",
];

/// Handler for steps that are safe to complete without a human.
pub struct ReviewCapability;

impl ReviewCapability {
    pub fn handles(description: &str) -> bool {
        let lower = description.trim_start().to_lowercase();
        SAFE_PREFIXES.iter().any(|prefix| {
            lower.strip_prefix(prefix).is_some_and(|rest| {
                rest.is_empty() || !rest.starts_with(|c: char| c.is_alphanumeric())
            })
        })
    }
}

#[async_trait]
impl Capability for ReviewCapability {
    fn tag(&self) -> &'static str {
        "review"
    }

    async fn authenticate(&self) -> bool {
        true
    }

    async fn execute(&self, step: &StepRequest) -> Result<StepOutcome, ExecutorError> {
        if !Self::handles(&step.description) {
            return Err(ExecutorError::Permanent(format!(
                "no capability configured for step {:?}",
                step.description
            )));
        }

        tracing::info!(task_id = %step.task_id, step = %step.description, "Step completed by review");

        Ok(StepOutcome::done(format!("Reviewed: {}", step.description)))
    }
}
