//! Error types for the action engine.

use foreman_core::error::ForemanError;
use foreman_core::types::{ItemId, ItemStatus};

/// Errors from a capability executing one plan step.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Network hiccup, rate limit, or similar. Worth retrying.
    #[error("Transient executor failure: {0}")]
    Transient(String),
    /// The step cannot succeed without outside help.
    #[error("Permanent executor failure: {0}")]
    Permanent(String),
    #[error("Executor timed out after {0} seconds")]
    Timeout(u64),
    /// The task already used every retry attempt.
    #[error("Retries exhausted for task: {0}")]
    Exhausted(String),
    #[error("Storage error: {0}")]
    Storage(#[from] ForemanError),
}

impl ExecutorError {
    /// Whether a later attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutorError::Transient(_) | ExecutorError::Timeout(_))
    }
}

/// Errors from item status transitions driven by outside decisions.
#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("Item {item} is {actual}, expected {expected}")]
    InvalidStatus {
        item: ItemId,
        actual: ItemStatus,
        expected: ItemStatus,
    },
    #[error("Storage error: {0}")]
    Storage(#[from] ForemanError),
}

/// Errors that stop a processing cycle as a whole.
///
/// Per-item failures never surface here; they are logged and counted.
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("Capability not registered: {0}")]
    UnknownCapability(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("Storage error: {0}")]
    Storage(#[from] ForemanError),
}

impl LoopError {
    /// The retry classification of this error when it is queued for recovery.
    pub fn to_retry_error(&self) -> ExecutorError {
        match self {
            LoopError::Storage(ForemanError::Validation(msg)) => {
                ExecutorError::Permanent(msg.clone())
            }
            LoopError::UnknownCapability(_) | LoopError::Transition(TransitionError::InvalidStatus { .. }) => {
                ExecutorError::Permanent(self.to_string())
            }
            _ => ExecutorError::Transient(self.to_string()),
        }
    }
}

/// Errors from the master scheduler and its jobs.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Job failed: {0}")]
    Failed(String),
    #[error("Job already running: {0}")]
    AlreadyRunning(String),
    #[error("Job not found: {0}")]
    JobNotFound(String),
    #[error("Processing error: {0}")]
    Loop(#[from] LoopError),
    #[error("Storage error: {0}")]
    Storage(#[from] ForemanError),
}
