//! Recovery handlers for admission work that failed outside a capability.
//!
//! - `AdmissionRetry`: re-runs triage or planning for a stored item
//! - `IntakeRetry`: re-admits a notification rebuilt from its record
//!
//! Handlers hold a weak reference; the processor owns the recovery manager
//! they are registered on.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use foreman_core::types::{FailedTaskRecord, ItemId, Timestamp};

use crate::error::ExecutorError;
use crate::intake::{notification_from_context, NotificationSource};
use crate::processor::{intake_source, Processor, PLAN_SOURCE, TRIAGE_SOURCE};
use crate::recovery::RetryHandler;

fn upgrade(processor: &Weak<Processor>) -> Result<Arc<Processor>, ExecutorError> {
    processor
        .upgrade()
        .ok_or_else(|| ExecutorError::Transient("processor is shutting down".into()))
}

pub struct AdmissionRetry {
    processor: Weak<Processor>,
}

impl AdmissionRetry {
    pub fn new(processor: &Arc<Processor>) -> Self {
        Self {
            processor: Arc::downgrade(processor),
        }
    }
}

#[async_trait]
impl RetryHandler for AdmissionRetry {
    async fn retry(&self, record: &FailedTaskRecord) -> Result<(), ExecutorError> {
        let processor = upgrade(&self.processor)?;
        let id = record
            .context
            .get("item_id")
            .and_then(Value::as_str)
            .map(ItemId::from_raw)
            .ok_or_else(|| {
                ExecutorError::Permanent(format!("record {} names no item", record.task_id))
            })?;
        let item = processor
            .resume_admission(&id, Timestamp::now())
            .map_err(|e| e.to_retry_error())?;
        info!(item_id = %item.id, stage = %item.stage, "Admission resumed");
        Ok(())
    }
}

pub struct IntakeRetry {
    processor: Weak<Processor>,
}

impl IntakeRetry {
    pub fn new(processor: &Arc<Processor>) -> Self {
        Self {
            processor: Arc::downgrade(processor),
        }
    }
}

#[async_trait]
impl RetryHandler for IntakeRetry {
    async fn retry(&self, record: &FailedTaskRecord) -> Result<(), ExecutorError> {
        let processor = upgrade(&self.processor)?;
        let new = notification_from_context(&record.context).ok_or_else(|| {
            ExecutorError::Permanent(format!("record {} carries no notification", record.task_id))
        })?;
        processor
            .admit(&new, Timestamp::now())
            .map_err(|e| e.to_retry_error())?;
        Ok(())
    }
}

/// Register the triage, planning and per-source intake handlers.
pub fn register_retry_handlers(processor: &Arc<Processor>, sources: &[Arc<dyn NotificationSource>]) {
    let recovery = processor.recovery();
    let admission: Arc<dyn RetryHandler> = Arc::new(AdmissionRetry::new(processor));
    recovery.register_handler(TRIAGE_SOURCE, Arc::clone(&admission));
    recovery.register_handler(PLAN_SOURCE, admission);

    let intake: Arc<dyn RetryHandler> = Arc::new(IntakeRetry::new(processor));
    for source in sources {
        recovery.register_handler(&intake_source(source.name()), Arc::clone(&intake));
    }
}
