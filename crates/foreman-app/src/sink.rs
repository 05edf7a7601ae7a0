//! Journal subscribers on the event dispatcher.
//!
//! Failures go to `error.log`, outcomes worth auditing go to `audit.log`.
//! Everything else stays in tracing output only.

use std::sync::Arc;

use foreman_core::events::{topics, EventDispatcher, EventRecord};
use foreman_core::journal::{ErrorEntry, Journal, Severity};

const AUDITED: &[&str] = &[
    topics::ITEM_COMPLETED,
    topics::APPROVAL_RESOLVED,
    topics::ITEM_RESET,
    topics::LOOP_FINISHED,
    topics::REPORT_DAILY,
    topics::REPORT_WEEKLY,
];

/// Subscribe journal writers for failure and audit topics.
pub fn attach(dispatcher: &EventDispatcher, journal: &Arc<Journal>) {
    let errors = [
        (topics::STEP_FAILED, Severity::Warning),
        (topics::ITEM_BLOCKED, Severity::Error),
        (topics::TASK_EXHAUSTED, Severity::Error),
        (topics::JOB_FAILED, Severity::Error),
        (topics::ALERT_TRIGGERED, Severity::Critical),
    ];
    for (topic, severity) in errors {
        let journal = Arc::clone(journal);
        dispatcher.subscribe(topic, move |record| {
            journal
                .log_error(&error_entry(record, severity))
                .map_err(|e| e.to_string())
        });
    }

    for topic in AUDITED {
        let journal = Arc::clone(journal);
        dispatcher.subscribe(topic, move |record| {
            journal
                .audit(&record.topic, "ok", record.payload.clone())
                .map_err(|e| e.to_string())
        });
    }
}

fn error_entry(record: &EventRecord, severity: Severity) -> ErrorEntry {
    let source = record
        .str_field("source")
        .or_else(|| record.str_field("job"))
        .map(str::to_string)
        .unwrap_or_else(|| record.topic.clone());

    let message = match record.topic.as_str() {
        topics::ALERT_TRIGGERED => format!(
            "{} errors from {} within {}s",
            record.u64_field("error_count").unwrap_or_default(),
            source,
            record.u64_field("window_seconds").unwrap_or_default(),
        ),
        topics::TASK_EXHAUSTED => format!(
            "Task {} gave up after {} attempts",
            record.str_field("task_id").unwrap_or("?"),
            record.u64_field("retry_count").unwrap_or_default(),
        ),
        _ => record
            .str_field("error")
            .or_else(|| record.str_field("reason"))
            .unwrap_or(record.topic.as_str())
            .to_string(),
    };

    let mut entry = ErrorEntry::new(severity, &source, message);
    for (key, value) in &record.payload {
        entry = entry.with_context(key, value.clone());
    }
    let retries = record
        .u64_field("failure_count")
        .or_else(|| record.u64_field("retry_count"))
        .unwrap_or_default();
    entry.with_retry_count(u32::try_from(retries).unwrap_or(u32::MAX))
}
