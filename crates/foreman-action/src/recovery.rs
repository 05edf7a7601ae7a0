//! Retry and recovery manager.
//!
//! Every external action goes through `invoke`, which applies a timeout and
//! keeps a durable record of failures. Records move pending -> retrying ->
//! resolved or failed, with exponential backoff between attempts. Errors are
//! also counted per source; crossing the threshold inside the window raises
//! exactly one alert until the window rolls over.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use foreman_core::config::RecoveryConfig;
use foreman_core::error::ForemanError;
use foreman_core::events::{DomainEvent, EventDispatcher, Payload};
use foreman_core::types::{AlertWindowState, FailedTaskRecord, FailedTaskStatus, Timestamp};
use foreman_storage::{AlertWindows, Database, FailedTaskQueue, QueueStats};

use crate::error::ExecutorError;
use crate::types::RecoveryStats;

/// Re-runs a failed task from its stored record.
#[async_trait]
pub trait RetryHandler: Send + Sync {
    async fn retry(&self, record: &FailedTaskRecord) -> Result<(), ExecutorError>;
}

pub struct RecoveryManager {
    queue: FailedTaskQueue,
    windows: AlertWindows,
    dispatcher: Arc<EventDispatcher>,
    config: RecoveryConfig,
    handlers: RwLock<HashMap<String, Arc<dyn RetryHandler>>>,
}

impl RecoveryManager {
    pub fn new(db: Arc<Database>, dispatcher: Arc<EventDispatcher>, config: RecoveryConfig) -> Self {
        Self {
            queue: FailedTaskQueue::new(Arc::clone(&db)),
            windows: AlertWindows::new(db),
            dispatcher,
            config,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register the handler that `run_recovery` uses for records from `source`.
    pub fn register_handler(&self, source: &str, handler: Arc<dyn RetryHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(source.to_string(), handler);
    }

    /// Backoff before the next attempt after `retry_count` failures.
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        let exp = retry_count.saturating_sub(1).min(32);
        let secs = self
            .config
            .base_delay_secs
            .saturating_mul(1u64 << exp)
            .min(self.config.max_delay_secs);
        Duration::from_secs(secs)
    }

    // =========================================================================
    // Invocation
    // =========================================================================

    /// Run `action` under the configured timeout and record the outcome.
    ///
    /// A task whose record is already `failed` is not run again.
    pub async fn invoke<F, Fut, T>(
        &self,
        task_id: &str,
        source: &str,
        context: Payload,
        now: Timestamp,
        action: F,
    ) -> Result<T, ExecutorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ExecutorError>>,
    {
        let existing = self.queue.get(task_id)?;
        if existing
            .as_ref()
            .is_some_and(|r| r.status == FailedTaskStatus::Failed)
        {
            return Err(ExecutorError::Exhausted(task_id.to_string()));
        }

        let timeout_secs = self.config.invoke_timeout_secs;
        let result = match tokio::time::timeout(Duration::from_secs(timeout_secs), action()).await {
            Ok(result) => result,
            Err(_) => Err(ExecutorError::Timeout(timeout_secs)),
        };

        match result {
            Ok(value) => {
                if let Some(record) = existing {
                    if record.status != FailedTaskStatus::Resolved {
                        self.resolve(record, now)?;
                    }
                }
                Ok(value)
            }
            Err(err) => {
                self.record_failure(existing, task_id, source, &err, context, now)?;
                Err(err)
            }
        }
    }

    /// Record a failure that happened outside `invoke` so `run_recovery`
    /// retries it through the handler registered for `source`.
    pub fn note_failure(
        &self,
        task_id: &str,
        source: &str,
        err: &ExecutorError,
        context: Payload,
        now: Timestamp,
    ) -> Result<FailedTaskRecord, ForemanError> {
        let existing = self.queue.get(task_id)?;
        self.record_failure(existing, task_id, source, err, context, now)
    }

    /// Whether `task_id` has an unresolved record, retrying or exhausted.
    pub fn is_tracked(&self, task_id: &str) -> Result<bool, ForemanError> {
        Ok(self
            .queue
            .get(task_id)?
            .is_some_and(|r| r.status != FailedTaskStatus::Resolved))
    }

    /// Whether `task_id` is waiting out its backoff at `now`.
    pub fn in_backoff(&self, task_id: &str, now: Timestamp) -> Result<bool, ForemanError> {
        Ok(self
            .queue
            .get(task_id)?
            .is_some_and(|r| !r.status.is_terminal() && r.next_retry_at > now))
    }

    pub fn record(&self, task_id: &str) -> Result<Option<FailedTaskRecord>, ForemanError> {
        self.queue.get(task_id)
    }

    fn resolve(&self, mut record: FailedTaskRecord, now: Timestamp) -> Result<(), ForemanError> {
        record.status = FailedTaskStatus::Resolved;
        record.updated_at = now;
        self.queue.upsert(&record)?;
        info!(task_id = %record.task_id, source = %record.source, "Task recovered");
        self.dispatcher.publish(DomainEvent::TaskRecovered {
            task_id: record.task_id,
            source: record.source,
        });
        Ok(())
    }

    fn record_failure(
        &self,
        existing: Option<FailedTaskRecord>,
        task_id: &str,
        source: &str,
        err: &ExecutorError,
        context: Payload,
        now: Timestamp,
    ) -> Result<FailedTaskRecord, ForemanError> {
        let (retry_count, created_at, mut merged) = match existing {
            Some(r) if r.status != FailedTaskStatus::Resolved => {
                (r.retry_count + 1, r.created_at, r.context)
            }
            _ => (1, now, Payload::new()),
        };
        merged.extend(context);

        let max_attempts = self.config.max_attempts;
        let status = if !err.is_retryable() || retry_count >= max_attempts {
            FailedTaskStatus::Failed
        } else if retry_count == 1 {
            FailedTaskStatus::Pending
        } else {
            FailedTaskStatus::Retrying
        };
        let delay = self.retry_delay(retry_count).as_secs() as i64;

        let record = FailedTaskRecord {
            task_id: task_id.to_string(),
            source: source.to_string(),
            error: err.to_string(),
            retry_count,
            max_attempts,
            next_retry_at: now.plus_secs(delay),
            status,
            context: merged,
            created_at,
            updated_at: now,
        };
        self.queue.upsert(&record)?;

        if status == FailedTaskStatus::Failed {
            error!(task_id, source, retry_count, error = %err, "Task failed permanently");
            self.dispatcher.publish(DomainEvent::TaskExhausted {
                task_id: task_id.to_string(),
                source: source.to_string(),
                retry_count,
            });
        } else {
            warn!(task_id, source, retry_count, delay_secs = delay, error = %err, "Task failed; retry scheduled");
        }

        self.record_error(source, now)?;
        Ok(record)
    }

    // =========================================================================
    // Alerting
    // =========================================================================

    /// Count one error for `source`. Returns true if this error fired the alert.
    pub fn record_error(&self, source: &str, now: Timestamp) -> Result<bool, ForemanError> {
        let window_secs = self.config.alert_window_secs;
        let mut state = self
            .windows
            .get(source)?
            .unwrap_or_else(|| AlertWindowState::new(source, now));

        if now.seconds_since(state.window_start) >= window_secs as i64 {
            state = AlertWindowState::new(source, now);
        }
        state.error_count += 1;

        let fire = state.error_count >= self.config.alert_threshold && state.last_alert_fired.is_none();
        if fire {
            state.last_alert_fired = Some(now);
        }
        self.windows.put(&state)?;

        if fire {
            error!(source, error_count = state.error_count, window_secs, "Error threshold reached");
            self.dispatcher.publish(DomainEvent::AlertTriggered {
                source: source.to_string(),
                error_count: state.error_count,
                window_seconds: window_secs,
            });
        }
        Ok(fire)
    }

    // =========================================================================
    // Queue maintenance
    // =========================================================================

    /// Retry every due record that has a handler for its source.
    pub async fn run_recovery(&self, now: Timestamp) -> Result<RecoveryStats, ForemanError> {
        let mut stats = RecoveryStats::default();

        for record in self.queue.due(now)? {
            let handler = self
                .handlers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .get(&record.source)
                .cloned();
            let Some(handler) = handler else {
                stats.skipped += 1;
                continue;
            };

            stats.attempted += 1;
            let task_id = record.task_id.clone();
            let source = record.source.clone();
            let result = self
                .invoke(&task_id, &source, Payload::new(), now, || async move {
                    handler.retry(&record).await
                })
                .await;
            match result {
                Ok(()) => stats.recovered += 1,
                Err(ExecutorError::Storage(e)) => return Err(e),
                Err(_) => stats.failed += 1,
            }
        }

        if stats.attempted > 0 {
            info!(
                attempted = stats.attempted,
                recovered = stats.recovered,
                failed = stats.failed,
                skipped = stats.skipped,
                "Recovery pass finished"
            );
        }
        Ok(stats)
    }

    /// Resolve every record whose task id starts with `prefix`.
    pub fn release(&self, prefix: &str, now: Timestamp) -> Result<usize, ForemanError> {
        self.queue.resolve_by_prefix(prefix, now)
    }

    /// Drop resolved and failed records older than `keep_days`.
    pub fn cleanup(&self, keep_days: u32, now: Timestamp) -> Result<usize, ForemanError> {
        self.queue
            .cleanup(now.plus_secs(-(i64::from(keep_days) * 86_400)))
    }

    pub fn stats(&self) -> Result<QueueStats, ForemanError> {
        self.queue.stats()
    }

    pub fn records(
        &self,
        status: Option<FailedTaskStatus>,
    ) -> Result<Vec<FailedTaskRecord>, ForemanError> {
        self.queue.list(status)
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::events::{topics, EventRecord};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const T0: Timestamp = Timestamp(1_700_000_000);
    const SOURCE: &str = "capability.mail";

    fn manager() -> (RecoveryManager, Arc<Mutex<Vec<EventRecord>>>) {
        let dispatcher = Arc::new(EventDispatcher::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        dispatcher.subscribe("*", move |e| {
            sink.lock().unwrap().push(e.clone());
            Ok(())
        });
        let config = RecoveryConfig {
            invoke_timeout_secs: 1,
            ..RecoveryConfig::default()
        };
        let db = Arc::new(Database::in_memory().unwrap());
        (RecoveryManager::new(db, dispatcher, config), seen)
    }

    fn topics_of(seen: &Arc<Mutex<Vec<EventRecord>>>, topic: &str) -> usize {
        seen.lock().unwrap().iter().filter(|e| e.topic == topic).count()
    }

    async fn fail(m: &RecoveryManager, task: &str, now: Timestamp) -> ExecutorError {
        m.invoke(task, SOURCE, Payload::new(), now, || async {
            Err::<(), _>(ExecutorError::Transient("smtp 421".into()))
        })
        .await
        .unwrap_err()
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let (m, _) = manager();
        assert_eq!(m.retry_delay(1), Duration::from_secs(60));
        assert_eq!(m.retry_delay(2), Duration::from_secs(120));
        assert_eq!(m.retry_delay(3), Duration::from_secs(240));
        assert_eq!(m.retry_delay(20), Duration::from_secs(3600));
        assert_eq!(m.retry_delay(u32::MAX), Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_success_without_record_writes_nothing() {
        let (m, _) = manager();
        let value = m
            .invoke("t1", SOURCE, Payload::new(), T0, || async { Ok::<_, ExecutorError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert!(m.record("t1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failures_progress_to_failed() {
        let (m, seen) = manager();

        fail(&m, "t1", T0).await;
        let r = m.record("t1").unwrap().unwrap();
        assert_eq!((r.retry_count, r.status), (1, FailedTaskStatus::Pending));
        assert_eq!(r.next_retry_at, T0.plus_secs(60));
        assert!(m.in_backoff("t1", T0).unwrap());
        assert!(!m.in_backoff("t1", T0.plus_secs(60)).unwrap());

        fail(&m, "t1", T0.plus_secs(60)).await;
        let r = m.record("t1").unwrap().unwrap();
        assert_eq!((r.retry_count, r.status), (2, FailedTaskStatus::Retrying));

        fail(&m, "t1", T0.plus_secs(200)).await;
        let r = m.record("t1").unwrap().unwrap();
        assert_eq!((r.retry_count, r.status), (3, FailedTaskStatus::Failed));
        assert_eq!(topics_of(&seen, topics::TASK_EXHAUSTED), 1);

        let err = m
            .invoke("t1", SOURCE, Payload::new(), T0.plus_secs(999), || async {
                Ok::<_, ExecutorError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Exhausted(_)));
    }

    #[tokio::test]
    async fn test_success_after_failure_resolves() {
        let (m, seen) = manager();
        fail(&m, "t1", T0).await;
        m.invoke("t1", SOURCE, Payload::new(), T0.plus_secs(60), || async {
            Ok::<_, ExecutorError>(())
        })
        .await
        .unwrap();

        assert_eq!(
            m.record("t1").unwrap().unwrap().status,
            FailedTaskStatus::Resolved
        );
        assert_eq!(topics_of(&seen, topics::TASK_RECOVERED), 1);
    }

    #[tokio::test]
    async fn test_permanent_error_fails_immediately() {
        let (m, seen) = manager();
        m.invoke("t1", SOURCE, Payload::new(), T0, || async {
            Err::<(), _>(ExecutorError::Permanent("bad address".into()))
        })
        .await
        .unwrap_err();
        let r = m.record("t1").unwrap().unwrap();
        assert_eq!((r.retry_count, r.status), (1, FailedTaskStatus::Failed));
        assert_eq!(topics_of(&seen, topics::TASK_EXHAUSTED), 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_transient_failure() {
        let (m, _) = manager();
        let err = m
            .invoke("slow", SOURCE, Payload::new(), T0, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, ExecutorError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Timeout(1)));
        let r = m.record("slow").unwrap().unwrap();
        assert_eq!(r.status, FailedTaskStatus::Pending);
        assert!(r.error.contains("timed out"));
    }

    #[tokio::test]
    async fn test_context_is_merged_across_failures() {
        let (m, _) = manager();
        let mut ctx = Payload::new();
        ctx.insert("item_id".into(), "inbox/a.md".into());
        m.invoke("t1", SOURCE, ctx, T0, || async {
            Err::<(), _>(ExecutorError::Transient("x".into()))
        })
        .await
        .unwrap_err();
        fail(&m, "t1", T0.plus_secs(60)).await;
        let r = m.record("t1").unwrap().unwrap();
        assert_eq!(r.context.get("item_id").and_then(|v| v.as_str()), Some("inbox/a.md"));
    }

    #[test]
    fn test_alert_fires_once_per_window() {
        let (m, seen) = manager();
        assert!(!m.record_error(SOURCE, T0).unwrap());
        assert!(!m.record_error(SOURCE, T0.plus_secs(10)).unwrap());
        assert!(m.record_error(SOURCE, T0.plus_secs(20)).unwrap());
        assert!(!m.record_error(SOURCE, T0.plus_secs(30)).unwrap());
        assert_eq!(topics_of(&seen, topics::ALERT_TRIGGERED), 1);

        let alert = seen
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.topic == topics::ALERT_TRIGGERED)
            .cloned()
            .unwrap();
        assert_eq!(alert.str_field("source"), Some(SOURCE));
        assert_eq!(alert.u64_field("error_count"), Some(3));
        assert_eq!(alert.u64_field("window_seconds"), Some(3600));
    }

    #[test]
    fn test_alert_window_resets_after_elapsed() {
        let (m, seen) = manager();
        for i in 0..3 {
            m.record_error(SOURCE, T0.plus_secs(i)).unwrap();
        }
        // New window: the count starts over and a new alert is possible.
        let later = T0.plus_secs(3600);
        assert!(!m.record_error(SOURCE, later).unwrap());
        assert!(!m.record_error(SOURCE, later.plus_secs(1)).unwrap());
        assert!(m.record_error(SOURCE, later.plus_secs(2)).unwrap());
        assert_eq!(topics_of(&seen, topics::ALERT_TRIGGERED), 2);
    }

    #[test]
    fn test_alert_sources_are_independent() {
        let (m, seen) = manager();
        for i in 0..2 {
            m.record_error("capability.a", T0.plus_secs(i)).unwrap();
            m.record_error("capability.b", T0.plus_secs(i)).unwrap();
        }
        assert_eq!(topics_of(&seen, topics::ALERT_TRIGGERED), 0);
    }

    struct CountingHandler {
        calls: AtomicUsize,
        succeed: bool,
    }

    #[async_trait]
    impl RetryHandler for CountingHandler {
        async fn retry(&self, _record: &FailedTaskRecord) -> Result<(), ExecutorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.succeed {
                Ok(())
            } else {
                Err(ExecutorError::Transient("still down".into()))
            }
        }
    }

    #[tokio::test]
    async fn test_run_recovery_counts() {
        let (m, _) = manager();
        fail(&m, "mail-1", T0).await;
        fail(&m, "mail-2", T0).await;
        m.invoke("other-1", "intake.rss", Payload::new(), T0, || async {
            Err::<(), _>(ExecutorError::Transient("x".into()))
        })
        .await
        .unwrap_err();

        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            succeed: true,
        });
        m.register_handler(SOURCE, handler.clone());

        // Not due yet.
        let stats = m.run_recovery(T0).await.unwrap();
        assert_eq!(stats, RecoveryStats::default());

        let stats = m.run_recovery(T0.plus_secs(60)).await.unwrap();
        assert_eq!(stats.attempted, 2);
        assert_eq!(stats.recovered, 2);
        assert_eq!(stats.skipped, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(m.stats().unwrap().resolved, 2);
    }

    #[tokio::test]
    async fn test_run_recovery_failure_advances_record() {
        let (m, _) = manager();
        fail(&m, "mail-1", T0).await;
        m.register_handler(
            SOURCE,
            Arc::new(CountingHandler {
                calls: AtomicUsize::new(0),
                succeed: false,
            }),
        );
        let stats = m.run_recovery(T0.plus_secs(60)).await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(m.record("mail-1").unwrap().unwrap().retry_count, 2);
    }

    #[tokio::test]
    async fn test_release_and_cleanup() {
        let (m, _) = manager();
        fail(&m, "inbox/a.md::step-1", T0).await;
        fail(&m, "inbox/a.md::step-2", T0).await;
        fail(&m, "inbox/b.md::step-1", T0).await;

        assert_eq!(m.release("inbox/a.md::", T0).unwrap(), 2);
        assert_eq!(m.stats().unwrap().active(), 1);

        assert_eq!(m.cleanup(7, T0.plus_secs(6 * 86_400)).unwrap(), 0);
        assert_eq!(m.cleanup(7, T0.plus_secs(8 * 86_400)).unwrap(), 2);
        assert_eq!(m.records(None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_noted_failure_is_retried_by_handler() {
        let (m, _) = manager();
        let err = ExecutorError::Transient("database busy".into());
        let record = m
            .note_failure("inbox/a.md::triage", "triage", &err, Payload::new(), T0)
            .unwrap();
        assert_eq!(record.status, FailedTaskStatus::Pending);
        assert!(m.is_tracked("inbox/a.md::triage").unwrap());
        assert!(!m.is_tracked("inbox/b.md::triage").unwrap());

        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            succeed: true,
        });
        m.register_handler("triage", handler.clone());
        let stats = m.run_recovery(T0.plus_secs(60)).await.unwrap();
        assert_eq!(stats.recovered, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(!m.is_tracked("inbox/a.md::triage").unwrap());
    }
}
