//! Master scheduler.
//!
//! Runs jobs on independent cadences: fixed intervals, a daily time, and a
//! weekly day and time (all UTC). Each job has a single-instance lock; a job
//! that is still running when it comes due again is skipped, not queued.
//! Missed fixed-time occurrences are never caught up: a fixed-time job runs
//! only if its target time falls inside the current check window.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Days, NaiveDate, NaiveTime, Weekday};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use foreman_core::events::{DomainEvent, EventDispatcher};
use foreman_core::types::Timestamp;
use foreman_storage::JobLedger;

use crate::error::SchedulerError;
use crate::jobs::ScheduledJob;

/// When a job comes due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Every(Duration),
    DailyAt(NaiveTime),
    WeeklyAt(Weekday, NaiveTime),
}

impl Cadence {
    pub fn every_mins(mins: u64) -> Self {
        Cadence::Every(Duration::from_secs(mins.saturating_mul(60)))
    }

    /// Whether the job should run at `now`.
    ///
    /// `window_secs` is the width of the check window for fixed-time jobs.
    pub fn is_due(&self, last_run: Option<Timestamp>, now: Timestamp, window_secs: i64) -> bool {
        match self {
            Cadence::Every(interval) => last_run.map_or(true, |last| {
                now.seconds_since(last) >= interval.as_secs() as i64
            }),
            Cadence::DailyAt(_) | Cadence::WeeklyAt(..) => {
                let Some(target) = self.latest_target(now) else {
                    return false;
                };
                let in_window = now.seconds_since(target) < window_secs;
                let already_ran = last_run.is_some_and(|last| last >= target);
                in_window && !already_ran
            }
        }
    }

    /// Most recent fixed-time occurrence at or before `now`.
    pub fn latest_target(&self, now: Timestamp) -> Option<Timestamp> {
        let today = now.to_datetime().date_naive();
        let at = |date: NaiveDate, time: NaiveTime| {
            Timestamp::from_datetime(date.and_time(time).and_utc())
        };

        match *self {
            Cadence::Every(_) => None,
            Cadence::DailyAt(time) => {
                let target = at(today, time);
                if target <= now {
                    Some(target)
                } else {
                    today.checked_sub_days(Days::new(1)).map(|d| at(d, time))
                }
            }
            Cadence::WeeklyAt(weekday, time) => {
                let back = (today.weekday().num_days_from_monday() + 7
                    - weekday.num_days_from_monday())
                    % 7;
                let date = today.checked_sub_days(Days::new(u64::from(back)))?;
                let target = at(date, time);
                if target <= now {
                    Some(target)
                } else {
                    date.checked_sub_days(Days::new(7)).map(|d| at(d, time))
                }
            }
        }
    }
}

struct JobEntry {
    job: Arc<dyn ScheduledJob>,
    cadence: Cadence,
    lock: Arc<Mutex<()>>,
}

/// Names of jobs started and skipped by one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub started: Vec<String>,
    pub skipped: Vec<String>,
}

pub struct MasterScheduler {
    jobs: Vec<JobEntry>,
    ledger: JobLedger,
    dispatcher: Arc<EventDispatcher>,
    tick_interval: Duration,
    running: Mutex<JoinSet<()>>,
    shutdown: Arc<Notify>,
}

impl MasterScheduler {
    pub fn new(ledger: JobLedger, dispatcher: Arc<EventDispatcher>, tick_interval: Duration) -> Self {
        Self {
            jobs: Vec::new(),
            ledger,
            dispatcher,
            tick_interval,
            running: Mutex::new(JoinSet::new()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn add_job(&mut self, job: Arc<dyn ScheduledJob>, cadence: Cadence) {
        info!(job = job.name(), cadence = ?cadence, "Job scheduled");
        self.jobs.push(JobEntry {
            job,
            cadence,
            lock: Arc::new(Mutex::new(())),
        });
    }

    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.iter().map(|e| e.job.name()).collect()
    }

    /// Start every job that is due at `now`. Jobs run in the background.
    pub async fn tick(&self, now: Timestamp) -> Result<TickReport, SchedulerError> {
        let mut report = TickReport::default();
        let window = self.tick_interval.as_secs().max(1) as i64;
        let mut running = self.running.lock().await;
        reap(&mut running);

        for entry in &self.jobs {
            let name = entry.job.name().to_string();
            let last_run = self.ledger.last_run(&name)?;
            if !entry.cadence.is_due(last_run, now, window) {
                continue;
            }

            let guard = match Arc::clone(&entry.lock).try_lock_owned() {
                Ok(guard) => guard,
                Err(_) => {
                    warn!(job = %name, "Job still running; skipped");
                    self.dispatcher.publish(DomainEvent::JobSkipped {
                        job: name.clone(),
                        reason: "previous run still in progress".to_string(),
                    });
                    report.skipped.push(name);
                    continue;
                }
            };

            self.ledger.record_run(&name, now)?;
            let job = Arc::clone(&entry.job);
            let dispatcher = Arc::clone(&self.dispatcher);
            debug!(job = %name, "Job started");
            report.started.push(name.clone());
            running.spawn(async move {
                let _guard = guard;
                match job.run(now).await {
                    Ok(()) => debug!(job = %name, "Job finished"),
                    Err(e) => {
                        error!(job = %name, error = %e, "Job failed");
                        dispatcher.publish(DomainEvent::JobFailed {
                            job: name,
                            error: e.to_string(),
                        });
                    }
                }
            });
        }
        Ok(report)
    }

    /// Run one job immediately, outside its cadence.
    pub async fn run_job_now(&self, name: &str, now: Timestamp) -> Result<(), SchedulerError> {
        let entry = self
            .jobs
            .iter()
            .find(|e| e.job.name() == name)
            .ok_or_else(|| SchedulerError::JobNotFound(name.to_string()))?;
        let _guard = Arc::clone(&entry.lock)
            .try_lock_owned()
            .map_err(|_| SchedulerError::AlreadyRunning(name.to_string()))?;

        self.ledger.record_run(name, now)?;
        entry.job.run(now).await
    }

    /// Wait for every background job started so far.
    pub async fn wait_idle(&self) {
        let mut running = self.running.lock().await;
        while let Some(result) = running.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Job task aborted");
            }
        }
    }

    /// Tick on the configured interval until `shutdown` is called.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(jobs = ?self.job_names(), tick_secs = self.tick_interval.as_secs(), "Scheduler started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Timestamp::now()).await {
                        error!(error = %e, "Scheduler tick failed");
                    }
                }
                _ = self.shutdown.notified() => break,
            }
        }

        self.wait_idle().await;
        info!("Scheduler stopped");
    }

    /// Signal the scheduler to shut down gracefully.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

/// Collect finished background jobs so panics get logged.
fn reap(running: &mut JoinSet<()>) {
    while let Some(result) = running.try_join_next() {
        if let Err(e) = result {
            error!(error = %e, "Job task aborted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use foreman_core::events::topics;
    use foreman_storage::Database;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> Timestamp {
        Timestamp::from_datetime(Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap())
    }

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    struct CountingJob {
        name: &'static str,
        runs: AtomicUsize,
        fail: bool,
        gate: Option<Arc<Notify>>,
    }

    impl CountingJob {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                runs: AtomicUsize::new(0),
                fail: false,
                gate: None,
            })
        }
    }

    #[async_trait]
    impl ScheduledJob for CountingJob {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&self, _now: Timestamp) -> Result<(), SchedulerError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail {
                return Err(SchedulerError::Failed("disk full".into()));
            }
            Ok(())
        }
    }

    fn scheduler() -> (MasterScheduler, Arc<EventDispatcher>) {
        let db = Arc::new(Database::in_memory().unwrap());
        let dispatcher = Arc::new(EventDispatcher::new());
        (
            MasterScheduler::new(
                JobLedger::new(db),
                Arc::clone(&dispatcher),
                Duration::from_secs(60),
            ),
            dispatcher,
        )
    }

    #[test]
    fn test_interval_cadence() {
        let c = Cadence::every_mins(5);
        let t = at(2024, 1, 1, 12, 0, 0);
        assert!(c.is_due(None, t, 60));
        assert!(!c.is_due(Some(t), t.plus_secs(299), 60));
        assert!(c.is_due(Some(t), t.plus_secs(300), 60));
    }

    #[test]
    fn test_daily_runs_only_inside_window() {
        let c = Cadence::DailyAt(time(18, 0));
        assert!(c.is_due(None, at(2024, 1, 1, 18, 0, 30), 60));
        // Missed by more than one window: skipped, not caught up.
        assert!(!c.is_due(None, at(2024, 1, 1, 18, 2, 0), 60));
        assert!(!c.is_due(None, at(2024, 1, 1, 17, 59, 59), 60));
        // Already ran for this occurrence.
        assert!(!c.is_due(
            Some(at(2024, 1, 1, 18, 0, 5)),
            at(2024, 1, 1, 18, 0, 50),
            60
        ));
        // Yesterday's run does not block today's.
        assert!(c.is_due(
            Some(at(2023, 12, 31, 18, 0, 5)),
            at(2024, 1, 1, 18, 0, 5),
            60
        ));
    }

    #[test]
    fn test_latest_target_daily() {
        let c = Cadence::DailyAt(time(18, 0));
        assert_eq!(
            c.latest_target(at(2024, 1, 2, 9, 0, 0)),
            Some(at(2024, 1, 1, 18, 0, 0))
        );
        assert_eq!(c.latest_target(at(2024, 1, 2, 18, 0, 0)), Some(at(2024, 1, 2, 18, 0, 0)));
        assert_eq!(Cadence::every_mins(1).latest_target(at(2024, 1, 2, 18, 0, 0)), None);
    }

    #[test]
    fn test_weekly_cadence() {
        // 2024-01-01 is a Monday.
        let c = Cadence::WeeklyAt(Weekday::Mon, time(8, 0));
        assert!(c.is_due(None, at(2024, 1, 1, 8, 0, 10), 60));
        assert!(!c.is_due(None, at(2024, 1, 2, 8, 0, 10), 60));
        assert_eq!(
            c.latest_target(at(2024, 1, 3, 12, 0, 0)),
            Some(at(2024, 1, 1, 8, 0, 0))
        );
        assert_eq!(
            c.latest_target(at(2024, 1, 8, 7, 0, 0)),
            Some(at(2024, 1, 1, 8, 0, 0))
        );
        assert_eq!(
            c.latest_target(at(2024, 1, 8, 8, 0, 0)),
            Some(at(2024, 1, 8, 8, 0, 0))
        );
    }

    #[tokio::test]
    async fn test_tick_runs_due_jobs_and_records_them() {
        let (mut s, _) = scheduler();
        let fast = CountingJob::new("fast");
        let daily = CountingJob::new("daily");
        s.add_job(fast.clone(), Cadence::every_mins(5));
        s.add_job(daily.clone(), Cadence::DailyAt(time(18, 0)));

        let t = at(2024, 1, 1, 12, 0, 0);
        let report = s.tick(t).await.unwrap();
        assert_eq!(report.started, vec!["fast".to_string()]);
        s.wait_idle().await;

        let report = s.tick(t.plus_secs(60)).await.unwrap();
        assert!(report.started.is_empty());

        let report = s.tick(at(2024, 1, 1, 18, 0, 20)).await.unwrap();
        assert_eq!(report.started, vec!["fast".to_string(), "daily".to_string()]);
        s.wait_idle().await;

        assert_eq!(fast.runs.load(Ordering::SeqCst), 2);
        assert_eq!(daily.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_overlapping_run_is_skipped() {
        let (mut s, dispatcher) = scheduler();
        let gate = Arc::new(Notify::new());
        let slow = Arc::new(CountingJob {
            name: "slow",
            runs: AtomicUsize::new(0),
            fail: false,
            gate: Some(Arc::clone(&gate)),
        });
        s.add_job(slow.clone(), Cadence::Every(Duration::ZERO));

        let t = at(2024, 1, 1, 12, 0, 0);
        assert_eq!(s.tick(t).await.unwrap().started.len(), 1);
        let report = s.tick(t.plus_secs(1)).await.unwrap();
        assert_eq!(report.skipped, vec!["slow".to_string()]);

        let err = s.run_job_now("slow", t).await.unwrap_err();
        assert!(matches!(err, SchedulerError::AlreadyRunning(_)));

        gate.notify_one();
        s.wait_idle().await;
        assert_eq!(slow.runs.load(Ordering::SeqCst), 1);

        let skipped = dispatcher
            .history()
            .iter()
            .filter(|r| r.topic == topics::JOB_SKIPPED)
            .count();
        assert_eq!(skipped, 1);
    }

    #[tokio::test]
    async fn test_failing_job_is_isolated() {
        let (mut s, dispatcher) = scheduler();
        let bad = Arc::new(CountingJob {
            name: "bad",
            runs: AtomicUsize::new(0),
            fail: true,
            gate: None,
        });
        let good = CountingJob::new("good");
        s.add_job(bad, Cadence::every_mins(5));
        s.add_job(good.clone(), Cadence::every_mins(5));

        let report = s.tick(at(2024, 1, 1, 12, 0, 0)).await.unwrap();
        assert_eq!(report.started.len(), 2);
        s.wait_idle().await;

        assert_eq!(good.runs.load(Ordering::SeqCst), 1);
        let failed: Vec<_> = dispatcher
            .history()
            .into_iter()
            .filter(|r| r.topic == topics::JOB_FAILED)
            .collect();
        assert_eq!(failed.len(), 1);
    }

    #[tokio::test]
    async fn test_ledger_survives_restart() {
        let db = Arc::new(Database::in_memory().unwrap());
        let dispatcher = Arc::new(EventDispatcher::new());
        let job = CountingJob::new("daily");
        let t = at(2024, 1, 1, 18, 0, 10);

        let mut first = MasterScheduler::new(
            JobLedger::new(Arc::clone(&db)),
            Arc::clone(&dispatcher),
            Duration::from_secs(60),
        );
        first.add_job(job.clone(), Cadence::DailyAt(time(18, 0)));
        first.tick(t).await.unwrap();
        first.wait_idle().await;

        let mut second =
            MasterScheduler::new(JobLedger::new(db), dispatcher, Duration::from_secs(60));
        second.add_job(job.clone(), Cadence::DailyAt(time(18, 0)));
        let report = second.tick(t.plus_secs(30)).await.unwrap();
        assert!(report.started.is_empty());
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_job_now_unknown() {
        let (s, _) = scheduler();
        let err = s
            .run_job_now("nope", Timestamp::now())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn test_scheduler_shutdown() {
        let (mut s, _) = scheduler();
        s.add_job(CountingJob::new("fast"), Cadence::every_mins(5));
        let s = Arc::new(s);
        let runner = Arc::clone(&s);
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        s.shutdown();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }
}
