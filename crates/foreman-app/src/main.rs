//! Foreman application binary - composition root.
//!
//! Ties together all Foreman crates into a single executable:
//! 1. Load and validate configuration from TOML
//! 2. Take the store lock, open SQLite and the journal
//! 3. Subscribe journal writers on the event dispatcher
//! 4. Build the processor, recovery handlers, and scheduled jobs
//! 5. Dispatch the requested subcommand

mod cli;
mod inbox;
mod sink;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use foreman_action::{
    ingest, register_retry_handlers, Cadence, CapabilityRegistry, CycleJob, MasterScheduler, NotificationSource, Processor,
    RecoveryManager, ReportJob, ReportPeriod, RotationJob, StatusSummary,
};
use foreman_core::config::ForemanConfig;
use foreman_core::events::EventDispatcher;
use foreman_core::journal::Journal;
use foreman_core::types::{ItemId, Timestamp};
use foreman_storage::{Database, ItemStore, JobLedger, StoreLock};

use cli::{CliArgs, Command};
use inbox::DirectorySource;

const TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Everything a subcommand may need, alive for the process lifetime.
struct Engine {
    _lock: StoreLock,
    journal: Arc<Journal>,
    inbox: Arc<DirectorySource>,
    processor: Arc<Processor>,
    scheduler: MasterScheduler,
}

fn build_registry(config: &ForemanConfig) -> Result<CapabilityRegistry, Box<dyn std::error::Error>> {
    let mut registry = CapabilityRegistry::new();
    registry.register_defaults();
    registry.validate(&config.capabilities)?;
    Ok(registry)
}

fn build_engine(config: &ForemanConfig) -> Result<Engine, Box<dyn std::error::Error>> {
    // Storage.
    let data_dir = config.general.data_path();
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::error!(path = %data_dir.display(), error = %e, "Failed to create data directory");
        return Err(e.into());
    }
    let lock = StoreLock::acquire(&data_dir)?;

    let db_path = data_dir.join("foreman.db");
    let db = Arc::new(Database::new(&db_path)?);
    tracing::info!(path = %db_path.display(), "SQLite database opened");

    let journal = Arc::new(Journal::open(
        &data_dir.join("logs"),
        config.journal.max_file_size_mb,
    )?);

    // Events.
    let dispatcher = Arc::new(EventDispatcher::new());
    sink::attach(&dispatcher, &journal);

    // Processing.
    let registry = build_registry(config)?;
    let recovery = Arc::new(RecoveryManager::new(
        Arc::clone(&db),
        Arc::clone(&dispatcher),
        config.recovery.clone(),
    ));
    let processor = Arc::new(Processor::new(
        Arc::new(ItemStore::new(Arc::clone(&db))),
        Arc::clone(&dispatcher),
        Arc::new(registry),
        Arc::clone(&recovery),
        config.processing.clone(),
        config.capabilities.clone(),
    ));

    let inbox = Arc::new(DirectorySource::new(config.general.inbox_path())?);
    tracing::info!(path = %inbox.dir().display(), "Watching inbox");

    // Scheduler.
    let sched = &config.scheduler;
    let mut scheduler = MasterScheduler::new(
        JobLedger::new(Arc::clone(&db)),
        Arc::clone(&dispatcher),
        TICK_INTERVAL,
    );
    let inbox_source: Arc<dyn NotificationSource> = inbox.clone();
    let sources = vec![inbox_source];
    register_retry_handlers(&processor, &sources);
    scheduler.add_job(
        Arc::new(CycleJob::new(Arc::clone(&processor), sources)),
        Cadence::every_mins(sched.cycle_interval_mins),
    );
    scheduler.add_job(
        Arc::new(RotationJob::new(Arc::clone(&journal), recovery)),
        Cadence::every_mins(sched.rotation_interval_mins),
    );
    scheduler.add_job(
        Arc::new(ReportJob::new(
            ReportPeriod::Daily,
            Arc::clone(&processor),
            Arc::clone(&journal),
            Arc::clone(&dispatcher),
        )),
        Cadence::DailyAt(sched.daily_time()?),
    );
    scheduler.add_job(
        Arc::new(ReportJob::new(
            ReportPeriod::Weekly,
            Arc::clone(&processor),
            Arc::clone(&journal),
            Arc::clone(&dispatcher),
        )),
        Cadence::WeeklyAt(sched.weekly_weekday()?, sched.weekly_time()?),
    );

    Ok(Engine {
        _lock: lock,
        journal,
        inbox,
        processor,
        scheduler,
    })
}

fn print_status(engine: &Engine, period: ReportPeriod) -> Result<(), Box<dyn std::error::Error>> {
    let now = Timestamp::now();
    let since = now.plus_secs(-period.lookback_secs());
    let summary = StatusSummary::collect(&engine.processor, &engine.journal, since, now)?;
    print!("{}", summary.render());
    Ok(())
}

/// Run the scheduler until Ctrl-C, then let in-flight jobs finish.
async fn run_daemon(scheduler: MasterScheduler) -> Result<(), Box<dyn std::error::Error>> {
    let scheduler = Arc::new(scheduler);
    let runner = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run().await })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    scheduler.shutdown();
    runner.await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config. A malformed or invalid file stops us before anything is scheduled.
    let config_file = args.resolve_config_path();
    let mut config = match ForemanConfig::load_strict(&config_file) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration {}: {}", config_file.display(), e);
            return Err(e.into());
        }
    };
    if let Some(dir) = args.resolve_data_dir() {
        config.general.data_dir = dir;
    }
    if let Some(level) = args.resolve_log_level() {
        config.general.log_level = level;
    }

    // Tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.general.log_level)),
        )
        .init();

    tracing::info!("Starting Foreman v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(path = %config_file.display(), "Configuration loaded");

    if args.command == Command::Validate {
        let registry = build_registry(&config)?;
        let failed = registry.authenticate_all().await;
        if !failed.is_empty() {
            return Err(format!("capabilities failed authentication: {}", failed.join(", ")).into());
        }
        println!("Configuration OK: {}", config_file.display());
        return Ok(());
    }

    let engine = build_engine(&config)?;
    let now = Timestamp::now();

    match args.command {
        Command::Validate => {}
        Command::Once => {
            engine.scheduler.run_job_now(CycleJob::NAME, now).await?;
            print_status(&engine, ReportPeriod::Daily)?;
        }
        Command::Daemon => {
            let counts = engine.processor.store().stage_counts()?;
            tracing::info!(
                received = counts.received,
                working = counts.working,
                archived = counts.archived,
                "Store ready"
            );
            run_daemon(engine.scheduler).await?;
        }
        Command::Run { max_cycles } => {
            let report = ingest(engine.inbox.as_ref(), &engine.processor, now).await?;
            tracing::info!(received = report.received, duplicates = report.duplicates, "Inbox ingested");
            engine.processor.triage_pending(now)?;
            engine.processor.recovery().run_recovery(now).await?;

            let max_cycles = max_cycles.unwrap_or(config.processing.max_cycles);
            let summary = engine.processor.run(max_cycles).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Report { period } => {
            let period = ReportPeriod::from(period);
            engine.scheduler.run_job_now(period.job_name(), now).await?;
            print_status(&engine, period)?;
        }
        Command::Status => print_status(&engine, ReportPeriod::Daily)?,
        Command::Approve { id } => {
            let item = engine.processor.approvals().approve(&ItemId::from_raw(id), now)?;
            println!("{} approved ({})", item.id, item.status);
        }
        Command::Reject { id, reason } => {
            let item = engine
                .processor
                .approvals()
                .reject(&ItemId::from_raw(id), reason.as_deref(), now)?;
            println!("{} rejected and archived", item.id);
        }
        Command::Reset { id } => {
            let item = engine.processor.reset_blocked(&ItemId::from_raw(id), now)?;
            println!("{} reset ({})", item.id, item.status);
        }
    }

    Ok(())
}
