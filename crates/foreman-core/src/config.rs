use std::path::{Path, PathBuf};

use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ForemanError, Result};

/// Top-level configuration for Foreman.
///
/// Loaded from `~/.foreman/config.toml` by default. Every section falls
/// back to its defaults when omitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForemanConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    #[serde(default)]
    pub capabilities: CapabilityConfig,
}

impl ForemanConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ForemanConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Load a config file if present, defaults if absent, and reject a file
    /// that exists but is malformed or fails validation.
    pub fn load_strict(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            Self::load(path)?
        } else {
            info!("No config at {}; using defaults", path.display());
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Semantic checks that TOML parsing alone cannot catch.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.general.data_dir.trim().is_empty() {
            problems.push("general.data_dir must not be empty".to_string());
        }
        if self.processing.max_cycles == 0 {
            problems.push("processing.max_cycles must be at least 1".to_string());
        }
        if self.processing.failure_threshold == 0 {
            problems.push("processing.failure_threshold must be at least 1".to_string());
        }
        if self.recovery.max_attempts == 0 {
            problems.push("recovery.max_attempts must be at least 1".to_string());
        }
        if self.recovery.max_delay_secs < self.recovery.base_delay_secs {
            problems.push("recovery.max_delay_secs must be >= base_delay_secs".to_string());
        }
        if self.recovery.invoke_timeout_secs == 0 {
            problems.push("recovery.invoke_timeout_secs must be at least 1".to_string());
        }
        if self.recovery.alert_threshold == 0 {
            problems.push("recovery.alert_threshold must be at least 1".to_string());
        }
        if self.recovery.alert_window_secs == 0 {
            problems.push("recovery.alert_window_secs must be at least 1".to_string());
        }
        if self.scheduler.cycle_interval_mins == 0 {
            problems.push("scheduler.cycle_interval_mins must be at least 1".to_string());
        }
        if self.scheduler.rotation_interval_mins == 0 {
            problems.push("scheduler.rotation_interval_mins must be at least 1".to_string());
        }
        if let Err(e) = self.scheduler.daily_time() {
            problems.push(e.to_string());
        }
        if let Err(e) = self.scheduler.weekly_time() {
            problems.push(e.to_string());
        }
        if let Err(e) = self.scheduler.weekly_weekday() {
            problems.push(e.to_string());
        }
        for (label, tag) in [
            ("capabilities.plan_execution", &self.capabilities.plan_execution),
            ("capabilities.generic", &self.capabilities.generic),
        ] {
            if tag.trim().is_empty() {
                problems.push(format!("{} must name a capability", label));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ForemanError::Config(problems.join("; ")))
        }
    }
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory for the SQLite store, journal, and lock file.
    pub data_dir: String,
    /// Inbox directory scanned for new items.
    pub inbox_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.foreman/data".to_string(),
            inbox_dir: "~/.foreman/inbox".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl GeneralConfig {
    pub fn data_path(&self) -> PathBuf {
        expand_home(&self.data_dir)
    }

    pub fn inbox_path(&self) -> PathBuf {
        expand_home(&self.inbox_dir)
    }
}

/// Autonomous processing loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Upper bound on cycles for a bounded autonomous run.
    pub max_cycles: u32,
    /// Consecutive step failures before an item is blocked.
    pub failure_threshold: u32,
    /// Hours an item may wait for an approval decision.
    pub approval_timeout_hours: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_cycles: 10,
            failure_threshold: 3,
            approval_timeout_hours: 24,
        }
    }
}

/// Retry, backoff and alert escalation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    /// Attempts after which a failed task is terminal.
    pub max_attempts: u32,
    /// Timeout applied to every capability invocation.
    pub invoke_timeout_secs: u64,
    /// Errors from one source within the window that raise an alert.
    pub alert_threshold: u32,
    pub alert_window_secs: u64,
    /// Resolved and failed records older than this are purged.
    pub keep_days: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 60,
            max_delay_secs: 3600,
            max_attempts: 3,
            invoke_timeout_secs: 120,
            alert_threshold: 3,
            alert_window_secs: 3600,
            keep_days: 7,
        }
    }
}

/// Master scheduler cadences.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval of the processing job.
    pub cycle_interval_mins: u64,
    /// Interval of the rotation job.
    pub rotation_interval_mins: u64,
    /// UTC time of the daily summary, "HH:MM".
    pub daily_report_time: String,
    /// Weekday of the weekly summary, e.g. "monday".
    pub weekly_report_day: String,
    /// UTC time of the weekly summary, "HH:MM".
    pub weekly_report_time: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cycle_interval_mins: 5,
            rotation_interval_mins: 60,
            daily_report_time: "18:00".to_string(),
            weekly_report_day: "monday".to_string(),
            weekly_report_time: "08:00".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn daily_time(&self) -> Result<NaiveTime> {
        parse_clock("scheduler.daily_report_time", &self.daily_report_time)
    }

    pub fn weekly_time(&self) -> Result<NaiveTime> {
        parse_clock("scheduler.weekly_report_time", &self.weekly_report_time)
    }

    pub fn weekly_weekday(&self) -> Result<Weekday> {
        self.weekly_report_day.parse::<Weekday>().map_err(|_| {
            ForemanError::Config(format!(
                "scheduler.weekly_report_day: unknown weekday {:?}",
                self.weekly_report_day
            ))
        })
    }
}

/// Structured journal settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Size at which a journal file is rotated.
    pub max_file_size_mb: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: 50,
        }
    }
}

/// Capability variant selected per action type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityConfig {
    /// Capability tag for items that carry a checklist.
    pub plan_execution: String,
    /// Capability tag for everything else.
    pub generic: String,
}

/// Both action types default to `review`. It completes only bookkeeping
/// steps (verify, review, archive, report and similar); any other step fails
/// permanently and blocks its item with the step named in the reason. Set a tag explicitly (`dry_run`
/// or a real capability) to get other steps executed.
impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            plan_execution: "review".to_string(),
            generic: "review".to_string(),
        }
    }
}

fn parse_clock(label: &str, value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .map_err(|e| ForemanError::Config(format!("{}: invalid time {:?}: {}", label, value, e)))
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        #[cfg(target_os = "windows")]
        let home = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(rest)
    } else {
        PathBuf::from(path)
    }
}
