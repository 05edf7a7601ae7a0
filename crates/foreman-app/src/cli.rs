//! CLI argument definitions for the Foreman application.
//!
//! Uses `clap` with derive macros for ergonomic argument parsing.
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use foreman_action::ReportPeriod;

/// Foreman: triage, plan, and work through an inbox of items.
#[derive(Parser, Debug)]
#[command(name = "foreman", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Data directory for the store, journal, and lock file.
    #[arg(short = 'd', long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Poll the inbox, run recovery, and process a single cycle.
    Once,
    /// Run the scheduler until interrupted.
    Daemon,
    /// Process the queue until it drains, stalls, or hits the cycle limit.
    Run {
        /// Overrides processing.max_cycles.
        #[arg(long = "max-cycles")]
        max_cycles: Option<u32>,
    },
    /// Generate a status report now.
    Report {
        #[arg(value_enum, default_value_t = PeriodArg::Daily)]
        period: PeriodArg,
    },
    /// Print the current status without recording a report.
    Status,
    /// Check the configuration and exit.
    Validate,
    /// Approve an item awaiting approval.
    Approve { id: String },
    /// Reject an item awaiting approval.
    Reject {
        id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Return a blocked item to the queue.
    Reset { id: String },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodArg {
    Daily,
    Weekly,
}

impl From<PeriodArg> for ReportPeriod {
    fn from(arg: PeriodArg) -> Self {
        match arg {
            PeriodArg::Daily => ReportPeriod::Daily,
            PeriodArg::Weekly => ReportPeriod::Weekly,
        }
    }
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > FOREMAN_CONFIG env var > platform default (~/.foreman/config.toml).
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("FOREMAN_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Resolve the data directory path.
    ///
    /// Returns `None` if not overridden (use config value).
    pub fn resolve_data_dir(&self) -> Option<String> {
        self.data_dir
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
    }

    /// Resolve the log level.
    ///
    /// Priority: --log-level flag > config file value.
    pub fn resolve_log_level(&self) -> Option<String> {
        self.log_level.clone()
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".foreman").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".foreman").join("config.toml");
    }
    PathBuf::from("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_with_max_cycles() {
        let args = CliArgs::try_parse_from(["foreman", "run", "--max-cycles", "4"]).unwrap();
        assert_eq!(
            args.command,
            Command::Run {
                max_cycles: Some(4)
            }
        );
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = CliArgs::try_parse_from([
            "foreman",
            "once",
            "--data-dir",
            "/tmp/fm",
            "-l",
            "debug",
        ])
        .unwrap();
        assert_eq!(args.command, Command::Once);
        assert_eq!(args.resolve_data_dir().as_deref(), Some("/tmp/fm"));
        assert_eq!(args.resolve_log_level().as_deref(), Some("debug"));
    }

    #[test]
    fn test_report_period_defaults_to_daily() {
        let args = CliArgs::try_parse_from(["foreman", "report"]).unwrap();
        assert_eq!(
            args.command,
            Command::Report {
                period: PeriodArg::Daily
            }
        );

        let args = CliArgs::try_parse_from(["foreman", "report", "weekly"]).unwrap();
        match args.command {
            Command::Report { period } => {
                assert_eq!(ReportPeriod::from(period), ReportPeriod::Weekly)
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_reject_reason_is_optional() {
        let args =
            CliArgs::try_parse_from(["foreman", "reject", "mail/42", "--reason", "not now"])
                .unwrap();
        assert_eq!(
            args.command,
            Command::Reject {
                id: "mail/42".into(),
                reason: Some("not now".into()),
            }
        );
    }

    #[test]
    fn test_missing_subcommand_is_an_error() {
        assert!(CliArgs::try_parse_from(["foreman"]).is_err());
    }

    #[test]
    fn test_config_flag_wins() {
        let args =
            CliArgs::try_parse_from(["foreman", "--config", "/etc/foreman.toml", "status"])
                .unwrap();
        assert_eq!(
            args.resolve_config_path(),
            PathBuf::from("/etc/foreman.toml")
        );
    }
}
