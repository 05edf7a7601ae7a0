//! Durable JSON Lines journal for errors and audit records.
//!
//! `error.log` and `audit.log` live in the journal directory, one JSON
//! object per line. Files past the size limit are moved into `archive/`.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::{ForemanError, Result};

const ERROR_LOG: &str = "error.log";
const AUDIT_LOG: &str = "audit.log";
const ARCHIVE_DIR: &str = "archive";

/// Severity of a journaled error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

/// One line of `error.log`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub source: String,
    pub message: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub resolved: bool,
}

impl ErrorEntry {
    pub fn new(severity: Severity, source: &str, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            severity,
            source: source.to_string(),
            message: message.into(),
            context: Map::new(),
            retry_count: 0,
            resolved: false,
        }
    }

    pub fn with_context(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// One line of `audit.log`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub status: String,
    #[serde(default)]
    pub details: Map<String, Value>,
}

/// Append-only JSONL journal with size-based rotation.
pub struct Journal {
    dir: PathBuf,
    max_bytes: u64,
    write_lock: Mutex<()>,
}

impl Journal {
    /// Open (creating if needed) a journal rooted at `dir`.
    pub fn open(dir: &Path, max_file_size_mb: u64) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            max_bytes: max_file_size_mb.saturating_mul(1024 * 1024),
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn error_log_path(&self) -> PathBuf {
        self.dir.join(ERROR_LOG)
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.dir.join(AUDIT_LOG)
    }

    pub fn log_error(&self, entry: &ErrorEntry) -> Result<()> {
        self.append(&self.error_log_path(), entry)
    }

    pub fn audit(&self, action: &str, status: &str, details: Map<String, Value>) -> Result<()> {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            action: action.to_string(),
            status: status.to_string(),
            details,
        };
        self.append(&self.audit_log_path(), &entry)
    }

    /// The last `limit` error entries, oldest first. Malformed lines are skipped.
    pub fn recent_errors(&self, limit: usize) -> Result<Vec<ErrorEntry>> {
        let mut entries: Vec<ErrorEntry> = read_lines(&self.error_log_path())?;
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.split_off(skip))
    }

    pub fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let mut entries: Vec<AuditEntry> = read_lines(&self.audit_log_path())?;
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.split_off(skip))
    }

    /// Errors logged at or after `since`.
    pub fn error_count_since(&self, since: DateTime<Utc>) -> Result<usize> {
        let entries: Vec<ErrorEntry> = read_lines(&self.error_log_path())?;
        Ok(entries.iter().filter(|e| e.timestamp >= since).count())
    }

    /// Rotate each journal file that has grown past the size limit.
    ///
    /// Returns the archive paths that were written.
    pub fn rotate_if_needed(&self) -> Result<Vec<PathBuf>> {
        let _guard = self.lock()?;
        let mut rotated = Vec::new();
        for path in [self.error_log_path(), self.audit_log_path()] {
            let size = match std::fs::metadata(&path) {
                Ok(meta) => meta.len(),
                Err(_) => continue,
            };
            if size >= self.max_bytes {
                rotated.push(self.archive(&path)?);
            }
        }
        Ok(rotated)
    }

    /// Rotate every non-empty journal file regardless of size.
    pub fn force_rotate(&self) -> Result<Vec<PathBuf>> {
        let _guard = self.lock()?;
        let mut rotated = Vec::new();
        for path in [self.error_log_path(), self.audit_log_path()] {
            if std::fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false) {
                rotated.push(self.archive(&path)?);
            }
        }
        Ok(rotated)
    }

    fn archive(&self, path: &Path) -> Result<PathBuf> {
        let archive_dir = self.dir.join(ARCHIVE_DIR);
        std::fs::create_dir_all(&archive_dir)?;

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("journal");
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let mut target = archive_dir.join(format!("{}_{}.log", stem, stamp));
        let mut n = 2;
        while target.exists() {
            target = archive_dir.join(format!("{}_{}_{}.log", stem, stamp, n));
            n += 1;
        }

        std::fs::rename(path, &target)?;
        info!(from = %path.display(), to = %target.display(), "Journal rotated");
        Ok(target)
    }

    fn append<T: Serialize>(&self, path: &Path, entry: &T) -> Result<()> {
        let line = serde_json::to_string(entry)?;
        let _guard = self.lock()?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|e| ForemanError::Storage(format!("Journal lock poisoned: {}", e)))
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal").field("dir", &self.dir).finish()
    }
}

fn read_lines<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping malformed journal line"),
        }
    }
    Ok(entries)
}
