//! Single-instance lock on the data directory.
//!
//! Two engines processing the same store would race on moves and plans, so
//! the binary takes an exclusive advisory lock before it touches the store.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use foreman_core::error::ForemanError;

const LOCK_FILE: &str = "foreman.lock";

/// Held for the lifetime of the process; released on drop.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    /// Take the lock in `dir`, failing fast if another process holds it.
    pub fn acquire(dir: &Path) -> Result<Self, ForemanError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        file.try_lock_exclusive().map_err(|e| {
            ForemanError::Concurrency(format!(
                "another instance holds {} ({})",
                path.display(),
                e
            ))
        })?;

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;
        debug!(path = %path.display(), "Store lock acquired");

        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!(path = %self.path.display(), error = %e, "Failed to release store lock");
        }
    }
}
