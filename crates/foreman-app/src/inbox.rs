//! Inbox directory as a notification source.
//!
//! A `*.md` file is reported on the first poll that sees it, and again only
//! when its modification time or size changes. The ledger lives in memory,
//! so a restart reports everything once more; the store deduplicates by
//! `inbox/<file name>`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::{debug, warn};

use foreman_action::NotificationSource;
use foreman_core::error::ForemanError;
use foreman_core::types::NewItem;

pub const INBOX_ORIGIN: &str = "inbox";

/// What a file looked like when it was last reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Seen {
    modified: Option<SystemTime>,
    len: u64,
}

pub struct DirectorySource {
    dir: PathBuf,
    seen: Mutex<HashMap<PathBuf, Seen>>,
}

impl DirectorySource {
    /// Watch `dir`, creating it if needed.
    pub fn new(dir: PathBuf) -> Result<Self, ForemanError> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            seen: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl NotificationSource for DirectorySource {
    fn name(&self) -> &str {
        INBOX_ORIGIN
    }

    async fn poll(&self) -> Result<Vec<NewItem>, ForemanError> {
        let mut present = HashMap::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let meta = entry.metadata().await?;
            if meta.is_file() {
                let seen = Seen {
                    modified: meta.modified().ok(),
                    len: meta.len(),
                };
                present.insert(path, seen);
            }
        }

        let mut paths: Vec<(PathBuf, Seen)> = {
            let mut ledger = self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            ledger.retain(|path, _| present.contains_key(path));
            present
                .into_iter()
                .filter(|(path, seen)| ledger.get(path) != Some(seen))
                .collect()
        };
        paths.sort_by(|a, b| a.0.cmp(&b.0));

        let mut items = Vec::with_capacity(paths.len());
        for (path, seen) in paths {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                warn!(path = %path.display(), "Skipping inbox file with non-UTF-8 name");
                continue;
            };
            let body = match tokio::fs::read_to_string(&path).await {
                Ok(body) => body,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read inbox file");
                    continue;
                }
            };
            self.seen
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(path.clone(), seen);
            items.push(NewItem {
                origin: INBOX_ORIGIN.to_string(),
                name: name.to_string(),
                title: title_of(&path, &body),
                body,
            });
        }

        debug!(dir = %self.dir.display(), count = items.len(), "Inbox polled");
        Ok(items)
    }
}

/// First `# ` heading, else the file stem.
fn title_of(path: &Path, body: &str) -> String {
    body.lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("# "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default()
        })
}
