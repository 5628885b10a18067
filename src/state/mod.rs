//! Per-post download status, persisted as a JSON object `{id: status}`.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Downloaded,
    Skipped,
    Failed,
}

/// Why a post is not attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyDownloaded,
    PreviouslySkipped,
    PreviouslyFailed,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AlreadyDownloaded => "already downloaded",
            Self::PreviouslySkipped => "previously skipped",
            Self::PreviouslyFailed => "previously failed",
        })
    }
}

/// In-memory status map backed by a file.
#[derive(Debug)]
pub struct StatusStore {
    path: PathBuf,
    items: BTreeMap<String, ItemStatus>,
}

impl StatusStore {
    /// Load the store from `path`.
    ///
    /// A missing file starts an empty store; so does an unreadable one, with a warning.
    #[must_use]
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let items = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Status file is corrupt, starting empty");
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read status file, starting empty");
                BTreeMap::new()
            }
        };
        debug!(path = %path.display(), count = items.len(), "Loaded status store");
        Self { path, items }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<ItemStatus> {
        self.items.get(id).copied()
    }

    /// Record `status` for `id`, returning whether anything changed.
    ///
    /// `Downloaded` and `Skipped` are final. `Failed` can only move to `Downloaded`.
    pub fn record(&mut self, id: &str, status: ItemStatus) -> bool {
        match (self.get(id), status) {
            (None, _) | (Some(ItemStatus::Failed), ItemStatus::Downloaded) => {
                self.items.insert(id.to_string(), status);
                true
            }
            _ => false,
        }
    }

    /// Reason to leave `id` alone this run, if any.
    #[must_use]
    pub fn skip_reason(&self, id: &str, skip_failed: bool) -> Option<SkipReason> {
        match self.get(id)? {
            ItemStatus::Downloaded => Some(SkipReason::AlreadyDownloaded),
            ItemStatus::Skipped => Some(SkipReason::PreviouslySkipped),
            ItemStatus::Failed if skip_failed => Some(SkipReason::PreviouslyFailed),
            ItemStatus::Failed => None,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of ids with `status`.
    #[must_use]
    pub fn count(&self, status: ItemStatus) -> usize {
        self.items.values().filter(|s| **s == status).count()
    }

    /// Write the whole map, replacing the file atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the temporary file cannot be written or renamed.
    pub fn save(&self) -> Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

        let json = serde_json::to_vec_pretty(&self.items).context("Failed to serialize status")?;
        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
        tmp.write_all(&json).context("Failed to write status")?;
        tmp.as_file().sync_all().context("Failed to sync status")?;
        tmp.persist(&self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        debug!(path = %self.path.display(), count = self.items.len(), "Saved status store");
        Ok(())
    }
}
