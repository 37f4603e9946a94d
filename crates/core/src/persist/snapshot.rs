use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dispatch::budget::BudgetState;
use crate::types::{Task, TaskStatus, Trigger};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot serialize snapshot: {0}")]
    Encode(#[from] serde_json::Error),
    /// Primary and backup are both unreadable. Fatal at boot.
    #[error("snapshot {path} and its backup are corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("snapshot worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Monotonic counters carried across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursors {
    pub next_task_seq: u64,
    pub next_result_seq: u64,
}

impl Default for Cursors {
    fn default() -> Self {
        Self {
            next_task_seq: 1,
            next_result_seq: 1,
        }
    }
}

/// Everything the dispatcher needs to resume after a crash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub cursors: Cursors,
    #[serde(default)]
    pub budget: BudgetState,
}

impl RuntimeSnapshot {
    pub fn new(tasks: Vec<Task>, triggers: Vec<Trigger>, cursors: Cursors, budget: BudgetState) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            tasks,
            triggers,
            cursors,
            budget,
        }
    }

    /// Tasks that were running when the process died go back to the queue.
    fn requeue_interrupted(&mut self) -> usize {
        let mut requeued = 0;
        for task in &mut self.tasks {
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Pending;
                task.started_at = None;
                requeued += 1;
            }
        }
        requeued
    }
}

/// Snapshot file with a rolling `.bak` copy and atomic replace.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        with_suffix(&self.path, "bak")
    }

    fn temp_path(&self) -> PathBuf {
        with_suffix(&self.path, "tmp")
    }

    /// Copy the current primary to `.bak`, then replace the primary via temp file + rename.
    pub fn save(&self, snapshot: &RuntimeSnapshot) -> Result<(), SnapshotError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| SnapshotError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let json = serde_json::to_string_pretty(snapshot)?;

        if self.path.exists() {
            let backup = self.backup_path();
            std::fs::copy(&self.path, &backup).map_err(|source| SnapshotError::Io {
                path: backup,
                source,
            })?;
        }

        let tmp = self.temp_path();
        std::fs::write(&tmp, json).map_err(|source| SnapshotError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| SnapshotError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }

    /// [`save`](Self::save) on the blocking pool, off the runtime's workers.
    pub async fn spawn_save(&self, snapshot: RuntimeSnapshot) -> Result<(), SnapshotError> {
        let file = self.clone();
        tokio::task::spawn_blocking(move || file.save(&snapshot)).await?
    }

    /// [`load`](Self::load) on the blocking pool.
    pub async fn spawn_load(&self) -> Result<Option<RuntimeSnapshot>, SnapshotError> {
        let file = self.clone();
        tokio::task::spawn_blocking(move || file.load()).await?
    }

    /// Load the primary, falling back to `.bak`. `Ok(None)` on first boot.
    ///
    /// Interrupted `running` tasks are downgraded to `pending`.
    pub fn load(&self) -> Result<Option<RuntimeSnapshot>, SnapshotError> {
        let primary = match read_snapshot(&self.path) {
            Ok(Some(snapshot)) => Ok(snapshot),
            Ok(None) => Err("primary missing".to_string()),
            Err(reason) => {
                tracing::warn!(path = %self.path.display(), %reason, "snapshot unreadable, trying backup");
                Err(reason)
            }
        };

        let mut snapshot = match primary {
            Ok(snapshot) => snapshot,
            Err(primary_reason) => match read_snapshot(&self.backup_path()) {
                Ok(Some(snapshot)) => {
                    tracing::warn!(path = %self.backup_path().display(), "restored snapshot from backup");
                    snapshot
                }
                Ok(None) if primary_reason == "primary missing" => return Ok(None),
                Ok(None) => {
                    return Err(SnapshotError::Corrupt {
                        path: self.path.clone(),
                        reason: format!("{primary_reason}; no backup"),
                    });
                }
                Err(backup_reason) => {
                    return Err(SnapshotError::Corrupt {
                        path: self.path.clone(),
                        reason: format!("{primary_reason}; backup: {backup_reason}"),
                    });
                }
            },
        };

        let requeued = snapshot.requeue_interrupted();
        if requeued > 0 {
            tracing::info!(requeued, "requeued tasks interrupted by restart");
        }
        Ok(Some(snapshot))
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// `Ok(None)` when the file does not exist; `Err(reason)` when it exists but is unusable.
fn read_snapshot(path: &Path) -> Result<Option<RuntimeSnapshot>, String> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(format!("cannot read: {e}")),
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| format!("cannot parse: {e}"))
}
