use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("journal io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot encode journal record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Append-only JSON Lines file.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append<T: Serialize>(&self, record: &T) -> Result<(), JournalError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| self.io_err(source))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| self.io_err(source))?;
        file.write_all(line.as_bytes())
            .map_err(|source| self.io_err(source))
    }

    /// All decodable records in append order. Torn or foreign lines are skipped.
    pub fn read_all<T: DeserializeOwned>(&self) -> Result<Vec<T>, JournalError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(self.io_err(source)),
        };
        let mut records = Vec::new();
        for (lineno, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(
                    path = %self.path.display(),
                    line = lineno + 1,
                    error = %e,
                    "skipping malformed journal line"
                ),
            }
        }
        Ok(records)
    }

    fn io_err(&self, source: std::io::Error) -> JournalError {
        JournalError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

// ── Feedback log ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    /// A task was held back by the daily token budget.
    BudgetDeferred,
    /// One execution attempt failed.
    TaskAttemptFailed,
    /// Recorded by the manager or a human.
    External,
}

/// Numbered signal consumed by self-evolve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEvent {
    pub seq: u64,
    pub kind: FeedbackKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub detail: String,
    pub at: DateTime<Utc>,
}

/// Feedback journal plus a consumer watermark (last consumed `seq`).
#[derive(Debug)]
pub struct FeedbackLog {
    journal: Journal,
    watermark_path: PathBuf,
    next_seq: AtomicU64,
}

impl FeedbackLog {
    /// Open the log under `dir`, resuming numbering after the last recorded event.
    pub fn open(dir: &Path) -> Result<Self, JournalError> {
        let journal = Journal::new(dir.join("feedback.jsonl"));
        let last = journal
            .read_all::<FeedbackEvent>()?
            .iter()
            .map(|e| e.seq)
            .max()
            .unwrap_or(0);
        Ok(Self {
            journal,
            watermark_path: dir.join("feedback.watermark"),
            next_seq: AtomicU64::new(last + 1),
        })
    }

    pub fn record(
        &self,
        kind: FeedbackKind,
        task_id: Option<&str>,
        detail: impl Into<String>,
    ) -> Result<u64, JournalError> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.journal.append(&FeedbackEvent {
            seq,
            kind,
            task_id: task_id.map(String::from),
            detail: detail.into(),
            at: Utc::now(),
        })?;
        Ok(seq)
    }

    /// Last consumed `seq`; 0 when nothing was consumed yet.
    pub fn watermark(&self) -> Result<u64, JournalError> {
        match std::fs::read_to_string(&self.watermark_path) {
            Ok(raw) => Ok(raw.trim().parse().unwrap_or(0)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(source) => Err(JournalError::Io {
                path: self.watermark_path.clone(),
                source,
            }),
        }
    }

    pub fn set_watermark(&self, seq: u64) -> Result<(), JournalError> {
        std::fs::write(&self.watermark_path, seq.to_string()).map_err(|source| JournalError::Io {
            path: self.watermark_path.clone(),
            source,
        })
    }

    /// Events recorded after `watermark`, in order.
    pub fn since(&self, watermark: u64) -> Result<Vec<FeedbackEvent>, JournalError> {
        Ok(self
            .journal
            .read_all::<FeedbackEvent>()?
            .into_iter()
            .filter(|e| e.seq > watermark)
            .collect())
    }
}
