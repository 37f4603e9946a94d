use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::persist::{Journal, JournalError};
use crate::types::{Task, TaskKind, TaskResult, TaskStatus};

/// Per-task archive documents plus the task journal.
#[derive(Debug)]
pub struct Archive {
    root: PathBuf,
    journal: Journal,
}

/// One line of the task journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub task_id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_trigger_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_path: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Serialize)]
struct ArchiveDoc<'a> {
    task: &'a Task,
    result: &'a TaskResult,
}

impl Archive {
    pub fn new(root: impl Into<PathBuf>, journal: Journal) -> Self {
        Self {
            root: root.into(),
            journal,
        }
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Write `archive/<date>/<task_id>.json` and append the journal line.
    /// Returns the archive path.
    pub fn record(&self, task: &Task, result: &TaskResult) -> Result<String, JournalError> {
        let day_dir = self
            .root
            .join(result.completed_at.format("%Y-%m-%d").to_string());
        let path = day_dir.join(format!("{}.json", task.id));
        let io_err = |source| JournalError::Io {
            path: path.clone(),
            source,
        };
        std::fs::create_dir_all(&day_dir).map_err(io_err)?;
        let json = serde_json::to_string_pretty(&ArchiveDoc { task, result })?;
        std::fs::write(&path, json).map_err(io_err)?;

        let archive_path = path.display().to_string();
        self.journal.append(&TaskLogEntry {
            task_id: task.id.clone(),
            kind: task.kind,
            status: result.status,
            attempts: result.attempts,
            duration_ms: result.duration_ms,
            source_trigger_id: task.source_trigger_id.clone(),
            archive_path: Some(archive_path.clone()),
            at: result.completed_at,
        })?;
        Ok(archive_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn archive_is_dated_and_journaled() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::new(
            dir.path().join("archive"),
            Journal::new(dir.path().join("tasks.jsonl")),
        );
        let task = Task::new(TaskKind::Standard, "x");
        let result = TaskResult {
            seq: 1,
            task_id: task.id.clone(),
            kind: TaskKind::Standard,
            status: TaskStatus::Failed,
            output: None,
            error: Some("boom".into()),
            duration_ms: 5,
            usage: None,
            attempts: 3,
            source_trigger_id: None,
            archive_path: None,
            completed_at: Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0).unwrap(),
        };

        let path = archive.record(&task, &result).unwrap();
        assert!(path.contains("2026-03-04"));
        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["result"]["status"], "failed");
        assert_eq!(doc["task"]["id"], task.id.as_str());

        let log: Vec<TaskLogEntry> = archive.journal().read_all().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].attempts, 3);
    }
}
