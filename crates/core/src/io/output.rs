use tokio::sync::mpsc;

use crate::types::{TaskResult, TaskStatus};

/// Results channel sender. The dispatcher pushes finished task outcomes here.
pub type ResultSender = mpsc::Sender<TaskResult>;
/// Results channel receiver, consumed by the manager.
pub type ResultReceiver = mpsc::Receiver<TaskResult>;

/// Create a results channel with the given buffer size.
pub fn channel(buffer: usize) -> (ResultSender, ResultReceiver) {
    mpsc::channel(buffer.max(1))
}

/// Results buffered and not yet consumed by the manager.
pub fn pending(tx: &ResultSender) -> usize {
    tx.max_capacity() - tx.capacity()
}

/// One-line operator summary of a result.
pub fn summarize(result: &TaskResult) -> String {
    match result.status {
        TaskStatus::Succeeded => format!(
            "task {} succeeded in {}ms",
            result.task_id, result.duration_ms
        ),
        status => format!(
            "task {} {} after {} attempt(s): {}",
            result.task_id,
            status.as_str(),
            result.attempts,
            result.error.as_deref().unwrap_or("no error recorded")
        ),
    }
}
