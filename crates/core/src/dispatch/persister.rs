use std::sync::Arc;

use tokio::sync::Mutex;

use crate::dispatch::queue::TaskBoard;
use crate::persist::{RuntimeSnapshot, SnapshotError, SnapshotFile};
use crate::trigger::TriggerStore;

/// Serializes snapshot writes from the dispatch loop and execution bodies.
pub struct Persister {
    file: SnapshotFile,
    board: TaskBoard,
    store: Arc<dyn TriggerStore>,
    lock: Mutex<()>,
}

impl Persister {
    pub fn new(file: SnapshotFile, board: TaskBoard, store: Arc<dyn TriggerStore>) -> Self {
        Self {
            file,
            board,
            store,
            lock: Mutex::new(()),
        }
    }

    pub fn file(&self) -> &SnapshotFile {
        &self.file
    }

    pub async fn try_save(&self) -> Result<(), SnapshotError> {
        let _guard = self.lock.lock().await;
        let triggers = match self.store.list().await {
            Ok(triggers) => triggers,
            Err(e) => {
                tracing::warn!(error = %e, "snapshot without triggers, store unreadable");
                Vec::new()
            }
        };
        let (tasks, cursors, budget) = self.board.export();
        self.file
            .spawn_save(RuntimeSnapshot::new(tasks, triggers, cursors, budget))
            .await
    }

    /// Save, logging instead of failing.
    pub async fn save(&self) {
        if let Err(e) = self.try_save().await {
            tracing::warn!(error = %e, "failed to persist runtime snapshot");
        }
    }
}
