use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::VigilCfg;
use crate::dispatch::{Persister, TaskBoard};
use crate::trigger::{ConditionEvaluator, EngineOptions, TriggerStore, process_triggers};

/// Drives the trigger engine and feeds fired tasks to the board.
pub struct TriggerLoop {
    cfg: Arc<VigilCfg>,
    evaluator: Arc<dyn ConditionEvaluator>,
    store: Arc<dyn TriggerStore>,
    board: TaskBoard,
    persister: Option<Arc<Persister>>,
}

impl TriggerLoop {
    pub fn new(
        cfg: Arc<VigilCfg>,
        evaluator: Arc<dyn ConditionEvaluator>,
        store: Arc<dyn TriggerStore>,
        board: TaskBoard,
    ) -> Self {
        Self {
            cfg,
            evaluator,
            store,
            board,
            persister: None,
        }
    }

    /// Save a snapshot whenever a tick enqueues tasks. A fired one-shot
    /// trigger is already deleted, so the snapshot is its only record.
    pub fn with_persister(mut self, persister: Arc<Persister>) -> Self {
        self.persister = Some(persister);
        self
    }

    /// One engine pass. Returns the earliest wake hint.
    pub async fn tick(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let opts = EngineOptions::from_cfg(&self.cfg, now);
        let outcome = process_triggers(self.evaluator.as_ref(), self.store.as_ref(), &opts).await;
        let enqueued = !outcome.tasks.is_empty();
        for task in outcome.tasks {
            let task_id = task.id.clone();
            let trigger_id = task.source_trigger_id.clone().unwrap_or_default();
            let seq = self.board.enqueue(task);
            tracing::debug!(task_id = %task_id, trigger_id = %trigger_id, seq, "trigger task enqueued");
        }
        if let (true, Some(persister)) = (enqueued, &self.persister) {
            persister.save().await;
        }
        outcome.next_wake_at
    }

    /// Sleep until the earliest hint, never longer than the tick interval.
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let max_tick = Duration::from_millis(self.cfg.trigger_tick_ms.max(1));
        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let delay = match self.tick(now).await {
                    Some(at) => (at - now).to_std().unwrap_or(Duration::ZERO).min(max_tick),
                    None => max_tick,
                };
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("trigger loop shutting down");
                        return;
                    }
                    _ = tokio::time::sleep(delay.max(Duration::from_millis(1))) => {}
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::SnapshotFile;
    use crate::trigger::{BuiltinEvaluator, MemoryTriggerStore};
    use crate::types::{TaskStatus, Trigger};

    #[tokio::test]
    async fn fired_trigger_lands_on_the_board() {
        let now = Utc::now();
        let store = Arc::new(MemoryTriggerStore::with_triggers([Trigger::scheduled(
            "once",
            "remind me",
            now - chrono::Duration::seconds(1),
        )]));
        let board = TaskBoard::default();
        let lp = TriggerLoop::new(
            Arc::new(VigilCfg::default()),
            Arc::new(BuiltinEvaluator),
            store.clone(),
            board.clone(),
        );

        lp.tick(now).await;
        let pending = board.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].prompt, "remind me");
        assert_eq!(pending[0].status, TaskStatus::Pending);
        assert!(store.get("once").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fired_one_shot_survives_a_crash_before_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let store = Arc::new(MemoryTriggerStore::with_triggers([Trigger::scheduled(
            "once",
            "remind me",
            now - chrono::Duration::seconds(1),
        )]));
        let board = TaskBoard::default();
        let file = SnapshotFile::new(dir.path().join("runtime.json"));
        let persister = Arc::new(Persister::new(file.clone(), board.clone(), store.clone()));
        let lp = TriggerLoop::new(Arc::new(VigilCfg::default()), Arc::new(BuiltinEvaluator), store.clone(), board)
            .with_persister(persister);

        lp.tick(now).await;
        drop(lp);

        // the trigger is gone; the reloaded snapshot still holds its task
        assert!(store.get("once").await.unwrap().is_none());
        let restored = TaskBoard::restore(&file.load().unwrap().unwrap());
        let pending = restored.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].source_trigger_id.as_deref(), Some("once"));
    }

    #[tokio::test]
    async fn loop_stops_on_cancel() {
        let lp = TriggerLoop::new(
            Arc::new(VigilCfg::default()),
            Arc::new(BuiltinEvaluator),
            Arc::new(MemoryTriggerStore::new()),
            TaskBoard::default(),
        );
        let cancel = CancellationToken::new();
        let handle = lp.spawn(cancel.clone());
        cancel.cancel();
        handle.await.unwrap();
    }
}
