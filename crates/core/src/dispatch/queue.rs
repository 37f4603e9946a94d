use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::dispatch::budget::BudgetState;
use crate::persist::{Cursors, RuntimeSnapshot};
use crate::types::{Task, TaskKind, TaskStatus};

/// Terminal tasks kept on the board for inspection after they finish.
const FINISHED_RETENTION: usize = 256;

#[derive(Debug)]
struct Queue {
    tasks: HashMap<String, Task>,
    cursors: Cursors,
    /// Mirror of the dispatcher's budget counter, for snapshots.
    budget: BudgetState,
}

impl Default for Queue {
    fn default() -> Self {
        Self {
            tasks: HashMap::new(),
            cursors: Cursors::default(),
            budget: BudgetState::default(),
        }
    }
}

/// Shared task table.
///
/// Producers enqueue and cancel; execution bodies record attempts and
/// outcomes. Locks are never held across an await.
#[derive(Debug, Clone, Default)]
pub struct TaskBoard {
    inner: Arc<Mutex<Queue>>,
}

impl TaskBoard {
    fn with<R>(&self, f: impl FnOnce(&mut Queue) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Rebuild from a loaded snapshot.
    pub fn restore(snapshot: &RuntimeSnapshot) -> Self {
        let board = Self::default();
        board.with(|q| {
            q.cursors = snapshot.cursors;
            q.budget = snapshot.budget;
            for task in &snapshot.tasks {
                q.tasks.insert(task.id.clone(), task.clone());
            }
            // never reuse a sequence number
            let max_seq = q.tasks.values().map(|t| t.seq).max().unwrap_or(0);
            q.cursors.next_task_seq = q.cursors.next_task_seq.max(max_seq + 1);
        });
        board
    }

    /// Add a pending task, stamping its queue position. Returns the assigned `seq`.
    pub fn enqueue(&self, mut task: Task) -> u64 {
        self.with(|q| {
            let seq = q.cursors.next_task_seq;
            q.cursors.next_task_seq += 1;
            task.seq = seq;
            task.status = TaskStatus::Pending;
            tracing::debug!(task_id = %task.id, seq, kind = task.kind.as_str(), "task enqueued");
            q.tasks.insert(task.id.clone(), task);
            seq
        })
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.with(|q| q.tasks.get(id).cloned())
    }

    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        self.with(|q| q.tasks.get(id).map(|t| t.status))
    }

    /// Flip a pending or running task to `canceled`. The dispatcher notices on its next tick.
    pub fn cancel(&self, id: &str) -> bool {
        self.with(|q| match q.tasks.get_mut(id) {
            Some(task) if !task.status.is_terminal() => {
                tracing::info!(task_id = %id, was = task.status.as_str(), "task cancel requested");
                task.status = TaskStatus::Canceled;
                true
            }
            _ => false,
        })
    }

    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut Task) -> R) -> Option<R> {
        self.with(|q| q.tasks.get_mut(id).map(f))
    }

    /// Clones of every pending task, in `seq` order.
    pub fn pending(&self) -> Vec<Task> {
        self.with(|q| {
            let mut pending: Vec<Task> = q
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Pending)
                .cloned()
                .collect();
            pending.sort_by_key(|t| t.seq);
            pending
        })
    }

    /// `(pending, running)` counts.
    pub fn counts(&self) -> (usize, usize) {
        self.with(|q| {
            q.tasks.values().fold((0, 0), |(p, r), t| match t.status {
                TaskStatus::Pending => (p + 1, r),
                TaskStatus::Running => (p, r + 1),
                _ => (p, r),
            })
        })
    }

    /// Number of non-terminal tasks of `kind`.
    pub fn outstanding(&self, kind: TaskKind) -> usize {
        self.with(|q| {
            q.tasks
                .values()
                .filter(|t| t.kind == kind && !t.status.is_terminal())
                .count()
        })
    }

    pub fn has_outstanding(&self, kind: TaskKind) -> bool {
        self.outstanding(kind) > 0
    }

    /// Tasks canceled before they ever ran and not yet finalized.
    pub fn canceled_unstarted(&self) -> Vec<Task> {
        self.with(|q| {
            q.tasks
                .values()
                .filter(|t| {
                    t.status == TaskStatus::Canceled
                        && t.started_at.is_none()
                        && t.completed_at.is_none()
                })
                .cloned()
                .collect()
        })
    }

    pub fn next_result_seq(&self) -> u64 {
        self.with(|q| {
            let seq = q.cursors.next_result_seq;
            q.cursors.next_result_seq += 1;
            seq
        })
    }

    pub fn set_budget(&self, budget: BudgetState) {
        self.with(|q| q.budget = budget);
    }

    /// Tasks (by `seq`), cursors and budget for a snapshot.
    pub fn export(&self) -> (Vec<Task>, Cursors, BudgetState) {
        self.with(|q| {
            let mut tasks: Vec<Task> = q.tasks.values().cloned().collect();
            tasks.sort_by_key(|t| t.seq);
            (tasks, q.cursors, q.budget)
        })
    }

    /// Drop the oldest finished tasks beyond the retention window.
    pub fn prune_finished(&self) -> usize {
        self.with(|q| {
            let mut finished: Vec<(DateTime<Utc>, String)> = q
                .tasks
                .values()
                .filter_map(|t| t.completed_at.map(|at| (at, t.id.clone())))
                .collect();
            if finished.len() <= FINISHED_RETENTION {
                return 0;
            }
            finished.sort();
            let excess = finished.len() - FINISHED_RETENTION;
            for (_, id) in finished.into_iter().take(excess) {
                q.tasks.remove(&id);
            }
            excess
        })
    }
}

/// Chooses which admissible task runs next.
pub trait TaskPicker: Send + Sync {
    /// Index into `candidates`, or `None` to admit nothing.
    fn pick(&self, candidates: &[Task]) -> Option<usize>;
}

/// Highest priority first, then lowest `seq`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PriorityPicker;

impl TaskPicker for PriorityPicker {
    fn pick(&self, candidates: &[Task]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)))
            .map(|(i, _)| i)
    }
}
