pub mod admission;
pub mod archive;
pub mod budget;
pub mod persister;
pub mod queue;
pub mod state;
pub mod worker;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::activity::LoadProbe;
use crate::config::VigilCfg;
use crate::persist::FeedbackKind;
use crate::trigger::{TriggerStore, settle};
use crate::types::{DispatchStatus, Task, TaskKind, TaskStatus};

pub use admission::{AdmissionResult, AdmissionView, Rejection};
pub use archive::Archive;
pub use budget::{BudgetState, TokenBudget, estimate_cost};
pub use persister::Persister;
pub use queue::{PriorityPicker, TaskBoard, TaskPicker};
pub use state::DispatchState;
pub use worker::{ExecContext, Execution, Outcome};

/// Prompt of the task enqueued when self-evolve finds pending feedback.
const EVOLVE_PROMPT: &str = "apply pending runtime feedback";

/// Admits pending tasks into bounded concurrent execution.
///
/// The dispatcher is the only writer of the running set, the cancellation
/// map and the token budget. Execution bodies write task records on the
/// board and hand an [`Execution`] back through the join set.
pub struct Dispatcher {
    cfg: Arc<VigilCfg>,
    ctx: Arc<ExecContext>,
    state: DispatchState,
    picker: Box<dyn TaskPicker>,
    probe: LoadProbe,
    store: Arc<dyn TriggerStore>,
    executions: JoinSet<Execution>,
    spawned: HashMap<Id, String>,
    last_evolve_probe: Option<DateTime<Utc>>,
    restart_requested: bool,
    tick_count: u64,
    shutdown: CancellationToken,
    status_tx: watch::Sender<DispatchStatus>,
}

impl Dispatcher {
    pub fn new(
        cfg: Arc<VigilCfg>,
        ctx: Arc<ExecContext>,
        probe: LoadProbe,
        store: Arc<dyn TriggerStore>,
        budget: BudgetState,
        shutdown: CancellationToken,
    ) -> (Self, watch::Receiver<DispatchStatus>) {
        let state = DispatchState::new(TokenBudget::new(budget, cfg.daily_token_budget));
        let (status_tx, status_rx) = watch::channel(DispatchStatus::default());
        let dispatcher = Self {
            cfg,
            ctx,
            state,
            picker: Box::new(PriorityPicker),
            probe,
            store,
            executions: JoinSet::new(),
            spawned: HashMap::new(),
            last_evolve_probe: None,
            restart_requested: false,
            tick_count: 0,
            shutdown,
            status_tx,
        };
        (dispatcher, status_rx)
    }

    pub fn with_picker(mut self, picker: Box<dyn TaskPicker>) -> Self {
        self.picker = picker;
        self
    }

    pub fn board(&self) -> &TaskBoard {
        &self.ctx.board
    }

    pub fn budget(&self) -> &TokenBudget {
        &self.state.budget
    }

    /// A promoted self-evolve change asked for a process restart.
    pub fn restart_requested(&self) -> bool {
        self.restart_requested
    }

    pub fn running_count(&self) -> usize {
        self.state.running_count()
    }

    /// One dispatch pass.
    pub async fn tick(&mut self, now: DateTime<Utc>) {
        self.tick_count += 1;
        self.reap().await;
        self.forward_cancels();
        self.finalize_canceled().await;

        if self.state.budget.roll(now) {
            tracing::info!(date = %now.date_naive(), "daily token budget rolled over");
        }
        self.ctx.board.set_budget(self.state.budget.state());

        if self.shutdown.is_cancelled() || self.restart_requested {
            self.publish_status();
            return;
        }

        if self.state.budget.is_exhausted() {
            tracing::debug!(
                spent = self.state.budget.spent(),
                limit = self.state.budget.limit(),
                "daily token budget exhausted, admitting nothing"
            );
        } else {
            self.probe_evolve(now);
            self.admit(now).await;
        }

        self.publish_status();
        let pruned = self.ctx.board.prune_finished();
        if pruned > 0 {
            tracing::debug!(pruned, "pruned finished tasks");
        }
    }

    /// Run until the shutdown token fires, then drain. Returns whether a
    /// restart was requested.
    pub async fn run(mut self) -> bool {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.cfg.dispatch_tick_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick completes immediately
        ticker.tick().await;
        tracing::info!(
            max_concurrent = self.cfg.max_concurrent_tasks,
            budget = self.cfg.daily_token_budget,
            "dispatcher started"
        );

        loop {
            let span = tracing::info_span!("dispatch", n = self.tick_count + 1);
            self.tick(Utc::now()).instrument(span).await;

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                Some(joined) = self.executions.join_next_with_id(), if !self.executions.is_empty() => {
                    self.handle_joined(joined).await;
                }
            }
        }

        self.shutdown_drain().await;
        self.restart_requested
    }

    /// Await every running execution and process it. Used by tests and by
    /// callers that want a quiescent board.
    pub async fn join_running(&mut self) {
        while let Some(joined) = self.executions.join_next_with_id().await {
            self.handle_joined(joined).await;
        }
    }

    async fn reap(&mut self) {
        while let Some(joined) = self.executions.try_join_next_with_id() {
            self.handle_joined(joined).await;
        }
    }

    async fn handle_joined(&mut self, joined: Result<(Id, Execution), JoinError>) {
        match joined {
            Ok((id, exec)) => {
                self.spawned.remove(&id);
                self.finish(exec).await;
            }
            Err(e) => {
                let Some(task_id) = self.spawned.remove(&e.id()) else {
                    tracing::warn!(error = %e, "unknown execution ended abnormally");
                    return;
                };
                if e.is_cancelled() {
                    // aborted on shutdown; the snapshot requeues it on load
                    self.state.release(&task_id);
                    return;
                }
                tracing::error!(task_id = %task_id, error = %e, "task execution panicked");
                let attempted = worker::Attempted::failed(Some(format!("execution panicked: {e}")));
                let exec = worker::conclude(&self.ctx, &task_id, attempted, Instant::now()).await;
                self.finish(exec).await;
            }
        }
    }

    /// The `finally` step of an execution.
    async fn finish(&mut self, exec: Execution) {
        let estimate = self.state.release(&exec.task_id);
        self.state.forget_deferred(&exec.task_id);

        let charged = match (exec.usage, exec.outcome) {
            (Some(usage), _) => usage.total(),
            (None, Outcome::Finished(TaskStatus::Succeeded | TaskStatus::Failed)) => estimate,
            (None, _) => 0,
        };
        self.state.budget.charge(charged);
        self.ctx.board.set_budget(self.state.budget.state());

        if let Outcome::Finished(_) = exec.outcome {
            self.settle_trigger(&exec.task_id, exec.error.as_deref()).await;
        }

        if exec.restart_requested && !self.restart_requested {
            tracing::info!(task_id = %exec.task_id, "promoted self-evolve change requests restart");
            self.restart_requested = true;
            self.shutdown.cancel();
        }
        self.ctx.activity.touch_worker(Utc::now());
        self.ctx.persister.save().await;
    }

    async fn settle_trigger(&self, task_id: &str, error: Option<&str>) {
        let Some(task) = self.ctx.board.get(task_id) else {
            return;
        };
        if task.source_trigger_id.is_none() {
            return;
        }
        match settle(self.store.as_ref(), &task, error).await {
            Ok(true) => tracing::debug!(task_id, "source trigger released"),
            Ok(false) => {}
            Err(e) => tracing::warn!(task_id, error = %e, "failed to settle source trigger"),
        }
    }

    fn forward_cancels(&mut self) {
        for task_id in self.state.running_ids() {
            if self.ctx.board.status(&task_id) == Some(TaskStatus::Canceled)
                && self.state.cancel(&task_id)
            {
                tracing::info!(task_id = %task_id, "cancellation forwarded to running task");
            }
        }
    }

    /// Tasks canceled while still pending never reach an execution body;
    /// finalize them here so they are archived, surfaced and settled.
    async fn finalize_canceled(&mut self) {
        let canceled = self.ctx.board.canceled_unstarted();
        if canceled.is_empty() {
            return;
        }
        for task in canceled {
            if self.state.is_running(&task.id) {
                continue;
            }
            self.state.forget_deferred(&task.id);
            let exec =
                worker::conclude(&self.ctx, &task.id, worker::Attempted::canceled(), Instant::now())
                    .await;
            self.settle_trigger(&task.id, exec.error.as_deref()).await;
        }
        self.ctx.persister.save().await;
    }

    fn probe_evolve(&mut self, now: DateTime<Utc>) {
        let Some(evolver) = self.ctx.evolver.clone() else {
            return;
        };
        if !evolver.is_enabled() {
            return;
        }
        let interval = crate::types::saturating_secs(self.cfg.evolve_poll_interval_secs);
        if self.last_evolve_probe.is_some_and(|last| now - last < interval) {
            return;
        }
        if !self.probe.sample().is_idle() || self.ctx.board.has_outstanding(TaskKind::SystemEvolve) {
            return;
        }
        self.last_evolve_probe = Some(now);
        if !evolver.has_pending_feedback() {
            return;
        }
        let seq = self
            .ctx
            .board
            .enqueue(Task::new(TaskKind::SystemEvolve, EVOLVE_PROMPT));
        tracing::info!(seq, "pending feedback found, self-evolve task enqueued");
    }

    async fn admit(&mut self, now: DateTime<Utc>) {
        let max = self.cfg.max_concurrent_tasks.max(1);
        let mut skipped: HashSet<String> = HashSet::new();

        while self.state.running_count() < max {
            let load = self.probe.sample();
            let evolve_outstanding = self.ctx.board.outstanding(TaskKind::SystemEvolve);
            let candidates: Vec<Task> = self
                .ctx
                .board
                .pending()
                .into_iter()
                .filter(|t| !skipped.contains(&t.id))
                .filter(|t| {
                    let view = AdmissionView {
                        load,
                        // the candidate itself is one of the outstanding
                        other_evolve: t.kind == TaskKind::SystemEvolve && evolve_outstanding > 1,
                    };
                    admission::check(t, self.state.is_running(&t.id), &view, now)
                        == AdmissionResult::Admitted
                })
                .collect();

            let Some(index) = self.picker.pick(&candidates) else {
                break;
            };
            let task = candidates[index].clone();

            let estimate = estimate_cost(&task.prompt, self.cfg.min_task_cost_tokens);
            if !self.state.budget.fits_with(self.state.reserved(), estimate) {
                skipped.insert(task.id.clone());
                if self.state.mark_deferred(&task.id) {
                    tracing::info!(
                        task_id = %task.id,
                        estimate,
                        spent = self.state.budget.spent(),
                        reserved = self.state.reserved(),
                        limit = self.state.budget.limit(),
                        "task deferred by daily token budget"
                    );
                    self.record_feedback(
                        &task.id,
                        format!(
                            "estimate {estimate} exceeds remaining budget ({} of {} spent, {} in flight)",
                            self.state.budget.spent(),
                            self.state.budget.limit(),
                            self.state.reserved()
                        ),
                    );
                }
                continue;
            }

            self.spawn(task, estimate, now).await;
        }
    }

    fn record_feedback(&self, task_id: &str, detail: String) {
        let Some(feedback) = &self.ctx.feedback else {
            return;
        };
        if let Err(e) = feedback.record(FeedbackKind::BudgetDeferred, Some(task_id), detail) {
            tracing::warn!(task_id, error = %e, "failed to record feedback");
        }
    }

    async fn spawn(&mut self, task: Task, estimate: u64, now: DateTime<Utc>) {
        let token = self.state.register(&task.id, estimate);
        let started = self.ctx.board.update(&task.id, |t| {
            t.status = TaskStatus::Running;
            t.started_at = Some(now);
            t.clone()
        });
        let Some(task) = started else {
            self.state.release(&task.id);
            return;
        };
        self.ctx.activity.touch_worker(now);
        self.ctx.persister.save().await;

        tracing::info!(
            task_id = %task.id,
            kind = task.kind.as_str(),
            priority = task.priority,
            estimate,
            "task admitted"
        );
        let task_id = task.id.clone();
        let handle = self
            .executions
            .spawn(worker::execute(self.ctx.clone(), task, token));
        self.spawned.insert(handle.id(), task_id);
    }

    fn publish_status(&self) {
        let (pending, _) = self.ctx.board.counts();
        let _ = self.status_tx.send(DispatchStatus {
            tick_count: self.tick_count,
            running: self.state.running_count(),
            pending,
            budget_spent: self.state.budget.spent(),
            budget_limit: self.state.budget.limit(),
            evolve_enabled: self.ctx.evolver.as_ref().is_some_and(|e| e.is_enabled()),
        });
    }

    /// Cancel running executions, wait for them up to the shutdown timeout,
    /// abort the rest and persist a final snapshot.
    async fn shutdown_drain(&mut self) {
        let running = self.state.running_count();
        if running > 0 {
            tracing::info!(running, "cancelling running tasks");
        }
        self.state.cancel_all();

        let deadline = tokio::time::Instant::now() + self.cfg.shutdown_timeout();
        loop {
            match tokio::time::timeout_at(deadline, self.executions.join_next_with_id()).await {
                Ok(Some(joined)) => self.handle_joined(joined).await,
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        remaining = self.executions.len(),
                        "executions did not stop in time, aborting"
                    );
                    self.executions.abort_all();
                    while let Some(joined) = self.executions.join_next_with_id().await {
                        self.handle_joined(joined).await;
                    }
                    break;
                }
            }
        }

        self.ctx.persister.save().await;
        tracing::info!("dispatcher stopped");
    }
}
