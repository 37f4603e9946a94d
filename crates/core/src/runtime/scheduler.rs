use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use vigil_exec::TaskRunner;

use super::shutdown::ShutdownGuard;
use super::trigger_loop::TriggerLoop;
use crate::activity::{ActivityClock, LoadProbe};
use crate::boot::{GateStatus, HealthGate, HealthGateError};
use crate::config::VigilCfg;
use crate::dispatch::{Archive, BudgetState, Dispatcher, ExecContext, Persister, TaskBoard};
use crate::evolve::{CommandPipeline, CommandValidator, EvolvePipeline, Evolver, Validator};
use crate::io::input::{self, InputReceiver, InputSender};
use crate::io::output::{self, ResultReceiver};
use crate::persist::{FeedbackLog, Journal, JournalError, SnapshotError, SnapshotFile};
use crate::trigger::{BuiltinEvaluator, ConditionEvaluator, FileTriggerStore, StoreError, TriggerStore};
use crate::types::DispatchStatus;
use crate::wake::{CronStore, CronWake, IdleWake, IntentStore};

/// Exit code asking the supervisor to restart into a promoted change.
pub const RESTART_EXIT_CODE: i32 = 75;

/// How the runtime ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Clean,
    RestartRequested,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Clean => 0,
            ExitStatus::RestartRequested => RESTART_EXIT_CODE,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to prepare {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    HealthGate(#[from] HealthGateError),
}

/// Files and directories under `data_dir`.
#[derive(Debug, Clone)]
pub struct DataLayout {
    pub root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn snapshot(&self) -> PathBuf {
        self.root.join("runtime.json")
    }

    pub fn triggers(&self) -> PathBuf {
        self.root.join("triggers")
    }

    pub fn cron_jobs(&self) -> PathBuf {
        self.root.join("cron.json")
    }

    pub fn intents(&self) -> PathBuf {
        self.root.join("intents.json")
    }

    pub fn journal_dir(&self) -> PathBuf {
        self.root.join("journal")
    }

    pub fn archive(&self) -> PathBuf {
        self.root.join("archive")
    }

    pub fn health_gate(&self) -> PathBuf {
        self.root.join("health_gate.json")
    }

    fn ensure(&self) -> Result<(), RuntimeError> {
        for dir in [self.root.clone(), self.triggers(), self.journal_dir(), self.archive()] {
            std::fs::create_dir_all(&dir).map_err(|source| RuntimeError::Io { path: dir, source })?;
        }
        Ok(())
    }
}

/// Cloneable access to a running runtime for the manager side.
#[derive(Clone)]
pub struct RuntimeHandle {
    pub inputs: InputSender,
    pub board: TaskBoard,
    pub triggers: Arc<dyn TriggerStore>,
    pub cron: Arc<CronStore>,
    pub intents: Arc<IntentStore>,
    pub activity: Arc<ActivityClock>,
    pub status: watch::Receiver<DispatchStatus>,
    pub shutdown: CancellationToken,
}

/// Receiving ends consumed by the manager.
pub struct RuntimeOutputs {
    pub inputs: InputReceiver,
    pub results: ResultReceiver,
}

/// Assembles the runtime from config and pluggable backends.
pub struct RuntimeBuilder {
    cfg: Arc<VigilCfg>,
    runner: Arc<dyn TaskRunner>,
    evaluator: Arc<dyn ConditionEvaluator>,
    pipeline: Option<Arc<dyn EvolvePipeline>>,
    validator: Option<Arc<dyn Validator>>,
}

impl RuntimeBuilder {
    pub fn new(cfg: Arc<VigilCfg>, runner: Arc<dyn TaskRunner>) -> Self {
        Self {
            cfg,
            runner,
            evaluator: Arc::new(BuiltinEvaluator),
            pipeline: None,
            validator: None,
        }
    }

    pub fn evaluator(mut self, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Overrides the `evolve_pipeline_command` pipeline.
    pub fn pipeline(mut self, pipeline: Arc<dyn EvolvePipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Overrides the `evolve_validate_commands` gates.
    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Recover persisted state and wire every loop. Nothing runs until
    /// [`Runtime::run`].
    pub async fn build(self) -> Result<(Runtime, RuntimeHandle, RuntimeOutputs), RuntimeError> {
        let cfg = self.cfg;
        let layout = DataLayout::new(&cfg.data_dir);
        layout.ensure()?;

        // malformed primary and backup is fatal
        let snapshot_file = SnapshotFile::new(layout.snapshot());
        let snapshot = snapshot_file.spawn_load().await?;
        let store: Arc<dyn TriggerStore> = Arc::new(FileTriggerStore::new(layout.triggers()));
        let (board, budget) = match &snapshot {
            Some(snapshot) => {
                restore_triggers(store.as_ref(), snapshot).await?;
                tracing::info!(
                    tasks = snapshot.tasks.len(),
                    triggers = snapshot.triggers.len(),
                    saved_at = %snapshot.saved_at,
                    "runtime snapshot recovered"
                );
                (TaskBoard::restore(snapshot), snapshot.budget)
            }
            None => (TaskBoard::default(), BudgetState::default()),
        };

        let feedback = Arc::new(FeedbackLog::open(&layout.journal_dir())?);
        let archive = Arc::new(Archive::new(
            layout.archive(),
            Journal::new(layout.journal_dir().join("tasks.jsonl")),
        ));
        let cron_journal = Arc::new(Journal::new(layout.journal_dir().join("cron.jsonl")));
        let cron = Arc::new(CronStore::new(layout.cron_jobs()));
        let intents = Arc::new(IntentStore::new(layout.intents()));

        let (inputs_tx, inputs_rx) = input::channel(cfg.input_channel_capacity.max(1));
        let (results_tx, results_rx) = output::channel(cfg.result_channel_capacity.max(1));
        let activity = Arc::new(ActivityClock::new(Utc::now()));
        let shutdown = ShutdownGuard::new();

        let gate = HealthGate::new(
            layout.health_gate(),
            Duration::from_secs(cfg.health_gate_grace_secs),
            cfg.health_gate_max_boots,
        );
        let gate_status = gate.on_boot()?;
        let evolver = build_evolver(&cfg, self.pipeline, self.validator, &feedback, &gate);
        if let (GateStatus::Untrusted { boots }, Some(evolver)) = (gate_status, &evolver) {
            evolver.disable(&format!("promoted change unconfirmed after {boots} boots"));
        }

        let persister = Arc::new(Persister::new(snapshot_file, board.clone(), store.clone()));
        let mut ctx = ExecContext::from_cfg(
            &cfg,
            self.runner,
            board.clone(),
            archive,
            results_tx.clone(),
            activity.clone(),
            persister.clone(),
        );
        ctx.feedback = Some(feedback);
        ctx.evolver = evolver;

        let probe = LoadProbe {
            board: board.clone(),
            inputs: inputs_tx.clone(),
            results: results_tx,
            activity: activity.clone(),
        };
        let (dispatcher, status) = Dispatcher::new(
            cfg.clone(),
            Arc::new(ctx),
            probe.clone(),
            store.clone(),
            budget,
            shutdown.token(),
        );

        let trigger_loop = TriggerLoop::new(cfg.clone(), self.evaluator, store.clone(), board.clone())
            .with_persister(persister);
        let cron_wake = CronWake::new(cron.as_ref().clone(), inputs_tx.clone(), cron_journal);
        let idle_wake = IdleWake::new(
            intents.as_ref().clone(),
            inputs_tx.clone(),
            probe,
            cfg.idle_threshold(),
        );

        let handle = RuntimeHandle {
            inputs: inputs_tx,
            board,
            triggers: store,
            cron,
            intents,
            activity,
            status,
            shutdown: shutdown.token(),
        };
        let runtime = Runtime {
            cfg,
            shutdown,
            dispatcher,
            trigger_loop,
            cron_wake,
            idle_wake,
            gate: matches!(gate_status, GateStatus::Probation { .. }).then_some(gate),
        };
        let outputs = RuntimeOutputs {
            inputs: inputs_rx,
            results: results_rx,
        };
        Ok((runtime, handle, outputs))
    }
}

/// Triggers in the snapshot are written back only into an empty store.
async fn restore_triggers(
    store: &dyn TriggerStore,
    snapshot: &crate::persist::RuntimeSnapshot,
) -> Result<(), StoreError> {
    if snapshot.triggers.is_empty() || !store.list().await?.is_empty() {
        return Ok(());
    }
    for trigger in &snapshot.triggers {
        store.put(trigger).await?;
    }
    tracing::info!(count = snapshot.triggers.len(), "trigger store restored from snapshot");
    Ok(())
}

fn build_evolver(
    cfg: &VigilCfg,
    pipeline: Option<Arc<dyn EvolvePipeline>>,
    validator: Option<Arc<dyn Validator>>,
    feedback: &Arc<FeedbackLog>,
    gate: &HealthGate,
) -> Option<Arc<Evolver>> {
    if !cfg.evolve_enabled {
        return None;
    }
    let timeout = Duration::from_secs(cfg.evolve_validate_timeout_secs);
    let pipeline: Arc<dyn EvolvePipeline> = match pipeline {
        Some(pipeline) => pipeline,
        None if !cfg.evolve_pipeline_command.trim().is_empty() => {
            Arc::new(CommandPipeline::new(cfg.evolve_pipeline_command.clone(), timeout))
        }
        None => {
            tracing::warn!("evolve_enabled is set but no evolve_pipeline_command is configured");
            return None;
        }
    };
    let validator: Arc<dyn Validator> = match validator {
        Some(validator) => validator,
        None => Arc::new(CommandValidator::new(cfg.evolve_validate_commands.clone(), timeout)),
    };
    let mut evolver = Evolver::new(&cfg.evolve_workdir, pipeline, validator, feedback.clone());
    if cfg.evolve_auto_restart {
        evolver = evolver.with_restart(gate.clone());
    }
    Some(Arc::new(evolver))
}

/// The assembled runtime: trigger loop, wake loops and dispatcher.
pub struct Runtime {
    cfg: Arc<VigilCfg>,
    shutdown: ShutdownGuard,
    dispatcher: Dispatcher,
    trigger_loop: TriggerLoop,
    cron_wake: CronWake,
    idle_wake: IdleWake,
    /// Armed gate to confirm after a healthy grace period.
    gate: Option<HealthGate>,
}

impl Runtime {
    pub fn data_dir(&self) -> &Path {
        &self.cfg.data_dir
    }

    /// Run every loop until shutdown. Resolves after the dispatcher drained
    /// and the final snapshot is written.
    pub async fn run(self, listen_for_signals: bool) -> ExitStatus {
        let Runtime {
            cfg,
            shutdown,
            dispatcher,
            trigger_loop,
            cron_wake,
            idle_wake,
            gate,
        } = self;
        let token = shutdown.token();
        if listen_for_signals {
            shutdown.spawn_signal_listener();
        }
        tracing::info!(data_dir = %cfg.data_dir.display(), "vigil runtime started");

        let mut loops = vec![
            trigger_loop.spawn(token.clone()),
            cron_wake.spawn(Duration::from_millis(cfg.cron_tick_ms.max(1)), token.clone()),
            idle_wake.spawn(Duration::from_millis(cfg.idle_tick_ms.max(1)), token.clone()),
        ];
        if let Some(gate) = gate {
            loops.push(gate.spawn_confirm(token.clone()));
        }

        let restart = dispatcher.run().await;
        token.cancel();
        for handle in loops {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "loop task ended abnormally");
            }
        }

        let status = if restart {
            ExitStatus::RestartRequested
        } else {
            ExitStatus::Clean
        };
        tracing::info!(?status, "vigil runtime stopped");
        status
    }
}
