//! Dispatch flows wired the way the runtime wires them, driven tick by tick
//! with explicit clocks: triggers feed the board, the dispatcher runs tasks
//! through a mock runner, settlement releases triggers.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use vigil_core::activity::{ActivityClock, LoadProbe};
use vigil_core::config::VigilCfg;
use vigil_core::dispatch::{Archive, BudgetState, Dispatcher, ExecContext, Persister, TaskBoard};
use vigil_core::evolve::{
    CommandValidator, EvolvePipeline, EvolveProposal, Evolver, PipelineError, TreeCheckpoint,
};
use vigil_core::io::input::{self, InputReceiver};
use vigil_core::io::output::{self, ResultReceiver};
use vigil_core::persist::{FeedbackEvent, FeedbackKind, FeedbackLog, Journal, SnapshotFile};
use vigil_core::runtime::TriggerLoop;
use vigil_core::trigger::{BuiltinEvaluator, MemoryTriggerStore, StoreError, TriggerStore, settle};
use vigil_core::types::{Task, TaskKind, TaskStatus, Trigger, TriggerStatus};
use vigil_exec::{MockRunner, TaskRunner};

struct Harness {
    dir: TempDir,
    cfg: Arc<VigilCfg>,
    dispatcher: Dispatcher,
    board: TaskBoard,
    store: Arc<MemoryTriggerStore>,
    feedback: Arc<FeedbackLog>,
    results: ResultReceiver,
    _inputs: InputReceiver,
}

struct HarnessOptions<'a> {
    cfg: &'a [(&'a str, &'a str)],
    budget: BudgetState,
    evolver: Option<Arc<Evolver>>,
}

impl Default for HarnessOptions<'_> {
    fn default() -> Self {
        Self {
            cfg: &[],
            budget: BudgetState::default(),
            evolver: None,
        }
    }
}

fn harness(runner: Arc<dyn TaskRunner>, opts: HarnessOptions<'_>) -> Harness {
    let dir = TempDir::new().unwrap();
    let mut map: HashMap<String, String> = opts
        .cfg
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    map.entry("task_retry_backoff_ms".into()).or_insert("1".into());
    let cfg = Arc::new(VigilCfg::from_map(&map));

    let board = TaskBoard::default();
    let store = Arc::new(MemoryTriggerStore::new());
    let store_dyn: Arc<dyn TriggerStore> = store.clone();
    let (inputs_tx, inputs_rx) = input::channel(16);
    let (results_tx, results_rx) = output::channel(16);
    let activity = Arc::new(ActivityClock::new(Utc::now()));
    let feedback = Arc::new(FeedbackLog::open(dir.path()).unwrap());
    let persister = Arc::new(Persister::new(
        SnapshotFile::new(dir.path().join("runtime.json")),
        board.clone(),
        store_dyn.clone(),
    ));
    let mut ctx = ExecContext::from_cfg(
        &cfg,
        runner,
        board.clone(),
        Arc::new(Archive::new(
            dir.path().join("archive"),
            Journal::new(dir.path().join("tasks.jsonl")),
        )),
        results_tx.clone(),
        activity.clone(),
        persister,
    );
    ctx.feedback = Some(feedback.clone());
    ctx.evolver = opts.evolver;
    let probe = LoadProbe {
        board: board.clone(),
        inputs: inputs_tx,
        results: results_tx,
        activity,
    };
    let (dispatcher, _status) = Dispatcher::new(
        cfg.clone(),
        Arc::new(ctx),
        probe,
        store_dyn,
        opts.budget,
        CancellationToken::new(),
    );
    Harness {
        dir,
        cfg,
        dispatcher,
        board,
        store,
        feedback,
        results: results_rx,
        _inputs: inputs_rx,
    }
}

fn at(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339)
        .unwrap()
        .with_timezone(&Utc)
}

#[tokio::test]
async fn always_failing_task_ends_failed_after_every_attempt() {
    let runner = Arc::new(MockRunner::new("unused").always_failing());
    let mut h = harness(
        runner.clone(),
        HarnessOptions {
            cfg: &[("task_max_retries", "2")],
            ..Default::default()
        },
    );
    let task = Task::new(TaskKind::Standard, "flaky job");
    let id = task.id.clone();
    h.board.enqueue(task);

    h.dispatcher.tick(Utc::now()).await;
    h.dispatcher.join_running().await;

    let stored = h.board.get(&id).unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.attempts, h.cfg.task_max_retries + 1);
    assert_eq!(runner.calls(), 3);

    let result = h.results.recv().await.unwrap();
    assert_eq!(result.status, TaskStatus::Failed);
    let archived = std::fs::read_to_string(result.archive_path.unwrap()).unwrap();
    assert!(archived.contains("\"failed\""));
}

#[tokio::test]
async fn cancellation_in_flight_ends_canceled() {
    let runner = Arc::new(MockRunner::new("late").with_delay(Duration::from_secs(30)));
    let mut h = harness(runner.clone(), HarnessOptions::default());
    let task = Task::new(TaskKind::Standard, "long job");
    let id = task.id.clone();
    h.board.enqueue(task);

    h.dispatcher.tick(Utc::now()).await;
    assert_eq!(h.board.status(&id), Some(TaskStatus::Running));

    assert!(h.board.cancel(&id));
    h.dispatcher.tick(Utc::now()).await;
    tokio::time::timeout(Duration::from_secs(5), h.dispatcher.join_running())
        .await
        .expect("cancellation should stop the runner");

    let result = h.results.recv().await.unwrap();
    assert_eq!(result.task_id, id);
    assert_eq!(result.status, TaskStatus::Canceled);
    assert_eq!(h.board.status(&id), Some(TaskStatus::Canceled));
    assert_eq!(runner.calls(), 1);
}

#[tokio::test]
async fn budget_deferral_holds_task_until_the_date_rolls() {
    let day1 = at("2026-05-10T23:59:00Z");
    let day2 = at("2026-05-11T00:00:05Z");
    let runner = Arc::new(MockRunner::new("ok"));
    let mut h = harness(
        runner.clone(),
        HarnessOptions {
            cfg: &[("daily_token_budget", "2000"), ("min_task_cost_tokens", "1024")],
            budget: BudgetState {
                date: day1.date_naive(),
                spent: 1500,
            },
            ..Default::default()
        },
    );
    let task = Task::new(TaskKind::Standard, "summarize the day");
    let id = task.id.clone();
    h.board.enqueue(task);

    h.dispatcher.tick(day1).await;
    h.dispatcher.tick(day1 + chrono::Duration::seconds(30)).await;
    assert_eq!(h.board.status(&id), Some(TaskStatus::Pending));
    assert_eq!(runner.calls(), 0);
    let deferred = h.feedback.since(0).unwrap();
    assert_eq!(deferred.len(), 1);
    assert_eq!(deferred[0].kind, FeedbackKind::BudgetDeferred);

    h.dispatcher.tick(day2).await;
    h.dispatcher.join_running().await;
    assert_eq!(h.board.status(&id), Some(TaskStatus::Succeeded));
    assert_eq!(h.dispatcher.budget().state().date, day2.date_naive());
    // mock usage is charged, not the estimate
    assert_eq!(h.dispatcher.budget().spent(), 30);
}

#[tokio::test]
async fn llm_eval_trigger_respects_cooldown_with_settlement_between_ticks() {
    let t0 = at("2026-06-01T09:00:00Z");
    let runner = Arc::new(MockRunner::new("verdict: not yet"));
    let mut h = harness(runner.clone(), HarnessOptions::default());
    h.store
        .put(
            &Trigger::conditional("inbox", "Is the inbox over 100 messages?", json!({"type": "llm_eval"}))
                .with_cooldown(60)
                .created(t0),
        )
        .await
        .unwrap();
    let store_dyn: Arc<dyn TriggerStore> = h.store.clone();
    let triggers = TriggerLoop::new(h.cfg.clone(), Arc::new(BuiltinEvaluator), store_dyn, h.board.clone());

    // t0: judgment task emitted, mutex held
    triggers.tick(t0).await;
    let pending = h.board.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, TaskKind::ConditionEval);
    assert_eq!(pending[0].prompt, "Is the inbox over 100 messages?");
    let held = h.store.get("inbox").await.unwrap().unwrap();
    assert_eq!(held.state.running_at, Some(t0));

    // the judgment runs and settles the trigger
    h.dispatcher.tick(t0 + chrono::Duration::seconds(1)).await;
    h.dispatcher.join_running().await;
    let settled = h.store.get("inbox").await.unwrap().unwrap();
    assert!(settled.state.running_at.is_none());
    assert_eq!(settled.state.last_status, Some(TriggerStatus::Ok));
    assert_eq!(settled.state.last_eval_at, Some(t0));

    // t0+30s: inside the cooldown
    triggers.tick(t0 + chrono::Duration::seconds(30)).await;
    assert!(h.board.pending().is_empty());

    // t0+61s: evaluated again
    triggers.tick(t0 + chrono::Duration::seconds(61)).await;
    assert_eq!(h.board.pending().len(), 1);
    assert_eq!(runner.calls(), 1);
}

#[tokio::test]
async fn failed_trigger_task_records_error_on_release() {
    let runner = Arc::new(MockRunner::new("x").always_failing());
    let mut h = harness(
        runner,
        HarnessOptions {
            cfg: &[("task_max_retries", "0")],
            ..Default::default()
        },
    );
    let now = Utc::now();
    h.store
        .put(&Trigger::recurring("report", "weekly report", 60).created(now - chrono::Duration::seconds(61)))
        .await
        .unwrap();
    let store_dyn: Arc<dyn TriggerStore> = h.store.clone();
    let triggers = TriggerLoop::new(h.cfg.clone(), Arc::new(BuiltinEvaluator), store_dyn, h.board.clone());

    triggers.tick(now).await;
    h.dispatcher.tick(now).await;
    h.dispatcher.join_running().await;

    let trigger = h.store.get("report").await.unwrap().unwrap();
    assert!(trigger.state.running_at.is_none());
    assert_eq!(trigger.state.last_status, Some(TriggerStatus::Error));
    assert!(trigger.state.last_error.unwrap().contains("scripted failure"));
}

/// Settles a queued task right after the engine lists, so the engine
/// works from a copy that is already stale when it writes.
struct SettlingStore {
    inner: Arc<MemoryTriggerStore>,
    settle_next: std::sync::Mutex<Option<Task>>,
}

impl SettlingStore {
    fn settle_after_next_list(&self, task: Task) {
        *self.settle_next.lock().unwrap() = Some(task);
    }
}

#[async_trait]
impl TriggerStore for SettlingStore {
    async fn list(&self) -> Result<Vec<Trigger>, StoreError> {
        let listed = self.inner.list().await?;
        let queued = self.settle_next.lock().unwrap().take();
        if let Some(task) = queued {
            assert!(settle(self.inner.as_ref(), &task, None).await?);
        }
        Ok(listed)
    }

    async fn get(&self, id: &str) -> Result<Option<Trigger>, StoreError> {
        self.inner.get(id).await
    }

    async fn put(&self, trigger: &Trigger) -> Result<(), StoreError> {
        self.inner.put(trigger).await
    }

    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        self.inner.remove(id).await
    }

    async fn replace(&self, current: &Trigger, next: &Trigger) -> Result<bool, StoreError> {
        self.inner.replace(current, next).await
    }

    async fn remove_if(&self, current: &Trigger) -> Result<bool, StoreError> {
        self.inner.remove_if(current).await
    }
}

#[tokio::test]
async fn settlement_during_a_tick_is_not_overwritten() {
    let t0 = at("2026-07-01T08:00:00Z");
    let h = harness(Arc::new(MockRunner::new("ok")), HarnessOptions::default());
    h.store
        .put(&Trigger::recurring("digest", "send the digest", 60).created(t0 - chrono::Duration::seconds(60)))
        .await
        .unwrap();
    let racing = Arc::new(SettlingStore {
        inner: h.store.clone(),
        settle_next: std::sync::Mutex::new(None),
    });
    let store_dyn: Arc<dyn TriggerStore> = racing.clone();
    let triggers = TriggerLoop::new(h.cfg.clone(), Arc::new(BuiltinEvaluator), store_dyn, h.board.clone());

    triggers.tick(t0).await;
    let mut fired = h.board.pending().remove(0);
    assert_eq!(fired.source_trigger_id.as_deref(), Some("digest"));
    fired.status = TaskStatus::Succeeded;

    // the engine still sees the trigger held and would rewrite its wake time
    racing.settle_after_next_list(fired);
    triggers.tick(t0 + chrono::Duration::seconds(10)).await;

    let stored = h.store.get("digest").await.unwrap().unwrap();
    assert!(stored.state.running_at.is_none());
    assert_eq!(stored.state.last_status, Some(TriggerStatus::Ok));

    triggers.tick(t0 + chrono::Duration::seconds(61)).await;
    let from_digest = h
        .board
        .pending()
        .into_iter()
        .filter(|t| t.source_trigger_id.as_deref() == Some("digest"))
        .count();
    assert_eq!(from_digest, 2);
}

#[tokio::test]
async fn unrepresentable_spans_disable_only_their_trigger() {
    let t0 = at("2026-07-01T08:00:00Z");
    let h = harness(Arc::new(MockRunner::new("ok")), HarnessOptions::default());
    for trigger in [
        Trigger::recurring("huge", "never", 10_000_000_000_000_000).created(t0),
        Trigger::conditional("noisy", "always true", json!(true))
            .with_cooldown(u64::MAX)
            .created(t0),
        Trigger::recurring("fine", "still fires", 60).created(t0 - chrono::Duration::seconds(60)),
    ] {
        h.store.put(&trigger).await.unwrap();
    }
    let store_dyn: Arc<dyn TriggerStore> = h.store.clone();
    let triggers = TriggerLoop::new(h.cfg.clone(), Arc::new(BuiltinEvaluator), store_dyn, h.board.clone());

    triggers.tick(t0).await;
    triggers.tick(t0 + chrono::Duration::seconds(61)).await;

    let fired: Vec<String> = h
        .board
        .pending()
        .into_iter()
        .filter_map(|t| t.source_trigger_id)
        .collect();
    // the second tick finds "fine" still held by its first firing
    assert_eq!(fired, vec!["fine".to_string()]);
    for id in ["huge", "noisy"] {
        let stored = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.state.last_status, Some(TriggerStatus::Error), "{id}");
        assert!(stored.state.last_error.unwrap().contains("out of range"), "{id}");
        assert!(stored.state.running_at.is_none(), "{id}");
    }
}

/// Breaks the tree, then claims success.
struct BreakingPipeline;

#[async_trait]
impl EvolvePipeline for BreakingPipeline {
    async fn propose(
        &self,
        workdir: &Path,
        _feedback: &[FeedbackEvent],
        _cancel: &CancellationToken,
    ) -> Result<EvolveProposal, PipelineError> {
        std::fs::write(workdir.join("lib.rs"), "fn broken(").unwrap();
        std::fs::create_dir_all(workdir.join("generated")).unwrap();
        std::fs::write(workdir.join("generated/extra.rs"), "// new").unwrap();
        Ok(EvolveProposal {
            promoted: true,
            code_changed: true,
            summary: "rewrite lib".into(),
        })
    }
}

#[tokio::test]
async fn self_evolve_validation_failure_leaves_tree_byte_identical() {
    let work = TempDir::new().unwrap();
    std::fs::write(work.path().join("lib.rs"), "pub fn ok() {}\n").unwrap();
    std::fs::write(work.path().join("Cargo.toml"), "[package]\nname = \"demo\"\n").unwrap();
    let before = TreeCheckpoint::capture(work.path()).unwrap();

    let feedback_dir = TempDir::new().unwrap();
    let feedback = Arc::new(FeedbackLog::open(feedback_dir.path()).unwrap());
    feedback
        .record(FeedbackKind::External, None, "responses are too slow")
        .unwrap();
    let evolver = Arc::new(Evolver::new(
        work.path(),
        Arc::new(BreakingPipeline),
        Arc::new(CommandValidator::new(
            vec!["! grep -q 'fn broken(' lib.rs".into()],
            Duration::from_secs(5),
        )),
        feedback.clone(),
    ));

    let mut h = harness(
        Arc::new(MockRunner::new("ok")),
        HarnessOptions {
            cfg: &[("evolve_poll_interval_secs", "0")],
            evolver: Some(evolver),
            ..Default::default()
        },
    );

    h.dispatcher.tick(Utc::now()).await;
    h.dispatcher.join_running().await;

    let evolve: Vec<Task> = h
        .board
        .export()
        .0
        .into_iter()
        .filter(|t| t.kind == TaskKind::SystemEvolve)
        .collect();
    assert_eq!(evolve.len(), 1);
    assert_eq!(evolve[0].status, TaskStatus::Failed);
    assert!(evolve[0].result.as_deref().unwrap().contains("validation failed"));

    assert_eq!(TreeCheckpoint::capture(work.path()).unwrap(), before);
    assert_eq!(feedback.watermark().unwrap(), 0);
    // evolve outcomes stay internal
    assert!(h.results.try_recv().is_err());
    assert!(h.dir.path().join("runtime.json").exists());
}
