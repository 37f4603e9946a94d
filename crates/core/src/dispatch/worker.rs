use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use vigil_exec::{RunError, RunRequest, TaskRunner, Usage};

use crate::activity::ActivityClock;
use crate::config::VigilCfg;
use crate::dispatch::archive::Archive;
use crate::dispatch::persister::Persister;
use crate::dispatch::queue::TaskBoard;
use crate::evolve::Evolver;
use crate::io::output::ResultSender;
use crate::persist::{FeedbackKind, FeedbackLog};
use crate::types::{Task, TaskKind, TaskResult, TaskStatus};

/// Everything an execution body needs, shared by all executions.
pub struct ExecContext {
    pub runner: Arc<dyn TaskRunner>,
    pub board: TaskBoard,
    pub archive: Arc<Archive>,
    pub results: ResultSender,
    pub feedback: Option<Arc<FeedbackLog>>,
    pub activity: Arc<ActivityClock>,
    pub persister: Arc<Persister>,
    pub evolver: Option<Arc<Evolver>>,
    pub max_retries: u32,
    pub backoff: Duration,
    /// Per-attempt bound when the task carries no `timeout_ms`.
    pub default_timeout: Duration,
}

impl ExecContext {
    /// Context with retry and timeout settings from `cfg`, no feedback log
    /// and no self-evolve.
    pub fn from_cfg(
        cfg: &VigilCfg,
        runner: Arc<dyn TaskRunner>,
        board: TaskBoard,
        archive: Arc<Archive>,
        results: ResultSender,
        activity: Arc<ActivityClock>,
        persister: Arc<Persister>,
    ) -> Self {
        Self {
            runner,
            board,
            archive,
            results,
            feedback: None,
            activity,
            persister,
            evolver: None,
            max_retries: cfg.task_max_retries,
            backoff: cfg.retry_backoff(),
            default_timeout: Duration::from_secs(cfg.runner_timeout_secs),
        }
    }
}

/// How an execution body ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Finished(TaskStatus),
    /// Stopped by shutdown; the task went back to `pending`.
    Interrupted,
}

/// Handed back to the dispatch loop for the `finally` step.
#[derive(Debug, Clone)]
pub struct Execution {
    pub task_id: String,
    pub outcome: Outcome,
    pub error: Option<String>,
    pub usage: Option<Usage>,
    /// A promoted self-evolve change wants the process restarted.
    pub restart_requested: bool,
}

/// Result of the attempt phase, before the board has the final word.
#[derive(Debug, Default)]
pub struct Attempted {
    status: Option<TaskStatus>,
    output: Option<String>,
    error: Option<String>,
    usage: Option<Usage>,
    restart: bool,
}

impl Attempted {
    fn succeeded(output: String, usage: Option<Usage>) -> Self {
        Self {
            status: Some(TaskStatus::Succeeded),
            output: Some(output),
            usage,
            ..Self::default()
        }
    }

    pub fn failed(error: Option<String>) -> Self {
        Self {
            status: Some(TaskStatus::Failed),
            error,
            ..Self::default()
        }
    }

    pub fn canceled() -> Self {
        Self {
            status: Some(TaskStatus::Canceled),
            error: Some("canceled".into()),
            ..Self::default()
        }
    }

    fn interrupted() -> Self {
        Self::default()
    }
}

/// Execution body of one admitted task.
pub async fn execute(ctx: Arc<ExecContext>, task: Task, cancel: CancellationToken) -> Execution {
    let started = Instant::now();
    let attempted = match task.kind {
        TaskKind::SystemEvolve => run_evolve(&ctx, &task, &cancel).await,
        TaskKind::Standard | TaskKind::ConditionEval => run_attempts(&ctx, &task, &cancel).await,
    };
    conclude(&ctx, &task.id, attempted, started).await
}

/// Canceled on the board wins over anything the runner said; a fired token
/// without a board cancel means shutdown.
fn stop_reason(ctx: &ExecContext, task_id: &str, cancel: &CancellationToken) -> Option<Attempted> {
    if ctx.board.status(task_id) == Some(TaskStatus::Canceled) {
        return Some(Attempted::canceled());
    }
    if cancel.is_cancelled() {
        return Some(Attempted::interrupted());
    }
    None
}

async fn run_attempts(ctx: &ExecContext, task: &Task, cancel: &CancellationToken) -> Attempted {
    let max_attempts = ctx.max_retries + 1;
    let timeout = task
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(ctx.default_timeout);
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        if let Some(stop) = stop_reason(ctx, &task.id, cancel) {
            return stop;
        }

        let request = RunRequest {
            task_id: task.id.clone(),
            kind: task.kind.as_str().to_string(),
            prompt: task.prompt.clone(),
            attempt,
        };
        let result = match tokio::time::timeout(timeout, ctx.runner.run(request, cancel.clone())).await {
            Ok(result) => result,
            Err(_) => Err(RunError::TimedOut(timeout)),
        };

        if let Some(stop) = stop_reason(ctx, &task.id, cancel) {
            return stop;
        }

        let e = match result {
            Ok(out) => return Attempted::succeeded(out.output, out.usage),
            Err(RunError::Canceled) => return Attempted::canceled(),
            Err(e) => e,
        };

        let attempts = ctx
            .board
            .update(&task.id, |t| {
                t.attempts += 1;
                t.attempts
            })
            .unwrap_or(attempt);
        tracing::warn!(
            task_id = %task.id,
            attempt,
            attempts,
            max_attempts,
            error = %e,
            "task attempt failed"
        );
        if let Some(feedback) = &ctx.feedback {
            if let Err(err) = feedback.record(
                FeedbackKind::TaskAttemptFailed,
                Some(&task.id),
                format!("attempt {attempt}/{max_attempts}: {e}"),
            ) {
                tracing::warn!(error = %err, "failed to record feedback");
            }
        }
        ctx.persister.save().await;
        last_error = Some(e.to_string());

        if attempt < max_attempts {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return stop_reason(ctx, &task.id, cancel).unwrap_or_else(Attempted::canceled);
                }
                _ = tokio::time::sleep(ctx.backoff) => {}
            }
        }
    }
    Attempted::failed(last_error)
}

async fn run_evolve(ctx: &ExecContext, task: &Task, cancel: &CancellationToken) -> Attempted {
    let Some(evolver) = &ctx.evolver else {
        return Attempted::failed(Some("self-evolve is not configured".into()));
    };
    let result = evolver.run(cancel.clone()).await;
    if let Some(stop) = stop_reason(ctx, &task.id, cancel) {
        return stop;
    }
    match result {
        Ok(report) => {
            let mut attempted = Attempted::succeeded(report.summary(), None);
            attempted.restart = report.restart_requested();
            attempted
        }
        Err(e) => {
            tracing::warn!(task_id = %task.id, error = %e, "self-evolve run failed");
            Attempted::failed(Some(e.to_string()))
        }
    }
}

/// Record the outcome on the board, archive it and surface it to the manager.
pub async fn conclude(
    ctx: &ExecContext,
    task_id: &str,
    attempted: Attempted,
    started: Instant,
) -> Execution {
    let Some(proposed) = attempted.status else {
        ctx.board.update(task_id, |t| {
            t.status = TaskStatus::Pending;
            t.started_at = None;
        });
        tracing::info!(task_id, "task interrupted by shutdown, requeued");
        return Execution {
            task_id: task_id.to_string(),
            outcome: Outcome::Interrupted,
            error: None,
            usage: attempted.usage,
            restart_requested: false,
        };
    };

    let now = Utc::now();
    let duration_ms = started.elapsed().as_millis() as u64;
    let finished = ctx.board.update(task_id, |t| {
        let status = if t.status == TaskStatus::Canceled {
            TaskStatus::Canceled
        } else {
            proposed
        };
        t.status = status;
        t.completed_at = Some(now);
        t.duration_ms = Some(duration_ms);
        t.usage = attempted.usage;
        t.result = match status {
            TaskStatus::Succeeded => attempted.output.clone(),
            _ => Some(attempted.error.clone().unwrap_or_else(|| status.as_str().to_string())),
        };
        t.clone()
    });
    let Some(task) = finished else {
        tracing::warn!(task_id, "finished task vanished from the board");
        return Execution {
            task_id: task_id.to_string(),
            outcome: Outcome::Finished(proposed),
            error: attempted.error,
            usage: attempted.usage,
            restart_requested: false,
        };
    };

    let status = task.status;
    let (output, error) = match status {
        TaskStatus::Succeeded => (attempted.output, None),
        TaskStatus::Canceled => (None, Some(attempted.error.unwrap_or_else(|| "canceled".into()))),
        _ => (None, attempted.error),
    };
    let mut result = TaskResult {
        seq: ctx.board.next_result_seq(),
        task_id: task.id.clone(),
        kind: task.kind,
        status,
        output,
        error: error.clone(),
        duration_ms,
        usage: attempted.usage,
        attempts: task.attempts,
        source_trigger_id: task.source_trigger_id.clone(),
        archive_path: None,
        completed_at: now,
    };

    match ctx.archive.record(&task, &result) {
        Ok(path) => {
            ctx.board.update(task_id, |t| t.archive_path = Some(path.clone()));
            result.archive_path = Some(path);
        }
        Err(e) => tracing::warn!(task_id, error = %e, "failed to archive task result"),
    }

    tracing::info!(
        task_id,
        kind = task.kind.as_str(),
        status = status.as_str(),
        attempts = task.attempts,
        duration_ms,
        "task finished"
    );

    if task.kind != TaskKind::SystemEvolve && ctx.results.send(result).await.is_err() {
        tracing::warn!(task_id, "results channel closed, result dropped");
    }
    ctx.activity.touch_worker(now);

    Execution {
        task_id: task_id.to_string(),
        outcome: Outcome::Finished(status),
        error,
        usage: attempted.usage,
        restart_requested: attempted.restart && status == TaskStatus::Succeeded,
    }
}
