use chrono::{DateTime, Duration, Utc};

use crate::config::VigilCfg;
use crate::trigger::condition::{ConditionEvaluator, Evaluation};
use crate::trigger::store::TriggerStore;
use crate::types::{
    OneShotSchedule, OutOfRange, RecurringSchedule, Task, TaskKind, Trigger, TriggerRule,
    TriggerStatus, checked_after,
};

/// Inputs of one engine tick.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub now: DateTime<Utc>,
    /// Re-check delay for conditionals that did not fire.
    pub check_interval: Duration,
    /// How long `running_at` may be held before it is force-cleared.
    pub stuck: Duration,
}

impl EngineOptions {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            check_interval: Duration::milliseconds(5000),
            stuck: Duration::milliseconds(7_200_000),
        }
    }

    pub fn from_cfg(cfg: &VigilCfg, now: DateTime<Utc>) -> Self {
        Self {
            now,
            check_interval: cfg.trigger_check_interval(),
            stuck: cfg.trigger_stuck(),
        }
    }
}

/// Result of one engine tick.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub tasks: Vec<Task>,
    /// Earliest per-trigger wake hint.
    pub next_wake_at: Option<DateTime<Utc>>,
}

/// What a single trigger asked for during this tick.
#[derive(Debug, Default)]
struct Step {
    task: Option<Task>,
    wake: Option<DateTime<Utc>>,
    delete: bool,
}

impl Step {
    fn wait(at: DateTime<Utc>) -> Self {
        Self {
            wake: Some(at),
            ..Self::default()
        }
    }

    fn fire(task: Task, wake: Option<DateTime<Utc>>) -> Self {
        Self {
            task: Some(task),
            wake,
            delete: false,
        }
    }
}

/// Evaluate every trigger once and return the tasks to enqueue.
///
/// Each trigger is handled independently: a store failure on one trigger is
/// logged and the tick moves on. A document is rewritten only when it
/// changed, and only if nobody else wrote it since it was listed; a trigger
/// that lost that race emits nothing and is looked at again next tick.
pub async fn process_triggers(
    evaluator: &dyn ConditionEvaluator,
    store: &dyn TriggerStore,
    opts: &EngineOptions,
) -> TickOutcome {
    let triggers = match store.list().await {
        Ok(triggers) => triggers,
        Err(e) => {
            tracing::warn!(error = %e, "failed to list triggers");
            return TickOutcome::default();
        }
    };

    let mut outcome = TickOutcome::default();
    for listed in triggers {
        let mut trigger = listed.clone();
        let step = step_trigger(evaluator, &mut trigger, opts).await;

        let written = if step.delete {
            store.remove_if(&listed).await
        } else if trigger != listed {
            store.replace(&listed, &trigger).await
        } else {
            Ok(true)
        };
        match written {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(trigger_id = %trigger.id, "trigger changed during tick, retrying");
                outcome.wake_at(opts.now);
                continue;
            }
            Err(e) => {
                // Keep the stored copy; the trigger is looked at again next tick.
                tracing::warn!(trigger_id = %trigger.id, error = %e, "failed to persist trigger state");
                continue;
            }
        }

        if let Some(task) = step.task {
            tracing::info!(
                trigger_id = %trigger.id,
                kind = trigger.rule.as_str(),
                task_id = %task.id,
                task_kind = task.kind.as_str(),
                "trigger fired"
            );
            outcome.tasks.push(task);
        }
        if let Some(wake) = step.wake {
            outcome.wake_at(wake);
        }
    }
    outcome
}

impl TickOutcome {
    fn wake_at(&mut self, at: DateTime<Utc>) {
        self.next_wake_at = Some(self.next_wake_at.map_or(at, |w| w.min(at)));
    }
}

async fn step_trigger(
    evaluator: &dyn ConditionEvaluator,
    trigger: &mut Trigger,
    opts: &EngineOptions,
) -> Step {
    trigger.state.initialized = true;
    match try_step(evaluator, trigger, opts).await {
        Ok(step) => step,
        Err(e) => {
            // A span chrono cannot represent disables this trigger only.
            let error = e.to_string();
            if trigger.state.last_error.as_deref() != Some(error.as_str()) {
                tracing::warn!(trigger_id = %trigger.id, error = %error, "trigger schedule out of range");
            }
            trigger.state.running_at = None;
            trigger.state.next_run_at = None;
            trigger.state.last_status = Some(TriggerStatus::Error);
            trigger.state.last_error = Some(error);
            Step::default()
        }
    }
}

async fn try_step(
    evaluator: &dyn ConditionEvaluator,
    trigger: &mut Trigger,
    opts: &EngineOptions,
) -> Result<Step, OutOfRange> {
    let now = opts.now;
    if let Some(running_at) = trigger.state.running_at {
        if now - running_at > opts.stuck {
            tracing::warn!(trigger_id = %trigger.id, %running_at, "trigger stuck, releasing");
            trigger.state.running_at = None;
            trigger.state.last_status = Some(TriggerStatus::Error);
            trigger.state.last_error = Some("stuck".into());
        } else {
            let wake = checked_after(running_at, opts.stuck, "stuck deadline")?;
            trigger.state.next_run_at = Some(wake);
            return Ok(Step::wait(wake));
        }
    }

    match trigger.rule.clone() {
        TriggerRule::Recurring { schedule } => step_recurring(trigger, schedule, opts),
        TriggerRule::Scheduled { schedule } => Ok(step_scheduled(trigger, schedule, now)),
        TriggerRule::Conditional { condition } => {
            step_conditional(evaluator, trigger, &condition, opts).await
        }
    }
}

fn step_recurring(
    trigger: &mut Trigger,
    mut schedule: RecurringSchedule,
    opts: &EngineOptions,
) -> Result<Step, OutOfRange> {
    let now = opts.now;
    let due = schedule.due_at(trigger.created_at)?;

    if now < due {
        if schedule.next_run_at.is_none() {
            schedule.next_run_at = Some(due);
            trigger.rule = TriggerRule::Recurring { schedule };
        }
        trigger.state.next_run_at = Some(due);
        return Ok(Step::wait(due));
    }

    let next = checked_after(now, schedule.interval()?, "next run")?;
    let wake = next.min(checked_after(now, opts.stuck, "stuck deadline")?);
    let task = Task::from_trigger(trigger, TaskKind::Standard, trigger.prompt.clone(), now);
    schedule.last_run_at = Some(now);
    schedule.next_run_at = Some(next);
    trigger.rule = TriggerRule::Recurring { schedule };
    trigger.state.last_triggered_at = Some(now);
    trigger.state.running_at = Some(now);
    trigger.state.next_run_at = Some(wake);
    Ok(Step::fire(task, Some(wake)))
}

fn step_scheduled(trigger: &mut Trigger, schedule: OneShotSchedule, now: DateTime<Utc>) -> Step {
    if now < schedule.run_at {
        trigger.state.next_run_at = Some(schedule.run_at);
        return Step::wait(schedule.run_at);
    }
    let task = Task::from_trigger(trigger, TaskKind::Standard, trigger.prompt.clone(), now);
    Step {
        task: Some(task),
        wake: None,
        delete: true,
    }
}

async fn step_conditional(
    evaluator: &dyn ConditionEvaluator,
    trigger: &mut Trigger,
    condition: &serde_json::Value,
    opts: &EngineOptions,
) -> Result<Step, OutOfRange> {
    let now = opts.now;
    let cooldown = trigger.cooldown()?;

    if let Some(last) = trigger.state.last_triggered_at {
        let until = checked_after(last, cooldown, "cooldown end")?;
        if until > now {
            trigger.state.next_run_at = Some(until);
            return Ok(Step::wait(until));
        }
    }
    let ready_at = match trigger.state.last_eval_at {
        Some(t) => Some(checked_after(t, cooldown, "judgment cooldown end")?),
        None => None,
    };
    let recheck = checked_after(now, opts.check_interval, "recheck")?;
    let held_until = checked_after(now, opts.stuck, "stuck deadline")?;

    let outcome = match evaluator.evaluate(trigger, condition, now).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::warn!(trigger_id = %trigger.id, error = %e, "condition evaluation failed");
            trigger.state.last_status = Some(TriggerStatus::Error);
            trigger.state.last_error = Some(e.to_string());
            trigger.state.next_run_at = None;
            return Ok(Step::wait(recheck));
        }
    };
    trigger.state.eval = outcome.state;

    let step = match outcome.result {
        Evaluation::Fired => {
            let task = Task::from_trigger(trigger, TaskKind::Standard, trigger.prompt.clone(), now);
            trigger.state.last_triggered_at = Some(now);
            trigger.state.running_at = Some(now);
            trigger.state.next_run_at = Some(held_until);
            Step::fire(task, Some(held_until))
        }
        Evaluation::NeedsJudgment { prompt } => match ready_at {
            Some(at) if at > now => {
                trigger.state.next_run_at = Some(at);
                Step::wait(at)
            }
            _ => {
                let task = Task::from_trigger(trigger, TaskKind::ConditionEval, prompt, now);
                trigger.state.last_eval_at = Some(now);
                trigger.state.running_at = Some(now);
                trigger.state.next_run_at = Some(held_until);
                Step::fire(task, Some(held_until))
            }
        },
        Evaluation::NotFired => {
            trigger.state.next_run_at = None;
            Step::wait(recheck)
        }
    };
    Ok(step)
}
