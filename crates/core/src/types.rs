use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use vigil_exec::Usage;

// ── Time arithmetic ────────────────────────────────────────────

/// A user-supplied span or instant that chrono cannot represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{0} is out of range")]
pub struct OutOfRange(pub &'static str);

fn secs_delta(secs: u64) -> Option<Duration> {
    i64::try_from(secs).ok().and_then(Duration::try_seconds)
}

/// `at + by`, or `OutOfRange(what)` past the representable calendar.
pub fn checked_after(at: DateTime<Utc>, by: Duration, what: &'static str) -> Result<DateTime<Utc>, OutOfRange> {
    at.checked_add_signed(by).ok_or(OutOfRange(what))
}

/// Milliseconds as a span, saturating at the largest one chrono holds.
pub fn saturating_millis(ms: u64) -> Duration {
    i64::try_from(ms)
        .ok()
        .and_then(Duration::try_milliseconds)
        .unwrap_or(Duration::MAX)
}

/// Seconds as a span, saturating like [`saturating_millis`].
pub fn saturating_secs(secs: u64) -> Duration {
    secs_delta(secs).unwrap_or(Duration::MAX)
}

// ── Trigger types ──────────────────────────────────────────────

/// Outcome recorded on a trigger after its last firing settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    Ok,
    Error,
}

/// Schedule of a `recurring` trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringSchedule {
    pub interval_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
}

impl RecurringSchedule {
    pub fn interval(&self) -> Result<Duration, OutOfRange> {
        secs_delta(self.interval_secs).ok_or(OutOfRange("interval_secs"))
    }

    /// Next due instant: explicit `next_run_at`, else `(last_run_at ?? created_at) + interval`.
    pub fn due_at(&self, created_at: DateTime<Utc>) -> Result<DateTime<Utc>, OutOfRange> {
        match self.next_run_at {
            Some(at) => Ok(at),
            None => checked_after(self.last_run_at.unwrap_or(created_at), self.interval()?, "next run"),
        }
    }
}

/// Schedule of a one-shot `scheduled` trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneShotSchedule {
    pub run_at: DateTime<Utc>,
}

/// Trigger kind together with the only schedule/condition shape valid for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerRule {
    /// Fires when the condition evaluator says so; the condition is opaque here.
    Conditional { condition: serde_json::Value },
    Recurring { schedule: RecurringSchedule },
    Scheduled { schedule: OneShotSchedule },
}

impl TriggerRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conditional { .. } => "conditional",
            Self::Recurring { .. } => "recurring",
            Self::Scheduled { .. } => "scheduled",
        }
    }
}

/// Engine-owned mutable state of a trigger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_triggered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_eval_at: Option<DateTime<Utc>>,
    /// Soft mutex: set while a task derived from this trigger is outstanding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<TriggerStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Wake hint computed on the last tick.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub initialized: bool,
    /// Opaque condition-evaluator state.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub eval: serde_json::Value,
}

/// A persistent rule that produces tasks when satisfied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    pub prompt: String,
    #[serde(default)]
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_secs: Option<u64>,
    #[serde(flatten)]
    pub rule: TriggerRule,
    #[serde(default)]
    pub state: TriggerState,
}

impl Trigger {
    pub fn new(id: impl Into<String>, prompt: impl Into<String>, rule: TriggerRule) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            priority: 0,
            created_at: Utc::now(),
            timeout_ms: None,
            cooldown_secs: None,
            rule,
            state: TriggerState::default(),
        }
    }

    pub fn recurring(id: impl Into<String>, prompt: impl Into<String>, interval_secs: u64) -> Self {
        Self::new(
            id,
            prompt,
            TriggerRule::Recurring {
                schedule: RecurringSchedule {
                    interval_secs,
                    last_run_at: None,
                    next_run_at: None,
                },
            },
        )
    }

    pub fn scheduled(id: impl Into<String>, prompt: impl Into<String>, run_at: DateTime<Utc>) -> Self {
        Self::new(
            id,
            prompt,
            TriggerRule::Scheduled {
                schedule: OneShotSchedule { run_at },
            },
        )
    }

    pub fn conditional(
        id: impl Into<String>,
        prompt: impl Into<String>,
        condition: serde_json::Value,
    ) -> Self {
        Self::new(id, prompt, TriggerRule::Conditional { condition })
    }

    pub fn with_cooldown(mut self, secs: u64) -> Self {
        self.cooldown_secs = Some(secs);
        self
    }

    pub fn created(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// Zero when unset.
    pub fn cooldown(&self) -> Result<Duration, OutOfRange> {
        match self.cooldown_secs {
            None => Ok(Duration::zero()),
            Some(secs) => secs_delta(secs).ok_or(OutOfRange("cooldown_secs")),
        }
    }
}

// ── Task types ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Standard,
    /// Deferred judgment of an `llm_eval` condition.
    ConditionEval,
    /// Idle-only self-improvement run.
    SystemEvolve,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::ConditionEval => "condition_eval",
            Self::SystemEvolve => "system_evolve",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

/// A unit of work owned by the dispatcher once it leaves `pending`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Queue position, assigned from the queue cursor on enqueue.
    #[serde(default)]
    pub seq: u64,
    pub kind: TaskKind,
    pub prompt: String,
    #[serde(default)]
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defer_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_trigger_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_at: Option<DateTime<Utc>>,

    // dispatcher-owned
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl Task {
    pub fn new(kind: TaskKind, prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            seq: 0,
            kind,
            prompt: prompt.into(),
            priority: 0,
            created_at: Utc::now(),
            attempts: 0,
            timeout_ms: None,
            defer_until: None,
            trace_id: None,
            parent_task_id: None,
            source_trigger_id: None,
            triggered_at: None,
            status: TaskStatus::Pending,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            usage: None,
            archive_path: None,
            result: None,
        }
    }

    /// Task emitted by the trigger engine on behalf of `trigger`.
    pub fn from_trigger(trigger: &Trigger, kind: TaskKind, prompt: impl Into<String>, now: DateTime<Utc>) -> Self {
        let mut task = Self::new(kind, prompt);
        task.priority = trigger.priority;
        task.created_at = now;
        task.timeout_ms = trigger.timeout_ms;
        task.source_trigger_id = Some(trigger.id.clone());
        task.triggered_at = Some(now);
        task.trace_id = Some(Uuid::new_v4().to_string());
        task
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Final outcome of a task, archived and handed to the manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Delivery order, assigned from the result cursor.
    #[serde(default)]
    pub seq: u64,
    pub task_id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_trigger_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_path: Option<String>,
    pub completed_at: DateTime<Utc>,
}

// ── Idle intent types ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    #[default]
    Pending,
    /// Exhausted one-shot intent; waits for a human, never retried.
    Blocked,
    Completed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentMode {
    #[default]
    OneShot,
    Cooldown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentPolicy {
    pub mode: IntentMode,
    #[serde(default)]
    pub cooldown_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntentTriggerState {
    #[serde(default)]
    pub total_triggered: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_triggered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed_at: Option<DateTime<Utc>>,
}

/// Work the agent wants to do when nothing else is going on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdleIntent {
    pub id: String,
    pub title: String,
    pub prompt: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub status: IntentStatus,
    #[serde(default)]
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub trigger_policy: IntentPolicy,
    #[serde(default)]
    pub trigger_state: IntentTriggerState,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus_id: Option<String>,
}

impl IdleIntent {
    pub fn one_shot(id: impl Into<String>, prompt: impl Into<String>, max_attempts: u32) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            prompt: prompt.into(),
            priority: 0,
            source: "planner".into(),
            status: IntentStatus::Pending,
            attempts: 0,
            max_attempts,
            trigger_policy: IntentPolicy::default(),
            trigger_state: IntentTriggerState::default(),
            updated_at: Utc::now(),
            focus_id: None,
        }
    }

    pub fn cooldown(id: impl Into<String>, prompt: impl Into<String>, cooldown_ms: u64) -> Self {
        let mut intent = Self::one_shot(id, prompt, u32::MAX);
        intent.trigger_policy = IntentPolicy {
            mode: IntentMode::Cooldown,
            cooldown_ms,
        };
        intent
    }
}

// ── Cron types ─────────────────────────────────────────────────

/// A time-based job that injects a prompt into the input channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronJob {
    pub id: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_label: Option<String>,
    /// Repeating cron expression (5 or 6 fields).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    /// Fixed one-shot fire time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_triggered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub triggered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<String>,
}

fn default_true() -> bool {
    true
}

impl CronJob {
    pub fn repeating(id: impl Into<String>, expression: impl Into<String>, prompt: impl Into<String>) -> Self {
        let expression = expression.into();
        Self {
            id: id.into(),
            prompt: prompt.into(),
            profile: None,
            schedule_label: Some(expression.clone()),
            expression: Some(expression),
            scheduled_at: None,
            enabled: true,
            last_triggered_at: None,
            triggered: false,
            disabled_reason: None,
        }
    }

    pub fn once(id: impl Into<String>, at: DateTime<Utc>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            profile: None,
            schedule_label: Some(at.to_rfc3339()),
            expression: None,
            scheduled_at: Some(at),
            enabled: true,
            last_triggered_at: None,
            triggered: false,
            disabled_reason: None,
        }
    }

    pub fn disable(&mut self, reason: &str) {
        self.enabled = false;
        self.disabled_reason = Some(reason.to_string());
    }
}

// ── System input types ─────────────────────────────────────────

/// Origin of an input message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputSource {
    User,
    System,
}

/// Structured system events published by the wake loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemEvent {
    CronTrigger,
    IntentTrigger,
    Idle,
}

impl SystemEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CronTrigger => "cron_trigger",
            Self::IntentTrigger => "intent_trigger",
            Self::Idle => "idle",
        }
    }
}

/// Message on the ordered input channel the manager drains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInput {
    /// Publication order, assigned by the input sender.
    #[serde(default)]
    pub seq: u64,
    pub source: InputSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<SystemEvent>,
    pub text: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl SystemInput {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            seq: 0,
            source: InputSource::User,
            event: None,
            text: text.into(),
            payload: serde_json::Value::Null,
            at: Utc::now(),
        }
    }

    pub fn system(event: SystemEvent, text: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            seq: 0,
            source: InputSource::System,
            event: Some(event),
            text: text.into(),
            payload,
            at: Utc::now(),
        }
    }
}

// ── Runtime status ─────────────────────────────────────────────

/// Dispatcher snapshot, broadcast each tick via watch channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStatus {
    pub tick_count: u64,
    pub running: usize,
    pub pending: usize,
    pub budget_spent: u64,
    pub budget_limit: u64,
    pub evolve_enabled: bool,
}
