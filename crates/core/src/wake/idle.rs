use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::activity::LoadProbe;
use crate::io::input::InputSender;
use crate::types::{IdleIntent, SystemEvent};
use crate::wake::WakeError;
use crate::wake::intent;
use crate::wake::store::IntentStore;

/// What an idle tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleAction {
    /// Activity within the threshold.
    Active,
    /// Idle long enough, but tasks, inputs or the manager keep the runtime busy.
    Busy,
    /// Already acted for this idle window.
    Latched,
    /// Published one input per eligible intent.
    Intents(usize),
    /// Nothing eligible; published a single `idle` input.
    Idle,
}

/// Idle/intent wake loop state.
pub struct IdleWake {
    intents: IntentStore,
    inputs: InputSender,
    probe: LoadProbe,
    threshold: Duration,
    /// `(last_manager, last_worker)` of the window already acted on.
    latch: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl IdleWake {
    pub fn new(intents: IntentStore, inputs: InputSender, probe: LoadProbe, threshold: Duration) -> Self {
        Self {
            intents,
            inputs,
            probe,
            threshold,
            latch: None,
        }
    }

    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<IdleAction, WakeError> {
        let activity = self.probe.activity.snapshot();
        if now - activity.last_active() < self.threshold {
            return Ok(IdleAction::Active);
        }
        if !self.probe.sample().is_idle() {
            return Ok(IdleAction::Busy);
        }
        let window = (activity.last_manager, activity.last_worker);
        if self.latch == Some(window) {
            return Ok(IdleAction::Latched);
        }

        let eligible: Vec<IdleIntent> = self
            .intents
            .update(|intents| {
                intent::demote_exhausted(intents, now);
                let picked = intent::select_eligible(intents, now);
                for &i in &picked {
                    intent::mark_triggered(&mut intents[i], now);
                }
                let picked: Vec<IdleIntent> = picked.into_iter().map(|i| intents[i].clone()).collect();
                (picked, true)
            })
            .await?;
        self.latch = Some(window);

        let idle_for_ms = (now - activity.last_active()).num_milliseconds();
        if eligible.is_empty() {
            self.inputs
                .submit_event(
                    SystemEvent::Idle,
                    "runtime idle",
                    serde_json::json!({ "idle_for_ms": idle_for_ms }),
                )
                .await?;
            tracing::info!(idle_for_ms, "idle wake, no eligible intents");
            return Ok(IdleAction::Idle);
        }

        for it in &eligible {
            self.inputs
                .submit_event(
                    SystemEvent::IntentTrigger,
                    it.prompt.clone(),
                    serde_json::json!({
                        "intent_id": it.id,
                        "title": it.title,
                        "priority": it.priority,
                        "focus_id": it.focus_id,
                        "idle_for_ms": idle_for_ms,
                    }),
                )
                .await?;
        }
        tracing::info!(intents = eligible.len(), idle_for_ms, "idle wake triggered intents");
        Ok(IdleAction::Intents(eligible.len()))
    }

    pub fn spawn(mut self, tick: StdDuration, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("idle wake shutting down");
                        return;
                    }
                    _ = ticker.tick() => {}
                }
                if let Err(e) = self.tick(Utc::now()).await {
                    tracing::warn!(error = %e, "idle wake tick failed");
                }
            }
        })
    }
}
