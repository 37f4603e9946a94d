use chrono::{DateTime, Utc};

use crate::types::{IdleIntent, IntentMode, IntentStatus, saturating_millis};

/// Exhausted one-shot intents stop being considered and wait for a human.
pub fn demote_exhausted(intents: &mut [IdleIntent], now: DateTime<Utc>) -> usize {
    let mut demoted = 0;
    for intent in intents.iter_mut() {
        if intent.status == IntentStatus::Pending
            && intent.trigger_policy.mode == IntentMode::OneShot
            && intent.attempts >= intent.max_attempts
        {
            tracing::info!(intent_id = %intent.id, attempts = intent.attempts, "intent exhausted, blocking");
            intent.status = IntentStatus::Blocked;
            intent.updated_at = now;
            demoted += 1;
        }
    }
    demoted
}

pub fn is_eligible(intent: &IdleIntent, now: DateTime<Utc>) -> bool {
    if intent.status != IntentStatus::Pending {
        return false;
    }
    let state = &intent.trigger_state;
    match intent.trigger_policy.mode {
        IntentMode::OneShot => {
            state.last_completed_at.is_none() && intent.attempts < intent.max_attempts
        }
        IntentMode::Cooldown => {
            let anchor = match (state.last_triggered_at, state.last_completed_at) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
            let cooldown = saturating_millis(intent.trigger_policy.cooldown_ms);
            anchor.is_none_or(|t| now - t >= cooldown)
        }
    }
}

/// Indices of eligible intents: higher priority first, then older first.
pub fn select_eligible(intents: &[IdleIntent], now: DateTime<Utc>) -> Vec<usize> {
    let mut picked: Vec<usize> = (0..intents.len())
        .filter(|&i| is_eligible(&intents[i], now))
        .collect();
    picked.sort_by(|&a, &b| {
        let (a, b) = (&intents[a], &intents[b]);
        b.priority
            .cmp(&a.priority)
            .then(a.updated_at.cmp(&b.updated_at))
            .then(a.id.cmp(&b.id))
    });
    picked
}

pub fn mark_triggered(intent: &mut IdleIntent, now: DateTime<Utc>) {
    intent.trigger_state.total_triggered += 1;
    intent.trigger_state.last_triggered_at = Some(now);
    if intent.trigger_policy.mode == IntentMode::OneShot {
        intent.attempts += 1;
    }
    intent.updated_at = now;
}
