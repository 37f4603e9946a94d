use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use croner::Cron;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::io::input::InputSender;
use crate::persist::Journal;
use crate::types::{CronJob, SystemEvent};
use crate::wake::WakeError;
use crate::wake::store::CronStore;

pub const DISABLED_COMPLETED: &str = "completed";
pub const DISABLED_INVALID: &str = "invalid_expression";
/// Longest stretch of missed seconds a late tick replays.
pub const MAX_CATCH_UP_SECS: i64 = 60;

/// One job firing, published as a `cron_trigger` input and journaled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronFire {
    pub job_id: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    pub fired_at: DateTime<Utc>,
}

fn parse(expr: &str) -> Option<Cron> {
    Cron::new(expr).with_seconds_optional().parse().ok()
}

/// Walk the enabled jobs at `now`. Returns the firings and whether any job changed.
pub fn evaluate_jobs(jobs: &mut [CronJob], now: DateTime<Utc>) -> (Vec<CronFire>, bool) {
    let second = now.trunc_subsecs(0);
    let mut fires = Vec::new();
    let mut changed = false;

    for job in jobs.iter_mut().filter(|j| j.enabled) {
        if let Some(at) = job.scheduled_at {
            if job.triggered {
                job.disable(DISABLED_COMPLETED);
                changed = true;
            } else if now >= at {
                fires.push(fire(job, now));
                job.disable(DISABLED_COMPLETED);
                changed = true;
            }
            continue;
        }

        let Some(cron) = job.expression.as_deref().and_then(parse) else {
            tracing::warn!(job_id = %job.id, expression = ?job.expression, "disabling cron job with invalid expression");
            job.disable(DISABLED_INVALID);
            changed = true;
            continue;
        };

        let already_fired = job
            .last_triggered_at
            .is_some_and(|t| t.trunc_subsecs(0) == second);
        if already_fired || !cron.is_time_matching(&second).unwrap_or(false) {
            continue;
        }

        fires.push(fire(job, now));
        changed = true;
        if cron.find_next_occurrence(&second, false).is_err() {
            job.disable(DISABLED_COMPLETED);
        }
    }
    (fires, changed)
}

/// Input payload for a firing. Never empty: the ids survive even if the
/// full record cannot be encoded.
fn fire_payload(fire: &CronFire) -> serde_json::Value {
    serde_json::to_value(fire).unwrap_or_else(|e| {
        tracing::warn!(job_id = %fire.job_id, error = %e, "cron payload not serializable, sending ids only");
        serde_json::json!({ "job_id": fire.job_id, "fired_at": fire.fired_at })
    })
}

/// Evaluate every whole second after `after` up to `now`, oldest first, so a
/// late tick does not skip a matching second. At most [`MAX_CATCH_UP_SECS`]
/// seconds are replayed.
pub fn evaluate_span(
    jobs: &mut [CronJob],
    after: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> (Vec<CronFire>, bool) {
    let current = now.trunc_subsecs(0);
    let floor = current - chrono::Duration::seconds(MAX_CATCH_UP_SECS);
    let mut second = match after {
        Some(after) => (after.trunc_subsecs(0) + chrono::Duration::seconds(1)).max(floor),
        None => current,
    };

    let mut fires = Vec::new();
    let mut changed = false;
    while second < current {
        let (more, c) = evaluate_jobs(jobs, second);
        fires.extend(more);
        changed |= c;
        second += chrono::Duration::seconds(1);
    }
    let (more, c) = evaluate_jobs(jobs, now);
    fires.extend(more);
    (fires, changed || c)
}

fn fire(job: &mut CronJob, now: DateTime<Utc>) -> CronFire {
    job.last_triggered_at = Some(now);
    job.triggered = true;
    CronFire {
        job_id: job.id.clone(),
        prompt: job.prompt.clone(),
        profile: job.profile.clone(),
        schedule: job.schedule_label.clone(),
        fired_at: now,
    }
}

/// Cron wake loop state.
pub struct CronWake {
    store: CronStore,
    inputs: InputSender,
    journal: Arc<Journal>,
    /// Last instant whose second has been evaluated.
    evaluated: Option<DateTime<Utc>>,
}

impl CronWake {
    pub fn new(store: CronStore, inputs: InputSender, journal: Arc<Journal>) -> Self {
        Self {
            store,
            inputs,
            journal,
            evaluated: None,
        }
    }

    /// Job changes are saved before anything is published, so a crash never re-fires a job.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<usize, WakeError> {
        let after = self.evaluated;
        let fires = self
            .store
            .update(|jobs| evaluate_span(jobs, after, now))
            .await?;
        self.evaluated = Some(now);

        for fire in &fires {
            self.inputs
                .submit_event(SystemEvent::CronTrigger, fire.prompt.clone(), fire_payload(fire))
                .await?;
            if let Err(e) = self.journal.append(fire) {
                tracing::warn!(job_id = %fire.job_id, error = %e, "failed to journal cron firing");
            }
            tracing::info!(job_id = %fire.job_id, fired_at = %fire.fired_at, "cron job fired");
        }
        Ok(fires.len())
    }

    pub fn spawn(mut self, tick: Duration, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("cron wake shutting down");
                        return;
                    }
                    _ = ticker.tick() => {}
                }
                if let Err(e) = self.tick(Utc::now()).await {
                    tracing::warn!(error = %e, "cron wake tick failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, s).unwrap()
    }

    #[test]
    fn fixed_time_job_fires_once() {
        let mut jobs = vec![CronJob::once("j", at(9, 0, 0), "stand-up")];

        let (fires, changed) = evaluate_jobs(&mut jobs, at(8, 59, 59));
        assert!(fires.is_empty());
        assert!(!changed);

        let (fires, changed) = evaluate_jobs(&mut jobs, at(9, 0, 1));
        assert_eq!(fires.len(), 1);
        assert!(changed);
        assert!(!jobs[0].enabled);
        assert_eq!(jobs[0].disabled_reason.as_deref(), Some(DISABLED_COMPLETED));

        let (fires, _) = evaluate_jobs(&mut jobs, at(9, 0, 2));
        assert!(fires.is_empty());
    }

    #[test]
    fn expression_fires_on_matching_second_only_once() {
        let mut jobs = vec![CronJob::repeating("j", "0 9 * * *", "morning")];

        assert!(evaluate_jobs(&mut jobs, at(8, 59, 59)).0.is_empty());

        let first = at(9, 0, 0) + Duration::milliseconds(100);
        assert_eq!(evaluate_jobs(&mut jobs, first).0.len(), 1);

        // same second, later tick
        let again = at(9, 0, 0) + Duration::milliseconds(900);
        assert!(evaluate_jobs(&mut jobs, again).0.is_empty());
        assert!(jobs[0].enabled);
    }

    #[test]
    fn payload_carries_job_id_and_fire_time() {
        let mut jobs = vec![CronJob::repeating("j", "30 * * * * *", "half past")];
        let (fires, _) = evaluate_jobs(&mut jobs, at(10, 0, 30));
        let payload = fire_payload(&fires[0]);
        assert_eq!(payload["job_id"], "j");
        assert_eq!(payload["prompt"], "half past");
        assert!(payload["fired_at"].as_str().is_some_and(|s| s.starts_with("2026-03-02T10:00:30")));
    }

    #[test]
    fn six_field_expression_matches_seconds() {
        let mut jobs = vec![CronJob::repeating("j", "30 * * * * *", "half past")];
        assert!(evaluate_jobs(&mut jobs, at(10, 0, 29)).0.is_empty());
        assert_eq!(evaluate_jobs(&mut jobs, at(10, 0, 30)).0.len(), 1);
    }

    #[test]
    fn invalid_expression_disables_job() {
        let mut jobs = vec![CronJob::repeating("j", "every tuesday-ish", "?")];
        let (fires, changed) = evaluate_jobs(&mut jobs, at(9, 0, 0));
        assert!(fires.is_empty());
        assert!(changed);
        assert_eq!(jobs[0].disabled_reason.as_deref(), Some(DISABLED_INVALID));
    }

    #[tokio::test]
    async fn tick_publishes_and_journals() {
        let dir = tempfile::tempdir().unwrap();
        let store = CronStore::new(dir.path().join("cron.json"));
        let mut job = CronJob::once("j", at(9, 0, 0), "stand-up");
        job.profile = Some("ops".into());
        store.upsert(job).await.unwrap();

        let (tx, mut rx) = crate::io::input::channel(8);
        let journal = Arc::new(Journal::new(dir.path().join("cron.jsonl")));
        let mut wake = CronWake::new(store.clone(), tx, journal.clone());

        assert_eq!(wake.tick(at(9, 0, 0)).await.unwrap(), 1);
        let input = rx.recv().await.unwrap();
        assert_eq!(input.event, Some(SystemEvent::CronTrigger));
        assert_eq!(input.text, "stand-up");
        assert_eq!(input.payload["job_id"], "j");
        assert_eq!(input.payload["profile"], "ops");

        let logged: Vec<CronFire> = journal.read_all().unwrap();
        assert_eq!(logged.len(), 1);
        assert!(!store.load().await.unwrap()[0].enabled);

        assert_eq!(wake.tick(at(9, 0, 1)).await.unwrap(), 0);
    }

    #[test]
    fn late_tick_replays_the_skipped_matching_second() {
        let mut jobs = vec![CronJob::repeating("j", "30 * * * * *", "half past")];
        let last = at(10, 0, 29) + Duration::milliseconds(990);

        // the tick meant for :30 lands at :31.02
        let (fires, changed) = evaluate_span(&mut jobs, Some(last), at(10, 0, 31) + Duration::milliseconds(20));
        assert_eq!(fires.len(), 1);
        assert!(changed);
        assert_eq!(fires[0].fired_at, at(10, 0, 30));

        // already-evaluated seconds are not replayed
        let (fires, _) = evaluate_span(&mut jobs, Some(at(10, 0, 31)), at(10, 0, 32));
        assert!(fires.is_empty());
    }

    #[test]
    fn catch_up_is_bounded() {
        let mut jobs = vec![CronJob::repeating("j", "0 9 * * *", "morning")];
        // the matching second is far outside the replay window
        let (fires, _) = evaluate_span(&mut jobs, Some(at(8, 0, 0)), at(9, 5, 0));
        assert!(fires.is_empty());
    }

    #[tokio::test]
    async fn tick_after_a_stall_fires_the_missed_second() {
        let dir = tempfile::tempdir().unwrap();
        let store = CronStore::new(dir.path().join("cron.json"));
        store
            .upsert(CronJob::repeating("j", "0 9 * * *", "morning"))
            .await
            .unwrap();
        let (tx, mut rx) = crate::io::input::channel(8);
        let mut wake = CronWake::new(store, tx, Arc::new(Journal::new(dir.path().join("cron.jsonl"))));

        assert_eq!(wake.tick(at(8, 59, 59)).await.unwrap(), 0);
        assert_eq!(wake.tick(at(9, 0, 1)).await.unwrap(), 1);
        assert_eq!(rx.recv().await.unwrap().payload["job_id"], "j");
    }
}
