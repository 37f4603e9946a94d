use crate::trigger::store::{StoreError, TriggerStore};
use crate::types::{Task, TaskStatus, TriggerStatus};

/// Attempts before giving up on a trigger that keeps changing underneath.
const MAX_CONFLICTS: usize = 5;

/// Release the soft mutex of the trigger that produced `task`.
///
/// Only a terminal task whose `triggered_at` still matches the trigger's
/// `running_at` releases it; a stale task from a stuck-recovered firing does
/// not. The write is a compare-and-replace against the copy just read, so a
/// concurrent engine tick cannot overwrite the release. Returns whether the
/// trigger was updated. Deleted triggers are ignored.
pub async fn settle(
    store: &dyn TriggerStore,
    task: &Task,
    error: Option<&str>,
) -> Result<bool, StoreError> {
    let Some(trigger_id) = task.source_trigger_id.as_deref() else {
        return Ok(false);
    };
    if !task.status.is_terminal() {
        return Ok(false);
    }

    for _ in 0..MAX_CONFLICTS {
        let Some(current) = store.get(trigger_id).await? else {
            tracing::debug!(trigger_id, task_id = %task.id, "source trigger gone, nothing to settle");
            return Ok(false);
        };
        if current.state.running_at.is_none() || current.state.running_at != task.triggered_at {
            tracing::debug!(trigger_id, task_id = %task.id, "trigger held by another firing, not releasing");
            return Ok(false);
        }

        let mut trigger = current.clone();
        trigger.state.running_at = None;
        match task.status {
            TaskStatus::Succeeded => {
                trigger.state.last_status = Some(TriggerStatus::Ok);
                trigger.state.last_error = None;
            }
            status => {
                trigger.state.last_status = Some(TriggerStatus::Error);
                trigger.state.last_error = Some(error.unwrap_or(status.as_str()).to_string());
            }
        }
        if store.replace(&current, &trigger).await? {
            tracing::debug!(trigger_id, task_id = %task.id, status = task.status.as_str(), "trigger settled");
            return Ok(true);
        }
    }
    tracing::warn!(trigger_id, task_id = %task.id, "trigger kept changing, settlement skipped");
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::store::MemoryTriggerStore;
    use crate::types::{TaskKind, Trigger};
    use chrono::{Duration, Utc};

    fn fired(store_trigger: &mut Trigger, status: TaskStatus) -> Task {
        let now = Utc::now();
        store_trigger.state.running_at = Some(now);
        let mut task = Task::from_trigger(store_trigger, TaskKind::Standard, "p", now);
        task.status = status;
        task
    }

    #[tokio::test]
    async fn success_releases_mutex() {
        let mut trigger = Trigger::recurring("r", "p", 60);
        let task = fired(&mut trigger, TaskStatus::Succeeded);
        let store = MemoryTriggerStore::with_triggers([trigger]);

        assert!(settle(&store, &task, None).await.unwrap());
        let stored = store.get("r").await.unwrap().unwrap();
        assert!(stored.state.running_at.is_none());
        assert_eq!(stored.state.last_status, Some(TriggerStatus::Ok));
    }

    #[tokio::test]
    async fn failure_records_error() {
        let mut trigger = Trigger::recurring("r", "p", 60);
        let task = fired(&mut trigger, TaskStatus::Failed);
        let store = MemoryTriggerStore::with_triggers([trigger]);

        assert!(settle(&store, &task, Some("exit 1")).await.unwrap());
        let stored = store.get("r").await.unwrap().unwrap();
        assert_eq!(stored.state.last_status, Some(TriggerStatus::Error));
        assert_eq!(stored.state.last_error.as_deref(), Some("exit 1"));
    }

    #[tokio::test]
    async fn stale_task_does_not_release_newer_firing() {
        let mut trigger = Trigger::recurring("r", "p", 60);
        let task = fired(&mut trigger, TaskStatus::Succeeded);
        trigger.state.running_at = task.triggered_at.map(|t| t + Duration::hours(3));
        let store = MemoryTriggerStore::with_triggers([trigger]);

        assert!(!settle(&store, &task, None).await.unwrap());
        assert!(store.get("r").await.unwrap().unwrap().state.running_at.is_some());
    }

    #[tokio::test]
    async fn non_terminal_and_orphan_tasks_are_ignored() {
        let mut trigger = Trigger::recurring("r", "p", 60);
        let running = fired(&mut trigger, TaskStatus::Running);
        let store = MemoryTriggerStore::new();
        assert!(!settle(&store, &running, None).await.unwrap());

        let mut done = running.clone();
        done.status = TaskStatus::Canceled;
        assert!(!settle(&store, &done, None).await.unwrap());
    }
}
