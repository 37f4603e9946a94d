use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use crate::trigger::StoreError;
use crate::types::{CronJob, IdleIntent, IntentMode, IntentStatus};

/// A JSON array of documents kept in a single file.
///
/// Clones share one write lock, so read-modify-write cycles from the wake
/// loops and from the manager side never lose each other's changes.
#[derive(Debug)]
pub struct JsonListStore<T> {
    path: PathBuf,
    writes: Arc<Mutex<()>>,
    _doc: PhantomData<fn() -> T>,
}

impl<T> Clone for JsonListStore<T> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            writes: self.writes.clone(),
            _doc: PhantomData,
        }
    }
}

pub type CronStore = JsonListStore<CronJob>;
pub type IntentStore = JsonListStore<IdleIntent>;

impl<T: Serialize + DeserializeOwned + Send> JsonListStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writes: Arc::new(Mutex::new(())),
            _doc: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file reads as an empty list.
    pub async fn load(&self) -> Result<Vec<T>, StoreError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_str(&raw).map_err(|source| StoreError::Decode {
            path: self.path.clone(),
            source,
        })
    }

    pub async fn save(&self, items: &[T]) -> Result<(), StoreError> {
        let _guard = self.writes.lock().await;
        self.write(items).await
    }

    /// Load, edit and save while holding the write lock. `edit` returns its
    /// result and whether the list changed; unchanged lists are not rewritten.
    pub async fn update<R>(&self, edit: impl FnOnce(&mut Vec<T>) -> (R, bool)) -> Result<R, StoreError> {
        let _guard = self.writes.lock().await;
        let mut items = self.load().await?;
        let (result, changed) = edit(&mut items);
        if changed {
            self.write(&items).await?;
        }
        Ok(result)
    }

    async fn write(&self, items: &[T]) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(items)?;
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, json).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)
    }
}

impl IntentStore {
    /// Record that the work behind an intent was done.
    ///
    /// One-shot intents become `completed` and never fire again; cooldown
    /// intents only move their cooldown anchor.
    pub async fn mark_completed(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.update(|intents| {
            let Some(intent) = intents.iter_mut().find(|i| i.id == id) else {
                return (false, false);
            };
            intent.trigger_state.last_completed_at = Some(now);
            intent.updated_at = now;
            if intent.trigger_policy.mode == IntentMode::OneShot {
                intent.status = IntentStatus::Completed;
            }
            (true, true)
        })
        .await
    }

    pub async fn upsert(&self, intent: IdleIntent) -> Result<(), StoreError> {
        self.update(|intents| {
            match intents.iter_mut().find(|i| i.id == intent.id) {
                Some(existing) => *existing = intent,
                None => intents.push(intent),
            }
            ((), true)
        })
        .await
    }
}

impl CronStore {
    pub async fn upsert(&self, job: CronJob) -> Result<(), StoreError> {
        self.update(|jobs| {
            match jobs.iter_mut().find(|j| j.id == job.id) {
                Some(existing) => *existing = job,
                None => jobs.push(job),
            }
            ((), true)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_is_empty_and_save_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CronStore::new(dir.path().join("cron/jobs.json"));
        assert!(store.load().await.unwrap().is_empty());
        store.upsert(CronJob::repeating("j", "0 9 * * *", "morning")).await.unwrap();
        store.upsert(CronJob::repeating("j", "0 10 * * *", "later")).await.unwrap();
        let jobs = store.load().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].prompt, "later");
    }

    #[tokio::test]
    async fn mark_completed_finishes_one_shot_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = IntentStore::new(dir.path().join("intents.json"));
        store.upsert(IdleIntent::one_shot("once", "tidy notes", 3)).await.unwrap();
        store.upsert(IdleIntent::cooldown("again", "review inbox", 60_000)).await.unwrap();
        let now = Utc::now();

        assert!(store.mark_completed("once", now).await.unwrap());
        assert!(store.mark_completed("again", now).await.unwrap());
        assert!(!store.mark_completed("missing", now).await.unwrap());

        let intents = store.load().await.unwrap();
        assert_eq!(intents[0].status, IntentStatus::Completed);
        assert_eq!(intents[1].status, IntentStatus::Pending);
        assert_eq!(intents[1].trigger_state.last_completed_at, Some(now));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_upserts_through_clones_are_all_kept() {
        let dir = tempfile::tempdir().unwrap();
        let store = CronStore::new(dir.path().join("cron.json"));
        let mut writers = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            writers.push(tokio::spawn(async move {
                store
                    .upsert(CronJob::repeating(format!("job-{i}"), "0 9 * * *", "p"))
                    .await
                    .unwrap();
            }));
        }
        for w in writers {
            w.await.unwrap();
        }
        assert_eq!(store.load().await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn corrupt_file_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intents.json");
        std::fs::write(&path, "{").unwrap();
        assert!(matches!(
            IntentStore::new(path).load().await,
            Err(StoreError::Decode { .. })
        ));
    }
}
