use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

use crate::types::Trigger;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot decode {path}: {source}")]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("cannot encode document: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid id {0:?}")]
    InvalidId(String),
}

/// Durable mapping trigger id -> trigger document.
#[async_trait::async_trait]
pub trait TriggerStore: Send + Sync {
    async fn list(&self) -> Result<Vec<Trigger>, StoreError>;
    async fn get(&self, id: &str) -> Result<Option<Trigger>, StoreError>;
    /// Insert or replace. Writing the same document twice is harmless.
    async fn put(&self, trigger: &Trigger) -> Result<(), StoreError>;
    /// Returns `false` when the trigger was already gone.
    async fn remove(&self, id: &str) -> Result<bool, StoreError>;
    /// Write `next` only if the stored document still equals `current`.
    /// Returns `false` when another writer changed or removed it first.
    async fn replace(&self, current: &Trigger, next: &Trigger) -> Result<bool, StoreError>;
    /// Remove only if the stored document still equals `current`.
    async fn remove_if(&self, current: &Trigger) -> Result<bool, StoreError>;
}

/// Ids become file names, so only a conservative charset is accepted.
pub fn validate_id(id: &str) -> Result<(), StoreError> {
    let ok = !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidId(id.to_string()))
    }
}

/// One JSON file per trigger under a directory.
///
/// Every mutation holds `writes`, so a compare-and-write cannot interleave
/// with another writer of the same store.
#[derive(Debug, Clone)]
pub struct FileTriggerStore {
    dir: PathBuf,
    writes: Arc<Mutex<()>>,
}

impl FileTriggerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            writes: Arc::new(Mutex::new(())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn doc_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        validate_id(id)?;
        Ok(self.dir.join(format!("{id}.json")))
    }

    async fn read_doc(path: &Path) -> Result<Option<Trigger>, StoreError> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StoreError::Decode {
                path: path.to_path_buf(),
                source,
            })
    }

    async fn write_doc(&self, trigger: &Trigger) -> Result<(), StoreError> {
        let path = self.doc_path(&trigger.id)?;
        let json = serde_json::to_string_pretty(trigger)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| io_error(&self.dir, source))?;
        let tmp = self.dir.join(format!(".{}.json.tmp", trigger.id));
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|source| io_error(&tmp, source))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| io_error(&path, source))
    }

    async fn remove_doc(&self, id: &str) -> Result<bool, StoreError> {
        let path = self.doc_path(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}

#[async_trait::async_trait]
impl TriggerStore for FileTriggerStore {
    async fn list(&self) -> Result<Vec<Trigger>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let mut triggers = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => {
                    return Err(StoreError::Io {
                        path: self.dir.clone(),
                        source,
                    });
                }
            };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_doc(&path).await {
                Ok(Some(trigger)) => triggers.push(trigger),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "skipping unreadable trigger document"),
            }
        }
        triggers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(triggers)
    }

    async fn get(&self, id: &str) -> Result<Option<Trigger>, StoreError> {
        let path = self.doc_path(id)?;
        Self::read_doc(&path).await
    }

    async fn put(&self, trigger: &Trigger) -> Result<(), StoreError> {
        let _guard = self.writes.lock().await;
        self.write_doc(trigger).await
    }

    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let _guard = self.writes.lock().await;
        self.remove_doc(id).await
    }

    async fn replace(&self, current: &Trigger, next: &Trigger) -> Result<bool, StoreError> {
        let _guard = self.writes.lock().await;
        let stored = Self::read_doc(&self.doc_path(&current.id)?).await?;
        if stored.as_ref() != Some(current) {
            return Ok(false);
        }
        self.write_doc(next).await?;
        Ok(true)
    }

    async fn remove_if(&self, current: &Trigger) -> Result<bool, StoreError> {
        let _guard = self.writes.lock().await;
        let stored = Self::read_doc(&self.doc_path(&current.id)?).await?;
        if stored.as_ref() != Some(current) {
            return Ok(false);
        }
        self.remove_doc(&current.id).await
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// In-memory store for tests and ephemeral runs. Counts writes.
#[derive(Debug, Default)]
pub struct MemoryTriggerStore {
    docs: Mutex<BTreeMap<String, Trigger>>,
    writes: AtomicU64,
}

impl MemoryTriggerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_triggers(triggers: impl IntoIterator<Item = Trigger>) -> Self {
        let docs = triggers.into_iter().map(|t| (t.id.clone(), t)).collect();
        Self {
            docs: Mutex::new(docs),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of `put` calls so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl TriggerStore for MemoryTriggerStore {
    async fn list(&self) -> Result<Vec<Trigger>, StoreError> {
        Ok(self.docs.lock().await.values().cloned().collect())
    }

    async fn get(&self, id: &str) -> Result<Option<Trigger>, StoreError> {
        Ok(self.docs.lock().await.get(id).cloned())
    }

    async fn put(&self, trigger: &Trigger) -> Result<(), StoreError> {
        validate_id(&trigger.id)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.docs
            .lock()
            .await
            .insert(trigger.id.clone(), trigger.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.docs.lock().await.remove(id).is_some())
    }

    async fn replace(&self, current: &Trigger, next: &Trigger) -> Result<bool, StoreError> {
        validate_id(&next.id)?;
        let mut docs = self.docs.lock().await;
        if docs.get(&current.id) != Some(current) {
            return Ok(false);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        docs.insert(next.id.clone(), next.clone());
        Ok(true)
    }

    async fn remove_if(&self, current: &Trigger) -> Result<bool, StoreError> {
        let mut docs = self.docs.lock().await;
        if docs.get(&current.id) != Some(current) {
            return Ok(false);
        }
        docs.remove(&current.id);
        Ok(true)
    }
}
