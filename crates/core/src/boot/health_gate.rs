use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum HealthGateError {
    #[error("health gate io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("health gate record at {path} is malformed: {source}")]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Persisted while a promoted change awaits confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateRecord {
    pub armed_at: DateTime<Utc>,
    /// Boots observed since arming.
    pub boots: u32,
}

/// Health of the current boot relative to the last promoted change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStatus {
    /// Nothing armed.
    Clear,
    /// Armed; confirm after a healthy grace period.
    Probation { boots: u32 },
    /// Too many boots without confirmation.
    Untrusted { boots: u32 },
}

/// Post-restart gate for promoted self-evolve changes.
///
/// Arming writes a record; every boot bumps its counter; a boot that stays
/// healthy through the grace period removes it. A counter beyond
/// `max_boots` means the promoted state keeps failing before confirmation.
#[derive(Debug, Clone)]
pub struct HealthGate {
    path: PathBuf,
    grace: Duration,
    max_boots: u32,
}

impl HealthGate {
    pub fn new(path: impl Into<PathBuf>, grace: Duration, max_boots: u32) -> Self {
        Self {
            path: path.into(),
            grace,
            max_boots: max_boots.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    pub fn record(&self) -> Result<Option<GateRecord>, HealthGateError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(HealthGateError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| HealthGateError::Decode {
                path: self.path.clone(),
                source,
            })
    }

    fn write(&self, record: &GateRecord) -> Result<(), HealthGateError> {
        let io_err = |source| HealthGateError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_vec_pretty(record).map_err(|e| HealthGateError::Io {
            path: self.path.clone(),
            source: e.into(),
        })?;
        std::fs::write(&self.path, json).map_err(io_err)
    }

    /// Arm before exiting for a restart into a promoted change.
    pub fn arm(&self, now: DateTime<Utc>) -> Result<(), HealthGateError> {
        self.write(&GateRecord {
            armed_at: now,
            boots: 0,
        })?;
        tracing::info!(path = %self.path.display(), "health gate armed");
        Ok(())
    }

    /// Count this boot against an armed gate.
    pub fn on_boot(&self) -> Result<GateStatus, HealthGateError> {
        let Some(mut record) = self.record()? else {
            return Ok(GateStatus::Clear);
        };
        record.boots = record.boots.saturating_add(1);
        self.write(&record)?;
        if record.boots > self.max_boots {
            tracing::error!(
                boots = record.boots,
                armed_at = %record.armed_at,
                "promoted change never confirmed healthy, marking untrusted"
            );
            Ok(GateStatus::Untrusted { boots: record.boots })
        } else {
            tracing::info!(boots = record.boots, "booted under an armed health gate");
            Ok(GateStatus::Probation { boots: record.boots })
        }
    }

    /// The promoted change survived its grace period.
    pub fn confirm(&self) -> Result<(), HealthGateError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::info!("promoted change confirmed healthy");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(HealthGateError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Confirm after the grace period unless shutdown comes first.
    pub fn spawn_confirm(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("shutdown before health gate grace elapsed");
                }
                _ = tokio::time::sleep(self.grace) => {
                    if let Err(e) = self.confirm() {
                        tracing::warn!(error = %e, "failed to confirm health gate");
                    }
                }
            }
        })
    }
}
