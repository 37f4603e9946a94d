pub mod checkpoint;
pub mod pipeline;
pub mod validate;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::boot::{HealthGate, HealthGateError};
use crate::persist::JournalError;

pub use checkpoint::TreeCheckpoint;
pub use pipeline::{CommandPipeline, EvolvePipeline, EvolveProposal, FeedbackSource, PipelineError};
pub use validate::{CommandValidator, ValidationError, Validator};

#[derive(Debug, thiserror::Error)]
pub enum EvolveError {
    #[error("self-evolve is disabled")]
    Disabled,
    #[error("feedback unavailable: {0}")]
    Feedback(#[from] JournalError),
    #[error("failed to checkpoint work tree: {0}")]
    Checkpoint(std::io::Error),
    #[error("failed to restore work tree: {0}")]
    Restore(std::io::Error),
    #[error("pipeline error (work tree restored): {0}")]
    Pipeline(#[from] PipelineError),
    #[error("validation failed (work tree restored): {0}")]
    Validation(#[from] ValidationError),
    #[error("failed to arm health gate: {0}")]
    HealthGate(#[from] HealthGateError),
}

/// How a self-evolve run ended without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvolveOutcome {
    NoFeedback,
    /// The pipeline declined; the tree was restored.
    NotPromoted,
    Promoted { code_changed: bool },
}

#[derive(Debug, Clone)]
pub struct EvolveReport {
    pub outcome: EvolveOutcome,
    pub feedback_count: usize,
    /// Watermark after the run.
    pub watermark: u64,
    pub summary: String,
    restart: bool,
}

impl EvolveReport {
    pub fn restart_requested(&self) -> bool {
        self.restart
    }

    pub fn summary(&self) -> String {
        let label = match &self.outcome {
            EvolveOutcome::NoFeedback => "no pending feedback",
            EvolveOutcome::NotPromoted => "not promoted",
            EvolveOutcome::Promoted { code_changed: true } => "promoted with code changes",
            EvolveOutcome::Promoted { code_changed: false } => "promoted",
        };
        if self.summary.is_empty() {
            format!("{label} ({} feedback events)", self.feedback_count)
        } else {
            format!("{label} ({} feedback events): {}", self.feedback_count, self.summary)
        }
    }
}

/// Idle-time self-improvement: feed pending feedback to a pipeline, keep
/// the result only if it validates.
///
/// Every failure path leaves the work tree and the feedback watermark as
/// they were before the run.
pub struct Evolver {
    workdir: PathBuf,
    pipeline: Arc<dyn EvolvePipeline>,
    validator: Arc<dyn Validator>,
    feedback: Arc<dyn FeedbackSource>,
    gate: Option<HealthGate>,
    auto_restart: bool,
    enabled: AtomicBool,
}

impl Evolver {
    pub fn new(
        workdir: impl Into<PathBuf>,
        pipeline: Arc<dyn EvolvePipeline>,
        validator: Arc<dyn Validator>,
        feedback: Arc<dyn FeedbackSource>,
    ) -> Self {
        Self {
            workdir: workdir.into(),
            pipeline,
            validator,
            feedback,
            gate: None,
            auto_restart: false,
            enabled: AtomicBool::new(true),
        }
    }

    /// Arm `gate` and request a restart after a promoted code change.
    pub fn with_restart(mut self, gate: HealthGate) -> Self {
        self.gate = Some(gate);
        self.auto_restart = true;
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Disable for the rest of the process lifetime.
    pub fn disable(&self, reason: &str) {
        if self.enabled.swap(false, Ordering::SeqCst) {
            tracing::warn!(reason, "self-evolve disabled");
        }
    }

    /// Whether feedback exists past the watermark. Read errors count as none.
    pub fn has_pending_feedback(&self) -> bool {
        let pending = self
            .feedback
            .watermark()
            .and_then(|wm| self.feedback.since(wm));
        match pending {
            Ok(events) => !events.is_empty(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read feedback");
                false
            }
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<EvolveReport, EvolveError> {
        if !self.is_enabled() {
            return Err(EvolveError::Disabled);
        }
        let watermark = self.feedback.watermark()?;
        let events = self.feedback.since(watermark)?;
        let Some(high) = events.last().map(|e| e.seq) else {
            return Ok(EvolveReport {
                outcome: EvolveOutcome::NoFeedback,
                feedback_count: 0,
                watermark,
                summary: String::new(),
                restart: false,
            });
        };

        let checkpoint = capture_tree(&self.workdir).await?;
        tracing::info!(
            feedback = events.len(),
            watermark,
            files = checkpoint.file_count(),
            "self-evolve run started"
        );

        let proposal = match self.pipeline.propose(&self.workdir, &events, &cancel).await {
            Ok(proposal) => proposal,
            Err(e) => {
                self.rollback(&checkpoint, watermark).await?;
                return Err(e.into());
            }
        };

        if !proposal.promoted {
            let restored = restore_tree(&checkpoint).await?;
            self.feedback.set_watermark(high)?;
            tracing::info!(restored, watermark = high, "proposal not promoted");
            return Ok(EvolveReport {
                outcome: EvolveOutcome::NotPromoted,
                feedback_count: events.len(),
                watermark: high,
                summary: proposal.summary,
                restart: false,
            });
        }

        if proposal.code_changed {
            if let Err(e) = self.validator.validate(&self.workdir, &cancel).await {
                tracing::warn!(error = %e, "promoted change failed validation");
                self.rollback(&checkpoint, watermark).await?;
                return Err(e.into());
            }
        }

        self.feedback.set_watermark(high)?;
        let mut restart = false;
        if proposal.code_changed && self.auto_restart {
            if let Some(gate) = &self.gate {
                gate.arm(Utc::now())?;
                restart = true;
            }
        }
        tracing::info!(
            code_changed = proposal.code_changed,
            watermark = high,
            restart,
            "proposal promoted"
        );
        Ok(EvolveReport {
            outcome: EvolveOutcome::Promoted {
                code_changed: proposal.code_changed,
            },
            feedback_count: events.len(),
            watermark: high,
            summary: proposal.summary,
            restart,
        })
    }

    async fn rollback(
        &self,
        checkpoint: &Arc<TreeCheckpoint>,
        watermark: u64,
    ) -> Result<(), EvolveError> {
        let restored = restore_tree(checkpoint).await?;
        self.feedback.set_watermark(watermark)?;
        tracing::info!(restored, watermark, "work tree rolled back");
        Ok(())
    }
}

/// Walk the work tree on the blocking pool.
async fn capture_tree(root: &Path) -> Result<Arc<TreeCheckpoint>, EvolveError> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || TreeCheckpoint::capture(&root))
        .await
        .map_err(|e| EvolveError::Checkpoint(std::io::Error::other(e)))?
        .map(Arc::new)
        .map_err(EvolveError::Checkpoint)
}

async fn restore_tree(checkpoint: &Arc<TreeCheckpoint>) -> Result<usize, EvolveError> {
    let checkpoint = Arc::clone(checkpoint);
    tokio::task::spawn_blocking(move || checkpoint.restore())
        .await
        .map_err(|e| EvolveError::Restore(std::io::Error::other(e)))?
        .map_err(EvolveError::Restore)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{FeedbackKind, FeedbackLog};
    use async_trait::async_trait;
    use std::fs;
    use tempfile::TempDir;

    /// Writes into the tree, then answers with a fixed proposal.
    struct ScriptedPipeline {
        proposal: Result<EvolveProposal, String>,
    }

    #[async_trait]
    impl EvolvePipeline for ScriptedPipeline {
        async fn propose(
            &self,
            workdir: &Path,
            _feedback: &[crate::persist::FeedbackEvent],
            _cancel: &CancellationToken,
        ) -> Result<EvolveProposal, PipelineError> {
            fs::write(workdir.join("src.rs"), "changed").unwrap();
            fs::write(workdir.join("added.rs"), "new").unwrap();
            self.proposal.clone().map_err(PipelineError::Failed)
        }
    }

    struct Setup {
        work: TempDir,
        data: TempDir,
        log: Arc<FeedbackLog>,
    }

    fn setup() -> Setup {
        let work = TempDir::new().unwrap();
        fs::write(work.path().join("src.rs"), "original").unwrap();
        let data = TempDir::new().unwrap();
        let log = Arc::new(FeedbackLog::open(data.path()).unwrap());
        log.record(FeedbackKind::TaskAttemptFailed, Some("t-1"), "boom")
            .unwrap();
        Setup { work, data, log }
    }

    fn evolver(s: &Setup, proposal: Result<EvolveProposal, String>, gates: &[&str]) -> Evolver {
        Evolver::new(
            s.work.path(),
            Arc::new(ScriptedPipeline { proposal }),
            Arc::new(CommandValidator::new(
                gates.iter().map(|g| g.to_string()).collect(),
                std::time::Duration::from_secs(5),
            )),
            s.log.clone(),
        )
    }

    fn promoted() -> EvolveProposal {
        EvolveProposal {
            promoted: true,
            code_changed: true,
            summary: "fix".into(),
        }
    }

    #[tokio::test]
    async fn validation_failure_restores_tree_and_watermark() {
        let s = setup();
        let before = TreeCheckpoint::capture(s.work.path()).unwrap();
        let e = evolver(&s, Ok(promoted()), &["exit 1"]);

        let err = e.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, EvolveError::Validation(_)));
        assert_eq!(TreeCheckpoint::capture(s.work.path()).unwrap(), before);
        assert_eq!(s.log.watermark().unwrap(), 0);
        assert!(e.has_pending_feedback());
    }

    #[tokio::test]
    async fn pipeline_error_restores_tree() {
        let s = setup();
        let before = TreeCheckpoint::capture(s.work.path()).unwrap();
        let e = evolver(&s, Err("model unavailable".into()), &["true"]);

        assert!(matches!(
            e.run(CancellationToken::new()).await,
            Err(EvolveError::Pipeline(_))
        ));
        assert_eq!(TreeCheckpoint::capture(s.work.path()).unwrap(), before);
    }

    #[tokio::test]
    async fn declined_proposal_restores_and_advances() {
        let s = setup();
        let e = evolver(&s, Ok(EvolveProposal::default()), &["true"]);
        let report = e.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.outcome, EvolveOutcome::NotPromoted);
        assert_eq!(fs::read_to_string(s.work.path().join("src.rs")).unwrap(), "original");
        assert!(!s.work.path().join("added.rs").exists());
        assert_eq!(s.log.watermark().unwrap(), 1);
        assert!(!e.has_pending_feedback());
    }

    #[tokio::test]
    async fn validated_promotion_arms_gate_and_requests_restart() {
        let s = setup();
        let gate = HealthGate::new(
            s.data.path().join("health_gate.json"),
            std::time::Duration::from_secs(1),
            3,
        );
        let e = evolver(&s, Ok(promoted()), &["test -f added.rs"]).with_restart(gate.clone());

        let report = e.run(CancellationToken::new()).await.unwrap();
        assert!(report.restart_requested());
        assert!(report.summary().contains("fix"));
        assert_eq!(fs::read_to_string(s.work.path().join("src.rs")).unwrap(), "changed");
        assert!(gate.record().unwrap().is_some());
        assert_eq!(s.log.watermark().unwrap(), 1);
    }

    #[tokio::test]
    async fn disabled_evolver_refuses_to_run() {
        let s = setup();
        let e = evolver(&s, Ok(promoted()), &["true"]);
        e.disable("untrusted promotion");
        assert!(!e.is_enabled());
        assert!(matches!(
            e.run(CancellationToken::new()).await,
            Err(EvolveError::Disabled)
        ));
    }
}
