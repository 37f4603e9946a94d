use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::persist::{FeedbackEvent, FeedbackLog, JournalError};

/// What a pipeline run decided.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvolveProposal {
    /// The change should be kept.
    pub promoted: bool,
    /// The work tree was modified and needs validation.
    #[serde(default)]
    pub code_changed: bool,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline failed: {0}")]
    Failed(String),
    #[error("pipeline timed out after {0:?}")]
    TimedOut(Duration),
    #[error("pipeline output is not a proposal: {0}")]
    Malformed(String),
    #[error("pipeline canceled")]
    Canceled,
}

/// Turns pending feedback into a (possibly applied) change of the work tree.
#[async_trait]
pub trait EvolvePipeline: Send + Sync {
    async fn propose(
        &self,
        workdir: &Path,
        feedback: &[FeedbackEvent],
        cancel: &CancellationToken,
    ) -> Result<EvolveProposal, PipelineError>;
}

/// Feedback consumed by self-evolve, read past a persisted watermark.
pub trait FeedbackSource: Send + Sync {
    fn watermark(&self) -> Result<u64, JournalError>;
    fn set_watermark(&self, seq: u64) -> Result<(), JournalError>;
    fn since(&self, watermark: u64) -> Result<Vec<FeedbackEvent>, JournalError>;
}

impl FeedbackSource for FeedbackLog {
    fn watermark(&self) -> Result<u64, JournalError> {
        FeedbackLog::watermark(self)
    }

    fn set_watermark(&self, seq: u64) -> Result<(), JournalError> {
        FeedbackLog::set_watermark(self, seq)
    }

    fn since(&self, watermark: u64) -> Result<Vec<FeedbackEvent>, JournalError> {
        FeedbackLog::since(self, watermark)
    }
}

/// Runs a shell command in the work tree with the feedback batch as a JSON
/// array on stdin. The last non-empty stdout line must be an
/// [`EvolveProposal`] object.
#[derive(Debug, Clone)]
pub struct CommandPipeline {
    command: String,
    timeout: Duration,
}

impl CommandPipeline {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl EvolvePipeline for CommandPipeline {
    async fn propose(
        &self,
        workdir: &Path,
        feedback: &[FeedbackEvent],
        cancel: &CancellationToken,
    ) -> Result<EvolveProposal, PipelineError> {
        let batch = serde_json::to_vec(feedback).map_err(|e| PipelineError::Failed(e.to_string()))?;
        let mut child = tokio::process::Command::new("bash")
            .arg("-c")
            .arg(&self.command)
            .current_dir(workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PipelineError::Failed(format!("{}: {e}", self.command)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&batch)
                .await
                .map_err(|e| PipelineError::Failed(format!("failed to write feedback: {e}")))?;
        }

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Canceled),
            res = tokio::time::timeout(self.timeout, child.wait_with_output()) => match res {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => return Err(PipelineError::Failed(e.to_string())),
                Err(_) => return Err(PipelineError::TimedOut(self.timeout)),
            },
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::Failed(format!(
                "exit code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim().chars().take(500).collect::<String>()
            )));
        }
        parse_proposal(&String::from_utf8_lossy(&output.stdout))
    }
}

fn parse_proposal(stdout: &str) -> Result<EvolveProposal, PipelineError> {
    let line = stdout
        .lines()
        .map(str::trim)
        .rfind(|l| !l.is_empty())
        .ok_or_else(|| PipelineError::Malformed("empty output".into()))?;
    serde_json::from_str(line).map_err(|e| PipelineError::Malformed(format!("{e}: {line}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::FeedbackKind;
    use chrono::Utc;
    use tempfile::TempDir;

    fn event(seq: u64) -> FeedbackEvent {
        FeedbackEvent {
            seq,
            kind: FeedbackKind::TaskAttemptFailed,
            task_id: Some("t-1".into()),
            detail: "boom".into(),
            at: Utc::now(),
        }
    }

    #[test]
    fn proposal_is_read_from_last_line() {
        let out = "thinking...\n{\"promoted\": true, \"code_changed\": true, \"summary\": \"fix\"}\n\n";
        let p = parse_proposal(out).unwrap();
        assert!(p.promoted && p.code_changed);
        assert_eq!(p.summary, "fix");
        assert!(matches!(parse_proposal("  \n"), Err(PipelineError::Malformed(_))));
        assert!(matches!(parse_proposal("nope"), Err(PipelineError::Malformed(_))));
    }

    #[tokio::test]
    async fn command_sees_feedback_on_stdin() {
        let dir = TempDir::new().unwrap();
        let pipeline = CommandPipeline::new(
            r#"cat > batch.json; echo '{"promoted": false, "summary": "nothing to do"}'"#,
            Duration::from_secs(5),
        );
        let proposal = pipeline
            .propose(dir.path(), &[event(1), event(2)], &CancellationToken::new())
            .await
            .unwrap();
        assert!(!proposal.promoted);
        let batch: Vec<FeedbackEvent> =
            serde_json::from_slice(&std::fs::read(dir.path().join("batch.json")).unwrap()).unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn failing_command_is_an_error() {
        let dir = TempDir::new().unwrap();
        let pipeline = CommandPipeline::new("exit 4", Duration::from_secs(5));
        let err = pipeline
            .propose(dir.path(), &[], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exit code 4"));
    }
}
