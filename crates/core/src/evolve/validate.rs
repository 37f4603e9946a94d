use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Error lines kept from a failing gate's output.
const MAX_ERROR_LINES: usize = 20;

/// Why a work tree was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("gate `{gate}` failed: {detail}")]
    GateFailed { gate: String, detail: String },
    #[error("gate `{gate}` timed out after {timeout:?}")]
    TimedOut { gate: String, timeout: Duration },
    #[error("gate `{gate}` could not start: {detail}")]
    Spawn { gate: String, detail: String },
    #[error("validation canceled")]
    Canceled,
}

/// Decides whether a promoted change may stay in the work tree.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, workdir: &Path, cancel: &CancellationToken) -> Result<(), ValidationError>;
}

/// Runs each shell command in the work tree; all must exit zero.
#[derive(Debug, Clone)]
pub struct CommandValidator {
    gates: Vec<String>,
    timeout: Duration,
}

impl CommandValidator {
    pub fn new(gates: Vec<String>, timeout: Duration) -> Self {
        Self { gates, timeout }
    }

    pub fn gates(&self) -> &[String] {
        &self.gates
    }

    async fn run_gate(
        &self,
        gate: &str,
        workdir: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ValidationError> {
        let child = tokio::process::Command::new("bash")
            .arg("-c")
            .arg(gate)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ValidationError::Spawn {
                gate: gate.to_string(),
                detail: e.to_string(),
            })?;

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(ValidationError::Canceled),
            res = tokio::time::timeout(self.timeout, child.wait_with_output()) => match res {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => return Err(ValidationError::Spawn { gate: gate.to_string(), detail: e.to_string() }),
                Err(_) => return Err(ValidationError::TimedOut { gate: gate.to_string(), timeout: self.timeout }),
            },
        };

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(ValidationError::GateFailed {
            gate: gate.to_string(),
            detail: error_excerpt(&stderr, output.status.code()),
        })
    }
}

#[async_trait]
impl Validator for CommandValidator {
    async fn validate(&self, workdir: &Path, cancel: &CancellationToken) -> Result<(), ValidationError> {
        for gate in &self.gates {
            tracing::info!(gate, "running validation gate");
            self.run_gate(gate, workdir, cancel).await?;
        }
        Ok(())
    }
}

/// Lines mentioning `error`, or the head of the output when none do.
fn error_excerpt(stderr: &str, code: Option<i32>) -> String {
    let errors: Vec<&str> = stderr
        .lines()
        .filter(|l| l.contains("error"))
        .take(MAX_ERROR_LINES)
        .collect();
    let body = if errors.is_empty() {
        stderr.chars().take(2000).collect()
    } else {
        errors.join("\n")
    };
    match code {
        Some(code) if body.trim().is_empty() => format!("exit code {code}"),
        Some(code) => format!("exit code {code}: {body}"),
        None => body,
    }
}
