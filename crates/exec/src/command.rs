use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::runner::{RunError, RunFuture, RunOutput, RunRequest, TaskRunner};

/// Cap on captured stdout kept as task output.
const MAX_OUTPUT: usize = 64 * 1024;

/// Runs each task through a shell command.
///
/// The prompt is written to the child's stdin; stdout becomes the task output.
/// `VIGIL_TASK_ID`, `VIGIL_TASK_KIND` and `VIGIL_ATTEMPT` are exported to the child.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    command: String,
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

impl TaskRunner for CommandRunner {
    fn name(&self) -> &str {
        "command"
    }

    fn run(&self, request: RunRequest, cancel: CancellationToken) -> RunFuture<'_> {
        Box::pin(async move {
            let mut child = tokio::process::Command::new("bash")
                .arg("-c")
                .arg(&self.command)
                .env("VIGIL_TASK_ID", &request.task_id)
                .env("VIGIL_TASK_KIND", &request.kind)
                .env("VIGIL_ATTEMPT", request.attempt.to_string())
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| RunError::Unavailable(format!("{}: {e}", self.command)))?;

            // Feed stdin while collecting output so a child that fills its
            // stdout pipe before draining the prompt cannot stall us.
            let stdin = child.stdin.take();
            let prompt = request.prompt.as_bytes();
            let feed = async move {
                let Some(mut stdin) = stdin else {
                    return Ok(());
                };
                match stdin.write_all(prompt).await {
                    // the child exited or closed stdin; its exit status decides
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                    other => other,
                }
            };
            let exchange = async move {
                let (fed, waited) = tokio::join!(feed, child.wait_with_output());
                let output = waited
                    .map_err(|e| RunError::Failed(format!("failed to wait for command: {e}")))?;
                fed.map_err(|e| RunError::Failed(format!("failed to write prompt: {e}")))?;
                Ok::<_, RunError>(output)
            };

            // kill_on_drop reaps the child when the exchange future is dropped.
            let output = tokio::select! {
                _ = cancel.cancelled() => return Err(RunError::Canceled),
                res = tokio::time::timeout(self.timeout, exchange) => match res {
                    Ok(res) => res?,
                    Err(_) => return Err(RunError::TimedOut(self.timeout)),
                },
            };

            let stdout = truncate(&String::from_utf8_lossy(&output.stdout));
            if !output.status.success() {
                let code = output.status.code().unwrap_or(-1);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let preview = stderr
                    .lines()
                    .next()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .unwrap_or("no output");
                tracing::debug!(task_id = %request.task_id, code, "task command exited non-zero");
                return Err(RunError::Failed(format!(
                    "command exited with code {code}: {preview}"
                )));
            }

            Ok(RunOutput {
                output: stdout,
                usage: None,
            })
        })
    }
}

fn truncate(raw: &str) -> String {
    if raw.len() <= MAX_OUTPUT {
        return raw.to_string();
    }
    let mut end = MAX_OUTPUT;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated, {} bytes total]", &raw[..end], raw.len())
}
