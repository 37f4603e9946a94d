use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Token accounting reported by a runner for one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// One execution attempt handed to a runner.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub task_id: String,
    /// Task kind label (`standard`, `condition_eval`, ...).
    pub kind: String,
    pub prompt: String,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Output of a completed execution.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub output: String,
    pub usage: Option<Usage>,
}

/// Error type for task execution.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("runner unavailable: {0}")]
    Unavailable(String),
    #[error("execution failed: {0}")]
    Failed(String),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("canceled")]
    Canceled,
}

pub type RunFuture<'a> = Pin<Box<dyn Future<Output = Result<RunOutput, RunError>> + Send + 'a>>;

/// Execution backend for dispatched tasks (model call, subprocess, remote agent).
///
/// Implementations should watch `cancel` and return [`RunError::Canceled`]
/// promptly once it fires; the dispatcher treats cancellation as cooperative.
pub trait TaskRunner: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self, request: RunRequest, cancel: CancellationToken) -> RunFuture<'_>;
}

/// Mock runner for tests: scripted failures and an optional delay.
#[derive(Debug)]
pub struct MockRunner {
    pub response: String,
    pub usage: Option<Usage>,
    delay: Duration,
    fail_first: AtomicU32,
    calls: AtomicU32,
    prompts: Mutex<Vec<String>>,
}

impl MockRunner {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            usage: Some(Usage { input_tokens: 10, output_tokens: 20 }),
            delay: Duration::ZERO,
            fail_first: AtomicU32::new(0),
            calls: AtomicU32::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Fail the first `n` calls with [`RunError::Failed`].
    pub fn failing(mut self, n: u32) -> Self {
        self.fail_first = AtomicU32::new(n);
        self
    }

    /// Fail every call.
    pub fn always_failing(self) -> Self {
        self.failing(u32::MAX)
    }

    /// Sleep this long before answering (still honours cancellation).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_usage(mut self, usage: Option<Usage>) -> Self {
        self.usage = usage;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl TaskRunner for MockRunner {
    fn name(&self) -> &str {
        "mock"
    }

    fn run(&self, request: RunRequest, cancel: CancellationToken) -> RunFuture<'_> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(request.prompt.clone());
        }
        let fail = self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let output = self.response.clone();
        let usage = self.usage;
        let delay = self.delay;
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RunError::Canceled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if fail {
                return Err(RunError::Failed(format!(
                    "scripted failure on attempt {}",
                    request.attempt
                )));
            }
            Ok(RunOutput { output, usage })
        })
    }
}
