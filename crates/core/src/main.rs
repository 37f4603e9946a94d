use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use vigil_core::activity::ActivityClock;
use vigil_core::config::VigilCfg;
use vigil_core::io::input::InputReceiver;
use vigil_core::io::output::{self, ResultReceiver};
use vigil_core::runtime::{ExitStatus, RuntimeBuilder};
use vigil_exec::{CommandRunner, TaskRunner};

const DEFAULT_CONFIG: &str = "vigil.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config_path = std::env::var("VIGIL_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG));
    let cfg = Arc::new(VigilCfg::load(&config_path)?);
    tracing::info!(config = %config_path.display(), data_dir = %cfg.data_dir.display(), "config loaded");

    let runner: Arc<dyn TaskRunner> = Arc::new(CommandRunner::new(
        cfg.runner_command.clone(),
        Duration::from_secs(cfg.runner_timeout_secs),
    ));
    let (runtime, handle, outputs) = RuntimeBuilder::new(cfg, runner).build().await?;

    let inputs = tokio::spawn(drain_inputs(outputs.inputs, handle.activity.clone()));
    let results = tokio::spawn(drain_results(outputs.results, handle.activity.clone()));

    let status = runtime.run(true).await;
    // senders drop with the runtime and the handle, ending both drains
    drop(handle);
    let _ = tokio::time::timeout(Duration::from_secs(1), async {
        let _ = inputs.await;
        let _ = results.await;
    })
    .await;

    if status == ExitStatus::RestartRequested {
        tracing::info!(code = status.code(), "exiting for restart");
        std::process::exit(status.code());
    }
    Ok(())
}

/// Stderr by default; JSON lines when `VIGIL_LOG_JSON` is set.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("VIGIL_LOG_JSON").is_ok() {
        registry
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

/// Stand-in manager: log system inputs and mark the manager turn.
async fn drain_inputs(mut rx: InputReceiver, activity: Arc<ActivityClock>) {
    while let Some(input) = rx.recv().await {
        activity.manager_started(Utc::now());
        tracing::info!(
            seq = input.seq,
            source = ?input.source,
            event = input.event.map(|e| e.as_str()).unwrap_or("-"),
            text = %input.text,
            "system input"
        );
        activity.manager_finished(Utc::now());
    }
}

async fn drain_results(mut rx: ResultReceiver, activity: Arc<ActivityClock>) {
    while let Some(result) = rx.recv().await {
        activity.touch_manager(Utc::now());
        tracing::info!(task_id = %result.task_id, "{}", output::summarize(&result));
    }
}
