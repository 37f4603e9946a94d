use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment prefix for per-key overrides (`VIGIL_MAX_CONCURRENT_TASKS=4`).
const ENV_PREFIX: &str = "VIGIL_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("config at {path} is not a JSON object: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// All vigil parameters. Loaded from a JSON key/value file at startup.
/// First boot writes defaults; subsequent boots read existing values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VigilCfg {
    pub data_dir: PathBuf,

    // loop tick intervals (ms)
    pub trigger_tick_ms: u64,
    pub cron_tick_ms: u64,
    pub idle_tick_ms: u64,
    pub dispatch_tick_ms: u64,

    // trigger engine
    pub trigger_check_interval_ms: u64,
    pub trigger_stuck_ms: u64,

    // idle wake
    pub idle_threshold_ms: u64,

    // dispatcher
    pub max_concurrent_tasks: usize,
    pub task_max_retries: u32,
    pub task_retry_backoff_ms: u64,

    // token budget
    pub daily_token_budget: u64,
    pub min_task_cost_tokens: u64,

    // channels
    pub input_channel_capacity: usize,
    pub result_channel_capacity: usize,

    // self-evolve
    pub evolve_enabled: bool,
    pub evolve_poll_interval_secs: u64,
    pub evolve_auto_restart: bool,
    pub evolve_workdir: PathBuf,
    pub evolve_pipeline_command: String,
    pub evolve_validate_commands: Vec<String>,
    pub evolve_validate_timeout_secs: u64,
    pub health_gate_grace_secs: u64,
    pub health_gate_max_boots: u32,

    // execution backend
    pub runner_command: String,
    pub runner_timeout_secs: u64,

    // shutdown
    pub shutdown_timeout_secs: u64,
}

impl Default for VigilCfg {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            trigger_tick_ms: 1000,
            cron_tick_ms: 1000,
            idle_tick_ms: 1000,
            dispatch_tick_ms: 1000,
            trigger_check_interval_ms: 5000,
            trigger_stuck_ms: 7_200_000,
            idle_threshold_ms: 900_000,
            max_concurrent_tasks: 2,
            task_max_retries: 2,
            task_retry_backoff_ms: 5000,
            daily_token_budget: 2_000_000,
            min_task_cost_tokens: 1024,
            input_channel_capacity: 256,
            result_channel_capacity: 256,
            evolve_enabled: false,
            evolve_poll_interval_secs: 300,
            evolve_auto_restart: true,
            evolve_workdir: PathBuf::from("."),
            evolve_pipeline_command: String::new(),
            evolve_validate_commands: vec!["cargo check".into(), "cargo test".into()],
            evolve_validate_timeout_secs: 600,
            health_gate_grace_secs: 120,
            health_gate_max_boots: 3,
            runner_command: "cat".into(),
            runner_timeout_secs: 600,
            shutdown_timeout_secs: 15,
        }
    }
}

impl VigilCfg {
    /// Load config from the JSON file at `path`. If the file is missing, seed it with defaults.
    /// `VIGIL_<KEY>` environment variables override file values.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut map = match std::fs::read_to_string(path) {
            Ok(raw) => parse_entries(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let cfg = Self::default();
                cfg.seed(path)?;
                HashMap::new()
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        map.extend(env_overrides(std::env::vars()));
        Ok(Self::from_map(&map))
    }

    /// Write all default values into a fresh config file.
    fn seed(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let doc: serde_json::Map<String, serde_json::Value> = self
            .to_entries()
            .into_iter()
            .map(|(key, value, _)| (key.to_string(), serde_json::Value::String(value)))
            .collect();
        let raw = serde_json::to_string_pretty(&doc).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, raw).map_err(io_err)?;
        tracing::info!(path = %path.display(), "seeded default config");
        Ok(())
    }

    pub fn from_map(m: &HashMap<String, String>) -> Self {
        let d = Self::default();
        Self {
            data_dir: get_or(m, "data_dir", d.data_dir),
            trigger_tick_ms: get_or(m, "trigger_tick_ms", d.trigger_tick_ms),
            cron_tick_ms: get_or(m, "cron_tick_ms", d.cron_tick_ms),
            idle_tick_ms: get_or(m, "idle_tick_ms", d.idle_tick_ms),
            dispatch_tick_ms: get_or(m, "dispatch_tick_ms", d.dispatch_tick_ms),
            trigger_check_interval_ms: get_or(m, "trigger_check_interval_ms", d.trigger_check_interval_ms),
            trigger_stuck_ms: get_or(m, "trigger_stuck_ms", d.trigger_stuck_ms),
            idle_threshold_ms: get_or(m, "idle_threshold_ms", d.idle_threshold_ms),
            max_concurrent_tasks: get_or(m, "max_concurrent_tasks", d.max_concurrent_tasks),
            task_max_retries: get_or(m, "task_max_retries", d.task_max_retries),
            task_retry_backoff_ms: get_or(m, "task_retry_backoff_ms", d.task_retry_backoff_ms),
            daily_token_budget: get_or(m, "daily_token_budget", d.daily_token_budget),
            min_task_cost_tokens: get_or(m, "min_task_cost_tokens", d.min_task_cost_tokens),
            input_channel_capacity: get_or(m, "input_channel_capacity", d.input_channel_capacity),
            result_channel_capacity: get_or(m, "result_channel_capacity", d.result_channel_capacity),
            evolve_enabled: get_or(m, "evolve_enabled", d.evolve_enabled),
            evolve_poll_interval_secs: get_or(m, "evolve_poll_interval_secs", d.evolve_poll_interval_secs),
            evolve_auto_restart: get_or(m, "evolve_auto_restart", d.evolve_auto_restart),
            evolve_workdir: get_or(m, "evolve_workdir", d.evolve_workdir),
            evolve_pipeline_command: get_or(m, "evolve_pipeline_command", d.evolve_pipeline_command),
            evolve_validate_commands: get_list_or(m, "evolve_validate_commands", d.evolve_validate_commands),
            evolve_validate_timeout_secs: get_or(m, "evolve_validate_timeout_secs", d.evolve_validate_timeout_secs),
            health_gate_grace_secs: get_or(m, "health_gate_grace_secs", d.health_gate_grace_secs),
            health_gate_max_boots: get_or(m, "health_gate_max_boots", d.health_gate_max_boots),
            runner_command: get_or(m, "runner_command", d.runner_command),
            runner_timeout_secs: get_or(m, "runner_timeout_secs", d.runner_timeout_secs),
            shutdown_timeout_secs: get_or(m, "shutdown_timeout_secs", d.shutdown_timeout_secs),
        }
    }

    fn to_entries(&self) -> Vec<(&str, String, &str)> {
        vec![
            ("data_dir", self.data_dir.display().to_string(), "Snapshot, stores and journals root"),
            ("trigger_tick_ms", self.trigger_tick_ms.to_string(), "Trigger loop max tick ms"),
            ("cron_tick_ms", self.cron_tick_ms.to_string(), "Cron wake tick ms"),
            ("idle_tick_ms", self.idle_tick_ms.to_string(), "Idle wake tick ms"),
            ("dispatch_tick_ms", self.dispatch_tick_ms.to_string(), "Dispatcher tick ms"),
            ("trigger_check_interval_ms", self.trigger_check_interval_ms.to_string(), "Conditional re-check interval ms"),
            ("trigger_stuck_ms", self.trigger_stuck_ms.to_string(), "Soft mutex stuck threshold ms"),
            ("idle_threshold_ms", self.idle_threshold_ms.to_string(), "Inactivity before idle wake ms"),
            ("max_concurrent_tasks", self.max_concurrent_tasks.to_string(), "Max concurrent task executions"),
            ("task_max_retries", self.task_max_retries.to_string(), "Retries after the first failed attempt"),
            ("task_retry_backoff_ms", self.task_retry_backoff_ms.to_string(), "Fixed backoff between attempts ms"),
            ("daily_token_budget", self.daily_token_budget.to_string(), "Daily token limit, 0 disables"),
            ("min_task_cost_tokens", self.min_task_cost_tokens.to_string(), "Minimum admission cost estimate"),
            ("input_channel_capacity", self.input_channel_capacity.to_string(), "System input channel buffer"),
            ("result_channel_capacity", self.result_channel_capacity.to_string(), "Task result channel buffer"),
            ("evolve_enabled", self.evolve_enabled.to_string(), "Enable idle self-evolve"),
            ("evolve_poll_interval_secs", self.evolve_poll_interval_secs.to_string(), "Feedback probe interval seconds"),
            ("evolve_auto_restart", self.evolve_auto_restart.to_string(), "Exit for restart after promotion"),
            ("evolve_workdir", self.evolve_workdir.display().to_string(), "Work tree checkpointed by self-evolve"),
            ("evolve_pipeline_command", self.evolve_pipeline_command.clone(), "Shell command proposing changes, empty disables"),
            ("evolve_validate_commands", self.evolve_validate_commands.join(";"), "Validation gates, ';' separated"),
            ("evolve_validate_timeout_secs", self.evolve_validate_timeout_secs.to_string(), "Per-gate timeout seconds"),
            ("health_gate_grace_secs", self.health_gate_grace_secs.to_string(), "Healthy run before confirming promotion"),
            ("health_gate_max_boots", self.health_gate_max_boots.to_string(), "Armed boots before promotion is untrusted"),
            ("runner_command", self.runner_command.clone(), "Shell command executing tasks"),
            ("runner_timeout_secs", self.runner_timeout_secs.to_string(), "Default per-attempt timeout seconds"),
            ("shutdown_timeout_secs", self.shutdown_timeout_secs.to_string(), "Graceful shutdown timeout seconds"),
        ]
    }

    pub fn trigger_check_interval(&self) -> chrono::Duration {
        crate::types::saturating_millis(self.trigger_check_interval_ms)
    }

    pub fn trigger_stuck(&self) -> chrono::Duration {
        crate::types::saturating_millis(self.trigger_stuck_ms)
    }

    pub fn idle_threshold(&self) -> chrono::Duration {
        crate::types::saturating_millis(self.idle_threshold_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.task_retry_backoff_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Flatten a JSON object into string entries. Non-string values keep their JSON text.
fn parse_entries(raw: &str) -> Result<HashMap<String, String>, serde_json::Error> {
    let doc: serde_json::Map<String, serde_json::Value> = serde_json::from_str(raw)?;
    Ok(doc
        .into_iter()
        .map(|(k, v)| {
            let v = match v {
                serde_json::Value::String(s) => s,
                serde_json::Value::Array(items) => items
                    .iter()
                    .filter_map(|i| i.as_str())
                    .collect::<Vec<_>>()
                    .join(";"),
                other => other.to_string(),
            };
            (k, v)
        })
        .collect())
}

fn env_overrides(vars: impl Iterator<Item = (String, String)>) -> HashMap<String, String> {
    vars.filter_map(|(k, v)| {
        k.strip_prefix(ENV_PREFIX)
            .map(|key| (key.to_ascii_lowercase(), v))
    })
    .collect()
}

fn get_or<T: std::str::FromStr>(map: &HashMap<String, String>, key: &str, default: T) -> T {
    map.get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_list_or(map: &HashMap<String, String>, key: &str, default: Vec<String>) -> Vec<String> {
    match map.get(key) {
        Some(v) => v
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_seeded_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.json");
        let cfg = VigilCfg::load(&path).unwrap();
        assert_eq!(cfg.trigger_stuck_ms, 7_200_000);
        assert!(path.exists());

        let raw = std::fs::read_to_string(&path).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["idle_threshold_ms"], "900000");
        assert_eq!(doc["evolve_validate_commands"], "cargo check;cargo test");
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.json");
        std::fs::write(
            &path,
            r#"{"max_concurrent_tasks": 5, "evolve_enabled": "true", "evolve_validate_commands": ["make", "make test"]}"#,
        )
        .unwrap();
        let cfg = VigilCfg::load(&path).unwrap();
        assert_eq!(cfg.max_concurrent_tasks, 5);
        assert!(cfg.evolve_enabled);
        assert_eq!(cfg.evolve_validate_commands, vec!["make", "make test"]);
    }

    #[test]
    fn unparsable_value_falls_back() {
        let mut m = HashMap::new();
        m.insert("task_max_retries".to_string(), "lots".to_string());
        let cfg = VigilCfg::from_map(&m);
        assert_eq!(cfg.task_max_retries, VigilCfg::default().task_max_retries);
    }

    #[test]
    fn env_keys_are_lowercased_and_prefixed() {
        let vars = vec![
            ("VIGIL_DAILY_TOKEN_BUDGET".to_string(), "0".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ];
        let m = env_overrides(vars.into_iter());
        assert_eq!(m.len(), 1);
        assert_eq!(VigilCfg::from_map(&m).daily_token_budget, 0);
    }

    #[test]
    fn non_object_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.json");
        std::fs::write(&path, "[1, 2]").unwrap();
        assert!(matches!(VigilCfg::load(&path), Err(ConfigError::Parse { .. })));
    }
}
