//! Scheduler Configuration
//!
//! Values consumed by the scheduler loop, the persistence layer and the
//! job launcher. Loaded once at process start from an optional YAML file,
//! then overridden from the environment, and passed down explicitly.
//!
//! # Example YAML
//!
//! ```yaml
//! steps_check_interval: 3
//! retry_attempts: 3
//! retry_wait: 2
//! launcher:
//!   type: queue
//!   submit_template: |
//!     #!/bin/bash
//!     #SBATCH -J {JOB_NAME}
//!     #SBATCH -o {JOB_LOGS}.out
//!     {JOB_COMMAND}
//!   submit_command: sbatch {JOB_SCRIPT}
//!   check_command: squeue -h -j {JOB_ID}
//!   cancel_command: scancel {JOB_ID}
//! ```

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::persistence::RetryPolicy;

/// Poll interval override, in seconds.
pub const ENV_POLL_SECS: &str = "PROTOFLOW_POLL_SECS";
pub const ENV_RETRY_ATTEMPTS: &str = "PROTOFLOW_RETRY_ATTEMPTS";
pub const ENV_RETRY_WAIT_SECS: &str = "PROTOFLOW_RETRY_WAIT_SECS";

/// Path of the `protoflow` binary used to start scheduler processes.
///
/// Resolution order: next to the running executable, then `protoflow` on
/// the PATH.
pub static SCHEDULER_PROGRAM: Lazy<PathBuf> = Lazy::new(|| {
    if let Ok(exe_path) = env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            let sibling = exe_dir.join("protoflow");
            if sibling.exists() {
                debug!("Using scheduler binary: {}", sibling.display());
                return sibling;
            }
        }
    }
    PathBuf::from("protoflow")
});

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid value '{value}' for {name}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Commands and template of a batch queue.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    /// Submission script template (`{JOB_NAME}`, `{JOB_SCRIPT}`,
    /// `{JOB_COMMAND}`, `{JOB_LOGS}`, `{JOB_CWD}` plus `variables`)
    pub submit_template: String,

    /// Command submitting the rendered script; its output holds the job id
    pub submit_command: String,

    /// Command printing queue state for `{JOB_ID}`
    pub check_command: String,

    pub cancel_command: String,

    /// Text in the check output meaning the job has left the queue
    #[serde(default)]
    pub job_done_marker: Option<String>,

    /// Extra template variables
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

/// Which launcher runs jobs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LauncherConfig {
    #[default]
    Local,
    Queue(QueueSettings),
}

fn default_steps_check_interval() -> f64 {
    3.0
}

fn default_stream_check_interval() -> f64 {
    3.0
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_wait() -> f64 {
    2.0
}

fn default_initial_refresh_wait() -> f64 {
    1.0
}

fn default_auto_refresh() -> bool {
    true
}

fn default_max_parallel_steps() -> usize {
    num_cpus::get()
}

fn default_unknown_poll_limit() -> u32 {
    20
}

/// Runtime configuration. Durations are in seconds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Seconds between scheduler loop iterations
    #[serde(default = "default_steps_check_interval")]
    pub steps_check_interval: f64,

    /// Minimum seconds between streaming input checks
    #[serde(default = "default_stream_check_interval")]
    pub stream_check_interval: f64,

    /// Busy results tolerated per contended write
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_wait")]
    pub retry_wait: f64,

    /// Seconds the GUI-side refresher waits before its first refresh
    #[serde(default = "default_initial_refresh_wait")]
    pub initial_refresh_wait: f64,

    /// Whether the GUI-side refresher keeps running
    #[serde(default = "default_auto_refresh")]
    pub auto_refresh: bool,

    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,

    /// Consecutive UNKNOWN polls after which a step is failed
    #[serde(default = "default_unknown_poll_limit")]
    pub unknown_poll_limit: u32,

    #[serde(default)]
    pub launcher: LauncherConfig,

    /// Binary used to start scheduler processes; defaults to
    /// [`SCHEDULER_PROGRAM`]
    #[serde(default)]
    pub scheduler_program: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            steps_check_interval: default_steps_check_interval(),
            stream_check_interval: default_stream_check_interval(),
            retry_attempts: default_retry_attempts(),
            retry_wait: default_retry_wait(),
            initial_refresh_wait: default_initial_refresh_wait(),
            auto_refresh: default_auto_refresh(),
            max_parallel_steps: default_max_parallel_steps(),
            unknown_poll_limit: default_unknown_poll_limit(),
            launcher: LauncherConfig::default(),
            scheduler_program: None,
        }
    }
}

fn seconds(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

impl SchedulerConfig {
    /// Loads configuration from `path` (defaults if `None`) and applies
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading configuration from: {}", path.display());
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies `PROTOFLOW_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = env_value(ENV_POLL_SECS)? {
            self.steps_check_interval = value;
        }
        if let Some(value) = env_value::<u32>(ENV_RETRY_ATTEMPTS)? {
            self.retry_attempts = value;
        }
        if let Some(value) = env_value(ENV_RETRY_WAIT_SECS)? {
            self.retry_wait = value;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("steps_check_interval", self.steps_check_interval),
            ("stream_check_interval", self.stream_check_interval),
            ("retry_wait", self.retry_wait),
            ("initial_refresh_wait", self.initial_refresh_wait),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!("{} must be >= 0, got {}", name, value)));
            }
        }
        if self.max_parallel_steps == 0 {
            return Err(ConfigError::Invalid("max_parallel_steps must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn steps_check_interval(&self) -> Duration {
        seconds(self.steps_check_interval)
    }

    pub fn stream_check_interval(&self) -> Duration {
        seconds(self.stream_check_interval)
    }

    pub fn initial_refresh_wait(&self) -> Duration {
        seconds(self.initial_refresh_wait)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, seconds(self.retry_wait))
    }

    pub fn scheduler_program(&self) -> PathBuf {
        self.scheduler_program
            .clone()
            .unwrap_or_else(|| SCHEDULER_PROGRAM.clone())
    }
}

fn env_value<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => {
            let parsed = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv {
                    name,
                    value: value.clone(),
                })?;
            debug!("{} overrides configuration: {}", name, value);
            Ok(Some(parsed))
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => {
            warn!("Ignoring non-unicode value of {}", name);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.steps_check_interval(), Duration::from_secs(3));
        assert_eq!(config.retry_policy(), RetryPolicy::new(3, Duration::from_secs(2)));
        assert_eq!(config.initial_refresh_wait(), Duration::from_secs(1));
        assert!(config.auto_refresh);
        assert_eq!(config.unknown_poll_limit, 20);
        assert_eq!(config.launcher, LauncherConfig::Local);
        assert!(config.max_parallel_steps >= 1);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("protoflow.yaml");
        fs::write(&path, "steps_check_interval: 0.5\nmax_parallel_steps: 2\n").unwrap();

        let config = SchedulerConfig::from_file(&path).unwrap();
        assert_eq!(config.steps_check_interval(), Duration::from_millis(500));
        assert_eq!(config.max_parallel_steps, 2);
        assert_eq!(config.retry_attempts, 3);
    }

    #[test]
    fn test_queue_launcher_yaml() {
        let yaml = r#"
launcher:
  type: queue
  submit_template: "{JOB_COMMAND}"
  submit_command: sbatch {JOB_SCRIPT}
  check_command: squeue -h -j {JOB_ID}
  cancel_command: scancel {JOB_ID}
  variables:
    PARTITION: gpu
"#;
        let config: SchedulerConfig = serde_yaml::from_str(yaml).unwrap();
        match config.launcher {
            LauncherConfig::Queue(settings) => {
                assert_eq!(settings.submit_command, "sbatch {JOB_SCRIPT}");
                assert_eq!(settings.variables.get("PARTITION").unwrap(), "gpu");
                assert!(settings.job_done_marker.is_none());
            }
            other => panic!("expected queue launcher, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = SchedulerConfig {
            max_parallel_steps: 0,
            ..SchedulerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = SchedulerConfig {
            retry_wait: -1.0,
            ..SchedulerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let result = SchedulerConfig::from_file(Path::new("/nonexistent/protoflow.yaml"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
