//! Job Launcher Interface
//!
//! A launcher starts a step (or a whole scheduler process) as an
//! independent OS-level job and later reports on it through a serializable
//! [`JobHandle`]. Handles are stored in the database, so any process can poll
//! a job that another process launched.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::local::LocalLauncher;
use super::queue::QueueLauncher;
use crate::config::LauncherConfig;
use crate::protocol::{Protocol, Step};

/// Backend-specific job identifier.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum JobId {
    /// Process id of the wrapper script (also its process group id)
    Local { pid: u32 },
    /// Identifier assigned by the queue system
    Queue { job_id: String },
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local { pid } => write!(f, "pid {}", pid),
            Self::Queue { job_id } => write!(f, "queue job {}", job_id),
        }
    }
}

/// Everything needed to poll or abort a launched job later.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub job: JobId,
    /// Marker file receiving the job's exit code
    pub exit_file: PathBuf,
    /// Host the job was launched from
    pub host: String,
}

/// Result of polling a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Finished,
    Failed,
    Aborted,
    /// Neither alive nor dead could be confirmed; poll again later
    Unknown,
}

/// Absolute paths of the combined and error-only logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl LogPaths {
    /// Makes both paths absolute against the current directory.
    pub fn new(stdout: impl AsRef<Path>, stderr: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self {
            stdout: std::path::absolute(stdout)?,
            stderr: std::path::absolute(stderr)?,
        })
    }
}

/// A command to run as an independent job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Unique, filesystem-safe job name
    pub name: String,
    pub command: String,
    pub working_dir: PathBuf,
    pub logs: LogPaths,
    /// Directory receiving generated scripts and the exit-code marker
    pub script_dir: PathBuf,
}

impl JobRequest {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        working_dir: impl AsRef<Path>,
        logs: LogPaths,
    ) -> io::Result<Self> {
        let working_dir = std::path::absolute(working_dir)?;
        Ok(Self {
            name: sanitize_job_name(&name.into()),
            command: command.into(),
            script_dir: working_dir.join("jobs"),
            working_dir,
            logs,
        })
    }

    /// Request for one step of a protocol, logging into the protocol logs.
    pub fn for_step(protocol: &Protocol, step: &Step) -> io::Result<Self> {
        let mut request = Self::new(
            format!("{}_{}", protocol.id, step.id),
            &step.command,
            &protocol.working_dir,
            protocol.log_paths()?,
        )?;
        request.script_dir = std::path::absolute(protocol.jobs_dir())?;
        Ok(request)
    }

    pub fn with_script_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.script_dir = dir.into();
        self
    }

    pub fn script_path(&self) -> PathBuf {
        self.script_dir.join(format!("{}.sh", self.name))
    }

    pub fn exit_file(&self) -> PathBuf {
        self.script_dir.join(format!("{}.exit", self.name))
    }
}

/// Replaces characters that are awkward in file names and queue job names.
fn sanitize_job_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Failed to prepare job '{job}': {source}")]
    Prepare {
        job: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to start job '{job}': {source}")]
    Spawn {
        job: String,
        #[source]
        source: io::Error,
    },

    /// Submission template with unknown variables or unbalanced braces
    #[error("Malformed submission template:\n{}", lines.join("\n"))]
    MalformedTemplate { lines: Vec<String> },

    #[error("Submission of job '{job}' failed: {reason}")]
    Submission { job: String, reason: String },

    #[error("Failed to abort {job}: {reason}")]
    Abort { job: JobId, reason: String },
}

/// Starts jobs and reports on them.
pub trait JobLauncher {
    fn launch(&mut self, request: &JobRequest) -> Result<JobHandle, LaunchError>;

    /// Never fails: anything that cannot be decided is [`JobStatus::Unknown`].
    fn poll(&mut self, handle: &JobHandle) -> JobStatus;

    fn abort(&mut self, handle: &JobHandle) -> Result<(), LaunchError>;
}

impl<L: JobLauncher + ?Sized> JobLauncher for Box<L> {
    fn launch(&mut self, request: &JobRequest) -> Result<JobHandle, LaunchError> {
        (**self).launch(request)
    }

    fn poll(&mut self, handle: &JobHandle) -> JobStatus {
        (**self).poll(handle)
    }

    fn abort(&mut self, handle: &JobHandle) -> Result<(), LaunchError> {
        (**self).abort(handle)
    }
}

/// Builds the launcher selected by the configuration.
pub fn launcher_from_config(config: &LauncherConfig) -> Box<dyn JobLauncher> {
    match config {
        LauncherConfig::Local => Box::new(LocalLauncher::new()),
        LauncherConfig::Queue(settings) => Box::new(QueueLauncher::new(settings.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_paths_made_absolute() {
        let logs = LogPaths::new("logs/run.stdout", "logs/run.stderr").unwrap();
        assert!(logs.stdout.is_absolute());
        assert!(logs.stderr.ends_with("logs/run.stderr"));
    }

    #[test]
    fn test_request_for_step() {
        let protocol = Protocol::new("ctf 01", "static", "/data/Runs/ctf");
        let step = Step::new("estimate/all", "ctffind4");
        let request = JobRequest::for_step(&protocol, &step).unwrap();

        assert_eq!(request.name, "ctf_01_estimate_all");
        assert_eq!(request.script_dir, PathBuf::from("/data/Runs/ctf/jobs"));
        assert_eq!(
            request.exit_file(),
            PathBuf::from("/data/Runs/ctf/jobs/ctf_01_estimate_all.exit")
        );
        assert_eq!(request.logs.stdout, PathBuf::from("/data/Runs/ctf/logs/run.stdout"));
    }

    #[test]
    fn test_job_handle_json() {
        let handle = JobHandle {
            job: JobId::Queue {
                job_id: "8812".to_string(),
            },
            exit_file: PathBuf::from("/tmp/j.exit"),
            host: "login1".to_string(),
        };
        let json = serde_json::to_string(&handle).unwrap();
        assert!(json.contains("\"backend\":\"queue\""));
        let back: JobHandle = serde_json::from_str(&json).unwrap();
        assert_eq!(back, handle);
    }
}
