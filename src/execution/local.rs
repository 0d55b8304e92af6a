//! Local process launcher.
//!
//! Jobs run as detached bash wrappers in their own process group. Children
//! spawned by this launcher are reaped directly; jobs adopted from an
//! earlier scheduler process are judged by their exit marker and, failing
//! that, by a process-table lookup.

use std::collections::{HashMap, HashSet};
use std::process::{Child, Command, Stdio};

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, System};

use super::launcher::{JobHandle, JobId, JobLauncher, JobRequest, JobStatus, LaunchError};
use super::script::{classify_exit, read_exit_code, write_job_script};

/// Name of this host, recorded in every handle.
pub static HOST_NAME: Lazy<String> =
    Lazy::new(|| System::host_name().unwrap_or_else(|| "localhost".to_string()));

/// Runs jobs as local processes.
pub struct LocalLauncher {
    children: HashMap<u32, Child>,
    aborted: HashSet<u32>,
    system: System,
}

impl Default for LocalLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalLauncher {
    pub fn new() -> Self {
        Self {
            children: HashMap::new(),
            aborted: HashSet::new(),
            system: System::new(),
        }
    }

    /// Number of spawned children not yet reaped.
    pub fn active_children(&self) -> usize {
        self.children.len()
    }

    fn process_alive(&mut self, pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        if !self
            .system
            .refresh_process_specifics(pid, ProcessRefreshKind::new())
        {
            return false;
        }
        self.system
            .process(pid)
            .map(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
            .unwrap_or(false)
    }

    fn finish_status(&self, pid: u32, status: JobStatus) -> JobStatus {
        if self.aborted.contains(&pid) && status != JobStatus::Finished {
            JobStatus::Aborted
        } else {
            status
        }
    }
}

impl JobLauncher for LocalLauncher {
    fn launch(&mut self, request: &JobRequest) -> Result<JobHandle, LaunchError> {
        let script = write_job_script(request).map_err(|source| LaunchError::Prepare {
            job: request.name.clone(),
            source,
        })?;

        let mut command = Command::new("bash");
        command
            .arg(&script)
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let child = command.spawn().map_err(|source| LaunchError::Spawn {
            job: request.name.clone(),
            source,
        })?;
        let pid = child.id();
        self.children.insert(pid, child);

        info!("Launched job '{}' (pid {})", request.name, pid);
        debug!("  script: {}", script.display());

        Ok(JobHandle {
            job: JobId::Local { pid },
            exit_file: request.exit_file(),
            host: HOST_NAME.clone(),
        })
    }

    fn poll(&mut self, handle: &JobHandle) -> JobStatus {
        let pid = match handle.job {
            JobId::Local { pid } => pid,
            JobId::Queue { .. } => return JobStatus::Unknown,
        };

        if let Some(code) = read_exit_code(&handle.exit_file) {
            if let Some(mut child) = self.children.remove(&pid) {
                // The marker is written just before exit
                if let Err(e) = child.wait() {
                    warn!("Failed to reap pid {}: {}", pid, e);
                }
            }
            return self.finish_status(pid, classify_exit(code));
        }

        if let Some(child) = self.children.get_mut(&pid) {
            return match child.try_wait() {
                Ok(None) => JobStatus::Running,
                Ok(Some(status)) => {
                    self.children.remove(&pid);
                    // Killed before the wrapper could write its marker
                    let status = match status.code() {
                        Some(code) => classify_exit(code),
                        None => JobStatus::Failed,
                    };
                    self.finish_status(pid, status)
                }
                Err(e) => {
                    warn!("Could not query pid {}: {}", pid, e);
                    JobStatus::Unknown
                }
            };
        }

        if handle.host != *HOST_NAME {
            debug!("Job {} belongs to host '{}'", handle.job, handle.host);
            return JobStatus::Unknown;
        }
        if self.process_alive(pid) {
            JobStatus::Running
        } else if self.aborted.contains(&pid) {
            JobStatus::Aborted
        } else {
            JobStatus::Unknown
        }
    }

    fn abort(&mut self, handle: &JobHandle) -> Result<(), LaunchError> {
        let pid = match handle.job {
            JobId::Local { pid } => pid,
            JobId::Queue { .. } => {
                return Err(LaunchError::Abort {
                    job: handle.job.clone(),
                    reason: "not a local job".to_string(),
                })
            }
        };

        info!("Aborting job {}", handle.job);
        self.aborted.insert(pid);

        // Negative pid: signal the whole process group
        let output = Command::new("kill")
            .arg("-TERM")
            .arg("--")
            .arg(format!("-{}", pid))
            .output()
            .map_err(|e| LaunchError::Abort {
                job: handle.job.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Already gone is fine
            if self.children.contains_key(&pid) || self.process_alive(pid) {
                return Err(LaunchError::Abort {
                    job: handle.job.clone(),
                    reason: stderr.trim().to_string(),
                });
            }
            debug!("Job {} already exited: {}", handle.job, stderr.trim());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::LogPaths;
    use std::fs;
    use std::path::Path;
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn request(dir: &Path, name: &str, command: &str) -> JobRequest {
        let logs = LogPaths::new(dir.join("logs/run.stdout"), dir.join("logs/run.stderr")).unwrap();
        JobRequest::new(name, command, dir, logs).unwrap()
    }

    fn wait_terminal(launcher: &mut LocalLauncher, handle: &JobHandle) -> JobStatus {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let status = launcher.poll(handle);
            if status != JobStatus::Running || Instant::now() > deadline {
                return status;
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn test_launch_and_finish() {
        let temp = tempdir().unwrap();
        let mut launcher = LocalLauncher::new();
        let handle = launcher
            .launch(&request(temp.path(), "ok", "echo done > result.txt"))
            .unwrap();

        assert_eq!(wait_terminal(&mut launcher, &handle), JobStatus::Finished);
        assert!(temp.path().join("result.txt").exists());
        assert_eq!(launcher.active_children(), 0);
        assert_eq!(handle.host, *HOST_NAME);
    }

    #[test]
    fn test_launch_and_fail() {
        let temp = tempdir().unwrap();
        let mut launcher = LocalLauncher::new();
        let handle = launcher
            .launch(&request(temp.path(), "bad", "echo oops >&2; exit 2"))
            .unwrap();

        assert_eq!(wait_terminal(&mut launcher, &handle), JobStatus::Failed);
        let stderr = fs::read_to_string(temp.path().join("logs/run.stderr")).unwrap();
        assert!(stderr.contains("oops"));
    }

    #[test]
    fn test_abort_running_job() {
        let temp = tempdir().unwrap();
        let mut launcher = LocalLauncher::new();
        let handle = launcher
            .launch(&request(temp.path(), "slow", "sleep 30"))
            .unwrap();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(launcher.poll(&handle), JobStatus::Running);

        launcher.abort(&handle).unwrap();
        assert_eq!(wait_terminal(&mut launcher, &handle), JobStatus::Aborted);
    }

    #[test]
    fn test_adopted_job_uses_exit_marker() {
        let temp = tempdir().unwrap();
        let mut first = LocalLauncher::new();
        let handle = first.launch(&request(temp.path(), "adopt", "true")).unwrap();
        assert_eq!(wait_terminal(&mut first, &handle), JobStatus::Finished);

        // A fresh launcher (another scheduler process) only has the handle
        let mut second = LocalLauncher::new();
        assert_eq!(second.poll(&handle), JobStatus::Finished);
    }

    #[test]
    fn test_vanished_job_is_unknown() {
        let temp = tempdir().unwrap();
        let handle = JobHandle {
            job: JobId::Local { pid: u32::MAX - 7 },
            exit_file: temp.path().join("missing.exit"),
            host: HOST_NAME.clone(),
        };
        let mut launcher = LocalLauncher::new();
        assert_eq!(launcher.poll(&handle), JobStatus::Unknown);
    }

    #[test]
    fn test_queue_handle_is_unknown_locally() {
        let temp = tempdir().unwrap();
        let handle = JobHandle {
            job: JobId::Queue {
                job_id: "77".to_string(),
            },
            exit_file: temp.path().join("q.exit"),
            host: HOST_NAME.clone(),
        };
        let mut launcher = LocalLauncher::new();
        assert_eq!(launcher.poll(&handle), JobStatus::Unknown);
    }
}
