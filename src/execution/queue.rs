//! Queue-system launcher.
//!
//! Renders a submission script from a template, submits it with the
//! configured command and parses the job id from the submitter's output.
//! Polling runs the configured check command; once the job has left the
//! queue its exit marker decides the final status.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::process::Command;

use log::{debug, info, warn};

use super::launcher::{JobHandle, JobId, JobLauncher, JobRequest, JobStatus, LaunchError};
use super::local::HOST_NAME;
use super::script::{classify_exit, read_exit_code, shell_quote, write_job_script};
use crate::config::QueueSettings;

/// Substitutes `{NAME}` variables in a template.
///
/// `{{` and `}}` produce literal braces. Every line with an unknown variable
/// or an unbalanced brace is reported in one
/// [`LaunchError::MalformedTemplate`].
pub fn render_template(template: &str, variables: &BTreeMap<String, String>) -> Result<String, LaunchError> {
    let mut rendered = String::with_capacity(template.len());
    let mut problems = Vec::new();

    for (number, line) in template.split('\n').enumerate() {
        if number > 0 {
            rendered.push('\n');
        }
        let mut chars = line.chars().peekable();
        let mut line_problems = Vec::new();

        while let Some(ch) = chars.next() {
            match ch {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    rendered.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    rendered.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        name.push(c);
                    }
                    if !closed {
                        line_problems.push("unclosed '{'".to_string());
                        continue;
                    }
                    match variables.get(name.trim()) {
                        Some(value) => rendered.push_str(value),
                        None => line_problems.push(format!("unknown variable '{{{}}}'", name)),
                    }
                }
                '}' => line_problems.push("unmatched '}'".to_string()),
                other => rendered.push(other),
            }
        }

        if !line_problems.is_empty() {
            problems.push(format!(
                "line {}: {} ({})",
                number + 1,
                line_problems.join(", "),
                line.trim()
            ));
        }
    }

    if problems.is_empty() {
        Ok(rendered)
    } else {
        Err(LaunchError::MalformedTemplate { lines: problems })
    }
}

/// First run of ASCII digits in `text`.
pub fn parse_job_id(text: &str) -> Option<String> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let digits: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    Some(digits)
}

/// Submits jobs to a batch queue (Slurm, PBS, SGE, ...).
pub struct QueueLauncher {
    settings: QueueSettings,
    aborted: HashSet<String>,
}

impl QueueLauncher {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            aborted: HashSet::new(),
        }
    }

    fn variables(&self, request: &JobRequest) -> BTreeMap<String, String> {
        let mut vars = self.settings.variables.clone();
        let submit_script = request.script_dir.join(format!("{}.job", request.name));
        vars.insert("JOB_NAME".to_string(), request.name.clone());
        vars.insert(
            "JOB_SCRIPT".to_string(),
            submit_script.to_string_lossy().to_string(),
        );
        vars.insert(
            "JOB_COMMAND".to_string(),
            format!("bash {}", shell_quote(&request.script_path().to_string_lossy())),
        );
        vars.insert(
            "JOB_LOGS".to_string(),
            request
                .script_dir
                .join(&request.name)
                .to_string_lossy()
                .to_string(),
        );
        vars.insert(
            "JOB_CWD".to_string(),
            request.working_dir.to_string_lossy().to_string(),
        );
        vars
    }

    fn job_vars(&self, job_id: &str) -> BTreeMap<String, String> {
        let mut vars = self.settings.variables.clone();
        vars.insert("JOB_ID".to_string(), job_id.to_string());
        vars
    }

    fn run_shell(command: &str) -> std::io::Result<std::process::Output> {
        Command::new("bash").arg("-c").arg(command).output()
    }
}

impl JobLauncher for QueueLauncher {
    fn launch(&mut self, request: &JobRequest) -> Result<JobHandle, LaunchError> {
        let vars = self.variables(request);
        let body = render_template(&self.settings.submit_template, &vars)?;
        let submit = render_template(&self.settings.submit_command, &vars)?;

        write_job_script(request).map_err(|source| LaunchError::Prepare {
            job: request.name.clone(),
            source,
        })?;
        let submit_script = request.script_dir.join(format!("{}.job", request.name));
        fs::write(&submit_script, body).map_err(|source| LaunchError::Prepare {
            job: request.name.clone(),
            source,
        })?;

        debug!("Submitting '{}': {}", request.name, submit);
        let output = Self::run_shell(&submit).map_err(|source| LaunchError::Spawn {
            job: request.name.clone(),
            source,
        })?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LaunchError::Submission {
                job: request.name.clone(),
                reason: format!(
                    "'{}' exited with {:?}: {}",
                    submit,
                    output.status.code(),
                    stderr.trim()
                ),
            });
        }

        let job_id = parse_job_id(&stdout).ok_or_else(|| LaunchError::Submission {
            job: request.name.clone(),
            reason: format!("no job id in submitter output '{}'", stdout.trim()),
        })?;

        info!("Submitted job '{}' as queue job {}", request.name, job_id);
        Ok(JobHandle {
            job: JobId::Queue { job_id },
            exit_file: request.exit_file(),
            host: HOST_NAME.clone(),
        })
    }

    fn poll(&mut self, handle: &JobHandle) -> JobStatus {
        let job_id = match handle.job {
            JobId::Queue { ref job_id } => job_id.clone(),
            JobId::Local { .. } => return JobStatus::Unknown,
        };

        let check = match render_template(&self.settings.check_command, &self.job_vars(&job_id)) {
            Ok(check) => check,
            Err(e) => {
                warn!("Cannot check queue job {}: {}", job_id, e);
                return JobStatus::Unknown;
            }
        };
        let output = match Self::run_shell(&check) {
            Ok(output) => output,
            Err(e) => {
                warn!("Check command for job {} failed to start: {}", job_id, e);
                return JobStatus::Unknown;
            }
        };

        let text = String::from_utf8_lossy(&output.stdout);
        let left_queue = text.trim().is_empty()
            || self
                .settings
                .job_done_marker
                .as_deref()
                .map(|marker| !marker.is_empty() && text.contains(marker))
                .unwrap_or(false);

        if !left_queue {
            return JobStatus::Running;
        }

        match read_exit_code(&handle.exit_file) {
            Some(code) => match classify_exit(code) {
                JobStatus::Finished => JobStatus::Finished,
                _ if self.aborted.contains(&job_id) => JobStatus::Aborted,
                status => status,
            },
            None if self.aborted.contains(&job_id) => JobStatus::Aborted,
            None => JobStatus::Unknown,
        }
    }

    fn abort(&mut self, handle: &JobHandle) -> Result<(), LaunchError> {
        let job_id = match handle.job {
            JobId::Queue { ref job_id } => job_id.clone(),
            JobId::Local { .. } => {
                return Err(LaunchError::Abort {
                    job: handle.job.clone(),
                    reason: "not a queue job".to_string(),
                })
            }
        };

        let cancel = render_template(&self.settings.cancel_command, &self.job_vars(&job_id))?;
        info!("Cancelling queue job {}", job_id);
        self.aborted.insert(job_id);

        let output = Self::run_shell(&cancel).map_err(|e| LaunchError::Abort {
            job: handle.job.clone(),
            reason: e.to_string(),
        })?;
        if !output.status.success() {
            return Err(LaunchError::Abort {
                job: handle.job.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::LogPaths;
    use std::path::Path;
    use tempfile::tempdir;

    fn vars() -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("JOB_NAME".to_string(), "ctf_estimate".to_string());
        vars.insert("QUEUE".to_string(), "gpu".to_string());
        vars
    }

    #[test]
    fn test_render_template() {
        let rendered = render_template("#SBATCH -J {JOB_NAME}\n#SBATCH -p {QUEUE}", &vars()).unwrap();
        assert_eq!(rendered, "#SBATCH -J ctf_estimate\n#SBATCH -p gpu");
    }

    #[test]
    fn test_render_template_escapes() {
        let rendered = render_template("awk '{{print $1}}' {JOB_NAME}", &vars()).unwrap();
        assert_eq!(rendered, "awk '{print $1}' ctf_estimate");
    }

    #[test]
    fn test_render_template_reports_every_bad_line() {
        let err = render_template("ok {JOB_NAME}\n-t {TIME}\n-p {QUEUE\nbad }", &vars()).unwrap_err();
        match err {
            LaunchError::MalformedTemplate { lines } => {
                assert_eq!(lines.len(), 3);
                assert!(lines[0].starts_with("line 2"));
                assert!(lines[0].contains("TIME"));
                assert!(lines[1].starts_with("line 3"));
                assert!(lines[2].starts_with("line 4"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_parse_job_id() {
        assert_eq!(parse_job_id("Submitted batch job 48213\n").as_deref(), Some("48213"));
        assert_eq!(parse_job_id("7.cluster").as_deref(), Some("7"));
        assert_eq!(parse_job_id("no id here"), None);
    }

    fn fake_settings(dir: &Path) -> QueueSettings {
        // A "queue" backed by plain bash: submit runs the job in the
        // background, check reports it while its pid file exists.
        let state = dir.join("queue_state");
        fs::create_dir_all(&state).unwrap();
        QueueSettings {
            submit_template: "#!/bin/bash\n{JOB_COMMAND}\nrm -f {STATE}/{JOB_NAME}.running\n".to_string(),
            submit_command: "touch {STATE}/{JOB_NAME}.running; nohup bash {JOB_SCRIPT} >/dev/null 2>&1 & echo \"Submitted batch job 1$RANDOM\"; ln -sf {STATE}/{JOB_NAME}.running {STATE}/current".to_string(),
            check_command: "test -e {STATE}/current && echo RUNNING".to_string(),
            cancel_command: "true".to_string(),
            job_done_marker: Some("COMPLETED".to_string()),
            variables: [("STATE".to_string(), state.to_string_lossy().to_string())]
                .into_iter()
                .collect(),
        }
    }

    #[test]
    fn test_fake_queue_roundtrip() {
        let temp = tempdir().unwrap();
        let logs = LogPaths::new(temp.path().join("logs/run.stdout"), temp.path().join("logs/run.stderr")).unwrap();
        let request = JobRequest::new("q1", "echo queued", temp.path(), logs).unwrap();
        let mut launcher = QueueLauncher::new(fake_settings(temp.path()));

        let handle = launcher.launch(&request).unwrap();
        assert!(matches!(handle.job, JobId::Queue { ref job_id } if job_id.starts_with('1')));
        assert!(request.script_dir.join("q1.job").exists());

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        let mut status = launcher.poll(&handle);
        while status == JobStatus::Running && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(50));
            status = launcher.poll(&handle);
        }
        assert_eq!(status, JobStatus::Finished);
        let out = fs::read_to_string(temp.path().join("logs/run.stdout")).unwrap();
        assert!(out.contains("queued"));
    }

    #[test]
    fn test_malformed_template_is_reported_at_launch() {
        let temp = tempdir().unwrap();
        let logs = LogPaths::new(temp.path().join("o"), temp.path().join("e")).unwrap();
        let request = JobRequest::new("q2", "true", temp.path(), logs).unwrap();
        let mut settings = fake_settings(temp.path());
        settings.submit_template = "#SBATCH --mem={MEMORY}\n".to_string();

        let result = QueueLauncher::new(settings).launch(&request);
        assert!(matches!(result, Err(LaunchError::MalformedTemplate { .. })));
    }

    #[test]
    fn test_left_queue_without_marker_is_unknown() {
        let temp = tempdir().unwrap();
        let mut settings = fake_settings(temp.path());
        settings.check_command = "true".to_string();
        let handle = JobHandle {
            job: JobId::Queue {
                job_id: "5".to_string(),
            },
            exit_file: temp.path().join("never.exit"),
            host: "login1".to_string(),
        };
        assert_eq!(QueueLauncher::new(settings).poll(&handle), JobStatus::Unknown);
    }
}
