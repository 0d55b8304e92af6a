//! Job wrapper scripts and exit-code markers.
//!
//! Every job runs through a generated bash wrapper that appends stdout to
//! the combined log, tees stderr into both logs and records the exit code in
//! a marker file. The marker lets any process classify a job that has
//! exited, not only the parent that spawned it.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::debug;

use super::launcher::{JobRequest, JobStatus};

/// Exit code written when the wrapper receives SIGTERM (128 + 15).
pub const ABORTED_EXIT_CODE: i32 = 143;

/// Quotes a value for safe interpolation into a bash script.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

/// Renders the wrapper script body for a request.
pub fn wrapper_script(request: &JobRequest) -> String {
    let exit_file = quote_path(&request.exit_file());
    let stdout = quote_path(&request.logs.stdout);
    let stderr = quote_path(&request.logs.stderr);

    let mut script = String::new();
    script.push_str("#!/bin/bash\n");
    script.push_str(&format!("# job: {}\n", request.name));
    script.push_str("set -o pipefail\n");
    script.push_str(&format!("rm -f {}\n", exit_file));
    script.push_str(&format!(
        "trap 'echo {code} > {exit}; exit {code}' TERM\n",
        code = ABORTED_EXIT_CODE,
        exit = exit_file.replace('\'', "'\\''")
    ));
    script.push_str("(\n");
    script.push_str(&format!("cd {} || exit 1\n", quote_path(&request.working_dir)));
    script.push_str(&request.command);
    script.push('\n');
    script.push_str(&format!(") 2>&1 1>>{} | tee -a {} >>{}\n", stdout, stderr, stdout));
    script.push_str("status=$?\n");
    script.push_str(&format!("echo $status > {}\n", exit_file));
    script.push_str("exit $status\n");
    script
}

/// Writes the wrapper script and prepares the log and script directories.
///
/// A stale exit marker from a previous run of the same job is removed so it
/// cannot be mistaken for the new job's result.
pub fn write_job_script(request: &JobRequest) -> io::Result<PathBuf> {
    fs::create_dir_all(&request.script_dir)?;
    fs::create_dir_all(&request.working_dir)?;
    for log in [&request.logs.stdout, &request.logs.stderr] {
        if let Some(parent) = log.parent() {
            fs::create_dir_all(parent)?;
        }
    }

    match fs::remove_file(request.exit_file()) {
        Ok(()) => debug!("Removed stale exit marker for '{}'", request.name),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let script_path = request.script_path();
    let mut file = File::create(&script_path)?;
    file.write_all(wrapper_script(request).as_bytes())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))?;
    }

    Ok(script_path)
}

/// Exit code recorded in a marker file, if the job has written one.
pub fn read_exit_code(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Maps an exit code to a terminal job status.
pub fn classify_exit(code: i32) -> JobStatus {
    match code {
        0 => JobStatus::Finished,
        ABORTED_EXIT_CODE => JobStatus::Aborted,
        _ => JobStatus::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::LogPaths;
    use std::process::Command;
    use tempfile::tempdir;

    fn request(dir: &Path, command: &str) -> JobRequest {
        let logs = LogPaths::new(dir.join("logs/run.stdout"), dir.join("logs/run.stderr")).unwrap();
        JobRequest::new("p1_step", command, dir, logs).unwrap()
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_wrapper_contains_command_and_marker() {
        let temp = tempdir().unwrap();
        let request = request(temp.path(), "echo hello");
        let script = wrapper_script(&request);

        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("echo hello"));
        assert!(script.contains("set -o pipefail"));
        assert!(script.contains(&request.exit_file().to_string_lossy().to_string()));
    }

    #[test]
    fn test_wrapper_splits_logs_and_records_exit_code() {
        let temp = tempdir().unwrap();
        let request = request(temp.path(), "echo to-out; echo to-err >&2; exit 3");
        let script = write_job_script(&request).unwrap();

        let status = Command::new("bash").arg(&script).status().unwrap();
        assert_eq!(status.code(), Some(3));

        let out = fs::read_to_string(&request.logs.stdout).unwrap();
        let err = fs::read_to_string(&request.logs.stderr).unwrap();
        assert!(out.contains("to-out"));
        assert!(out.contains("to-err"));
        assert!(err.contains("to-err"));
        assert!(!err.contains("to-out"));

        assert_eq!(read_exit_code(&request.exit_file()), Some(3));
    }

    #[test]
    fn test_stale_marker_removed() {
        let temp = tempdir().unwrap();
        let request = request(temp.path(), "true");
        fs::create_dir_all(&request.script_dir).unwrap();
        fs::write(request.exit_file(), "1\n").unwrap();

        write_job_script(&request).unwrap();
        assert!(read_exit_code(&request.exit_file()).is_none());
    }

    #[test]
    fn test_classify_exit() {
        assert_eq!(classify_exit(0), JobStatus::Finished);
        assert_eq!(classify_exit(1), JobStatus::Failed);
        assert_eq!(classify_exit(ABORTED_EXIT_CODE), JobStatus::Aborted);
    }
}
