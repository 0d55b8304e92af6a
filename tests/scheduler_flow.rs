//! End-to-end scheduler runs against a real database and real bash jobs.

use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;
use tempfile::TempDir;

use protoflow::config::SchedulerConfig;
use protoflow::domain::{Domain, FileStreamPlugin};
use protoflow::execution::{JobLauncher, JobRequest, JobStatus, LocalLauncher, SchedulerLoop};
use protoflow::persistence::Mapper;
use protoflow::project::Project;
use protoflow::protocol::{parse_definition, Protocol, ProtocolStatus, StepStatus, StreamState};

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        steps_check_interval: 0.05,
        stream_check_interval: 0.0,
        max_parallel_steps: 2,
        ..SchedulerConfig::default()
    }
}

fn open_mapper(dir: &Path) -> Mapper {
    Mapper::open(dir.join("project.sqlite"), fast_config().retry_policy()).unwrap()
}

fn define(mapper: &Mapper, dir: &Path, yaml: &str) -> Protocol {
    let protocol = parse_definition(yaml)
        .unwrap()
        .into_protocol(&dir.join("Runs"))
        .unwrap();
    fs::create_dir_all(&protocol.working_dir).unwrap();
    mapper.save(&protocol).unwrap();
    protocol
}

fn run_loop(mapper: &Mapper, id: &str) -> ProtocolStatus {
    let config = fast_config();
    let domain = Domain::with_builtins();
    let mut launcher = LocalLauncher::new();
    let protocol = mapper.load(id).unwrap();
    let summary = SchedulerLoop::new(mapper, &mut launcher, &domain, &config, protocol)
        .run()
        .unwrap();
    summary.status
}

fn wait_for<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

#[test]
fn test_chain_runs_in_order_and_records_outputs() {
    let temp = TempDir::new().unwrap();
    let mapper = open_mapper(temp.path());
    define(
        &mapper,
        temp.path(),
        r#"
id: ctf
steps:
  - id: import
    command: echo movie > movies.txt
    outputs: movies.txt
    output_set: outputMovies
  - id: estimate
    command: test -f movies.txt && echo ctf > ctf.txt
    prerequisites: import
    outputs: ctf.txt
    output_set: outputCTF
"#,
    );

    assert_eq!(run_loop(&mapper, "ctf"), ProtocolStatus::Finished);

    let stored = mapper.load("ctf").unwrap();
    let import = stored.graph.get("import").unwrap();
    let estimate = stored.graph.get("estimate").unwrap();
    assert_eq!(import.status, StepStatus::Finished);
    assert_eq!(estimate.status, StepStatus::Finished);
    assert!(import.executed_index < estimate.executed_index);
    assert!(stored.ended_at.is_some());

    let items = mapper.set_items("ctf", "outputCTF").unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].key, "ctf.txt");
    let set = mapper.set("ctf", "outputCTF").unwrap().unwrap();
    assert_eq!(set.stream_state, StreamState::Closed);
}

#[test]
fn test_failed_step_blocks_dependents() {
    let temp = TempDir::new().unwrap();
    let mapper = open_mapper(temp.path());
    define(
        &mapper,
        temp.path(),
        r#"
id: broken
steps:
  - id: s1
    command: "true"
  - id: s2
    command: echo "bad input" >&2; exit 3
    prerequisites: s1
  - id: s3
    command: touch never
    prerequisites: s2
"#,
    );

    assert_eq!(run_loop(&mapper, "broken"), ProtocolStatus::Failed);

    let stored = mapper.load("broken").unwrap();
    assert_eq!(stored.graph.get("s1").unwrap().status, StepStatus::Finished);
    assert_eq!(stored.graph.get("s2").unwrap().status, StepStatus::Failed);
    let s3 = stored.graph.get("s3").unwrap();
    assert_eq!(s3.status, StepStatus::Pending);
    assert!(s3.executed_index.is_none());
    assert!(!stored.working_dir.join("never").exists());

    let errors = fs::read_to_string(stored.log_paths().unwrap().stderr).unwrap();
    assert!(errors.contains("bad input"));
}

#[test]
fn test_resume_reruns_only_unfinished_steps() {
    let temp = TempDir::new().unwrap();
    let mapper = open_mapper(temp.path());
    define(
        &mapper,
        temp.path(),
        r#"
id: retry
steps:
  - id: count
    command: echo run >> count.log
  - id: check
    command: test -f ready
    prerequisites: count
"#,
    );

    assert_eq!(run_loop(&mapper, "retry"), ProtocolStatus::Failed);
    let first = mapper.load("retry").unwrap();
    let count_index = first.graph.get("count").unwrap().executed_index;

    fs::write(first.working_dir.join("ready"), "").unwrap();
    assert_eq!(run_loop(&mapper, "retry"), ProtocolStatus::Finished);

    let second = mapper.load("retry").unwrap();
    assert_eq!(second.graph.get("count").unwrap().executed_index, count_index);
    let runs = fs::read_to_string(second.working_dir.join("count.log")).unwrap();
    assert_eq!(runs.lines().count(), 1);
}

#[test]
fn test_stop_request_aborts_running_job() {
    let temp = TempDir::new().unwrap();
    let mapper = open_mapper(temp.path());
    define(
        &mapper,
        temp.path(),
        "id: slow\nsteps:\n  - id: wait\n    command: sleep 30\n  - id: after\n    command: \"true\"\n    prerequisites: wait\n",
    );

    let config = fast_config();
    let domain = Domain::with_builtins();
    let mut launcher = LocalLauncher::new();
    let protocol = mapper.load("slow").unwrap();
    let mut scheduler = SchedulerLoop::new(&mapper, &mut launcher, &domain, &config, protocol);
    scheduler.start().unwrap();
    assert!(scheduler.iterate());
    assert_eq!(
        mapper.load("slow").unwrap().graph.get("wait").unwrap().status,
        StepStatus::Running
    );

    mapper.request_stop("slow").unwrap();
    let started = Instant::now();
    while scheduler.iterate() {
        assert!(started.elapsed() < Duration::from_secs(10), "stop not honored");
        thread::sleep(Duration::from_millis(50));
    }
    let summary = scheduler.finish().unwrap();
    assert_eq!(summary.status, ProtocolStatus::Aborted);

    let stored = mapper.load("slow").unwrap();
    assert_eq!(stored.status, ProtocolStatus::Aborted);
    assert_eq!(stored.graph.get("wait").unwrap().status, StepStatus::Aborted);
    assert_eq!(stored.graph.get("after").unwrap().status, StepStatus::Pending);
}

#[test]
fn test_empty_protocol_finishes_immediately() {
    let temp = TempDir::new().unwrap();
    let mapper = open_mapper(temp.path());
    define(&mapper, temp.path(), "id: empty\n");

    assert_eq!(run_loop(&mapper, "empty"), ProtocolStatus::Finished);
}

#[test]
fn test_streaming_picks_up_files_until_end_marker() {
    let temp = TempDir::new().unwrap();
    let mapper = open_mapper(temp.path());
    let input = temp.path().join("incoming");
    fs::create_dir_all(&input).unwrap();
    fs::write(input.join("mic_001.mrc"), "1").unwrap();

    let working_dir = temp.path().join("Runs/motion");
    fs::create_dir_all(&working_dir).unwrap();
    let protocol = Protocol::new("motion", FileStreamPlugin::KIND, &working_dir)
        .streaming()
        .with_params(json!({
            "input_dir": input,
            "pattern": "{mic}.mrc",
            "command": "cp {file} {mic}.aligned",
            "outputs": ["{mic}.aligned"],
            "output_set": "outputMicrographs",
            "end_marker": "DONE",
            "summary_command": "ls *.aligned > summary.txt",
        }));
    mapper.save(&protocol).unwrap();

    let config = fast_config();
    let domain = Domain::with_builtins();
    let mut launcher = LocalLauncher::new();
    let mut scheduler = SchedulerLoop::new(&mapper, &mut launcher, &domain, &config, protocol);
    scheduler.start().unwrap();

    let mut fed = false;
    let started = Instant::now();
    while scheduler.iterate() {
        assert!(started.elapsed() < Duration::from_secs(20), "stream never ended");
        let finished = scheduler
            .protocol()
            .graph
            .get("item_mic_001")
            .map(|step| step.status == StepStatus::Finished)
            .unwrap_or(false);
        if finished && !fed {
            // The protocol stays RUNNING while more input may arrive
            assert_eq!(mapper.load("motion").unwrap().status, ProtocolStatus::Running);
            fs::write(input.join("mic_002.mrc"), "2").unwrap();
            fs::write(input.join("DONE"), "").unwrap();
            fed = true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    let summary = scheduler.finish().unwrap();
    assert_eq!(summary.status, ProtocolStatus::Finished);

    let stored = mapper.load("motion").unwrap();
    assert!(!stored.more_input);
    let ids: Vec<_> = stored.graph.iter().map(|step| step.id.as_str()).collect();
    assert_eq!(ids, vec!["item_mic_001", "item_mic_002", "item_summary"]);
    assert_eq!(
        stored.graph.get("item_summary").unwrap().prerequisites,
        vec!["item_mic_001".to_string(), "item_mic_002".to_string()]
    );

    let summary_file = fs::read_to_string(working_dir.join("summary.txt")).unwrap();
    assert_eq!(summary_file.lines().count(), 2);
    assert_eq!(mapper.set_items("motion", "outputMicrographs").unwrap().len(), 2);
    assert_eq!(
        mapper.set("motion", "outputMicrographs").unwrap().unwrap().stream_state,
        StreamState::Closed
    );
}

#[test]
fn test_missing_stream_directory_keeps_waiting() {
    let temp = TempDir::new().unwrap();
    let mapper = open_mapper(temp.path());
    let working_dir = temp.path().join("Runs/wait");
    let protocol = Protocol::new("wait", FileStreamPlugin::KIND, &working_dir)
        .streaming()
        .with_params(json!({ "input_dir": "not_there", "command": "true" }));
    mapper.save(&protocol).unwrap();

    let config = fast_config();
    let domain = Domain::with_builtins();
    let mut launcher = LocalLauncher::new();
    let mut scheduler = SchedulerLoop::new(&mapper, &mut launcher, &domain, &config, protocol);
    scheduler.start().unwrap();
    for _ in 0..5 {
        assert!(scheduler.iterate());
    }
    let stored = mapper.load("wait").unwrap();
    assert_eq!(stored.status, ProtocolStatus::Running);
    assert!(stored.more_input);
    assert!(stored.graph.is_empty());
}

#[test]
fn test_scheduled_protocol_runs_in_its_own_process() {
    let temp = TempDir::new().unwrap();
    let config_path = temp.path().join("protoflow.yaml");
    fs::write(
        &config_path,
        format!(
            "steps_check_interval: 0.1\nstream_check_interval: 0\nscheduler_program: {}\n",
            env!("CARGO_BIN_EXE_protoflow")
        ),
    )
    .unwrap();
    let config = SchedulerConfig::load(Some(&config_path)).unwrap();

    let mut project = Project::open(temp.path().join("project.sqlite"), config, Domain::with_builtins())
        .unwrap()
        .with_config_path(&config_path);
    let definition = parse_definition(
        "id: remote\nsteps:\n  - id: a\n    command: echo a > a.txt\n  - id: b\n    command: test -f a.txt\n    prerequisites: a\n",
    )
    .unwrap();
    project.create(definition).unwrap();
    project.schedule("remote").unwrap();

    let finished = wait_for(Duration::from_secs(30), || {
        project.load("remote").map(|p| p.status == ProtocolStatus::Finished).unwrap_or(false)
    });
    let stored = project.load("remote").unwrap();
    assert!(finished, "protocol ended as {} ({:?})", stored.status, stored.error);
    assert!(stored.job.is_some());
    assert_eq!(stored.graph.status_counts().finished, 2);

    // The scheduler exited cleanly, so a refresh leaves FINISHED alone
    assert!(wait_for(Duration::from_secs(10), || {
        project.refresh().map(|changes| changes.is_empty()).unwrap_or(false)
    }));
    assert_eq!(project.load("remote").unwrap().status, ProtocolStatus::Finished);
}

#[test]
fn test_refresh_fails_protocol_whose_scheduler_died() {
    let temp = TempDir::new().unwrap();
    let config_path = temp.path().join("protoflow.yaml");
    // The scheduler binary exits at once without touching the database
    fs::write(&config_path, "scheduler_program: /bin/false\n").unwrap();
    let config = SchedulerConfig::load(Some(&config_path)).unwrap();

    let mut project = Project::open(temp.path().join("project.sqlite"), config, Domain::with_builtins()).unwrap();
    project
        .create(parse_definition("id: orphan\nsteps:\n  - id: a\n    command: \"true\"\n").unwrap())
        .unwrap();
    project.schedule("orphan").unwrap();

    let failed = wait_for(Duration::from_secs(10), || {
        project.refresh().map(|changes| !changes.is_empty()).unwrap_or(false)
    });
    assert!(failed);
    let stored = project.load("orphan").unwrap();
    assert_eq!(stored.status, ProtocolStatus::Failed);
    assert_eq!(stored.error.as_deref(), Some("process not found"));
}

#[test]
fn test_local_launcher_reports_exit_codes() {
    let temp = TempDir::new().unwrap();
    let mut launcher = LocalLauncher::new();
    let protocol = Protocol::new("codes", "static", temp.path());
    let logs = protocol.log_paths().unwrap();

    let ok = JobRequest::new("ok", "exit 0", temp.path(), logs.clone()).unwrap();
    let bad = JobRequest::new("bad", "exit 7", temp.path(), logs).unwrap();
    let ok = launcher.launch(&ok).unwrap();
    let bad = launcher.launch(&bad).unwrap();

    assert!(wait_for(Duration::from_secs(10), || launcher.poll(&ok) == JobStatus::Finished));
    assert!(wait_for(Duration::from_secs(10), || launcher.poll(&bad) == JobStatus::Failed));
}
