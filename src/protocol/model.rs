//! Protocol Data Model
//!
//! Core data structures for protocols, their steps and the status values
//! shared by the scheduler process and the GUI process.
//!
//! # Example YAML Format (steps)
//!
//! ```yaml
//! steps:
//!   - id: import_movies
//!     command: ln -s /data/movies movies
//!
//!   - id: align_movies
//!     command: motioncor --in movies --out aligned
//!     outputs: aligned/
//!     output_set: outputMicrographs
//!     prerequisites: import_movies
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::graph::StepGraph;
use super::outputs::PossibleOutputs;
use super::pointer::Pointer;
use crate::execution::{JobHandle, LogPaths};

/// Error returned when a persisted status string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown {kind} value '{value}'")]
pub struct ParseStatusError {
    kind: &'static str,
    value: String,
}

impl ParseStatusError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Lifecycle of a single step.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Waiting for prerequisites or for a free slot
    #[default]
    Pending,
    /// Dispatched to a job launcher
    Running,
    /// Job exited successfully
    Finished,
    /// Job exited with an error or could not be launched
    Failed,
    /// Job was stopped on request
    Aborted,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Aborted => "ABORTED",
        }
    }

    /// Returns true once the step can no longer change on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Aborted)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "FINISHED" => Ok(Self::Finished),
            "FAILED" => Ok(Self::Failed),
            "ABORTED" => Ok(Self::Aborted),
            other => Err(ParseStatusError::new("step", other)),
        }
    }
}

/// Aggregate status of a protocol.
///
/// `Scheduled` is transient: the protocol has been handed to a scheduler
/// process that has not yet confirmed it is running. It is a distinct value
/// from `Failed`, so an unconfirmed scheduler is never reported as a failure.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolStatus {
    /// Saved, never scheduled
    #[default]
    Pending,
    Scheduled,
    Running,
    Finished,
    Failed,
    Aborted,
}

impl ProtocolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Scheduled => "SCHEDULED",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Aborted => "ABORTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Aborted)
    }

    /// Scheduled or running: a scheduler process owns this protocol.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Scheduled | Self::Running)
    }
}

impl fmt::Display for ProtocolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "SCHEDULED" => Ok(Self::Scheduled),
            "RUNNING" => Ok(Self::Running),
            "FINISHED" => Ok(Self::Finished),
            "FAILED" => Ok(Self::Failed),
            "ABORTED" => Ok(Self::Aborted),
            other => Err(ParseStatusError::new("protocol", other)),
        }
    }
}

/// How a scheduler treats previous results when it picks up a protocol.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Keep finished steps, retry failed or aborted ones
    #[default]
    Resume,
    /// Forget every previous result
    Restart,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resume => "resume",
            Self::Restart => "restart",
        }
    }
}

impl FromStr for RunMode {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resume" => Ok(Self::Resume),
            "restart" => Ok(Self::Restart),
            other => Err(ParseStatusError::new("run mode", other)),
        }
    }
}

/// One schedulable unit inside a protocol.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Step {
    /// Identifier, unique within the owning protocol
    pub id: String,

    /// Shell command executed by the job launcher
    pub command: String,

    /// Steps that must be FINISHED before this one is dispatched
    #[serde(deserialize_with = "single_or_vec", default)]
    pub prerequisites: Vec<String>,

    /// Files produced by the step, recorded as set items once it finishes
    #[serde(deserialize_with = "single_or_vec", default)]
    pub outputs: Vec<String>,

    /// Set output that receives `outputs` when the step finishes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_set: Option<String>,

    #[serde(default)]
    pub status: StepStatus,

    /// Handle of the launched job, kept so another loop can re-poll it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<JobHandle>,

    /// Dispatch counter value at the last execution (resume marker)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_index: Option<u64>,

    /// Consecutive polls that could not confirm the job alive or dead
    #[serde(default)]
    pub unknown_polls: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// Deserializes either a single string or array of strings into Vec<String>
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(de::Error::custom("Expected string in array")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected string or array of strings")),
    }
}

impl Step {
    /// Creates a pending step.
    ///
    /// # Example
    ///
    /// ```
    /// use protoflow::protocol::Step;
    ///
    /// let step = Step::new("ctf", "ctffind4 --input {input}")
    ///     .with_outputs(vec!["ctf/results.txt".to_string()])
    ///     .with_output_set("outputCTF");
    /// assert_eq!(step.id, "ctf");
    /// ```
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            command: command.into().trim().to_string(),
            prerequisites: Vec::new(),
            outputs: Vec::new(),
            output_set: None,
            status: StepStatus::Pending,
            job: None,
            executed_index: None,
            unknown_polls: 0,
            error: None,
            started_at: None,
            ended_at: None,
        }
    }

    /// Sets the prerequisites recorded on the step itself.
    ///
    /// [`StepGraph::push`] validates them when the step is appended.
    pub fn with_prerequisites(mut self, prerequisites: impl Into<super::graph::Prerequisites>) -> Self {
        self.prerequisites = prerequisites.into().into_vec();
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<String>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_output_set(mut self, name: impl Into<String>) -> Self {
        self.output_set = Some(name.into());
        self
    }

    /// Records a dispatch.
    pub fn mark_running(&mut self, job: JobHandle, executed_index: u64) {
        self.status = StepStatus::Running;
        self.job = Some(job);
        self.executed_index = Some(executed_index);
        self.unknown_polls = 0;
        self.error = None;
        self.started_at = Some(Utc::now());
        self.ended_at = None;
    }

    pub fn mark_finished(&mut self) {
        self.status = StepStatus::Finished;
        self.unknown_polls = 0;
        self.ended_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.error = Some(error.into());
        self.ended_at = Some(Utc::now());
    }

    pub fn mark_aborted(&mut self) {
        self.status = StepStatus::Aborted;
        self.ended_at = Some(Utc::now());
    }

    /// Returns the step to PENDING, dropping the previous execution record.
    pub fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.job = None;
        self.unknown_polls = 0;
        self.error = None;
        self.started_at = None;
        self.ended_at = None;
    }
}

/// A named unit of work: an owned graph of steps plus its run metadata.
#[derive(Debug, Clone)]
pub struct Protocol {
    pub id: String,
    /// Kind tag resolved through the [`Domain`](crate::domain::Domain) registry
    pub kind: String,
    pub label: String,
    pub comment: String,
    pub status: ProtocolStatus,
    pub streaming: bool,
    /// Streaming marker: more input, and therefore more steps, may still arrive
    pub more_input: bool,
    pub stop_requested: bool,
    pub run_mode: RunMode,
    pub working_dir: PathBuf,
    /// Kind-specific parameters (for example the watched directory of a stream)
    pub params: Value,
    /// Named input pointers into other protocols' outputs
    pub inputs: BTreeMap<String, Pointer>,
    pub possible_outputs: PossibleOutputs,
    /// Handle of the scheduler process running this protocol
    pub job: Option<JobHandle>,
    pub error: Option<String>,
    /// Number of dispatches so far; stamps `Step::executed_index`
    pub dispatch_counter: u64,
    pub graph: StepGraph,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Wall-clock runtime in milliseconds
    pub runtime_ms: Option<i64>,
}

impl Protocol {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        let id = id.into().trim().to_string();
        let now = Utc::now();
        Self {
            label: id.clone(),
            id,
            kind: kind.into(),
            comment: String::new(),
            status: ProtocolStatus::Pending,
            streaming: false,
            more_input: false,
            stop_requested: false,
            run_mode: RunMode::Resume,
            working_dir: working_dir.into(),
            params: Value::Null,
            inputs: BTreeMap::new(),
            possible_outputs: PossibleOutputs::default(),
            job: None,
            error: None,
            dispatch_counter: 0,
            graph: StepGraph::new(),
            created_at: now,
            modified_at: now,
            started_at: None,
            ended_at: None,
            runtime_ms: None,
        }
    }

    /// Marks the protocol as streaming; it starts out expecting more input.
    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self.more_input = true;
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, pointer: Pointer) -> Self {
        self.inputs.insert(name.into(), pointer);
        self
    }

    pub fn with_possible_outputs(mut self, outputs: PossibleOutputs) -> Self {
        self.possible_outputs = outputs;
        self
    }

    /// Absolute combined and error-only log paths.
    ///
    /// Jobs may run under a different working directory (or on a queue node),
    /// so the paths never depend on the current directory of the caller.
    pub fn log_paths(&self) -> io::Result<LogPaths> {
        let logs = self.working_dir.join("logs");
        LogPaths::new(logs.join("run.stdout"), logs.join("run.stderr"))
    }

    /// Directory holding generated job scripts and exit-code markers.
    pub fn jobs_dir(&self) -> PathBuf {
        self.working_dir.join("jobs")
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn len(&self) -> usize {
        self.graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    /// Prepares steps for a new scheduler run.
    ///
    /// Resume keeps finished steps and steps still running under a recorded
    /// job (they are re-polled); everything else goes back to PENDING.
    /// Restart resets every step.
    pub fn prepare_run(&mut self, mode: RunMode) {
        for step in self.graph.iter_mut() {
            let keep = match mode {
                RunMode::Resume => {
                    step.status == StepStatus::Finished
                        || (step.status == StepStatus::Running && step.job.is_some())
                }
                RunMode::Restart => false,
            };
            if !keep {
                step.reset();
            }
        }
        if mode == RunMode::Restart {
            self.dispatch_counter = 0;
            for step in self.graph.iter_mut() {
                step.executed_index = None;
            }
        }
        self.more_input = self.streaming;
        self.error = None;
        self.ended_at = None;
        self.runtime_ms = None;
    }

    /// Records the terminal timestamps.
    pub fn mark_ended(&mut self) {
        let now = Utc::now();
        self.ended_at = Some(now);
        self.runtime_ms = self
            .started_at
            .map(|start| (now - start).num_milliseconds());
    }
}
