//! Scheduler Loop
//!
//! Drives one protocol from RUNNING to a terminal status. Each iteration:
//!
//! 1. retries any writes that failed earlier
//! 2. observes a stop request (in-process handle or persisted flag)
//! 3. polls the jobs of RUNNING steps
//! 4. aggregates the protocol status
//! 5. dispatches runnable steps unless the protocol failed
//! 6. lets the streaming controller append new steps
//! 7. persists the aggregate status
//!
//! Every step transition is written immediately, one step at a time, so a
//! crashed loop never loses a dispatch record. The loop never blocks on a
//! job; it polls and sleeps for the configured interval.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::json;
use thiserror::Error;

use super::launcher::{JobLauncher, JobRequest, JobStatus, LaunchError};
use super::status::aggregate_status;
use super::streaming::{StreamOutcome, StreamingController};
use crate::config::SchedulerConfig;
use crate::domain::Domain;
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::persistence::{Mapper, PersistenceError};
use crate::protocol::{
    Protocol, ProtocolStatus, RunMode, SetItem, StatusCounts, StepStatus, StreamState,
    DEFAULT_ITEM_KIND,
};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Scheduler of protocol '{protocol}' could not persist its state: {source}")]
    Persistence {
        protocol: String,
        #[source]
        source: PersistenceError,
    },
}

/// Cooperative stop request shared with the loop.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of a completed loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopSummary {
    pub status: ProtocolStatus,
    pub iterations: u64,
    pub counts: StatusCounts,
}

/// Scheduler of a single protocol.
///
/// # Example
///
/// ```rust,no_run
/// use protoflow::config::SchedulerConfig;
/// use protoflow::domain::Domain;
/// use protoflow::execution::{LocalLauncher, SchedulerLoop};
/// use protoflow::persistence::Mapper;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = SchedulerConfig::default();
///     let mapper = Mapper::open("project.sqlite", config.retry_policy())?;
///     let protocol = mapper.load("ctf_01")?;
///     let domain = Domain::with_builtins();
///     let mut launcher = LocalLauncher::new();
///
///     let summary = SchedulerLoop::new(&mapper, &mut launcher, &domain, &config, protocol).run()?;
///     println!("{}", summary.status);
///     Ok(())
/// }
/// ```
pub struct SchedulerLoop<'a> {
    mapper: &'a Mapper,
    launcher: &'a mut dyn JobLauncher,
    domain: &'a Domain,
    config: &'a SchedulerConfig,
    protocol: Protocol,
    streaming: Option<StreamingController>,
    stop: StopHandle,
    timeline: ExecutionTimeline,
    /// Steps whose last write failed
    unsaved_steps: BTreeSet<String>,
    /// `(status, more_input)` as last written
    saved_status: Option<(ProtocolStatus, bool)>,
    stopping: bool,
    done: bool,
    iterations: u64,
}

impl<'a> SchedulerLoop<'a> {
    pub fn new(
        mapper: &'a Mapper,
        launcher: &'a mut dyn JobLauncher,
        domain: &'a Domain,
        config: &'a SchedulerConfig,
        protocol: Protocol,
    ) -> Self {
        Self {
            mapper,
            launcher,
            domain,
            config,
            protocol,
            streaming: None,
            stop: StopHandle::new(),
            timeline: ExecutionTimeline::new(),
            unsaved_steps: BTreeSet::new(),
            saved_status: None,
            stopping: false,
            done: false,
            iterations: 0,
        }
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn timeline(&self) -> &ExecutionTimeline {
        &self.timeline
    }

    /// Handle another thread can use to stop the loop.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Runs the loop to completion.
    pub fn run(mut self) -> Result<LoopSummary, SchedulerError> {
        self.start()?;
        while self.iterate() {
            thread::sleep(self.config.steps_check_interval());
        }
        self.finish()
    }

    /// Prepares the protocol and marks it RUNNING.
    ///
    /// Unresolvable inputs and unusable kinds fail the protocol (recorded in
    /// its `error`) rather than the call; only persistence errors are
    /// returned.
    pub fn start(&mut self) -> Result<(), SchedulerError> {
        let mode = self.protocol.run_mode;
        info!(
            "Starting protocol '{}' ({}, {} steps, mode: {})",
            self.protocol.id,
            self.protocol.kind,
            self.protocol.len(),
            mode.as_str()
        );

        self.protocol.prepare_run(mode);
        if mode == RunMode::Restart {
            self.mapper
                .clear_sets(&self.protocol.id)
                .map_err(|source| self.persistence(source))?;
            self.protocol.run_mode = RunMode::Resume;
        }
        self.protocol.started_at = Some(Utc::now());

        if let Err(reason) = self.prepare_inputs_and_kind() {
            error!("Protocol '{}' failed to start: {}", self.protocol.id, reason);
            self.protocol.status = ProtocolStatus::Failed;
            self.protocol.error = Some(reason);
            self.protocol.mark_ended();
            self.done = true;
            return self.save_all();
        }

        let mut declarations = self.protocol.possible_outputs.declarations();
        for step in self.protocol.graph.iter() {
            if let Some(ref set) = step.output_set {
                if !declarations.iter().any(|(name, _)| name == set) {
                    declarations.push((set.clone(), DEFAULT_ITEM_KIND.to_string()));
                }
            }
        }
        self.mapper
            .open_sets(&self.protocol.id, &declarations)
            .map_err(|source| self.persistence(source))?;

        self.protocol.status = ProtocolStatus::Running;
        self.protocol.error = None;
        self.save_all()
    }

    fn prepare_inputs_and_kind(&mut self) -> Result<(), String> {
        for (name, pointer) in &self.protocol.inputs {
            match self.mapper.resolve(pointer) {
                Ok(resolved) => debug!(
                    "Input '{}' -> {} ({} items)",
                    name,
                    pointer,
                    resolved.set().size
                ),
                Err(e) => return Err(format!("input '{}': {}", name, e)),
            }
        }

        let plugin = self.domain.plugin(&self.protocol.kind).map_err(|e| e.to_string())?;
        if self.protocol.streaming {
            match plugin.step_source(&self.protocol).map_err(|e| e.to_string())? {
                Some(source) => {
                    self.streaming = Some(StreamingController::new(
                        source,
                        self.config.stream_check_interval(),
                    ));
                }
                None => {
                    warn!(
                        "Protocol '{}' is streaming but kind '{}' supplies no steps",
                        self.protocol.id, self.protocol.kind
                    );
                    self.protocol.more_input = false;
                }
            }
        }
        Ok(())
    }

    /// Runs one iteration; returns `false` once the loop is done.
    pub fn iterate(&mut self) -> bool {
        if self.done {
            return false;
        }
        self.iterations += 1;
        debug!("Protocol '{}': iteration {}", self.protocol.id, self.iterations);

        self.flush();

        if !self.stopping && self.stop_observed() {
            self.begin_stop();
        }

        self.refresh_running();

        if self.stopping {
            if self.protocol.graph.status_counts().running == 0 {
                info!("Protocol '{}' aborted", self.protocol.id);
                self.protocol.status = ProtocolStatus::Aborted;
                self.protocol.mark_ended();
                self.done = true;
            }
            self.persist_status();
            return !self.done;
        }

        self.protocol.status =
            aggregate_status(&self.protocol.graph, self.protocol.status, self.protocol.more_input);
        if self.protocol.status == ProtocolStatus::Running {
            self.dispatch();
        }

        self.poll_stream();

        self.protocol.status =
            aggregate_status(&self.protocol.graph, self.protocol.status, self.protocol.more_input);
        if self.protocol.status.is_terminal() && self.protocol.graph.status_counts().running == 0 {
            info!(
                "Protocol '{}' {} after {} iteration(s)",
                self.protocol.id, self.protocol.status, self.iterations
            );
            self.protocol.mark_ended();
            self.done = true;
        }

        self.persist_status();
        !self.done
    }

    /// Closes the protocol's sets and writes everything still pending.
    pub fn finish(mut self) -> Result<LoopSummary, SchedulerError> {
        if let Err(e) = self
            .mapper
            .set_stream_state_all(&self.protocol.id, StreamState::Closed)
        {
            error!("Protocol '{}': could not close sets: {}", self.protocol.id, e);
        }

        if !self.timeline.is_empty() {
            info!("{}", self.timeline.gantt_chart());
        }

        self.save_all()?;
        Ok(LoopSummary {
            status: self.protocol.status,
            iterations: self.iterations,
            counts: self.protocol.graph.status_counts(),
        })
    }

    fn stop_observed(&self) -> bool {
        if self.stop.is_requested() {
            return true;
        }
        match self.mapper.stop_requested(&self.protocol.id) {
            Ok(requested) => requested,
            Err(e) => {
                warn!("Protocol '{}': could not read stop flag: {}", self.protocol.id, e);
                false
            }
        }
    }

    fn begin_stop(&mut self) {
        info!("Protocol '{}': stop requested, aborting running steps", self.protocol.id);
        self.stopping = true;

        let jobs: Vec<_> = self
            .protocol
            .graph
            .iter()
            .filter(|step| step.status == StepStatus::Running)
            .filter_map(|step| step.job.clone().map(|job| (step.id.clone(), job)))
            .collect();
        for (step_id, job) in jobs {
            if let Err(e) = self.launcher.abort(&job) {
                warn!("Step '{}': {}", step_id, e);
            }
        }
    }

    fn refresh_running(&mut self) {
        for id in self.protocol.graph.ids_with_status(StepStatus::Running) {
            let job = match self.protocol.graph.get(&id).and_then(|step| step.job.clone()) {
                Some(job) => job,
                None => {
                    self.fail_step(&id, "running without a recorded job".to_string());
                    continue;
                }
            };

            match self.launcher.poll(&job) {
                JobStatus::Running => {
                    let reset = self
                        .protocol
                        .graph
                        .get_mut(&id)
                        .map(|step| std::mem::take(&mut step.unknown_polls) > 0)
                        .unwrap_or(false);
                    if reset {
                        self.save_step(&id);
                    }
                }
                JobStatus::Finished => self.complete_step(&id),
                JobStatus::Failed => self.fail_step(&id, format!("{} exited with an error", job.job)),
                JobStatus::Aborted => {
                    info!("Step '{}' aborted", id);
                    if let Some(step) = self.protocol.graph.get_mut(&id) {
                        step.mark_aborted();
                    }
                    self.timeline.record(id.as_str(), EventType::Aborted);
                    self.save_step(&id);
                }
                JobStatus::Unknown => {
                    let limit = self.config.unknown_poll_limit;
                    let polls = match self.protocol.graph.get_mut(&id) {
                        Some(step) => {
                            step.unknown_polls += 1;
                            step.unknown_polls
                        }
                        None => continue,
                    };
                    if polls > limit {
                        self.fail_step(
                            &id,
                            format!("{} could not be found after {} polls", job.job, polls),
                        );
                    } else {
                        debug!("Step '{}': {} state unknown ({}/{})", id, job.job, polls, limit);
                        self.save_step(&id);
                    }
                }
            }
        }
    }

    /// Records the step's outputs, then marks it FINISHED.
    ///
    /// If the set is busy beyond the retry budget the step stays RUNNING and
    /// the append is retried on the next poll. Any other storage error fails
    /// the step.
    fn complete_step(&mut self, id: &str) {
        let (set_name, items) = match self.protocol.graph.get(id) {
            Some(step) => {
                let items: Vec<SetItem> = step
                    .outputs
                    .iter()
                    .map(|output| {
                        let path = self.protocol.working_dir.join(output);
                        SetItem::new(
                            output.clone(),
                            json!({ "step": step.id, "path": path.to_string_lossy() }),
                        )
                    })
                    .collect();
                (step.output_set.clone(), items)
            }
            None => return,
        };

        if let Some(set_name) = set_name {
            if !items.is_empty() {
                match self.mapper.append_set_items(&self.protocol.id, &set_name, &items) {
                    Ok(size) => debug!("Set '{}' now holds {} item(s)", set_name, size),
                    Err(e) if e.is_exhausted() => {
                        warn!("Step '{}': outputs not recorded yet: {}", id, e);
                        return;
                    }
                    Err(e) => {
                        self.fail_step(id, format!("could not record outputs: {}", e));
                        return;
                    }
                }
            }
        }

        info!("Step '{}' finished", id);
        if let Some(step) = self.protocol.graph.get_mut(id) {
            step.mark_finished();
        }
        self.timeline.record(id, EventType::Finished);
        self.save_step(id);
    }

    fn fail_step(&mut self, id: &str, reason: String) {
        error!("Step '{}' failed: {}", id, reason);
        if let Some(step) = self.protocol.graph.get_mut(id) {
            step.mark_failed(reason);
        }
        self.timeline.record(id, EventType::Failed);
        self.save_step(id);
    }

    /// Launches runnable steps up to the parallelism cap.
    ///
    /// A launch failure marks the step FAILED and ends the batch; the next
    /// aggregation then stops all further dispatch.
    fn dispatch(&mut self) {
        let running = self.protocol.graph.status_counts().running;
        let slots = self.config.max_parallel_steps.saturating_sub(running);
        if slots == 0 {
            return;
        }

        let ready: Vec<String> = self
            .protocol
            .graph
            .runnable_steps()
            .take(slots)
            .map(|step| step.id.clone())
            .collect();

        for id in ready {
            let launched = match self.protocol.graph.get(&id) {
                Some(step) => JobRequest::for_step(&self.protocol, step)
                    .map_err(|source| LaunchError::Prepare {
                        job: id.clone(),
                        source,
                    })
                    .and_then(|request| self.launcher.launch(&request)),
                None => continue,
            };

            match launched {
                Ok(job) => {
                    self.protocol.dispatch_counter += 1;
                    let index = self.protocol.dispatch_counter;
                    info!("Dispatched step '{}' as {} (#{})", id, job.job, index);
                    if let Some(step) = self.protocol.graph.get_mut(&id) {
                        step.mark_running(job, index);
                    }
                    self.timeline.record(id.as_str(), EventType::Dispatched);
                    self.save_step(&id);
                }
                Err(e) => {
                    self.fail_step(&id, e.to_string());
                    break;
                }
            }
        }
    }

    fn poll_stream(&mut self) {
        let Some(controller) = self.streaming.as_mut() else {
            return;
        };
        match controller.poll(&mut self.protocol) {
            StreamOutcome::Appended(ids) | StreamOutcome::Exhausted(ids) => {
                for id in ids {
                    self.save_step(&id);
                }
            }
            StreamOutcome::Idle | StreamOutcome::NoNewSteps | StreamOutcome::Unavailable(_) => {}
        }
    }

    fn save_step(&mut self, id: &str) {
        match self.mapper.save_step(&self.protocol, id) {
            Ok(()) => {
                self.unsaved_steps.remove(id);
            }
            Err(e) => {
                error!("Step '{}': state not saved, will retry: {}", id, e);
                self.unsaved_steps.insert(id.to_string());
            }
        }
    }

    fn persist_status(&mut self) {
        let current = (self.protocol.status, self.protocol.more_input);
        if self.saved_status == Some(current) && !self.done {
            return;
        }
        match self.mapper.save_status(&self.protocol) {
            Ok(()) => self.saved_status = Some(current),
            Err(e) => error!(
                "Protocol '{}': status not saved, will retry: {}",
                self.protocol.id, e
            ),
        }
    }

    /// Retries writes that failed in an earlier iteration.
    fn flush(&mut self) {
        let pending = std::mem::take(&mut self.unsaved_steps);
        for id in pending {
            self.save_step(&id);
        }
        if self.saved_status != Some((self.protocol.status, self.protocol.more_input)) {
            self.persist_status();
        }
    }

    /// Full write of the protocol; failures are returned.
    fn save_all(&mut self) -> Result<(), SchedulerError> {
        self.mapper
            .save(&self.protocol)
            .map_err(|source| self.persistence(source))?;
        self.unsaved_steps.clear();
        self.saved_status = Some((self.protocol.status, self.protocol.more_input));
        Ok(())
    }

    fn persistence(&self, source: PersistenceError) -> SchedulerError {
        SchedulerError::Persistence {
            protocol: self.protocol.id.clone(),
            source,
        }
    }
}
