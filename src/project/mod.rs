//! Project Facade
//!
//! The GUI-side view of a project database: defining protocols, starting
//! their scheduler processes, requesting stops and watching liveness. The
//! scheduler itself runs in a separate `protoflow run` process; both sides
//! share only the database.
//!
//! - [`Project`]: create, schedule, stop, edit, delete and list protocols
//! - [`Refresher`]: periodic liveness checks of active protocols

pub mod refresh;

pub use refresh::{CancelHandle, Refresher};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use thiserror::Error;

use crate::config::SchedulerConfig;
use crate::domain::{Domain, DomainError};
use crate::execution::script::shell_quote;
use crate::execution::{
    launcher_from_config, JobHandle, JobLauncher, JobRequest, JobStatus, LaunchError, LoopSummary,
    SchedulerError, SchedulerLoop,
};
use crate::persistence::{Mapper, PersistenceError};
use crate::protocol::{DefinitionError, Protocol, ProtocolDefinition, ProtocolStatus};

/// Error recorded when a protocol's scheduler process is gone.
pub const PROCESS_NOT_FOUND: &str = "process not found";

/// Directory next to the database holding default working directories.
pub const RUNS_DIR: &str = "Runs";

#[derive(Error, Debug)]
pub enum ProjectError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol '{0}' already exists")]
    AlreadyExists(String),

    #[error("Protocol '{id}' is {status}")]
    Active { id: String, status: ProtocolStatus },
}

/// A protocol whose stored status was changed by a refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub id: String,
    pub from: ProtocolStatus,
    pub to: ProtocolStatus,
}

/// Handle on one project database.
///
/// # Example
///
/// ```rust,no_run
/// use protoflow::config::SchedulerConfig;
/// use protoflow::domain::Domain;
/// use protoflow::project::Project;
/// use protoflow::protocol::load_definition;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut project = Project::open("project.sqlite", SchedulerConfig::default(), Domain::with_builtins())?;
///     let protocol = project.create(load_definition("ctf.yaml")?)?;
///     project.schedule(&protocol.id)?;
///     Ok(())
/// }
/// ```
pub struct Project {
    mapper: Mapper,
    config: SchedulerConfig,
    config_path: Option<PathBuf>,
    domain: Domain,
    launcher: Box<dyn JobLauncher>,
    runs_dir: PathBuf,
}

impl Project {
    /// Opens (or creates) the project database at `db_path`.
    pub fn open(db_path: impl AsRef<Path>, config: SchedulerConfig, domain: Domain) -> Result<Self, ProjectError> {
        let db_path = std::path::absolute(db_path.as_ref())?;
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mapper = Mapper::open(&db_path, config.retry_policy())?;
        let runs_dir = db_path
            .parent()
            .map(|dir| dir.join(RUNS_DIR))
            .unwrap_or_else(|| PathBuf::from(RUNS_DIR));
        let launcher = launcher_from_config(&config.launcher);

        Ok(Self {
            mapper,
            config,
            config_path: None,
            domain,
            launcher,
            runs_dir,
        })
    }

    /// Replaces the launcher used for scheduler processes.
    pub fn with_launcher(mut self, launcher: Box<dyn JobLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Config file passed on to scheduler processes.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn mapper(&self) -> &Mapper {
        &self.mapper
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    pub fn load(&self, id: &str) -> Result<Protocol, ProjectError> {
        Ok(self.mapper.load(id)?)
    }

    pub fn list(&self) -> Result<Vec<Protocol>, ProjectError> {
        Ok(self.mapper.list()?)
    }

    /// Builds a protocol from its definition and saves it as PENDING.
    ///
    /// Possible outputs come from the kind's plugin; outputs listed in the
    /// definition are added on top.
    pub fn create(&mut self, definition: ProtocolDefinition) -> Result<Protocol, ProjectError> {
        let declared = definition.possible_outputs.clone();
        let mut protocol = definition.into_protocol(&self.runs_dir)?;
        if self.mapper.exists(&protocol.id)? {
            return Err(ProjectError::AlreadyExists(protocol.id));
        }

        let plugin = self.domain.plugin(&protocol.kind)?;
        let outputs = plugin.possible_outputs(&protocol)?;
        protocol.possible_outputs = match declared {
            Some(declared) => outputs.merged(&declared),
            None => outputs,
        };

        fs::create_dir_all(&protocol.working_dir)?;
        self.mapper.save(&protocol)?;
        info!(
            "Created protocol '{}' ({}, {} steps)",
            protocol.id,
            protocol.kind,
            protocol.len()
        );
        Ok(protocol)
    }

    /// Marks the protocol SCHEDULED and launches its scheduler process.
    ///
    /// The protocol stays SCHEDULED until the scheduler marks it RUNNING; a
    /// launch failure marks it FAILED and is returned.
    pub fn schedule(&mut self, id: &str) -> Result<JobHandle, ProjectError> {
        let protocol = self.mapper.load(id)?;
        if protocol.status.is_active() {
            return Err(ProjectError::Active {
                id: id.to_string(),
                status: protocol.status,
            });
        }

        // Clears the previous scheduler's handle and stop flag only if the claim wins
        let claimed = self.mapper.claim_for_scheduling(
            id,
            &[
                ProtocolStatus::Pending,
                ProtocolStatus::Finished,
                ProtocolStatus::Failed,
                ProtocolStatus::Aborted,
            ],
        )?;
        if !claimed {
            let current = self.mapper.load(id)?.status;
            return Err(ProjectError::Active {
                id: id.to_string(),
                status: current,
            });
        }

        let request = self.scheduler_request(&protocol)?;
        match self.launcher.launch(&request) {
            Ok(handle) => {
                self.mapper.record_job(id, Some(&handle))?;
                info!("Scheduled protocol '{}' ({})", id, handle.job);
                Ok(handle)
            }
            Err(e) => {
                warn!("Could not launch scheduler of '{}': {}", id, e);
                self.mapper.transition_status(
                    id,
                    &[ProtocolStatus::Scheduled],
                    ProtocolStatus::Failed,
                    Some(&e.to_string()),
                )?;
                Err(e.into())
            }
        }
    }

    fn scheduler_request(&self, protocol: &Protocol) -> Result<JobRequest, ProjectError> {
        let program = self.config.scheduler_program();
        let mut command = format!(
            "{} run {} {}",
            shell_quote(&program.to_string_lossy()),
            shell_quote(&self.mapper.path().to_string_lossy()),
            shell_quote(&protocol.id)
        );
        if let Some(ref path) = self.config_path {
            let path = std::path::absolute(path)?;
            command.push_str(&format!(" --config {}", shell_quote(&path.to_string_lossy())));
        }

        fs::create_dir_all(&protocol.working_dir)?;
        let request = JobRequest::new(
            format!("{}_scheduler", protocol.id),
            command,
            &protocol.working_dir,
            protocol.log_paths()?,
        )?
        .with_script_dir(std::path::absolute(protocol.jobs_dir())?);
        debug!("Scheduler command: {}", request.command);
        Ok(request)
    }

    /// Runs the scheduler loop of a protocol in this process.
    ///
    /// This is what the scheduler process started by [`Project::schedule`]
    /// executes.
    pub fn run_protocol(&self, id: &str) -> Result<LoopSummary, ProjectError> {
        let protocol = self.mapper.load(id)?;
        let mut launcher = launcher_from_config(&self.config.launcher);
        let summary =
            SchedulerLoop::new(&self.mapper, launcher.as_mut(), &self.domain, &self.config, protocol).run()?;
        Ok(summary)
    }

    /// Asks the scheduler of an active protocol to stop.
    ///
    /// If its scheduler process is confirmed gone the protocol is marked
    /// ABORTED directly.
    pub fn stop(&mut self, id: &str) -> Result<(), ProjectError> {
        let protocol = self.mapper.load(id)?;
        if !protocol.status.is_active() {
            info!("Protocol '{}' is {}, nothing to stop", id, protocol.status);
            return Ok(());
        }
        self.mapper.request_stop(id)?;

        if let Some(ref job) = protocol.job {
            if self.scheduler_exited(job) {
                self.mapper.transition_status(
                    id,
                    &[ProtocolStatus::Scheduled, ProtocolStatus::Running],
                    ProtocolStatus::Aborted,
                    None,
                )?;
            }
        }
        Ok(())
    }

    /// Edits label and comment; status columns are never touched.
    pub fn update_metadata(&self, id: &str, label: &str, comment: &str) -> Result<(), ProjectError> {
        Ok(self.mapper.update_metadata(id, label, comment)?)
    }

    /// Deletes a protocol that is not scheduled or running.
    pub fn delete(&self, id: &str) -> Result<(), ProjectError> {
        let protocol = self.mapper.load(id)?;
        if protocol.status.is_active() {
            return Err(ProjectError::Active {
                id: id.to_string(),
                status: protocol.status,
            });
        }
        Ok(self.mapper.delete(id)?)
    }

    /// Checks the scheduler process of every active protocol.
    ///
    /// A SCHEDULED or RUNNING protocol whose scheduler is confirmed to have
    /// exited without writing a terminal status becomes FAILED. An UNKNOWN
    /// poll or a handle not recorded yet changes nothing.
    pub fn refresh(&mut self) -> Result<Vec<StatusChange>, ProjectError> {
        let mut changes = Vec::new();
        for protocol in self.mapper.list()? {
            if !protocol.status.is_active() {
                continue;
            }
            let Some(ref job) = protocol.job else {
                debug!("Protocol '{}': no scheduler handle yet", protocol.id);
                continue;
            };
            if !self.scheduler_exited(job) {
                continue;
            }

            let failed = self.mapper.transition_status(
                &protocol.id,
                &[ProtocolStatus::Scheduled, ProtocolStatus::Running],
                ProtocolStatus::Failed,
                Some(PROCESS_NOT_FOUND),
            )?;
            if failed {
                warn!("Protocol '{}': scheduler {} is gone", protocol.id, job.job);
                changes.push(StatusChange {
                    id: protocol.id.clone(),
                    from: protocol.status,
                    to: ProtocolStatus::Failed,
                });
            }
        }
        Ok(changes)
    }

    fn scheduler_exited(&mut self, job: &JobHandle) -> bool {
        match self.launcher.poll(job) {
            JobStatus::Finished | JobStatus::Failed | JobStatus::Aborted => true,
            JobStatus::Running | JobStatus::Unknown => false,
        }
    }
}
