//! Protoflow - Step Dependency Scheduler for Processing Pipelines
//!
//! Runs scientific processing protocols as graphs of shell steps. Each
//! protocol is driven by its own scheduler process that dispatches steps
//! whose prerequisites have finished, keeps polling a streaming input for
//! new work and records everything in a SQLite database shared with the
//! GUI process.
//!
//! # Architecture
//!
//! - [`protocol`]: Protocols, step graphs, set outputs and pointers
//! - [`persistence`]: SQLite store with busy-retry and scoped updates
//! - [`execution`]: Job launchers, streaming controller and scheduler loop
//! - [`domain`]: Registry of protocol kinds and the built-in plugins
//! - [`project`]: GUI-side facade for scheduling, stopping and refreshing
//! - [`monitoring`]: Step timeline and Gantt chart
//! - [`config`]: Scheduler configuration from YAML and the environment
//!
//! # Example
//!
//! ```rust,no_run
//! use protoflow::config::SchedulerConfig;
//! use protoflow::domain::Domain;
//! use protoflow::load_definition;
//! use protoflow::project::Project;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SchedulerConfig::load(None)?;
//!     let mut project = Project::open("project.sqlite", config, Domain::with_builtins())?;
//!
//!     // Define the protocol, then start its scheduler process
//!     let protocol = project.create(load_definition("ctf.yaml")?)?;
//!     project.schedule(&protocol.id)?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod domain;
pub mod execution;
pub mod monitoring;
pub mod persistence;
pub mod project;
pub mod protocol;

// Re-export commonly used types
pub use config::SchedulerConfig;
pub use execution::{SchedulerLoop, StreamingController};
pub use persistence::Mapper;
pub use project::Project;
pub use protocol::parser::load_definition;
pub use protocol::{Protocol, ProtocolStatus, Step, StepGraph};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Protoflow";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "Protoflow");
    }

    #[test]
    fn test_module_exports_step() {
        let step = Step::new("import", "import_movies --dir raw");
        assert_eq!(step.id, "import");
        assert!(step.prerequisites.is_empty());
    }

    #[test]
    fn test_module_exports_protocol() {
        let protocol = Protocol::new("p1", "static", "/tmp/p1");
        assert!(protocol.graph.is_empty());
        assert_eq!(protocol.status, ProtocolStatus::Pending);
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
