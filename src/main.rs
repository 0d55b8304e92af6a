//! Protoflow CLI Entry Point
//!
//! Provides the command-line interface to a project database. The `run`
//! command is what scheduled protocols execute in their own process.
//!
//! # Usage
//!
//! ```bash
//! # Define a protocol and start its scheduler process
//! protoflow schedule project.sqlite ctf.yaml
//!
//! # Show all protocols, or the steps of one
//! protoflow status project.sqlite
//! protoflow status project.sqlite ctf_estimation
//!
//! # Ask a running protocol to stop
//! protoflow stop project.sqlite ctf_estimation
//!
//! # Run the scheduler loop in the foreground
//! protoflow run project.sqlite ctf_estimation --config protoflow.yaml
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use colored::{ColoredString, Colorize};
use log::{error, info, warn};

use protoflow::config::SchedulerConfig;
use protoflow::domain::Domain;
use protoflow::project::{Project, ProjectError};
use protoflow::protocol::{load_definition, Protocol, ProtocolStatus, StepStatus};
use protoflow::{APP_NAME, VERSION};

/// Subcommand selected on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Run { id: String },
    Schedule { target: String },
    Status { id: Option<String> },
    Stop { id: String },
    Delete { id: String },
    Refresh,
}

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    command: Command,
    db_path: PathBuf,
    config_path: Option<PathBuf>,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Step Dependency Scheduler");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: protoflow [OPTIONS] <COMMAND> <PROJECT_DB> [ARGS]");
    println!();
    println!("Commands:");
    println!("  run <DB> <ID>             Run the scheduler loop of a protocol");
    println!("  schedule <DB> <YAML|ID>   Define a protocol (from YAML) and schedule it");
    println!("  status <DB> [ID]          List protocols, or the steps of one");
    println!("  stop <DB> <ID>            Request a protocol to stop");
    println!("  delete <DB> <ID>          Delete an inactive protocol");
    println!("  refresh <DB>              Fail protocols whose scheduler is gone");
    println!();
    println!("Options:");
    println!("  --config PATH       Scheduler configuration YAML");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  protoflow schedule project.sqlite ctf.yaml");
    println!("  protoflow status project.sqlite ctf_estimation");
    println!("  protoflow run project.sqlite ctf_estimation --config protoflow.yaml");
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut positional: Vec<String> = Vec::new();
    let mut config_path = None;
    let mut verbose = false;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => {
                verbose = true;
            }
            "--config" => {
                i += 1;
                if i >= args.len() {
                    return Err("--config requires a path argument".to_string());
                }
                config_path = Some(PathBuf::from(&args[i]));
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => positional.push(arg.clone()),
        }
        i += 1;
    }

    let mut positional = positional.into_iter();
    let name = positional.next().ok_or("Missing command")?;
    let db_path = positional
        .next()
        .map(PathBuf::from)
        .ok_or_else(|| format!("'{}' requires a project database", name))?;
    let required = |value: Option<String>, what: &str| value.ok_or_else(|| format!("'{}' requires {}", name, what));

    let command = match name.as_str() {
        "run" => Command::Run {
            id: required(positional.next(), "a protocol id")?,
        },
        "schedule" => Command::Schedule {
            target: required(positional.next(), "a definition file or protocol id")?,
        },
        "status" => Command::Status {
            id: positional.next(),
        },
        "stop" => Command::Stop {
            id: required(positional.next(), "a protocol id")?,
        },
        "delete" => Command::Delete {
            id: required(positional.next(), "a protocol id")?,
        },
        "refresh" => Command::Refresh,
        other => return Err(format!("Unknown command: {}", other)),
    };
    if let Some(extra) = positional.next() {
        return Err(format!("Unexpected argument: {}", extra));
    }

    Ok(Config {
        command,
        db_path,
        config_path,
        verbose,
    })
}

fn colored_status(status: &str) -> ColoredString {
    match status {
        "FINISHED" => status.green(),
        "FAILED" => status.red().bold(),
        "RUNNING" => status.cyan(),
        "SCHEDULED" => status.yellow(),
        "ABORTED" => status.magenta(),
        _ => status.normal(),
    }
}

fn print_protocols(protocols: &[Protocol]) {
    if protocols.is_empty() {
        println!("No protocols");
        return;
    }
    println!("{:24} {:14} {:10} {:>6}  LABEL", "ID", "KIND", "STATUS", "STEPS");
    for protocol in protocols {
        let counts = protocol.graph.status_counts();
        println!(
            "{:24} {:14} {:10} {:>6}  {}",
            protocol.id,
            protocol.kind,
            colored_status(protocol.status.as_str()),
            format!("{}/{}", counts.finished, counts.total()),
            protocol.label
        );
        if let Some(ref error) = protocol.error {
            println!("{:24} {}", "", error.red());
        }
    }
}

fn print_steps(protocol: &Protocol) {
    println!(
        "Protocol '{}' ({}): {}{}",
        protocol.id,
        protocol.kind,
        colored_status(protocol.status.as_str()),
        if protocol.more_input { " (waiting for input)" } else { "" }
    );
    println!();
    println!("{:24} {:10} {:>5}  PREREQUISITES", "STEP", "STATUS", "INDEX");
    for step in protocol.graph.iter() {
        let index = step.executed_index.map(|i| i.to_string()).unwrap_or_default();
        println!(
            "{:24} {:10} {:>5}  {}",
            step.id,
            colored_status(step.status.as_str()),
            index,
            step.prerequisites.join(", ")
        );
        if step.status == StepStatus::Failed {
            if let Some(ref error) = step.error {
                println!("{:24} {}", "", error.red());
            }
        }
    }
}

/// Creates the protocol when `target` is a definition file, then schedules it.
fn schedule(project: &mut Project, target: &str) -> Result<(), ProjectError> {
    let id = if Path::new(target).is_file() {
        let definition = load_definition(target)?;
        match project.create(definition) {
            Ok(protocol) => protocol.id,
            Err(ProjectError::AlreadyExists(id)) => {
                warn!("Protocol '{}' already exists, scheduling the stored one", id);
                id
            }
            Err(e) => return Err(e),
        }
    } else {
        target.to_string()
    };

    let handle = project.schedule(&id)?;
    println!("Scheduled '{}' ({})", id, handle.job);
    Ok(())
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(config.verbose);

    let scheduler_config = SchedulerConfig::load(config.config_path.as_deref())?;
    let domain = Domain::with_builtins();
    for (kind, reason) in domain.disabled() {
        warn!("Protocol kind '{}' unavailable: {}", kind, reason);
    }

    let mut project = Project::open(&config.db_path, scheduler_config, domain)?;
    if let Some(ref path) = config.config_path {
        project = project.with_config_path(path);
    }

    match config.command {
        Command::Run { id } => {
            print_banner();
            info!("Project: {}", config.db_path.display());
            let summary = project.run_protocol(&id).map_err(|e| {
                error!("Scheduler of '{}' failed: {}", id, e);
                e
            })?;
            info!(
                "Protocol '{}' ended {} after {} iterations ({}/{} steps finished)",
                id,
                summary.status,
                summary.iterations,
                summary.counts.finished,
                summary.counts.total()
            );
            if summary.status == ProtocolStatus::Failed {
                return Err(format!("Protocol '{}' failed", id).into());
            }
        }
        Command::Schedule { target } => schedule(&mut project, &target)?,
        Command::Status { id: Some(id) } => print_steps(&project.load(&id)?),
        Command::Status { id: None } => print_protocols(&project.list()?),
        Command::Stop { id } => {
            project.stop(&id)?;
            println!("Stop requested for '{}'", id);
        }
        Command::Delete { id } => {
            project.delete(&id)?;
            println!("Deleted '{}'", id);
        }
        Command::Refresh => {
            for change in project.refresh()? {
                println!("{}: {} -> {}", change.id, change.from, colored_status(change.to.as_str()));
            }
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("protoflow")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_run_with_config() {
        let config = parse_arguments(&args(&["run", "p.sqlite", "ctf", "--config", "c.yaml", "-v"])).unwrap();
        assert_eq!(config.command, Command::Run { id: "ctf".to_string() });
        assert_eq!(config.db_path, PathBuf::from("p.sqlite"));
        assert_eq!(config.config_path, Some(PathBuf::from("c.yaml")));
        assert!(config.verbose);
    }

    #[test]
    fn test_parse_status_optional_id() {
        let config = parse_arguments(&args(&["status", "p.sqlite"])).unwrap();
        assert_eq!(config.command, Command::Status { id: None });
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_arguments(&args(&[])).is_err());
        assert!(parse_arguments(&args(&["run", "p.sqlite"])).is_err());
        assert!(parse_arguments(&args(&["launch", "p.sqlite"])).is_err());
        assert!(parse_arguments(&args(&["stop", "p.sqlite", "a", "b"])).is_err());
        assert!(parse_arguments(&args(&["refresh", "p.sqlite", "--parallel"])).is_err());
        assert!(parse_arguments(&args(&["run", "p.sqlite", "a", "--config"])).is_err());
    }
}
