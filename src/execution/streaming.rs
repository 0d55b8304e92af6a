//! Streaming Controller
//!
//! Grows the step graph of a streaming protocol while it runs. The protocol
//! kind supplies a [`StepSource`]; the controller asks it for new steps at
//! most once per check interval and clears the protocol's `more_input`
//! marker once the source signals end of input.

use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::protocol::{Protocol, Step, StepGraph};

/// The upstream data source cannot be read right now. Recoverable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Input of protocol '{protocol}' unavailable: {reason}")]
pub struct InputUnavailableError {
    pub protocol: String,
    pub reason: String,
}

impl InputUnavailableError {
    pub fn new(protocol: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            reason: reason.into(),
        }
    }
}

/// What a source found since the last check.
#[derive(Debug, Clone, Default)]
pub struct SourceUpdate {
    /// New steps, in the order they should be appended
    pub steps: Vec<Step>,
    /// No further input will ever arrive
    pub exhausted: bool,
}

/// Supplies new steps for a streaming protocol.
pub trait StepSource {
    /// Looks for new input. `graph` is the protocol's current graph, so
    /// sources can skip work already appended by an earlier scheduler.
    fn check(&mut self, graph: &StepGraph) -> Result<SourceUpdate, InputUnavailableError>;
}

/// Result of one controller poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Not streaming, already exhausted, or checked too recently
    Idle,
    NoNewSteps,
    Appended(Vec<String>),
    /// End of input; carries the steps appended by this final check
    Exhausted(Vec<String>),
    Unavailable(InputUnavailableError),
}

pub struct StreamingController {
    source: Box<dyn StepSource>,
    interval: Duration,
    last_check: Option<Instant>,
}

impl StreamingController {
    pub fn new(source: Box<dyn StepSource>, interval: Duration) -> Self {
        Self {
            source,
            interval,
            last_check: None,
        }
    }

    /// Asks the source for new steps and appends them to the protocol.
    ///
    /// Steps the graph rejects (unknown prerequisite, cycle, duplicate id)
    /// are logged and skipped; the others are appended.
    pub fn poll(&mut self, protocol: &mut Protocol) -> StreamOutcome {
        if !protocol.streaming || !protocol.more_input {
            return StreamOutcome::Idle;
        }
        if let Some(last) = self.last_check {
            if last.elapsed() < self.interval {
                return StreamOutcome::Idle;
            }
        }
        self.last_check = Some(Instant::now());

        let update = match self.source.check(&protocol.graph) {
            Ok(update) => update,
            Err(e) => {
                warn!("{}", e);
                return StreamOutcome::Unavailable(e);
            }
        };

        let mut appended = Vec::new();
        for step in update.steps {
            let id = step.id.clone();
            match protocol.graph.push(step) {
                Ok(()) => appended.push(id),
                Err(e) => error!("Protocol '{}': rejected streamed step: {}", protocol.id, e),
            }
        }
        if !appended.is_empty() {
            info!(
                "Protocol '{}': {} new step(s): {:?}",
                protocol.id,
                appended.len(),
                appended
            );
        }

        if update.exhausted {
            info!("Protocol '{}': input exhausted", protocol.id);
            protocol.more_input = false;
            return StreamOutcome::Exhausted(appended);
        }

        if appended.is_empty() {
            debug!("Protocol '{}': no new input", protocol.id);
            StreamOutcome::NoNewSteps
        } else {
            StreamOutcome::Appended(appended)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays a fixed sequence of source results.
    pub(crate) struct ScriptedSource {
        pub results: VecDeque<Result<SourceUpdate, InputUnavailableError>>,
    }

    impl ScriptedSource {
        pub(crate) fn new(results: Vec<Result<SourceUpdate, InputUnavailableError>>) -> Self {
            Self {
                results: results.into(),
            }
        }
    }

    impl StepSource for ScriptedSource {
        fn check(&mut self, _graph: &StepGraph) -> Result<SourceUpdate, InputUnavailableError> {
            self.results.pop_front().unwrap_or_else(|| Ok(SourceUpdate::default()))
        }
    }

    fn streaming_protocol() -> Protocol {
        let mut protocol = Protocol::new("stream", "stream.files", "/tmp/stream").streaming();
        protocol.graph.push(Step::new("s1", "true")).unwrap();
        protocol
    }

    #[test]
    fn test_appends_new_steps() {
        let mut protocol = streaming_protocol();
        let source = ScriptedSource::new(vec![Ok(SourceUpdate {
            steps: vec![Step::new("s2", "true").with_prerequisites("s1")],
            exhausted: false,
        })]);
        let mut controller = StreamingController::new(Box::new(source), Duration::ZERO);

        let outcome = controller.poll(&mut protocol);
        assert_eq!(outcome, StreamOutcome::Appended(vec!["s2".to_string()]));
        assert_eq!(protocol.graph.get("s2").unwrap().prerequisites, vec!["s1"]);
        assert!(protocol.more_input);
    }

    #[test]
    fn test_unavailable_is_recoverable() {
        let mut protocol = streaming_protocol();
        let source = ScriptedSource::new(vec![
            Err(InputUnavailableError::new("stream", "mount not ready")),
            Ok(SourceUpdate {
                steps: vec![Step::new("s2", "true")],
                exhausted: true,
            }),
        ]);
        let mut controller = StreamingController::new(Box::new(source), Duration::ZERO);

        assert!(matches!(controller.poll(&mut protocol), StreamOutcome::Unavailable(_)));
        assert!(protocol.more_input);

        assert_eq!(
            controller.poll(&mut protocol),
            StreamOutcome::Exhausted(vec!["s2".to_string()])
        );
        assert!(!protocol.more_input);
        assert_eq!(controller.poll(&mut protocol), StreamOutcome::Idle);
    }

    #[test]
    fn test_invalid_streamed_step_is_skipped() {
        let mut protocol = streaming_protocol();
        let source = ScriptedSource::new(vec![Ok(SourceUpdate {
            steps: vec![
                Step::new("orphan", "true").with_prerequisites("missing"),
                Step::new("s2", "true").with_prerequisites("s1"),
            ],
            exhausted: false,
        })]);
        let mut controller = StreamingController::new(Box::new(source), Duration::ZERO);

        assert_eq!(
            controller.poll(&mut protocol),
            StreamOutcome::Appended(vec!["s2".to_string()])
        );
        assert!(!protocol.graph.contains("orphan"));
    }

    #[test]
    fn test_interval_limits_checks() {
        let mut protocol = streaming_protocol();
        let source = ScriptedSource::new(vec![]);
        let mut controller = StreamingController::new(Box::new(source), Duration::from_secs(60));

        assert_eq!(controller.poll(&mut protocol), StreamOutcome::NoNewSteps);
        assert_eq!(controller.poll(&mut protocol), StreamOutcome::Idle);
    }

    #[test]
    fn test_static_protocol_is_idle() {
        let mut protocol = Protocol::new("static", "static", "/tmp/static");
        let mut controller =
            StreamingController::new(Box::new(ScriptedSource::new(vec![])), Duration::ZERO);
        assert_eq!(controller.poll(&mut protocol), StreamOutcome::Idle);
    }
}
