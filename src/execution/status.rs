//! Aggregate protocol status.
//!
//! Precedence, highest first:
//!
//! 1. any step FAILED: `Failed`
//! 2. any step RUNNING: `Running`
//! 3. any step ABORTED: `Aborted`
//! 4. protocol still `Scheduled`: stays `Scheduled`
//! 5. every step FINISHED and no more input expected: `Finished`
//! 6. otherwise `Running` (waiting on prerequisites, slots or input)
//!
//! `Scheduled` is only ever carried over, never derived from step
//! statuses, so it can never be confused with `Failed`.

use crate::protocol::{ProtocolStatus, StepGraph};

/// Computes the protocol status implied by its steps.
///
/// An empty graph with no further input is `Finished`.
pub fn aggregate_status(graph: &StepGraph, current: ProtocolStatus, more_input: bool) -> ProtocolStatus {
    let counts = graph.status_counts();

    if counts.failed > 0 {
        ProtocolStatus::Failed
    } else if counts.running > 0 {
        ProtocolStatus::Running
    } else if counts.aborted > 0 {
        ProtocolStatus::Aborted
    } else if current == ProtocolStatus::Scheduled {
        ProtocolStatus::Scheduled
    } else if counts.finished == counts.total() && !more_input {
        ProtocolStatus::Finished
    } else {
        ProtocolStatus::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Step, StepStatus};

    fn graph(statuses: &[StepStatus]) -> StepGraph {
        let mut graph = StepGraph::new();
        for (i, status) in statuses.iter().enumerate() {
            let mut step = Step::new(format!("s{}", i), "true");
            step.status = *status;
            graph.push(step).unwrap();
        }
        graph
    }

    use StepStatus::*;

    #[test]
    fn test_empty_protocol_is_finished() {
        assert_eq!(
            aggregate_status(&StepGraph::new(), ProtocolStatus::Running, false),
            ProtocolStatus::Finished
        );
    }

    #[test]
    fn test_empty_streaming_protocol_waits_for_input() {
        assert_eq!(
            aggregate_status(&StepGraph::new(), ProtocolStatus::Running, true),
            ProtocolStatus::Running
        );
    }

    #[test]
    fn test_failed_beats_running() {
        let g = graph(&[Running, Failed, Pending]);
        assert_eq!(aggregate_status(&g, ProtocolStatus::Running, false), ProtocolStatus::Failed);
    }

    #[test]
    fn test_running_beats_aborted() {
        let g = graph(&[Running, Aborted]);
        assert_eq!(aggregate_status(&g, ProtocolStatus::Running, false), ProtocolStatus::Running);
    }

    #[test]
    fn test_aborted_when_nothing_in_flight() {
        let g = graph(&[Finished, Aborted, Pending]);
        assert_eq!(aggregate_status(&g, ProtocolStatus::Running, false), ProtocolStatus::Aborted);
    }

    #[test]
    fn test_scheduled_beats_finished_and_never_fails() {
        let g = graph(&[Finished, Finished]);
        assert_eq!(
            aggregate_status(&g, ProtocolStatus::Scheduled, false),
            ProtocolStatus::Scheduled
        );
        let g = graph(&[Pending]);
        assert_ne!(
            aggregate_status(&g, ProtocolStatus::Scheduled, false),
            ProtocolStatus::Failed
        );
    }

    #[test]
    fn test_finished_requires_no_more_input() {
        let g = graph(&[Finished, Finished]);
        assert_eq!(aggregate_status(&g, ProtocolStatus::Running, false), ProtocolStatus::Finished);
        assert_eq!(aggregate_status(&g, ProtocolStatus::Running, true), ProtocolStatus::Running);
    }

    #[test]
    fn test_pending_work_is_running() {
        let g = graph(&[Finished, Pending]);
        assert_eq!(aggregate_status(&g, ProtocolStatus::Running, false), ProtocolStatus::Running);
    }
}
