//! Execution Timeline
//!
//! Records when the scheduler loop dispatched each step and when it saw the
//! step end, for the Gantt chart logged when the loop exits.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// What the loop observed for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Dispatched,
    Finished,
    Failed,
    Aborted,
}

impl EventType {
    fn is_end(&self) -> bool {
        !matches!(self, Self::Dispatched)
    }

    fn bar_char(&self) -> char {
        match self {
            Self::Finished => '#',
            Self::Failed => 'x',
            Self::Aborted => '-',
            Self::Dispatched => ' ',
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub step_id: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// Timeline of one scheduler loop.
///
/// Steps adopted from an earlier loop (already running at start) only get
/// an end event and are left out of the chart.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    pub fn record(&mut self, step_id: impl Into<String>, event_type: EventType) {
        self.events.push(TimelineEvent {
            step_id: step_id.into(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// `(step, start ms, end ms, end event)` for every completed span,
    /// sorted by start. A step dispatched twice keeps its last span.
    fn spans(&self) -> Vec<(String, u128, u128, EventType)> {
        let mut starts: HashMap<&str, u128> = HashMap::new();
        let mut spans: HashMap<&str, (u128, u128, EventType)> = HashMap::new();

        for event in &self.events {
            let elapsed = event.timestamp.duration_since(self.start_time).as_millis();
            if event.event_type.is_end() {
                if let Some(start) = starts.remove(event.step_id.as_str()) {
                    spans.insert(&event.step_id, (start, elapsed, event.event_type));
                }
            } else {
                starts.insert(&event.step_id, elapsed);
            }
        }

        let mut sorted: Vec<_> = spans
            .into_iter()
            .map(|(id, (start, end, kind))| (id.to_string(), start, end, kind))
            .collect();
        sorted.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        sorted
    }

    /// Step durations in milliseconds.
    pub fn durations(&self) -> HashMap<String, u128> {
        self.spans()
            .into_iter()
            .map(|(id, start, end, _)| (id, end - start))
            .collect()
    }

    /// ASCII Gantt chart, 50 columns wide.
    ///
    /// `#` finished, `x` failed, `-` aborted.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.start_time.elapsed().as_millis();
        if total_time == 0 {
            return output;
        }
        let scale = 50.0 / total_time as f64;

        for (step_id, start, end, kind) in self.spans() {
            let start_pos = (start as f64 * scale) as usize;
            let width = ((end - start) as f64 * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&kind.bar_char().to_string().repeat(width));

            output.push_str(&format!(
                "{:12} |{:50}| ({} ms)\n",
                truncate(&step_id, 12),
                bar,
                end - start
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
