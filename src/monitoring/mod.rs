//! Monitoring Module
//!
//! - [`ExecutionTimeline`]: step dispatch/end timing for Gantt charts

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
