//! Execution Monitoring Module
//!
//! Tracks how an execution unfolded over time for reporting.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: State start/end timing for Gantt charts

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
