//! Execution Timeline
//!
//! Tracks state instance start/end times for execution reports and
//! Gantt-style charts.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Type of timeline event.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// State started executing
    Started,
    /// State registered a wait
    Waiting,
    /// State entry held back by a paused execution
    Paused,
    /// State ended positively
    Completed,
    /// State ended failed, errored or expired
    Failed,
    /// State was discontinued
    Aborted,
}

impl EventType {
    fn is_end(self) -> bool {
        matches!(self, EventType::Completed | EventType::Failed | EventType::Aborted)
    }
}

/// A single event in the execution timeline.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TimelineEvent {
    pub instance_id: String,
    pub state_name: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
}

/// Timeline of one workflow execution.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ExecutionTimeline {
    execution_id: String,
    start_time: DateTime<Utc>,
    events: Vec<TimelineEvent>,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            start_time: Utc::now(),
            events: Vec::new(),
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Records an event for a state instance.
    pub fn add_event(&mut self, instance_id: &str, state_name: &str, event_type: EventType) {
        self.events.push(TimelineEvent {
            instance_id: instance_id.to_string(),
            state_name: state_name.to_string(),
            event_type,
            timestamp: Utc::now(),
        });
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Events of one state, across all of its instances.
    pub fn events_for(&self, state_name: &str) -> Vec<&TimelineEvent> {
        self.events.iter().filter(|e| e.state_name == state_name).collect()
    }

    /// Time elapsed since the timeline was created.
    pub fn elapsed(&self) -> Duration {
        Utc::now() - self.start_time
    }

    /// Duration of every instance that both started and ended, keyed by
    /// instance id.
    pub fn durations(&self) -> HashMap<String, Duration> {
        let mut starts: HashMap<&str, DateTime<Utc>> = HashMap::new();
        let mut durations = HashMap::new();

        for event in &self.events {
            match event.event_type {
                EventType::Started => {
                    starts.entry(&event.instance_id).or_insert(event.timestamp);
                }
                end if end.is_end() => {
                    if let Some(start) = starts.get(event.instance_id.as_str()) {
                        durations.insert(event.instance_id.clone(), event.timestamp - *start);
                    }
                }
                _ => {}
            }
        }

        durations
    }

    /// Generates an ASCII Gantt chart, one bar per state instance.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.elapsed().num_milliseconds();
        if total_time <= 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        let mut spans: HashMap<&str, (&str, i64, i64)> = HashMap::new();
        for event in &self.events {
            let elapsed = (event.timestamp - self.start_time).num_milliseconds();
            match event.event_type {
                EventType::Started => {
                    spans
                        .entry(&event.instance_id)
                        .or_insert((&event.state_name, elapsed, 0));
                }
                end if end.is_end() => {
                    if let Some(span) = spans.get_mut(event.instance_id.as_str()) {
                        span.2 = elapsed;
                    }
                }
                _ => {}
            }
        }

        let mut sorted: Vec<_> = spans.into_values().collect();
        sorted.sort_by_key(|(_, start, _)| *start);

        for (state_name, start, end) in sorted {
            if end < start {
                continue;
            }
            let start_pos = (start as f64 * scale) as usize;
            let width = ((end - start) as f64 * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&"#".repeat(width));

            output.push_str(&format!(
                "{:16} |{}| ({} ms)\n",
                truncate(state_name, 16),
                bar,
                end - start
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }
}

/// Truncates a string to a maximum length.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration as StdDuration;

    #[test]
    fn test_durations() {
        let mut timeline = ExecutionTimeline::new("exec-1");
        timeline.add_event("i-1", "provision", EventType::Started);
        thread::sleep(StdDuration::from_millis(20));
        timeline.add_event("i-1", "provision", EventType::Waiting);
        timeline.add_event("i-2", "deploy", EventType::Started);
        thread::sleep(StdDuration::from_millis(20));
        timeline.add_event("i-1", "provision", EventType::Completed);

        let durations = timeline.durations();
        assert!(durations["i-1"].num_milliseconds() >= 40);
        assert!(!durations.contains_key("i-2"));
        assert_eq!(timeline.events_for("provision").len(), 3);
    }

    #[test]
    fn test_retried_state_has_two_bars() {
        let mut timeline = ExecutionTimeline::new("exec-1");
        timeline.add_event("i-1", "deploy", EventType::Started);
        timeline.add_event("i-1", "deploy", EventType::Failed);
        thread::sleep(StdDuration::from_millis(10));
        timeline.add_event("i-2", "deploy", EventType::Started);
        timeline.add_event("i-2", "deploy", EventType::Completed);
        thread::sleep(StdDuration::from_millis(5));

        let chart = timeline.gantt_chart();
        assert_eq!(chart.matches("deploy").count(), 2);
        assert!(chart.contains("Total:"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("verify", 8), "verify  ");
        assert_eq!(truncate("verify-canary-east", 8), "verif...");
    }
}
