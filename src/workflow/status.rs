//! Execution Status
//!
//! Lifecycle statuses shared by workflow executions and state execution
//! instances, plus the failure taxonomy used when selecting failure
//! strategies.

use serde::{Deserialize, Serialize};

/// Status of a workflow execution or a single state execution instance.
///
/// Terminal statuses never change again. `Waiting`, `Paused` and `Running`
/// are re-enterable: an instance may be moved back into them while it
/// waits for notifications or is resumed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    New,
    Queued,
    Running,
    Paused,
    Waiting,
    Resumed,
    Discontinuing,
    Success,
    Skipped,
    Failed,
    Error,
    Aborted,
    Rejected,
    Expired,
}

impl ExecutionStatus {
    /// Statuses after which nothing changes.
    pub const TERMINAL: [ExecutionStatus; 7] = [
        ExecutionStatus::Success,
        ExecutionStatus::Skipped,
        ExecutionStatus::Failed,
        ExecutionStatus::Error,
        ExecutionStatus::Aborted,
        ExecutionStatus::Rejected,
        ExecutionStatus::Expired,
    ];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    pub fn is_reenterable(self) -> bool {
        matches!(self, Self::Waiting | Self::Paused | Self::Running)
    }

    /// Terminal statuses that count as a successful outcome.
    pub fn is_positive(self) -> bool {
        matches!(self, Self::Success | Self::Skipped)
    }

    /// Terminal statuses that trigger failure handling.
    pub fn is_broken(self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Error | Self::Expired | Self::Rejected
        )
    }

    /// Whether a record in this status may move to `next`.
    ///
    /// Terminal statuses are final, `New` is never re-entered, a status may
    /// only repeat itself when it is re-enterable, and `Discontinuing` may
    /// only settle into a terminal status.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        if self.is_terminal() || next == Self::New {
            return false;
        }
        if self == next {
            return self.is_reenterable();
        }
        if self == Self::Discontinuing {
            return next.is_terminal();
        }
        true
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Waiting => "WAITING",
            Self::Resumed => "RESUMED",
            Self::Discontinuing => "DISCONTINUING",
            Self::Success => "SUCCESS",
            Self::Skipped => "SKIPPED",
            Self::Failed => "FAILED",
            Self::Error => "ERROR",
            Self::Aborted => "ABORTED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a state failure, used to filter failure strategies.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    Application,
    Timeout,
    Verification,
    Connectivity,
    Authorization,
    /// A context expression could not be resolved. Never retried.
    Resolution,
    /// A resource constraint request could never be satisfied.
    Admission,
}

impl FailureType {
    /// Failures that retrying cannot fix.
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Resolution | Self::Admission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses_are_final() {
        for status in ExecutionStatus::TERMINAL {
            assert!(status.is_terminal());
            assert!(!status.can_transition_to(ExecutionStatus::Running));
            assert!(!status.can_transition_to(status));
        }
    }

    #[test]
    fn test_reenterable_statuses() {
        assert!(ExecutionStatus::Waiting.can_transition_to(ExecutionStatus::Waiting));
        assert!(ExecutionStatus::Paused.can_transition_to(ExecutionStatus::Paused));
        assert!(!ExecutionStatus::Queued.can_transition_to(ExecutionStatus::Queued));
        assert!(ExecutionStatus::Waiting.can_transition_to(ExecutionStatus::Running));
    }

    #[test]
    fn test_new_is_never_reentered() {
        assert!(!ExecutionStatus::Running.can_transition_to(ExecutionStatus::New));
        assert!(ExecutionStatus::New.can_transition_to(ExecutionStatus::Running));
    }

    #[test]
    fn test_discontinuing_only_settles_terminal() {
        let status = ExecutionStatus::Discontinuing;
        assert!(status.can_transition_to(ExecutionStatus::Aborted));
        assert!(status.can_transition_to(ExecutionStatus::Expired));
        assert!(!status.can_transition_to(ExecutionStatus::Running));
    }

    #[test]
    fn test_status_serializes_screaming_case() {
        let json = serde_json::to_string(&ExecutionStatus::Discontinuing).unwrap();
        assert_eq!(json, "\"DISCONTINUING\"");
        let status: ExecutionStatus = serde_json::from_str("\"WAITING\"").unwrap();
        assert_eq!(status, ExecutionStatus::Waiting);
        assert_eq!(ExecutionStatus::Expired.to_string(), "EXPIRED");
    }

    #[test]
    fn test_resolution_failures_are_not_retryable() {
        assert!(!FailureType::Resolution.is_retryable());
        assert!(FailureType::Timeout.is_retryable());
    }
}
