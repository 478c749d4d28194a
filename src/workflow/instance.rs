//! Execution Records
//!
//! Runtime records created by the engine: one `WorkflowExecution` per run
//! and one `StateExecutionInstance` per state entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::model::{MachinePath, State, StateType};
use super::status::{ExecutionStatus, FailureType};
use super::step_data::StepExecutionData;

/// Runtime record of one entry into one state.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StateExecutionInstance {
    pub id: String,
    pub execution_id: String,

    /// Path of the machine this state belongs to
    pub machine_path: MachinePath,
    pub state_name: String,
    pub state_type: StateType,
    pub status: ExecutionStatus,

    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,

    /// Context elements pushed by this instance
    #[serde(default)]
    pub context_element_ids: Vec<String>,

    /// Every context element visible to this instance, bottom to top
    #[serde(default)]
    pub context_stack: Vec<String>,

    /// Elements produced by the step, visible to the states after it
    #[serde(default)]
    pub produced_element_ids: Vec<String>,

    #[serde(default)]
    pub parent_instance_id: Option<String>,
    #[serde(default)]
    pub child_instance_ids: Vec<String>,

    /// Instance this one follows in its branch (predecessor or failed attempt)
    #[serde(default)]
    pub prev_instance_id: Option<String>,

    /// Correlation id the parent waits on for this branch
    #[serde(default)]
    pub notify_id: Option<String>,

    /// Top-level branch this instance runs in; barrier participant id
    #[serde(default)]
    pub branch: Option<String>,

    /// Set for instances running inside a rollback machine
    #[serde(default)]
    pub rollback: bool,

    #[serde(default)]
    pub rollback_requested: bool,
    #[serde(default)]
    pub rollback_started: bool,

    #[serde(default)]
    pub retry_count: u32,

    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub failure_types: Vec<FailureType>,

    #[serde(default)]
    pub step_data: Option<StepExecutionData>,

    /// Correlation ids of the outstanding wait, if any
    #[serde(default)]
    pub correlation_ids: Vec<String>,

    #[serde(default)]
    pub delay_elapsed: bool,

    /// Resources whose permits are held until this instance ends
    #[serde(default)]
    pub held_permits: Vec<String>,
}

impl StateExecutionInstance {
    /// Creates a NEW instance for `state` inside the machine at `path`.
    pub fn new(execution_id: &str, state: &State, machine_path: MachinePath) -> Self {
        Self::with_type(execution_id, &state.name, state.state_type, machine_path)
    }

    /// Creates the synthetic root instance of an execution.
    pub fn root(execution_id: &str, workflow_name: &str) -> Self {
        Self::with_type(execution_id, workflow_name, StateType::Workflow, MachinePath::root())
    }

    fn with_type(execution_id: &str, name: &str, state_type: StateType, machine_path: MachinePath) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            execution_id: execution_id.to_string(),
            machine_path,
            state_name: name.to_string(),
            state_type,
            status: ExecutionStatus::New,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            context_element_ids: Vec::new(),
            context_stack: Vec::new(),
            produced_element_ids: Vec::new(),
            parent_instance_id: None,
            child_instance_ids: Vec::new(),
            prev_instance_id: None,
            notify_id: None,
            branch: None,
            rollback: false,
            rollback_requested: false,
            rollback_started: false,
            retry_count: 0,
            error_message: None,
            failure_types: Vec::new(),
            step_data: None,
            correlation_ids: Vec::new(),
            delay_elapsed: false,
            held_permits: Vec::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.state_type == StateType::Workflow
    }

    /// Context visible before this instance pushed its own elements.
    pub fn inherited_context(&self) -> Vec<String> {
        self.context_stack
            .iter()
            .filter(|id| !self.context_element_ids.contains(id))
            .cloned()
            .collect()
    }

    /// Context handed to the next state of the same branch.
    pub fn successor_context(&self) -> Vec<String> {
        let mut stack = self.inherited_context();
        stack.extend(self.produced_element_ids.iter().cloned());
        stack
    }

    /// Applies a status change if the lifecycle allows it.
    ///
    /// Returns false when the move is not allowed, leaving the record
    /// untouched.
    pub fn advance(&mut self, next: ExecutionStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        if next == ExecutionStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
            self.correlation_ids.clear();
        }
        self.status = next;
        true
    }

    /// Fresh attempt of this instance for a retry.
    pub fn retry_attempt(&self) -> Self {
        let mut attempt = self.clone();
        attempt.id = Uuid::new_v4().to_string();
        attempt.status = ExecutionStatus::New;
        attempt.created_at = Utc::now();
        attempt.started_at = None;
        attempt.ended_at = None;
        attempt.context_stack = self.inherited_context();
        attempt.context_element_ids.clear();
        attempt.produced_element_ids.clear();
        attempt.child_instance_ids.clear();
        attempt.prev_instance_id = Some(self.id.clone());
        attempt.rollback_requested = false;
        attempt.rollback_started = false;
        attempt.retry_count = self.retry_count + 1;
        attempt.error_message = None;
        attempt.failure_types.clear();
        attempt.step_data = None;
        attempt.correlation_ids.clear();
        attempt.delay_elapsed = false;
        attempt.held_permits.clear();
        attempt
    }
}

/// Runtime record of one workflow run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    pub root_instance_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl WorkflowExecution {
    pub fn new(workflow_name: &str, root_instance_id: &str, id: &str) -> Self {
        Self {
            id: id.to_string(),
            workflow_name: workflow_name.to_string(),
            status: ExecutionStatus::New,
            root_instance_id: root_instance_id.to_string(),
            created_at: Utc::now(),
            ended_at: None,
            paused: false,
            error_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::ExecutionMode;
    use crate::workflow::step_data::StepKind;

    #[test]
    fn test_advance_respects_lifecycle() {
        let state = State::step("deploy", StepKind::Command);
        let mut instance = StateExecutionInstance::new("exec-1", &state, MachinePath::root());
        assert!(instance.advance(ExecutionStatus::Running));
        assert!(instance.started_at.is_some());
        assert!(instance.advance(ExecutionStatus::Waiting));
        instance.correlation_ids.push("cb-1".to_string());
        assert!(instance.advance(ExecutionStatus::Success));
        assert!(instance.ended_at.is_some());
        assert!(instance.correlation_ids.is_empty());
        assert!(!instance.advance(ExecutionStatus::Failed));
        assert_eq!(instance.status, ExecutionStatus::Success);
    }

    #[test]
    fn test_retry_attempt_drops_own_context() {
        let state = State::step("deploy", StepKind::Command);
        let path = MachinePath::root().child("phase", ExecutionMode::Forward);
        let mut instance = StateExecutionInstance::new("exec-1", &state, path.clone());
        instance.context_stack = vec!["wf".to_string(), "own".to_string()];
        instance.context_element_ids = vec!["own".to_string()];
        instance.status = ExecutionStatus::Failed;
        instance.notify_id = Some("child:1".to_string());

        let attempt = instance.retry_attempt();
        assert_ne!(attempt.id, instance.id);
        assert_eq!(attempt.retry_count, 1);
        assert_eq!(attempt.status, ExecutionStatus::New);
        assert_eq!(attempt.context_stack, vec!["wf".to_string()]);
        assert_eq!(attempt.notify_id.as_deref(), Some("child:1"));
        assert_eq!(attempt.machine_path, path);
        assert_eq!(attempt.prev_instance_id.as_deref(), Some(instance.id.as_str()));
    }

    #[test]
    fn test_successor_context_keeps_produced_elements() {
        let state = State::step("provision", StepKind::AmiDeploy);
        let mut instance = StateExecutionInstance::new("exec-1", &state, MachinePath::root());
        instance.context_stack = vec!["wf".to_string(), "own".to_string()];
        instance.context_element_ids = vec!["own".to_string()];
        instance.produced_element_ids = vec!["asg".to_string()];
        assert_eq!(instance.successor_context(), vec!["wf".to_string(), "asg".to_string()]);
    }

    #[test]
    fn test_root_instance() {
        let root = StateExecutionInstance::root("exec-1", "deploy");
        assert!(root.is_root());
        assert!(root.machine_path.is_root());
    }
}
