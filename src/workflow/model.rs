//! Workflow Data Model
//!
//! A workflow is a tree of state machines. The root machine holds phases;
//! a phase (or phase step, or sub-workflow) owns a child machine and may
//! own a rollback machine. Leaves are steps, barriers, resource
//! constraints, waits and human approvals.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: deploy-web
//! machine:
//!   name: root
//!   initial: [deploy-east, deploy-west]
//!   states:
//!     - name: deploy-east
//!       type: PHASE
//!       machine:
//!         name: east
//!         states:
//!           - name: provision-east
//!             type: STEP
//!             step: { kind: AMI_DEPLOY, inputs: { asg: "${asg}" } }
//!           - name: provisioned-east
//!             type: BARRIER
//!             barrier: { key: post-provision }
//!         transitions:
//!           - { from: provision-east, to: provisioned-east }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::step_data::StepKind;
use super::strategy::FailureStrategy;
use crate::context::ContextElement;

/// Kind of a state in a state machine.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateType {
    /// Synthetic root of an execution; never declared in a machine.
    Workflow,
    Phase,
    PhaseStep,
    SubWorkflow,
    Step,
    Barrier,
    ResourceConstraint,
    Wait,
    /// Waits for a human decision on `approval:<instance id>`
    Approval,
}

impl StateType {
    /// Composite states own a child state machine.
    pub fn is_composite(self) -> bool {
        matches!(
            self,
            Self::Workflow | Self::Phase | Self::PhaseStep | Self::SubWorkflow
        )
    }
}

/// Whether a child machine runs forward or as a rollback.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    Forward,
    Rollback,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransitionType {
    #[default]
    Success,
    Failure,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub on: TransitionType,
}

/// Deployment work performed by a `Step` state.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepSpec {
    pub kind: StepKind,

    /// Input templates; `${name}` placeholders resolve against the context.
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BarrierSpec {
    pub key: String,

    /// Optional declared participant count, checked against analysis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participants: Option<usize>,
}

/// Scope whose completion releases a held permit.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldingScope {
    #[default]
    Phase,
    Workflow,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConstraintUsage {
    pub resource: String,
    #[serde(default = "default_units")]
    pub units: u32,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub scope: HoldingScope,
}

fn default_units() -> u32 {
    1
}

/// A node of a state machine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct State {
    /// Unique name across the whole workflow definition
    pub name: String,

    #[serde(rename = "type")]
    pub state_type: StateType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<StepSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barrier: Option<BarrierSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraint: Option<ConstraintUsage>,

    /// Duration of a `Wait` state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_secs: Option<u64>,

    /// Delay applied before the state starts executing
    #[serde(default)]
    pub wait_interval_secs: u64,

    /// Timeout for asynchronous responses, overriding the engine default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failure_strategies: Vec<FailureStrategy>,

    /// Context elements pushed when the state starts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<ContextElement>,

    /// Child machine of a composite state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<StateMachine>,

    /// Rollback machine of a composite state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<StateMachine>,
}

impl State {
    /// Creates a bare state of the given type.
    ///
    /// # Example
    ///
    /// ```
    /// use deployflow::workflow::{State, StateType, StepKind};
    ///
    /// let state = State::step("deploy-web", StepKind::K8sDeploy)
    ///     .with_input("namespace", "${namespace}")
    ///     .with_timeout_secs(600);
    /// assert_eq!(state.state_type, StateType::Step);
    /// ```
    pub fn new(name: impl Into<String>, state_type: StateType) -> Self {
        Self {
            name: name.into().trim().to_string(),
            state_type,
            step: None,
            barrier: None,
            constraint: None,
            wait_secs: None,
            wait_interval_secs: 0,
            timeout_secs: None,
            failure_strategies: Vec::new(),
            context: Vec::new(),
            machine: None,
            rollback: None,
        }
    }

    pub fn step(name: impl Into<String>, kind: StepKind) -> Self {
        let mut state = Self::new(name, StateType::Step);
        state.step = Some(StepSpec {
            kind,
            inputs: BTreeMap::new(),
        });
        state
    }

    pub fn phase(name: impl Into<String>, machine: StateMachine) -> Self {
        Self::new(name, StateType::Phase).with_machine(machine)
    }

    pub fn phase_step(name: impl Into<String>, machine: StateMachine) -> Self {
        Self::new(name, StateType::PhaseStep).with_machine(machine)
    }

    pub fn sub_workflow(name: impl Into<String>, machine: StateMachine) -> Self {
        Self::new(name, StateType::SubWorkflow).with_machine(machine)
    }

    pub fn barrier(name: impl Into<String>, key: impl Into<String>) -> Self {
        let mut state = Self::new(name, StateType::Barrier);
        state.barrier = Some(BarrierSpec {
            key: key.into(),
            participants: None,
        });
        state
    }

    pub fn resource_constraint(name: impl Into<String>, resource: impl Into<String>, units: u32) -> Self {
        let mut state = Self::new(name, StateType::ResourceConstraint);
        state.constraint = Some(ConstraintUsage {
            resource: resource.into(),
            units,
            priority: 0,
            scope: HoldingScope::Phase,
        });
        state
    }

    pub fn wait(name: impl Into<String>, secs: u64) -> Self {
        let mut state = Self::new(name, StateType::Wait);
        state.wait_secs = Some(secs);
        state
    }

    pub fn approval(name: impl Into<String>) -> Self {
        Self::new(name, StateType::Approval)
    }

    /// Adds an input template to a step state.
    pub fn with_input(mut self, key: impl Into<String>, template: impl Into<String>) -> Self {
        if let Some(step) = self.step.as_mut() {
            step.inputs.insert(key.into(), template.into());
        }
        self
    }

    pub fn with_machine(mut self, machine: StateMachine) -> Self {
        self.machine = Some(machine);
        self
    }

    pub fn with_rollback(mut self, machine: StateMachine) -> Self {
        self.rollback = Some(machine);
        self
    }

    /// Derives a rollback machine that replays the step states of the
    /// forward machine in reverse order.
    pub fn with_mirrored_rollback(mut self) -> Self {
        if let Some(forward) = &self.machine {
            let mut steps: Vec<State> = forward
                .states
                .iter()
                .filter(|s| s.state_type == StateType::Step)
                .map(|s| {
                    let mut mirrored = s.clone();
                    mirrored.name = format!("{}-rollback", s.name);
                    mirrored.failure_strategies.clear();
                    mirrored
                })
                .collect();
            steps.reverse();
            let name = format!("{}-rollback", forward.name);
            self.rollback = Some(StateMachine::sequence(name, steps));
        }
        self
    }

    pub fn with_failure_strategy(mut self, strategy: FailureStrategy) -> Self {
        self.failure_strategies.push(strategy);
        self
    }

    pub fn with_context(mut self, element: ContextElement) -> Self {
        self.context.push(element);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_wait_interval_secs(mut self, secs: u64) -> Self {
        self.wait_interval_secs = secs;
        self
    }

    pub fn with_participants(mut self, count: usize) -> Self {
        if let Some(barrier) = self.barrier.as_mut() {
            barrier.participants = Some(count);
        }
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        if let Some(usage) = self.constraint.as_mut() {
            usage.priority = priority;
        }
        self
    }

    pub fn with_holding_scope(mut self, scope: HoldingScope) -> Self {
        if let Some(usage) = self.constraint.as_mut() {
            usage.scope = scope;
        }
        self
    }

    /// Child machine for the given mode, if any.
    pub fn child_machine(&self, mode: ExecutionMode) -> Option<&StateMachine> {
        match mode {
            ExecutionMode::Forward => self.machine.as_ref(),
            ExecutionMode::Rollback => self.rollback.as_ref(),
        }
    }
}

/// A graph of states connected by success and failure transitions.
///
/// Several initial states start parallel branches; the machine is done
/// when every branch has ended.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StateMachine {
    pub name: String,

    /// Initial states; defaults to the first declared state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub initial: Vec<String>,

    #[serde(default)]
    pub states: Vec<State>,

    #[serde(default)]
    pub transitions: Vec<Transition>,
}

impl StateMachine {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            initial: Vec::new(),
            states: Vec::new(),
            transitions: Vec::new(),
        }
    }

    /// Chains states with success transitions in declaration order.
    pub fn sequence(name: impl Into<String>, states: Vec<State>) -> Self {
        let mut machine = Self::new(name);
        for pair in states.windows(2) {
            machine.transitions.push(Transition {
                from: pair[0].name.clone(),
                to: pair[1].name.clone(),
                on: TransitionType::Success,
            });
        }
        machine.states = states;
        machine
    }

    /// Starts every state as its own branch.
    pub fn parallel(name: impl Into<String>, states: Vec<State>) -> Self {
        let mut machine = Self::new(name);
        machine.initial = states.iter().map(|s| s.name.clone()).collect();
        machine.states = states;
        machine
    }

    pub fn with_state(mut self, state: State) -> Self {
        self.states.push(state);
        self
    }

    pub fn with_initial(mut self, state: impl Into<String>) -> Self {
        self.initial.push(state.into());
        self
    }

    pub fn with_transition(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.transitions.push(Transition {
            from: from.into(),
            to: to.into(),
            on: TransitionType::Success,
        });
        self
    }

    pub fn with_failure_transition(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.transitions.push(Transition {
            from: from.into(),
            to: to.into(),
            on: TransitionType::Failure,
        });
        self
    }

    pub fn state(&self, name: &str) -> Option<&State> {
        self.states.iter().find(|s| s.name == name)
    }

    pub fn initial_states(&self) -> Vec<&State> {
        if self.initial.is_empty() {
            return self.states.first().into_iter().collect();
        }
        self.initial.iter().filter_map(|name| self.state(name)).collect()
    }

    pub fn transitions_from(&self, name: &str) -> Vec<&Transition> {
        self.transitions.iter().filter(|t| t.from == name).collect()
    }

    /// Target of the transition leaving `name` on the given outcome.
    pub fn next_state(&self, name: &str, on: TransitionType) -> Option<&State> {
        self.transitions
            .iter()
            .find(|t| t.from == name && t.on == on)
            .and_then(|t| self.state(&t.to))
    }

    /// Child machine owned by the composite state `name`.
    pub fn child_machine(&self, name: &str, mode: ExecutionMode) -> Option<&StateMachine> {
        self.state(name)?.child_machine(mode)
    }

    /// Resolves a machine path relative to this machine.
    pub fn machine_at(&self, path: &MachinePath) -> Option<&StateMachine> {
        let mut machine = self;
        for segment in &path.0 {
            machine = machine.child_machine(&segment.state, segment.mode)?;
        }
        Some(machine)
    }

    /// Every state of this machine and of all nested machines, depth first.
    pub fn all_states(&self) -> Vec<&State> {
        let mut states = Vec::new();
        for state in &self.states {
            states.push(state);
            if let Some(child) = &state.machine {
                states.extend(child.all_states());
            }
            if let Some(rollback) = &state.rollback {
                states.extend(rollback.all_states());
            }
        }
        states
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathSegment {
    pub state: String,
    pub mode: ExecutionMode,
}

/// Location of a machine inside the definition: the chain of composite
/// states (and modes) leading to it from the root machine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct MachinePath(pub Vec<PathSegment>);

impl MachinePath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn child(&self, state: &str, mode: ExecutionMode) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment {
            state: state.to_string(),
            mode,
        });
        Self(segments)
    }

    pub fn is_rollback(&self) -> bool {
        self.0.iter().any(|s| s.mode == ExecutionMode::Rollback)
    }
}

impl std::fmt::Display for MachinePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.0 {
            match segment.mode {
                ExecutionMode::Forward => write!(f, "/{}", segment.state)?,
                ExecutionMode::Rollback => write!(f, "/{}~rollback", segment.state)?,
            }
        }
        Ok(())
    }
}

/// A complete deployment workflow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    pub name: String,

    /// Workflow variables, exposed as a standard context element
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,

    /// Root machine; its initial states are the top-level branches
    pub machine: StateMachine,

    /// Strategies consulted after every enclosing scope
    #[serde(default)]
    pub failure_strategies: Vec<FailureStrategy>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, machine: StateMachine) -> Self {
        Self {
            name: name.into(),
            variables: BTreeMap::new(),
            machine,
            failure_strategies: Vec::new(),
        }
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn with_failure_strategy(mut self, strategy: FailureStrategy) -> Self {
        self.failure_strategies.push(strategy);
        self
    }

    pub fn machine_at(&self, path: &MachinePath) -> Option<&StateMachine> {
        self.machine.machine_at(path)
    }

    pub fn state_at(&self, path: &MachinePath, name: &str) -> Option<&State> {
        self.machine_at(path)?.state(name)
    }

    /// Total number of states across all machines.
    pub fn state_count(&self) -> usize {
        self.machine.all_states().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_phase_definition() -> WorkflowDefinition {
        let east = StateMachine::sequence(
            "east",
            vec![
                State::step("provision-east", StepKind::AmiDeploy),
                State::step("verify-east", StepKind::HttpVerification),
            ],
        );
        let west = StateMachine::sequence("west", vec![State::step("provision-west", StepKind::AmiDeploy)]);
        let root = StateMachine::parallel(
            "root",
            vec![
                State::phase("deploy-east", east).with_mirrored_rollback(),
                State::phase("deploy-west", west),
            ],
        );
        WorkflowDefinition::new("deploy", root)
    }

    #[test]
    fn test_sequence_builds_success_transitions() {
        let def = two_phase_definition();
        let east = def.machine.child_machine("deploy-east", ExecutionMode::Forward).unwrap();
        assert_eq!(east.initial_states()[0].name, "provision-east");
        let next = east.next_state("provision-east", TransitionType::Success).unwrap();
        assert_eq!(next.name, "verify-east");
        assert!(east.next_state("verify-east", TransitionType::Success).is_none());
        assert!(east.next_state("provision-east", TransitionType::Failure).is_none());
    }

    #[test]
    fn test_parallel_initial_states() {
        let def = two_phase_definition();
        let names: Vec<_> = def.machine.initial_states().iter().map(|s| s.name.clone()).collect();
        assert_eq!(names, vec!["deploy-east", "deploy-west"]);
    }

    #[test]
    fn test_machine_path_resolution() {
        let def = two_phase_definition();
        let path = MachinePath::root().child("deploy-east", ExecutionMode::Rollback);
        let rollback = def.machine_at(&path).unwrap();
        let names: Vec<_> = rollback.states.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["verify-east-rollback", "provision-east-rollback"]);
        assert!(def.state_at(&path, "provision-east-rollback").is_some());
        assert!(path.is_rollback());
        assert_eq!(path.to_string(), "/deploy-east~rollback");

        let missing = MachinePath::root().child("deploy-west", ExecutionMode::Rollback);
        assert!(def.machine_at(&missing).is_none());
    }

    #[test]
    fn test_state_count_includes_nested_machines() {
        let def = two_phase_definition();
        // 2 phases + 3 forward steps + 2 mirrored rollback steps
        assert_eq!(def.state_count(), 7);
    }

    #[test]
    fn test_state_yaml_deserialization() {
        let yaml = r#"
name: lock-cluster
type: RESOURCE_CONSTRAINT
constraint:
  resource: cluster-x
  priority: 5
"#;
        let state: State = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(state.state_type, StateType::ResourceConstraint);
        let usage = state.constraint.unwrap();
        assert_eq!(usage.units, 1);
        assert_eq!(usage.priority, 5);
        assert_eq!(usage.scope, HoldingScope::Phase);
    }

    #[test]
    fn test_builders_ignore_mismatched_kinds() {
        let state = State::wait("pause", 30).with_input("ignored", "x").with_priority(3);
        assert!(state.step.is_none());
        assert!(state.constraint.is_none());
        assert_eq!(state.wait_secs, Some(30));
    }
}
