//! Workflow Validation
//!
//! Structural checks run before an execution starts:
//! - State fields match their state type
//! - Transitions reference existing states and are unambiguous
//! - Machines are acyclic (Kahn's algorithm)
//! - Parallel branches of a machine are disjoint and cover every state
//! - Barrier participants are derived from the root machine's branches
//!
//! Barrier participants are computed once, statically: a top-level branch
//! of the root machine participates in a barrier if any state in its
//! subtree references the barrier key. A declared participant count must
//! agree with that analysis.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use log::{debug, info};

use super::model::{State, StateMachine, StateType, TransitionType, WorkflowDefinition};
use crate::error::{EngineError, Result};

/// Barrier key -> participating top-level branches.
pub type BarrierPlan = BTreeMap<String, BTreeSet<String>>;

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    EmptyMachine(String),
    EmptyStateName(String),
    DuplicateStateName(String),
    ReservedStateType(String),
    MissingChildMachine(String),
    UnexpectedChildMachine(String),
    MissingStepSpec(String),
    MissingBarrierKey(String),
    MissingConstraint(String),
    InvalidUnits(String),
    MissingWaitDuration(String),
    BarrierInRollback(String),
    UnknownInitialState { machine: String, state: String },
    UnknownTransitionState { machine: String, state: String },
    AmbiguousTransition { state: String, on: TransitionType },
    CyclicTransitions(String),
    UnreachableState { machine: String, state: String },
    SharedBranchState { machine: String, state: String },
    SingleParticipantBarrier { key: String, participants: usize },
    RepeatedBarrierArrival { key: String, participant: String },
    ParticipantCountMismatch { key: String, declared: usize, found: usize },
}

impl ValidationError {
    /// Errors about barrier participation.
    pub fn is_synchronization(&self) -> bool {
        matches!(
            self,
            Self::SingleParticipantBarrier { .. }
                | Self::RepeatedBarrierArrival { .. }
                | Self::ParticipantCountMismatch { .. }
                | Self::BarrierInRollback(_)
        )
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyMachine(machine) => write!(f, "State machine '{}' has no states", machine),
            Self::EmptyStateName(machine) => {
                write!(f, "State machine '{}' has a state with an empty name", machine)
            }
            Self::DuplicateStateName(name) => write!(f, "Duplicate state name: '{}'", name),
            Self::ReservedStateType(name) => {
                write!(f, "State '{}' uses the reserved WORKFLOW type", name)
            }
            Self::MissingChildMachine(name) => {
                write!(f, "Composite state '{}' has no child machine", name)
            }
            Self::UnexpectedChildMachine(name) => {
                write!(f, "State '{}' is not composite but declares a child machine", name)
            }
            Self::MissingStepSpec(name) => write!(f, "Step '{}' has no step definition", name),
            Self::MissingBarrierKey(name) => write!(f, "Barrier '{}' has no key", name),
            Self::MissingConstraint(name) => {
                write!(f, "Resource constraint state '{}' names no resource", name)
            }
            Self::InvalidUnits(name) => {
                write!(f, "Resource constraint state '{}' requests zero units", name)
            }
            Self::MissingWaitDuration(name) => write!(f, "Wait state '{}' has no duration", name),
            Self::BarrierInRollback(name) => {
                write!(f, "Barrier '{}' is not allowed inside a rollback machine", name)
            }
            Self::UnknownInitialState { machine, state } => {
                write!(f, "Machine '{}' starts at unknown state '{}'", machine, state)
            }
            Self::UnknownTransitionState { machine, state } => {
                write!(f, "Machine '{}' has a transition referencing unknown state '{}'", machine, state)
            }
            Self::AmbiguousTransition { state, on } => {
                write!(f, "State '{}' has more than one {:?} transition", state, on)
            }
            Self::CyclicTransitions(machine) => {
                write!(f, "Machine '{}' contains a transition cycle", machine)
            }
            Self::UnreachableState { machine, state } => {
                write!(f, "State '{}' in machine '{}' is unreachable", state, machine)
            }
            Self::SharedBranchState { machine, state } => write!(
                f,
                "State '{}' in machine '{}' is reachable from more than one parallel branch",
                state, machine
            ),
            Self::SingleParticipantBarrier { key, participants } => write!(
                f,
                "Barrier '{}' is referenced by {} parallel branch(es); at least two are required",
                key, participants
            ),
            Self::RepeatedBarrierArrival { key, participant } => write!(
                f,
                "Branch '{}' reaches barrier '{}' more than once",
                participant, key
            ),
            Self::ParticipantCountMismatch { key, declared, found } => write!(
                f,
                "Barrier '{}' declares {} participants but {} branches reference it",
                key, declared, found
            ),
        }
    }
}

/// Validates a definition and returns its barrier plan.
pub fn validate_definition(definition: &WorkflowDefinition) -> Result<BarrierPlan> {
    info!(
        "Validating workflow '{}' with {} states",
        definition.name,
        definition.state_count()
    );

    let mut errors = Vec::new();

    let mut seen: HashSet<&str> = HashSet::new();
    for state in definition.machine.all_states() {
        if !state.name.is_empty() && !seen.insert(state.name.as_str()) {
            errors.push(ValidationError::DuplicateStateName(state.name.clone()));
        }
    }

    validate_machine(&definition.machine, false, &mut errors);

    let plan = if errors.is_empty() {
        barrier_plan(definition, &mut errors)
    } else {
        BarrierPlan::new()
    };

    if !errors.is_empty() {
        return Err(EngineError::Validation(errors));
    }

    info!(
        "Workflow '{}' validated: {} barrier(s)",
        definition.name,
        plan.len()
    );
    Ok(plan)
}

fn validate_machine(machine: &StateMachine, in_rollback: bool, errors: &mut Vec<ValidationError>) {
    if machine.states.is_empty() {
        errors.push(ValidationError::EmptyMachine(machine.name.clone()));
        return;
    }

    for state in &machine.states {
        validate_state(machine, state, in_rollback, errors);
        if let Some(child) = &state.machine {
            validate_machine(child, in_rollback, errors);
        }
        if let Some(rollback) = &state.rollback {
            validate_machine(rollback, true, errors);
        }
    }

    let names: HashSet<&str> = machine.states.iter().map(|s| s.name.as_str()).collect();
    for initial in &machine.initial {
        if !names.contains(initial.as_str()) {
            errors.push(ValidationError::UnknownInitialState {
                machine: machine.name.clone(),
                state: initial.clone(),
            });
        }
    }

    let mut outgoing: HashSet<(&str, TransitionType)> = HashSet::new();
    let mut references_ok = true;
    for transition in &machine.transitions {
        for endpoint in [&transition.from, &transition.to] {
            if !names.contains(endpoint.as_str()) {
                references_ok = false;
                errors.push(ValidationError::UnknownTransitionState {
                    machine: machine.name.clone(),
                    state: endpoint.clone(),
                });
            }
        }
        if !outgoing.insert((transition.from.as_str(), transition.on)) {
            errors.push(ValidationError::AmbiguousTransition {
                state: transition.from.clone(),
                on: transition.on,
            });
        }
    }

    if references_ok && !machine.initial.iter().any(|i| !names.contains(i.as_str())) {
        if is_acyclic(machine) {
            check_branches(machine, errors);
        } else {
            errors.push(ValidationError::CyclicTransitions(machine.name.clone()));
        }
    }
}

fn validate_state(machine: &StateMachine, state: &State, in_rollback: bool, errors: &mut Vec<ValidationError>) {
    if state.name.trim().is_empty() {
        errors.push(ValidationError::EmptyStateName(machine.name.clone()));
        return;
    }

    let name = state.name.clone();
    match state.state_type {
        StateType::Workflow => errors.push(ValidationError::ReservedStateType(name.clone())),
        StateType::Phase | StateType::PhaseStep | StateType::SubWorkflow => {
            if state.machine.is_none() {
                errors.push(ValidationError::MissingChildMachine(name.clone()));
            }
        }
        StateType::Step => {
            if state.step.is_none() {
                errors.push(ValidationError::MissingStepSpec(name.clone()));
            }
        }
        StateType::Barrier => {
            if state.barrier.as_ref().map_or(true, |b| b.key.trim().is_empty()) {
                errors.push(ValidationError::MissingBarrierKey(name.clone()));
            }
            if in_rollback {
                errors.push(ValidationError::BarrierInRollback(name.clone()));
            }
        }
        StateType::ResourceConstraint => match &state.constraint {
            None => errors.push(ValidationError::MissingConstraint(name.clone())),
            Some(usage) if usage.resource.trim().is_empty() => {
                errors.push(ValidationError::MissingConstraint(name.clone()))
            }
            Some(usage) if usage.units == 0 => errors.push(ValidationError::InvalidUnits(name.clone())),
            Some(_) => {}
        },
        StateType::Wait => {
            if state.wait_secs.is_none() {
                errors.push(ValidationError::MissingWaitDuration(name.clone()));
            }
        }
        StateType::Approval => {}
    }

    let composite = state.state_type.is_composite();
    if !composite && (state.machine.is_some() || state.rollback.is_some()) {
        errors.push(ValidationError::UnexpectedChildMachine(name));
    }
}

/// Kahn's algorithm over all transitions of one machine.
fn is_acyclic(machine: &StateMachine) -> bool {
    let mut in_degree: HashMap<&str, usize> = machine.states.iter().map(|s| (s.name.as_str(), 0)).collect();
    for transition in &machine.transitions {
        if let Some(degree) = in_degree.get_mut(transition.to.as_str()) {
            *degree += 1;
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();

    let mut visited = 0;
    while let Some(current) = queue.pop_front() {
        visited += 1;
        for transition in machine.transitions_from(current) {
            if let Some(degree) = in_degree.get_mut(transition.to.as_str()) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(transition.to.as_str());
                }
            }
        }
    }

    visited == machine.states.len()
}

/// States reachable from `start` through any transition.
fn reachable_from<'a>(machine: &'a StateMachine, start: &'a str) -> Vec<&'a str> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut order = Vec::new();
    let mut queue = VecDeque::from([start]);
    while let Some(current) = queue.pop_front() {
        if !seen.insert(current) {
            continue;
        }
        order.push(current);
        for transition in machine.transitions_from(current) {
            queue.push_back(transition.to.as_str());
        }
    }
    order
}

/// Each initial state starts a branch: (initial state, states in branch).
pub fn branches(machine: &StateMachine) -> Vec<(String, Vec<&State>)> {
    machine
        .initial_states()
        .into_iter()
        .map(|initial| {
            let states = reachable_from(machine, &initial.name)
                .into_iter()
                .filter_map(|name| machine.state(name))
                .collect();
            (initial.name.clone(), states)
        })
        .collect()
}

fn check_branches(machine: &StateMachine, errors: &mut Vec<ValidationError>) {
    let mut owners: HashMap<&str, usize> = HashMap::new();
    for (_, states) in branches(machine) {
        for state in states {
            *owners.entry(state.name.as_str()).or_insert(0) += 1;
        }
    }

    for state in &machine.states {
        match owners.get(state.name.as_str()) {
            None => errors.push(ValidationError::UnreachableState {
                machine: machine.name.clone(),
                state: state.name.clone(),
            }),
            Some(count) if *count > 1 => errors.push(ValidationError::SharedBranchState {
                machine: machine.name.clone(),
                state: state.name.clone(),
            }),
            Some(_) => {}
        }
    }
}

/// Counts barrier references in the forward subtree of a state.
fn count_barrier_refs(state: &State, counts: &mut BTreeMap<String, usize>) {
    if let Some(barrier) = &state.barrier {
        if state.state_type == StateType::Barrier {
            *counts.entry(barrier.key.clone()).or_insert(0) += 1;
        }
    }
    if let Some(child) = &state.machine {
        for nested in &child.states {
            count_barrier_refs(nested, counts);
        }
    }
}

fn barrier_plan(definition: &WorkflowDefinition, errors: &mut Vec<ValidationError>) -> BarrierPlan {
    let mut plan = BarrierPlan::new();
    for (participant, states) in branches(&definition.machine) {
        let mut counts = BTreeMap::new();
        for state in states {
            count_barrier_refs(state, &mut counts);
        }
        for (key, count) in counts {
            if count > 1 {
                errors.push(ValidationError::RepeatedBarrierArrival {
                    key: key.clone(),
                    participant: participant.clone(),
                });
            }
            plan.entry(key).or_default().insert(participant.clone());
        }
    }

    let declared: BTreeMap<String, usize> = definition
        .machine
        .all_states()
        .into_iter()
        .filter_map(|state| state.barrier.as_ref())
        .filter_map(|barrier| barrier.participants.map(|count| (barrier.key.clone(), count)))
        .collect();

    for (key, participants) in &plan {
        if participants.len() < 2 {
            errors.push(ValidationError::SingleParticipantBarrier {
                key: key.clone(),
                participants: participants.len(),
            });
        }
        if let Some(&count) = declared.get(key) {
            if count != participants.len() {
                errors.push(ValidationError::ParticipantCountMismatch {
                    key: key.clone(),
                    declared: count,
                    found: participants.len(),
                });
            }
        }
        debug!("Barrier '{}' participants: {:?}", key, participants);
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::State;
    use crate::workflow::step_data::StepKind;

    fn phase_with_barrier(name: &str, key: &str) -> State {
        State::phase(
            name,
            StateMachine::sequence(
                format!("{}-machine", name),
                vec![
                    State::step(format!("{}-provision", name), StepKind::AmiDeploy),
                    State::barrier(format!("{}-sync", name), key),
                    State::step(format!("{}-deploy", name), StepKind::K8sDeploy),
                ],
            ),
        )
    }

    fn errors_of(definition: &WorkflowDefinition) -> Vec<ValidationError> {
        match validate_definition(definition) {
            Err(EngineError::Validation(errors)) => errors,
            other => panic!("expected validation errors, got {:?}", other),
        }
    }

    #[test]
    fn test_barrier_plan_from_parallel_phases() {
        let root = StateMachine::parallel(
            "root",
            vec![
                phase_with_barrier("a", "post-provision"),
                phase_with_barrier("b", "post-provision"),
            ],
        );
        let plan = validate_definition(&WorkflowDefinition::new("wf", root)).unwrap();
        let participants: Vec<_> = plan["post-provision"].iter().cloned().collect();
        assert_eq!(participants, vec!["a", "b"]);
    }

    #[test]
    fn test_sequential_top_level_states_share_a_branch() {
        // a1 -> a2 is one branch, b is another
        let root = StateMachine::new("root")
            .with_state(State::phase(
                "a1",
                StateMachine::sequence("a1-m", vec![State::step("a1-step", StepKind::Command)]),
            ))
            .with_state(phase_with_barrier("a2", "k"))
            .with_state(phase_with_barrier("b", "k"))
            .with_initial("a1")
            .with_initial("b")
            .with_transition("a1", "a2");
        let plan = validate_definition(&WorkflowDefinition::new("wf", root)).unwrap();
        let participants: Vec<_> = plan["k"].iter().cloned().collect();
        assert_eq!(participants, vec!["a1", "b"]);
    }

    #[test]
    fn test_declared_count_must_match() {
        let mut a = phase_with_barrier("a", "k");
        if let Some(machine) = a.machine.as_mut() {
            machine.states[1] = State::barrier("a-sync", "k").with_participants(3);
        }
        let root = StateMachine::parallel("root", vec![a, phase_with_barrier("b", "k")]);
        let errors = errors_of(&WorkflowDefinition::new("wf", root));
        assert!(errors.contains(&ValidationError::ParticipantCountMismatch {
            key: "k".to_string(),
            declared: 3,
            found: 2
        }));
        assert!(errors.iter().all(|e| e.is_synchronization()));
    }

    #[test]
    fn test_single_participant_barrier() {
        let root = StateMachine::parallel(
            "root",
            vec![
                phase_with_barrier("a", "lonely"),
                State::phase("b", StateMachine::sequence("b-m", vec![State::step("b-step", StepKind::Command)])),
            ],
        );
        let errors = errors_of(&WorkflowDefinition::new("wf", root));
        assert!(matches!(errors[0], ValidationError::SingleParticipantBarrier { .. }));
    }

    #[test]
    fn test_cycle_detection() {
        let machine = StateMachine::new("loop")
            .with_state(State::step("x", StepKind::Command))
            .with_state(State::step("y", StepKind::Command))
            .with_transition("x", "y")
            .with_transition("y", "x");
        let errors = errors_of(&WorkflowDefinition::new("wf", machine));
        assert!(errors.contains(&ValidationError::CyclicTransitions("loop".to_string())));
    }

    #[test]
    fn test_structural_errors() {
        let machine = StateMachine::new("root")
            .with_state(State::step("dup", StepKind::Command))
            .with_state(State::step("dup", StepKind::Command))
            .with_state(State::new("naked-phase", StateType::Phase))
            .with_state(State::new("no-spec", StateType::Step))
            .with_transition("dup", "ghost");
        let errors = errors_of(&WorkflowDefinition::new("wf", machine));
        assert!(errors.contains(&ValidationError::DuplicateStateName("dup".to_string())));
        assert!(errors.contains(&ValidationError::MissingChildMachine("naked-phase".to_string())));
        assert!(errors.contains(&ValidationError::MissingStepSpec("no-spec".to_string())));
        assert!(errors.contains(&ValidationError::UnknownTransitionState {
            machine: "root".to_string(),
            state: "ghost".to_string()
        }));
    }

    #[test]
    fn test_unreachable_and_shared_states() {
        let unreachable = StateMachine::new("m")
            .with_state(State::step("start", StepKind::Command))
            .with_state(State::step("orphan", StepKind::Command));
        let errors = errors_of(&WorkflowDefinition::new("wf", unreachable));
        assert!(errors.contains(&ValidationError::UnreachableState {
            machine: "m".to_string(),
            state: "orphan".to_string()
        }));

        let shared = StateMachine::parallel(
            "m",
            vec![State::step("a", StepKind::Command), State::step("b", StepKind::Command)],
        )
        .with_state(State::step("join", StepKind::Command))
        .with_transition("a", "join")
        .with_transition("b", "join");
        let errors = errors_of(&WorkflowDefinition::new("wf", shared));
        assert!(errors.contains(&ValidationError::SharedBranchState {
            machine: "m".to_string(),
            state: "join".to_string()
        }));
    }

    #[test]
    fn test_ambiguous_transitions_and_failure_paths() {
        let machine = StateMachine::new("m")
            .with_state(State::step("a", StepKind::Command))
            .with_state(State::step("b", StepKind::Command))
            .with_state(State::step("c", StepKind::Command))
            .with_transition("a", "b")
            .with_failure_transition("a", "c");
        assert!(validate_definition(&WorkflowDefinition::new("wf", machine.clone())).is_ok());

        let ambiguous = machine.with_transition("a", "c");
        let errors = errors_of(&WorkflowDefinition::new("wf", ambiguous));
        assert!(matches!(errors[0], ValidationError::AmbiguousTransition { .. }));
    }

    #[test]
    fn test_barrier_inside_rollback_rejected() {
        let phase = phase_with_barrier("a", "k").with_rollback(StateMachine::sequence(
            "a-rollback",
            vec![State::barrier("a-undo-sync", "undo")],
        ));
        let root = StateMachine::parallel("root", vec![phase, phase_with_barrier("b", "k")]);
        let errors = errors_of(&WorkflowDefinition::new("wf", root));
        assert!(errors.contains(&ValidationError::BarrierInRollback("a-undo-sync".to_string())));
    }
}
