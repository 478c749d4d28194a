//! Workflow Parser
//!
//! Loads workflow definitions from YAML and validates them before they
//! reach the engine.

use std::fs;
use std::path::Path;

use log::{debug, info};

use super::model::WorkflowDefinition;
use super::validator::validate_definition;
use crate::error::Result;

/// Loads a workflow from a YAML file.
///
/// This function:
/// 1. Reads and parses the YAML file
/// 2. Validates the state machines and barrier participants
pub fn load_workflow<P: AsRef<Path>>(path: P) -> Result<WorkflowDefinition> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let contents = fs::read_to_string(path)?;
    let definition = parse_workflow(&contents)?;

    info!(
        "Loaded workflow '{}' with {} states",
        definition.name,
        definition.state_count()
    );
    Ok(definition)
}

/// Parses and validates a workflow from YAML text.
pub fn parse_workflow(contents: &str) -> Result<WorkflowDefinition> {
    let definition: WorkflowDefinition = serde_yaml::from_str(contents)?;
    let plan = validate_definition(&definition)?;
    debug!("Workflow '{}' barrier plan: {:?}", definition.name, plan);
    Ok(definition)
}

/// Saves a workflow definition as YAML.
pub fn save_workflow<P: AsRef<Path>>(definition: &WorkflowDefinition, path: P) -> Result<()> {
    let yaml = serde_yaml::to_string(definition)?;
    fs::write(path.as_ref(), yaml)?;
    info!("Saved workflow '{}' to {}", definition.name, path.as_ref().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::workflow::model::{ExecutionMode, StateType};
    use crate::workflow::strategy::FailureAction;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const TWO_PHASE: &str = r#"
name: deploy-web
variables:
  env: prod
failure_strategies:
  - action: ABORT_WORKFLOW
machine:
  name: root
  initial: [phase-a, phase-b]
  states:
    - name: phase-a
      type: PHASE
      context:
        - kind: INFRA_MAPPING
          name: east
          data: { namespace: web-east }
      machine:
        name: phase-a-steps
        states:
          - name: provision-a
            type: STEP
            step:
              kind: AMI_DEPLOY
              inputs: { asg: "web-${env}-east" }
            failure_strategies:
              - failure_types: [TIMEOUT]
                action: RETRY
                attempts: 2
          - name: sync-a
            type: BARRIER
            barrier: { key: post-provision, participants: 2 }
        transitions:
          - { from: provision-a, to: sync-a }
      rollback:
        name: phase-a-rollback
        states:
          - name: undo-a
            type: STEP
            step: { kind: COMMAND }
    - name: phase-b
      type: PHASE
      machine:
        name: phase-b-steps
        states:
          - name: sync-b
            type: BARRIER
            barrier: { key: post-provision }
"#;

    #[test]
    fn test_parse_two_phase_workflow() {
        let definition = parse_workflow(TWO_PHASE).unwrap();
        assert_eq!(definition.name, "deploy-web");
        assert_eq!(definition.variables["env"], serde_json::Value::from("prod"));
        assert_eq!(definition.failure_strategies[0].action, FailureAction::AbortWorkflow);

        let phase_a = definition.machine.state("phase-a").unwrap();
        assert_eq!(phase_a.state_type, StateType::Phase);
        assert_eq!(phase_a.context.len(), 1);
        let rollback = definition
            .machine
            .child_machine("phase-a", ExecutionMode::Rollback)
            .unwrap();
        assert_eq!(rollback.states[0].name, "undo-a");
        assert_eq!(definition.state_count(), 6);
    }

    #[test]
    fn test_invalid_workflow_is_rejected() {
        let broken = TWO_PHASE.replace("participants: 2", "participants: 3");
        match parse_workflow(&broken) {
            Err(EngineError::Validation(errors)) => assert!(errors.iter().any(|e| e.is_synchronization())),
            other => panic!("expected validation failure, got {:?}", other),
        }
        assert!(matches!(parse_workflow("name: [unclosed"), Err(EngineError::Yaml(_))));
    }

    #[test]
    fn test_load_and_save_round_trip_through_files() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(TWO_PHASE.as_bytes()).unwrap();
        let definition = load_workflow(file.path()).unwrap();

        let out = NamedTempFile::new().unwrap();
        save_workflow(&definition, out.path()).unwrap();
        let reloaded = load_workflow(out.path()).unwrap();
        assert_eq!(reloaded.machine.states.len(), definition.machine.states.len());
        assert_eq!(reloaded.state_count(), definition.state_count());
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(load_workflow("/nonexistent/workflow.yaml"), Err(EngineError::Io(_))));
    }
}
