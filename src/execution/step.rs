//! Step Execution
//!
//! The boundary between the engine and whatever actually performs a step
//! (cloud-provider calls, verifications, shell commands). An executor
//! either finishes right away or hands back correlation ids the engine
//! waits on.
//!
//! A shell-command executor is provided for `COMMAND` steps.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, warn};
use serde_json::Value;
use tokio::process::Command;

use crate::context::ContextElement;
use crate::error::Result;
use crate::queue::DeploymentEvent;
use crate::sync::NotifyResponseData;
use crate::workflow::status::{ExecutionStatus, FailureType};
use crate::workflow::step_data::{StepExecutionData, StepKind};

/// Everything an executor gets to know about the step it runs.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub execution_id: String,
    pub instance_id: String,
    pub state_name: String,
    pub kind: StepKind,
    /// Step inputs with every `${...}` placeholder rendered
    pub inputs: BTreeMap<String, String>,
    /// Set when the step runs inside a rollback machine
    pub rollback: bool,
    pub retry_count: u32,
    /// Flattened context visible to the step
    pub bindings: BTreeMap<String, Value>,
}

impl StepRequest {
    pub fn input(&self, key: &str) -> Option<&str> {
        self.inputs.get(key).map(String::as_str)
    }
}

/// Terminal result of a step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub status: ExecutionStatus,
    pub error_message: Option<String>,
    pub failure_types: Vec<FailureType>,
    pub data: Option<StepExecutionData>,
    /// Elements made visible to the states that follow in the branch
    pub context_elements: Vec<ContextElement>,
    /// Inventory events to enqueue
    pub events: Vec<DeploymentEvent>,
}

impl StepOutcome {
    pub fn new(status: ExecutionStatus) -> Self {
        Self {
            status,
            error_message: None,
            failure_types: Vec::new(),
            data: None,
            context_elements: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn success() -> Self {
        Self::new(ExecutionStatus::Success)
    }

    pub fn failed(message: impl Into<String>, failure_type: FailureType) -> Self {
        Self {
            error_message: Some(message.into()),
            failure_types: vec![failure_type],
            ..Self::new(ExecutionStatus::Failed)
        }
    }

    pub fn with_data(mut self, data: StepExecutionData) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_context(mut self, element: ContextElement) -> Self {
        self.context_elements.push(element);
        self
    }

    pub fn with_event(mut self, event: DeploymentEvent) -> Self {
        self.events.push(event);
        self
    }
}

/// What an executor hands back from `execute`.
#[derive(Debug, Clone, PartialEq)]
pub enum StepResponse {
    /// The step finished synchronously
    Completed(StepOutcome),
    /// The step continues elsewhere; resume once every id is notified
    Async {
        correlation_ids: Vec<String>,
        data: Option<StepExecutionData>,
        /// Overrides the state's timeout
        timeout: Option<Duration>,
    },
}

impl StepResponse {
    pub fn wait_on(correlation_id: impl Into<String>) -> Self {
        StepResponse::Async {
            correlation_ids: vec![correlation_id.into()],
            data: None,
            timeout: None,
        }
    }
}

/// Performs one kind of step.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, request: &StepRequest) -> Result<StepResponse>;

    /// Turns the responses of an asynchronous step into its outcome.
    async fn resume(
        &self,
        _request: &StepRequest,
        responses: &BTreeMap<String, NotifyResponseData>,
    ) -> Result<StepOutcome> {
        Ok(consolidate(responses))
    }
}

/// Default consolidation of fan-in responses: the first broken response
/// (in correlation id order) decides, otherwise the step succeeded.
pub fn consolidate(responses: &BTreeMap<String, NotifyResponseData>) -> StepOutcome {
    for (correlation_id, response) in responses {
        match response {
            NotifyResponseData::TimedOut => {
                return StepOutcome {
                    error_message: Some(format!("no response for '{}' before the timeout", correlation_id)),
                    failure_types: vec![FailureType::Timeout],
                    ..StepOutcome::new(ExecutionStatus::Expired)
                };
            }
            NotifyResponseData::Aborted => return StepOutcome::new(ExecutionStatus::Aborted),
            NotifyResponseData::StepResult {
                status,
                error_message,
                ..
            } if !status.is_positive() => {
                return StepOutcome {
                    error_message: error_message
                        .clone()
                        .or_else(|| Some(format!("'{}' reported {}", correlation_id, status))),
                    failure_types: vec![FailureType::Application],
                    ..StepOutcome::new(*status)
                };
            }
            _ => {}
        }
    }
    StepOutcome::success()
}

/// Runs `COMMAND` steps as bash scripts.
///
/// Inputs:
/// - `command`: script body (required)
/// - `working_dir`: directory to run in
#[derive(Debug, Clone, Default)]
pub struct ShellCommandExecutor {
    working_dir: Option<PathBuf>,
}

impl ShellCommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default working directory for commands.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl StepExecutor for ShellCommandExecutor {
    async fn execute(&self, request: &StepRequest) -> Result<StepResponse> {
        let Some(command_text) = request.input("command") else {
            return Ok(StepResponse::Completed(StepOutcome::failed(
                format!("step '{}' has no command input", request.state_name),
                FailureType::Application,
            )));
        };

        let script_path = create_execution_script(&request.instance_id, command_text)?;
        let working_dir = request
            .input("working_dir")
            .map(PathBuf::from)
            .or_else(|| self.working_dir.clone());

        let mut cmd = Command::new("bash");
        cmd.arg(&script_path);
        if let Some(dir) = &working_dir {
            cmd.current_dir(dir);
            debug!("Executing in directory: {}", dir.display());
        }
        let output = cmd.output().await;

        if let Err(e) = fs::remove_file(&script_path) {
            warn!("Failed to clean up script {}: {}", script_path.display(), e);
        }
        let output = output?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let data = StepExecutionData::Command {
            command_name: request.state_name.clone(),
            exit_code: output.status.code(),
            output: (!stdout.is_empty()).then(|| stdout.clone()),
        };

        if output.status.success() {
            debug!("Step '{}' completed successfully", request.state_name);
            return Ok(StepResponse::Completed(StepOutcome::success().with_data(data)));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(
            "Step '{}' failed with exit code: {:?}",
            request.state_name,
            output.status.code()
        );
        if !stderr.trim().is_empty() {
            error!("stderr:\n{}", stderr);
        }
        Ok(StepResponse::Completed(
            StepOutcome::failed(
                format!("command exited with {:?}", output.status.code()),
                FailureType::Application,
            )
            .with_data(data),
        ))
    }
}

/// Writes a temporary bash script for a step instance.
fn create_execution_script(instance_id: &str, command_text: &str) -> Result<PathBuf> {
    let script_dir = std::env::temp_dir().join("deployflow_scripts");
    fs::create_dir_all(&script_dir)?;

    let script_path = script_dir.join(format!("step_{}.sh", instance_id));
    let mut file = File::create(&script_path)?;

    writeln!(file, "#!/bin/bash")?;
    writeln!(file, "set -e")?;
    writeln!(file, "{}", command_text)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))?;
    }

    Ok(script_path)
}
