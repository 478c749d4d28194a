//! Workflow Definition Module
//!
//! Provides data structures for defining deployment workflows as nested
//! state machines, and the runtime records the engine produces for them.
//!
//! # Structure
//!
//! - [`model`]: States, machines, transitions and workflow definitions
//! - [`status`]: Execution statuses and failure types
//! - [`strategy`]: Failure strategies
//! - [`instance`]: Runtime state execution records
//! - [`step_data`]: Step kinds and their recorded data
//! - [`parser`]: YAML parsing and loading
//! - [`validator`]: Structural validation and barrier participant analysis
//! - [`state`]: Persistence of runtime records

pub mod instance;
pub mod model;
pub mod parser;
pub mod state;
pub mod status;
pub mod step_data;
pub mod strategy;
pub mod validator;

pub use instance::{StateExecutionInstance, WorkflowExecution};
pub use model::{
    BarrierSpec, ConstraintUsage, ExecutionMode, HoldingScope, MachinePath, PathSegment, State,
    StateMachine, StateType, StepSpec, Transition, TransitionType, WorkflowDefinition,
};
pub use parser::{load_workflow, parse_workflow, save_workflow};
pub use state::{JsonFileStore, MemoryStore, StateStore};
pub use status::{ExecutionStatus, FailureType};
pub use step_data::{StepExecutionData, StepExecutionSummary, StepKind};
pub use strategy::{FailureAction, FailureStrategy};
pub use validator::{validate_definition, BarrierPlan, ValidationError};
