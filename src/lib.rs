//! deployflow - Asynchronous Deployment Workflow Engine
//!
//! Runs multi-step deployment workflows as hierarchical state machines.
//! Long-running work (cloud calls, approvals, verifications) never blocks
//! a thread: a waiting state leaves a correlation record behind and is
//! resumed when the matching notification arrives.
//!
//! # Architecture
//!
//! - [`workflow`]: Definitions, state machines, instances and persistence
//! - [`context`]: Layered context stack and expression resolution
//! - [`sync`]: Notify/wait registry, barriers and resource constraints
//! - [`execution`]: The engine driving executions through their graphs
//! - [`queue`]: Lease-based deployment event queue and worker pool
//! - [`monitoring`]: Per-execution event timeline
//! - [`config`], [`logging`], [`error`]: Engine settings, logger setup
//!   and the shared error type
//!
//! # Example
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//!
//! use deployflow::{load_workflow, Engine, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> deployflow::Result<()> {
//!     deployflow::logging::init_logging(false);
//!
//!     let definition = load_workflow("deploy.yaml")?;
//!     let engine = Engine::builder(EngineConfig::default()).build();
//!     let resumed = engine.recover().await?;
//!     println!("resumed {} unfinished execution(s)", resumed);
//!
//!     let execution_id = engine.start(definition, BTreeMap::new()).await?;
//!     let status = engine.wait_for_completion(&execution_id).await?;
//!     println!("{} finished: {}", execution_id, status);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod execution;
pub mod logging;
pub mod monitoring;
pub mod queue;
pub mod sync;
pub mod workflow;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use execution::{Engine, EngineBuilder, StepExecutor, StepOutcome, StepRequest, StepResponse};
pub use workflow::model::{State, StateMachine, StateType, WorkflowDefinition};
pub use workflow::parser::{load_workflow, parse_workflow};
pub use workflow::status::ExecutionStatus;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "deployflow";
