//! Workflow Execution Module
//!
//! Provides the execution engine that drives workflow executions through
//! their state machines without blocking on external work.
//!
//! # Architecture
//!
//! - [`engine`]: Engine, builder, state entry and resumption
//! - [`step`]: Step executor boundary and the shell command executor
//! - `transition`: Completion, transitions and failure strategies
//! - `interrupt`: Abort, expire, pause and resume
//! - `recovery`: Reloading unfinished executions after a restart

pub mod engine;
mod interrupt;
mod recovery;
pub mod step;
mod transition;


pub use engine::{approval_id, Engine, EngineBuilder};
pub use step::{consolidate, ShellCommandExecutor, StepExecutor, StepOutcome, StepRequest, StepResponse};
