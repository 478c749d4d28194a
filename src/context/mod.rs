//! Execution Context
//!
//! Context elements, the scoped stack they live on, and expression
//! rendering against that stack.

pub mod element;
pub mod expression;
pub mod resolver;
pub mod stack;

pub use element::{ContextElement, ContextElementKind};
pub use resolver::{ElementResolver, ExecutionContext, PassthroughResolver};
pub use stack::ContextStack;
