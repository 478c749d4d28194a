//! Deployment Event Queue
//!
//! Decouples "a deployment happened" from "the instance inventory was
//! updated". Deploy steps enqueue events; workers lease, reconcile and ack
//! them.

pub mod event;
pub mod lease;
pub mod worker;

pub use event::{DeliveryState, DeploymentEvent, EventKind, QueuedEvent};
pub use lease::EventQueue;
pub use worker::{InventoryReconciler, WorkerPool};
