//! Synchronization Primitives
//!
//! Correlation-id waits, cross-branch barriers and resource-constraint
//! admission control. All three keep per-key state so unrelated keys never
//! contend on a shared lock.

pub mod barrier;
pub mod constraint;
pub mod notify;

pub use barrier::{ArrivalOutcome, BarrierRegistry, BarrierSnapshot, BarrierState, BarrierWaiter};
pub use constraint::{
    AcquireOutcome, ConstraintConfig, ConstraintSnapshot, Grant, QueueStrategy, Registration, Rejection,
    Requester, ResourceConstraintRegistry,
};
pub use notify::{NotifyOutcome, NotifyRegistry, NotifyResponseData, Resumption};
