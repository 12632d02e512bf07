//! Failure escalation, backpressure, and rebalancing.

mod backpressure;
mod failures;
pub mod rebalance;

pub use backpressure::{Backpressure, Pressure};
pub use failures::{
    DEBUG_TASK_PRIORITY, DEBUG_TASK_TYPE, EscalationPolicy, EscalationTrigger, FailureReport, FailureTracker,
};
pub use rebalance::{RebalanceReport, Rebalancer, RequeueReason};
