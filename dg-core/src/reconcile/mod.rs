//! Reconciliation
//!
//! [`plan_cycle`] is the pure decision step; [`Reconciler`] wraps it with
//! enumeration, verification and enforcement.

mod engine;
mod plan;
mod shutdown;

pub use engine::{CycleSummary, LoopTimings, Reconciler};
pub use plan::{plan_cycle, CyclePlan, DeviceState, MonitoringSnapshot, PendingVerification, Standing};
pub use shutdown::ShutdownSignal;
