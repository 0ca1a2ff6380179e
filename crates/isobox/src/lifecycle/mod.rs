//! Session lifecycle orchestration.
//!
//! Every operation follows check, act, verify: the live runtime state is read
//! before acting, and "already done" states (already stopped, already gone,
//! already persistent) count as success.

mod controller;
mod error;
mod models;

pub use controller::LifecycleController;
pub use error::{LifecycleError, LifecycleResult};
pub use models::{
    BatchReport, DeleteOutcome, KillOutcome, LaunchOutcome, LaunchRequest, LifecycleConfig,
    PersistOutcome, RunReport, RunRequest, SessionView, ShutdownOutcome, StopOutcome, StopReport,
};
