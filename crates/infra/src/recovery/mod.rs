//! Recovery runtime: one coordinator drives each document through
//! analyze, reset, dispatch and monitor.

mod coordinator;
mod monitor;
mod result;

pub use coordinator::RecoveryCoordinator;
pub use monitor::{MonitorOutcome, MonitorReport, StatusMonitor};
pub use result::{Diagnostics, RecoveryError, RecoveryResult};
