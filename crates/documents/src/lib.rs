//! `docflow-documents`: the document lifecycle domain.
//!
//! Pure types only: the status model and its transition allow-list, the
//! document record, recovery leases and the per-run recovery attempt record.
//! Nothing here performs IO; stores and coordinators live in `docflow-infra`.

pub mod attempt;
pub mod document;
pub mod lease;
pub mod status;

pub use attempt::{AttemptId, RecoveryAttempt, RecoveryOutcome, RecoveryStep, StepRecord};
pub use document::{Document, ErrorUpdate, LastError, PayloadRef, ProcessingTrace, StatusUpdate};
pub use lease::{Lease, LeaseToken};
pub use status::{DocumentStatus, InvalidTransition, LifecycleEvent};
