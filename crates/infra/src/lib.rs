//! Infrastructure layer: document store adapters, the processing gateway
//! boundary, and the recovery runtime (detector, coordinator, scheduler).

pub mod audit;
pub mod clock;
pub mod config;
pub mod detector;
pub mod gateway;
pub mod operator;
pub mod recovery;
pub mod retry;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod integration_tests;
#[cfg(test)]
mod test_support;

pub use audit::{AuditEvent, AuditSink, InMemoryAuditSink, TracingAuditSink};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ConfigError, CoordinatorConfig, DetectorConfig, RecoveryConfig, SchedulerConfig,
    StoreRetryConfig,
};
pub use detector::{StaleThresholds, StuckItemDetector};
pub use gateway::{
    AttemptToken, Capability, DispatchRequest, GatewayError, ProcessingGateway, QueueGateway,
};
pub use operator::{
    ErrorReport, Operator, ProgressEntry, ProgressionReport, RecentChanges, StatusAge,
    StatusDelta,
};
pub use recovery::{
    Diagnostics, MonitorOutcome, MonitorReport, RecoveryCoordinator, RecoveryError,
    RecoveryResult, StatusMonitor,
};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use scheduler::{BatchTriggerScheduler, SchedulerHandle, SchedulerStats, TickReport};
pub use store::{
    CasCondition, DocumentFilter, DocumentStore, InMemoryDocumentStore, LeaseAcquisition,
    LeaseRequest, RetryingStore, StaleDocument, StaleQuery, StatusCounts, StoreError,
    TenantScope,
};
