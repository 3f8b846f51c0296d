//! Document store boundary.
//!
//! The coordinator only needs a handful of primitives from storage: point
//! reads, a compare-and-swap on `status`, lease acquisition, and an
//! age-based scan. Every mutation is conditional on the expected prior
//! status so concurrent writers cannot clobber each other.
//!
//! Soft-deleted documents are invisible to every method here.

mod in_memory;
mod postgres;
mod retrying;
mod r#trait;

pub use in_memory::InMemoryDocumentStore;
pub use postgres::PostgresDocumentStore;
pub use retrying::RetryingStore;
pub use r#trait::{
    CasCondition, DocumentFilter, DocumentStore, LeaseAcquisition, LeaseRequest, StaleDocument,
    StaleQuery, StatusCounts, StoreError, TenantScope,
};
