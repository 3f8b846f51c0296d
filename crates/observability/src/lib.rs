//! Process-wide tracing/logging setup shared by docflow binaries and tests.

pub use crate::tracing::{LogFormat, ParseLogFormatError};

/// Initialize process-wide logging using `DOCFLOW_LOG_FORMAT` and `RUST_LOG`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Initialize logging with an explicit output format.
pub fn init_with(format: LogFormat) {
    tracing::init_with(format);
}

/// Tracing configuration (filters, formats).
pub mod tracing;
