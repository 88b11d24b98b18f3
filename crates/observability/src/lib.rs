//! Tracing and logging setup shared by the binaries.

/// Initialize process-wide tracing with the default filter.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    tracing::init();
}

/// Subscriber construction and filtering.
pub mod tracing;
