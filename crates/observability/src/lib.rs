//! Process-wide tracing setup for the batch binaries.

/// Initialize tracing with the format chosen by `LEDGERBATCH_LOG_FORMAT`.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    crate::tracing::init_with(LogFormat::from_env());
}

/// Subscriber configuration (filters, output format).
pub mod tracing;

pub use crate::tracing::LogFormat;
