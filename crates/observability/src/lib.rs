//! Process-wide tracing setup shared by the engine binaries.

/// Initialize tracing/logging from `RUST_LOG` and `OUTREACH_LOG_FORMAT`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

/// Subscriber construction (filter, output format).
pub mod tracing;
