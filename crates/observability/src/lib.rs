//! Process-wide logging setup shared by the custos binaries.

/// Subscriber configuration (filters, output format).
pub mod tracing;

pub use self::tracing::{LogFormat, UnknownLogFormat};

/// Initialize tracing with the format named by `LOG_FORMAT` (JSON when unset).
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    self::tracing::init(LogFormat::from_env());
}
