//! Tracing/logging setup shared by every service embedding the coordination core.

/// Initialize process-wide logging from the environment.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&tracing::LogConfig::from_env());
}

pub mod tracing;

pub use crate::tracing::{LogConfig, LogFormat};
