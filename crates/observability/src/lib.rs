//! Tracing, logging and component health (shared setup).

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Component health registry.
pub mod health;

pub use health::{ComponentHealth, HealthRegistry, HealthReport, HealthStatus};
