//! Logging and monitoring collaborators
//!
//! The engine itself emits `tracing` events. Pipelines additionally report
//! run-level events through a [`Logger`] so embedding applications can route
//! them elsewhere, and through an optional [`PerformanceMonitor`].

use async_trait::async_trait;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

/// Async logger consumed by pipelines
#[async_trait]
pub trait Logger: Send + Sync {
    async fn debug(&self, message: &str, data: Option<&Value>);
    async fn info(&self, message: &str, data: Option<&Value>);
    async fn warn(&self, message: &str, data: Option<&Value>);
    async fn error(&self, message: &str, data: Option<&Value>);
}

/// Forwards to the `tracing` macros
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

#[async_trait]
impl Logger for TracingLogger {
    async fn debug(&self, message: &str, data: Option<&Value>) {
        match data {
            Some(data) => tracing::debug!(%data, "{message}"),
            None => tracing::debug!("{message}"),
        }
    }

    async fn info(&self, message: &str, data: Option<&Value>) {
        match data {
            Some(data) => tracing::info!(%data, "{message}"),
            None => tracing::info!("{message}"),
        }
    }

    async fn warn(&self, message: &str, data: Option<&Value>) {
        match data {
            Some(data) => tracing::warn!(%data, "{message}"),
            None => tracing::warn!("{message}"),
        }
    }

    async fn error(&self, message: &str, data: Option<&Value>) {
        match data {
            Some(data) => tracing::error!(%data, "{message}"),
            None => tracing::error!("{message}"),
        }
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLogger;

#[async_trait]
impl Logger for NullLogger {
    async fn debug(&self, _message: &str, _data: Option<&Value>) {}
    async fn info(&self, _message: &str, _data: Option<&Value>) {}
    async fn warn(&self, _message: &str, _data: Option<&Value>) {}
    async fn error(&self, _message: &str, _data: Option<&Value>) {}
}

/// Host resource usage as seen by a [`PerformanceMonitor`]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SystemMetrics {
    /// CPU usage as a fraction of one core
    pub cpu_usage: f64,
    /// Resident memory in bytes
    pub memory_usage: u64,
}

/// Optional sink for operation timing
pub trait PerformanceMonitor: Send + Sync {
    fn record_operation_start(&self, name: &str);
    fn record_operation_end(&self, name: &str);
    fn get_metrics(&self) -> SystemMetrics;
}

/// Install a formatted `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `default_filter`. Calling this more than
/// once is harmless; later calls leave the first subscriber in place.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
