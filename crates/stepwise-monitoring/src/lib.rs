//! Monitoring for the Stepwise flow engine.
//!
//! Structured logging through `tracing` and engine counters derived from
//! the events the engine publishes on its bus.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;
use stepwise_core::EventBus;
use tracing::info;

pub mod logging;
pub mod metrics;

/// Configuration for initializing the monitoring system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoringConfig {
    /// Service name attached to the startup log line
    pub service_name: String,
    /// Log level filter (e.g., "info,stepwise_core=debug"); `RUST_LOG` wins
    pub log_filter: String,
    /// Emit JSON instead of pretty logs
    pub enable_json_logging: bool,
    /// Daily-rolling JSON log file, if any
    pub log_file: Option<String>,
    /// Subscribe [`EngineMetrics`] to the engine's bus in [`init`]
    pub enable_metrics: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: "stepwise".to_string(),
            log_filter: "info".to_string(),
            enable_json_logging: false,
            log_file: None,
            enable_metrics: true,
        }
    }
}

/// Initialize logging and, when enabled, attach engine metrics to `bus`
pub fn init(
    config: &MonitoringConfig,
    bus: &dyn EventBus,
) -> anyhow::Result<Option<Arc<EngineMetrics>>> {
    logging::init_logging(config)?;
    let metrics = attach_metrics(config, bus)?;
    info!(
        service_name = %config.service_name,
        metrics = metrics.is_some(),
        "Monitoring initialized"
    );
    Ok(metrics)
}

/// Subscribe a fresh [`EngineMetrics`] to `bus` if metrics are enabled
pub fn attach_metrics(
    config: &MonitoringConfig,
    bus: &dyn EventBus,
) -> anyhow::Result<Option<Arc<EngineMetrics>>> {
    if !config.enable_metrics {
        return Ok(None);
    }
    let metrics = EngineMetrics::new();
    metrics.attach(bus)?;
    Ok(Some(metrics))
}

pub use crate::logging::init_logging;
pub use crate::metrics::{EngineMetrics, MetricsSnapshot};
