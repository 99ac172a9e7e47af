//! Observability: structured logging and the agent's own metrics.

use crate::error::{Result, VirtmonError};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod metrics;

/// Initialize logging and, when `metrics_port` is set, the Prometheus exporter.
///
/// `log_level` is the default filter directive; `RUST_LOG` takes precedence.
/// Must be called once at startup.
pub fn init(log_level: &str, metrics_port: Option<u16>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| VirtmonError::InvalidConfig {
            reason: format!("invalid log level {:?}: {}", log_level, e),
        })?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true))
        .try_init()
        .map_err(|e| VirtmonError::Internal(format!("failed to install subscriber: {}", e)))?;

    if let Some(port) = metrics_port {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], port))
            .install()
            .map_err(VirtmonError::internal)?;
        tracing::info!(port, "Prometheus exporter listening");
    } else {
        tracing::debug!("Prometheus exporter disabled");
    }

    metrics::register_core_metrics();

    Ok(())
}
