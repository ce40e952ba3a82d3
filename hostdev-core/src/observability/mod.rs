//! Observability infrastructure: tracing and metrics.
//!
//! Every plugin process calls [`init`] once before starting the manager.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod metrics;

/// Port for the Prometheus exporter, if one was requested.
/// Set HOSTDEV_METRICS_PORT=9090 to enable.
fn metrics_port() -> Option<u16> {
    std::env::var("HOSTDEV_METRICS_PORT").ok().and_then(|p| p.parse().ok())
}

/// Initialize the global observability infrastructure.
///
/// This must be called once at process startup before any other operations.
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true))
        .try_init()?;

    if let Some(port) = metrics_port() {
        PrometheusBuilder::new().with_http_listener(([0, 0, 0, 0], port)).install()?;
        tracing::info!(port, "Prometheus metrics exporter listening");
    } else {
        tracing::info!("Observability initialized (set HOSTDEV_METRICS_PORT to export metrics)");
    }

    metrics::register_core_metrics();

    Ok(())
}
