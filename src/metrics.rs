//! Request metrics.
//!
//! Emitted through the `metrics` facade; the Prometheus exporter is only
//! installed when configured.

use std::{net::SocketAddr, time::Duration};

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use thiserror::Error;
use tracing::info;

use crate::config::MetricsConfig;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Invalid metrics listen address '{0}'")]
    InvalidAddress(String),

    #[error("Failed to install Prometheus exporter: {0}")]
    Build(#[from] BuildError),
}

pub struct Metrics;

impl Metrics {
    pub fn record_request(route: &'static str, outcome: &'static str, duration: Duration) {
        counter!("aviso_auth_requests_total", "route" => route, "outcome" => outcome).increment(1);
        histogram!("aviso_auth_request_duration_seconds", "route" => route)
            .record(duration.as_secs_f64());
    }
}

/// Install the Prometheus exporter. Must run inside a tokio runtime.
pub fn init_exporter(config: &MetricsConfig) -> Result<(), MetricsError> {
    let raw = format!("{}:{}", config.host, config.port);
    let addr: SocketAddr = raw
        .parse()
        .map_err(|_| MetricsError::InvalidAddress(raw.clone()))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    info!("Prometheus metrics exporter listening on {}", addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_address() {
        let config = MetricsConfig {
            host: "not an address".to_string(),
            port: 9000,
        };
        assert!(matches!(
            init_exporter(&config),
            Err(MetricsError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_record_without_recorder_is_noop() {
        Metrics::record_request("range", "allow", Duration::from_millis(3));
    }
}
