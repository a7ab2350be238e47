use std::sync::OnceLock;

use anyhow::Result;
use axum::{routing::get, Router};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::MetricsConfig;

static RECORDER: OnceLock<PrometheusHandle> = OnceLock::new();

/// Prometheus exporter for the proxy.
///
/// The recorder is process-wide, so it is installed once no matter how often
/// the pipeline is rebuilt. Without a recorder the `record_*` helpers are no-ops.
#[derive(Clone)]
pub struct MetricsCollector {
    config: MetricsConfig,
    prometheus_handle: Option<PrometheusHandle>,
}

impl MetricsCollector {
    pub fn new(config: &MetricsConfig) -> Result<Self> {
        let prometheus_handle = if config.enabled {
            Some(Self::install()?)
        } else {
            None
        };

        Ok(Self {
            config: config.clone(),
            prometheus_handle,
        })
    }

    fn install() -> Result<PrometheusHandle> {
        if let Some(handle) = RECORDER.get() {
            return Ok(handle.clone());
        }

        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;
        Self::register_metrics();

        Ok(RECORDER.get_or_init(|| handle).clone())
    }

    fn register_metrics() {
        describe_counter!("lb_requests_total", "Proxied requests by outcome");
        describe_counter!("lb_rate_limited_total", "Requests rejected by admission control");
        describe_counter!("lb_backend_selected_total", "Backend selections by backend id");
        describe_counter!("lb_reloads_total", "Configuration reloads by result");
        describe_histogram!("lb_upstream_response_seconds", "Upstream response time in seconds");
    }

    pub fn render(&self) -> Option<String> {
        self.prometheus_handle.as_ref().map(|handle| handle.render())
    }

    /// Serve the exposition endpoint until the process exits
    pub async fn start_server(&self) -> Result<()> {
        let handle = match &self.prometheus_handle {
            Some(handle) => handle.clone(),
            None => return Ok(()),
        };

        let app = Router::new()
            .route(&self.config.path, get(move || async move { handle.render() }))
            .route("/health", get(|| async { "OK" }));

        let addr = format!("0.0.0.0:{}", self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind metrics server on {}: {}", addr, e))?;

        info!("Metrics server listening on {}{}", addr, self.config.path);

        axum::serve(listener, app)
            .await
            .map_err(|e| anyhow::anyhow!("Metrics server error: {}", e))?;

        warn!("Metrics server stopped");
        Ok(())
    }
}

pub fn record_request(outcome: &'static str) {
    counter!("lb_requests_total", "outcome" => outcome).increment(1);
}

pub fn record_rate_limited() {
    counter!("lb_rate_limited_total").increment(1);
}

pub fn record_backend_selected(backend_id: &str) {
    counter!("lb_backend_selected_total", "backend" => backend_id.to_string()).increment(1);
}

pub fn record_upstream_response(backend_id: &str, seconds: f64) {
    histogram!("lb_upstream_response_seconds", "backend" => backend_id.to_string()).record(seconds);
}

pub fn record_reload(result: &'static str) {
    counter!("lb_reloads_total", "result" => result).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_collector_has_no_handle() {
        let collector = MetricsCollector::new(&MetricsConfig::default()).unwrap();
        assert!(collector.render().is_none());

        // recording without a recorder is harmless
        record_request("success");
        record_reload("applied");
    }

    #[test]
    fn test_enabled_collector_renders_counters() {
        let config = MetricsConfig {
            enabled: true,
            ..MetricsConfig::default()
        };
        let first = MetricsCollector::new(&config).unwrap();
        let second = MetricsCollector::new(&config).unwrap();

        record_rate_limited();
        record_backend_selected("b1");

        let rendered = second.render().unwrap();
        assert!(rendered.contains("lb_rate_limited_total"));
        assert!(rendered.contains("backend=\"b1\""));
        assert!(first.render().is_some());
    }
}
