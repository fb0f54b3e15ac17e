use anyhow::Result;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::config::MetricsConfig;
use super::logger;

/// Metrics collector that handles all application metrics
pub struct MetricsCollector {
    config: MetricsConfig,
    prometheus_handle: Option<PrometheusHandle>,
}

impl MetricsCollector {
    /// Installs the global Prometheus recorder when metrics are enabled.
    /// Only one enabled collector may exist per process.
    pub fn new(config: &MetricsConfig) -> Result<Self> {
        let prometheus_handle = if config.enabled {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

            Self::register_metrics();
            info!("Prometheus metrics exposed at {}", config.path);

            Some(handle)
        } else {
            None
        };

        Ok(Self {
            config: config.clone(),
            prometheus_handle,
        })
    }

    pub fn disabled() -> Self {
        Self {
            config: MetricsConfig {
                enabled: false,
                ..MetricsConfig::default()
            },
            prometheus_handle: None,
        }
    }

    fn register_metrics() {
        describe_counter!("gateway_requests_total", "Total number of requests handled by the gateway");
        describe_histogram!("gateway_request_duration_seconds", "Duration of gateway requests in seconds");
        describe_histogram!("gateway_upstream_response_time_seconds", "Time until upstream response headers arrived");
        describe_counter!("gateway_upstream_errors_total", "Total number of failed upstream calls");
        describe_counter!(
            logger::DROPPED_ENTRIES_METRIC,
            "Access log entries dropped because the write queue was full"
        );
        describe_counter!(logger::WRITE_ERRORS_METRIC, "Access log write or flush failures");
    }

    pub fn is_enabled(&self) -> bool {
        self.prometheus_handle.is_some()
    }

    pub fn path(&self) -> &str {
        &self.config.path
    }

    /// Prometheus text exposition, if enabled.
    pub fn render(&self) -> Option<String> {
        self.prometheus_handle.as_ref().map(PrometheusHandle::render)
    }

    /// Record a request metric
    pub fn record_request(&self, upstream: Option<&str>, method: &str, status: u16, duration: f64) {
        if !self.is_enabled() {
            return;
        }

        let status_class = match status {
            200..=299 => "2xx",
            300..=399 => "3xx",
            400..=499 => "4xx",
            500..=599 => "5xx",
            _ => "unknown",
        };
        let upstream = upstream.unwrap_or("gateway").to_string();

        counter!(
            "gateway_requests_total",
            "upstream" => upstream.clone(),
            "method" => method.to_string(),
            "status" => status_class
        )
        .increment(1);
        histogram!("gateway_request_duration_seconds", "upstream" => upstream).record(duration);
    }

    pub fn record_upstream_response(&self, upstream: &str, duration: f64) {
        if !self.is_enabled() {
            return;
        }

        histogram!("gateway_upstream_response_time_seconds", "upstream" => upstream.to_string()).record(duration);
    }

    pub fn record_upstream_error(&self, upstream: &str, kind: &'static str) {
        if !self.is_enabled() {
            return;
        }

        counter!("gateway_upstream_errors_total", "upstream" => upstream.to_string(), "kind" => kind).increment(1);
    }
}
