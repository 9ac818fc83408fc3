//! Prometheus metrics for the controller

use prometheus::{
    Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use tracing::error;

const RESOURCE_TYPE_LABEL: &str = "resource_type";
const NAMESPACE_LABEL: &str = "namespace";
const ERROR_CATEGORY_LABEL: &str = "error_category";
const REASON_LABEL: &str = "reason";

/// Metrics collector for the controller
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    /// Total number of reconciliations performed
    pub reconciliations_total: IntCounterVec,

    /// Total number of reconciliation errors
    pub reconciliation_errors_total: IntCounterVec,

    /// Duration of reconciliation operations
    pub reconciliation_duration_seconds: HistogramVec,

    /// Number of virtual hosts with live configuration
    pub managed_virtual_servers: IntGauge,

    /// Total proxy reloads performed
    pub reloads_total: IntCounter,

    /// Total proxy reload failures
    pub reload_errors_total: IntCounter,

    /// Duration of the most recent reload cycle
    pub last_reload_duration_seconds: Gauge,

    /// Total events emitted, by reason
    pub events_total: IntCounterVec,

    /// Version of the currently applied ConfigMap defaults
    pub config_params_version: IntGauge,

    /// Controller health status (1 = healthy)
    pub health_status: IntGauge,

    /// Controller startup timestamp
    pub startup_timestamp: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self::new_with_registry(Registry::new())
    }

    pub fn new_with_registry(registry: Registry) -> Self {
        let reconciliations_total = IntCounterVec::new(
            Opts::new(
                "routegate_reconciliations_total",
                "Total number of reconciliations performed",
            ),
            &[RESOURCE_TYPE_LABEL, NAMESPACE_LABEL],
        )
        .expect("metric creation should succeed");

        let reconciliation_errors_total = IntCounterVec::new(
            Opts::new(
                "routegate_reconciliation_errors_total",
                "Total number of reconciliation errors",
            ),
            &[RESOURCE_TYPE_LABEL, NAMESPACE_LABEL, ERROR_CATEGORY_LABEL],
        )
        .expect("metric creation should succeed");

        let reconciliation_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "routegate_reconciliation_duration_seconds",
                "Duration of reconciliation operations",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &[RESOURCE_TYPE_LABEL],
        )
        .expect("metric creation should succeed");

        let managed_virtual_servers = IntGauge::new(
            "routegate_managed_virtual_servers",
            "Number of virtual hosts with live configuration",
        )
        .expect("metric creation should succeed");

        let reloads_total = IntCounter::new(
            "routegate_proxy_reloads_total",
            "Total proxy reloads performed",
        )
        .expect("metric creation should succeed");

        let reload_errors_total = IntCounter::new(
            "routegate_proxy_reload_errors_total",
            "Total proxy reload failures",
        )
        .expect("metric creation should succeed");

        let last_reload_duration_seconds = Gauge::new(
            "routegate_proxy_last_reload_duration_seconds",
            "Duration of the most recent reload cycle",
        )
        .expect("metric creation should succeed");

        let events_total = IntCounterVec::new(
            Opts::new("routegate_events_total", "Total events emitted, by reason"),
            &[REASON_LABEL],
        )
        .expect("metric creation should succeed");

        let config_params_version = IntGauge::new(
            "routegate_config_params_version",
            "Version of the currently applied ConfigMap defaults",
        )
        .expect("metric creation should succeed");

        let health_status = IntGauge::new(
            "routegate_health_status",
            "Controller health status (1 = healthy)",
        )
        .expect("metric creation should succeed");

        let startup_timestamp = Gauge::new(
            "routegate_startup_timestamp_seconds",
            "Controller startup timestamp in seconds since epoch",
        )
        .expect("metric creation should succeed");

        let metrics = Self {
            registry,
            reconciliations_total,
            reconciliation_errors_total,
            reconciliation_duration_seconds,
            managed_virtual_servers,
            reloads_total,
            reload_errors_total,
            last_reload_duration_seconds,
            events_total,
            config_params_version,
            health_status,
            startup_timestamp,
        };

        if let Err(e) = metrics.register_all() {
            error!("Failed to register metrics: {}", e);
        }

        metrics
    }

    fn register_all(&self) -> Result<(), prometheus::Error> {
        self.registry
            .register(Box::new(self.reconciliations_total.clone()))?;
        self.registry
            .register(Box::new(self.reconciliation_errors_total.clone()))?;
        self.registry
            .register(Box::new(self.reconciliation_duration_seconds.clone()))?;
        self.registry
            .register(Box::new(self.managed_virtual_servers.clone()))?;
        self.registry.register(Box::new(self.reloads_total.clone()))?;
        self.registry
            .register(Box::new(self.reload_errors_total.clone()))?;
        self.registry
            .register(Box::new(self.last_reload_duration_seconds.clone()))?;
        self.registry.register(Box::new(self.events_total.clone()))?;
        self.registry
            .register(Box::new(self.config_params_version.clone()))?;
        self.registry.register(Box::new(self.health_status.clone()))?;
        self.registry
            .register(Box::new(self.startup_timestamp.clone()))?;
        Ok(())
    }

    pub fn record_reconciliation(&self, resource_type: &str, namespace: &str, duration_secs: f64) {
        self.reconciliations_total
            .with_label_values(&[resource_type, namespace])
            .inc();
        self.reconciliation_duration_seconds
            .with_label_values(&[resource_type])
            .observe(duration_secs);
    }

    pub fn record_reconciliation_error(
        &self,
        resource_type: &str,
        namespace: &str,
        error_category: &str,
    ) {
        self.reconciliation_errors_total
            .with_label_values(&[resource_type, namespace, error_category])
            .inc();
    }

    pub fn record_reload(&self, duration_secs: f64) {
        self.reloads_total.inc();
        self.last_reload_duration_seconds.set(duration_secs);
    }

    pub fn record_reload_error(&self) {
        self.reload_errors_total.inc();
    }

    pub fn record_event(&self, reason: &str) {
        self.events_total.with_label_values(&[reason]).inc();
    }

    pub fn set_managed_hosts(&self, count: i64) {
        self.managed_virtual_servers.set(count);
    }

    pub fn set_config_params_version(&self, version: u64) {
        self.config_params_version.set(version as i64);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.health_status.set(if healthy { 1 } else { 0 });
    }

    pub fn record_startup(&self) {
        self.startup_timestamp
            .set(chrono::Utc::now().timestamp() as f64);
        self.health_status.set(1);
    }

    /// Encode metrics for Prometheus scraping
    pub fn encode(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for tracking reconciliation duration
pub struct ReconciliationTimer<'a> {
    metrics: &'a Metrics,
    resource_type: String,
    namespace: String,
    start: std::time::Instant,
}

impl<'a> ReconciliationTimer<'a> {
    pub fn new(metrics: &'a Metrics, resource_type: &str, namespace: &str) -> Self {
        Self {
            metrics,
            resource_type: resource_type.to_string(),
            namespace: namespace.to_string(),
            start: std::time::Instant::now(),
        }
    }

    /// Complete the reconciliation successfully
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.metrics
            .record_reconciliation(&self.resource_type, &self.namespace, duration);
        std::mem::forget(self);
    }

    /// Complete the reconciliation with an error
    pub fn error(self, error_category: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        self.metrics
            .record_reconciliation(&self.resource_type, &self.namespace, duration);
        self.metrics.record_reconciliation_error(
            &self.resource_type,
            &self.namespace,
            error_category,
        );
        std::mem::forget(self);
    }
}

impl Drop for ReconciliationTimer<'_> {
    fn drop(&mut self) {
        // dropped without success/error: record as an unknown error
        let duration = self.start.elapsed().as_secs_f64();
        self.metrics
            .record_reconciliation(&self.resource_type, &self.namespace, duration);
        self.metrics
            .record_reconciliation_error(&self.resource_type, &self.namespace, "unknown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        assert!(metrics.encode().contains("routegate"));
    }

    #[test]
    fn test_reconciliation_metrics() {
        let metrics = Metrics::new();
        ReconciliationTimer::new(&metrics, "VirtualServer", "default").success();

        let output = metrics.encode();
        assert!(output.contains("routegate_reconciliations_total"));
    }

    #[test]
    fn test_reload_metrics() {
        let metrics = Metrics::new();
        metrics.record_reload(0.25);
        metrics.record_reload_error();

        let output = metrics.encode();
        assert!(output.contains("routegate_proxy_reloads_total 1"));
        assert!(output.contains("routegate_proxy_reload_errors_total 1"));
    }

    #[test]
    fn test_event_metrics() {
        let metrics = Metrics::new();
        metrics.record_event("AddedOrUpdated");
        metrics.record_event("AddedOrUpdated");

        let output = metrics.encode();
        assert!(output.contains("routegate_events_total"));
    }
}
