//! Prometheus metrics of the hub

use anyhow::Result;
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Hub metrics sharing one registry across clones
#[derive(Clone)]
pub struct MetricsCollector {
    /// Requests by component, verb, resource and route (remote or local)
    pub requests_total: CounterVec,
    /// Non-long-running requests currently admitted
    pub in_flight: IntGauge,
    /// Requests rejected by the in-flight limit
    pub rejected_total: IntCounter,
    /// 1 while a remote server is healthy
    pub server_healthy: IntGaugeVec,
    /// Responses written to the cache
    pub cache_writes_total: CounterVec,
    /// Requests answered from the cache
    pub cache_queries_total: CounterVec,
    /// Request latency in seconds
    pub request_duration_seconds: HistogramVec,
    pub registry: Arc<Registry>,
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let requests_total = CounterVec::new(
            Opts::new("edge_hub_requests_total", "Total proxied requests"),
            &["component", "verb", "resource", "route"],
        )?;
        let in_flight = IntGauge::new("edge_hub_in_flight_requests", "Admitted non-long-running requests")?;
        let rejected_total = IntCounter::new(
            "edge_hub_rejected_requests_total",
            "Requests rejected by the in-flight limit",
        )?;
        let server_healthy = IntGaugeVec::new(
            Opts::new("edge_hub_server_healthy", "Remote server health, 1 when healthy"),
            &["server"],
        )?;
        let cache_writes_total = CounterVec::new(
            Opts::new("edge_hub_cache_writes_total", "Responses written to the cache"),
            &["component", "resource", "result"],
        )?;
        let cache_queries_total = CounterVec::new(
            Opts::new("edge_hub_cache_queries_total", "Requests answered from the cache"),
            &["component", "resource", "result"],
        )?;
        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new("edge_hub_request_duration_seconds", "Request latency in seconds"),
            &["verb", "route"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;
        registry.register(Box::new(rejected_total.clone()))?;
        registry.register(Box::new(server_healthy.clone()))?;
        registry.register(Box::new(cache_writes_total.clone()))?;
        registry.register(Box::new(cache_queries_total.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        Ok(Self {
            requests_total,
            in_flight,
            rejected_total,
            server_healthy,
            cache_writes_total,
            cache_queries_total,
            request_duration_seconds,
            registry,
        })
    }

    pub fn record_request(&self, component: &str, verb: &str, resource: &str, route: &str, seconds: f64) {
        self.requests_total
            .with_label_values(&[component, verb, resource, route])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[verb, route])
            .observe(seconds);
    }

    pub fn record_server_health(&self, server: &str, healthy: bool) {
        self.server_healthy
            .with_label_values(&[server])
            .set(i64::from(healthy));
    }

    pub fn record_cache_write(&self, component: &str, resource: &str, ok: bool) {
        self.cache_writes_total
            .with_label_values(&[component, resource, outcome(ok)])
            .inc();
    }

    pub fn record_cache_query(&self, component: &str, resource: &str, ok: bool) {
        self.cache_queries_total
            .with_label_values(&[component, resource, outcome(ok)])
            .inc();
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

fn outcome(ok: bool) -> &'static str {
    if ok {
        "success"
    } else {
        "failure"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = MetricsCollector::new().unwrap();
        metrics.record_request("kubelet", "get", "pods", "remote", 0.01);
        metrics.record_server_health("10.0.0.1:6443", true);
        metrics.record_cache_write("kubelet", "pods", false);

        let output = metrics.gather().unwrap();
        assert!(output.contains("edge_hub_requests_total"));
        assert!(output.contains("route=\"remote\""));
        assert!(output.contains("edge_hub_server_healthy{server=\"10.0.0.1:6443\"} 1"));
        assert!(output.contains("result=\"failure\""));
    }

    #[test]
    fn test_clones_share_registry() {
        let metrics = MetricsCollector::new().unwrap();
        let clone = metrics.clone();
        clone.in_flight.inc();
        assert_eq!(metrics.in_flight.get(), 1);
    }
}
