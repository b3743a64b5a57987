//! Named observations emitted by the sidecar.
//!
//! The core only talks to [`MetricsSink`]. The binary plugs in
//! [`PrometheusMetrics`], which keeps its own registry and renders the
//! text exposition format for `/metrics`.

use crate::status::StatusSnapshot;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Receiver of every observation the sidecar records.
pub trait MetricsSink: Send + Sync {
    /// One HTTP request finished.
    fn http_request(&self, path: &str, method: &str, status: u16, elapsed: Duration);

    /// A fresh status snapshot was read.
    fn tor_status(&self, snapshot: &StatusSnapshot);

    /// Readiness was evaluated.
    fn tor_ready(&self, ready: bool);

    /// One egress probe attempt finished.
    fn external_check(&self, endpoint: &str, success: bool, is_tor: bool);

    /// One webhook delivery finished, or was dropped (`elapsed` is `None`).
    fn webhook_request(&self, event: &str, status: &str, elapsed: Option<Duration>);
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn http_request(&self, _: &str, _: &str, _: u16, _: Duration) {}
    fn tor_status(&self, _: &StatusSnapshot) {}
    fn tor_ready(&self, _: bool) {}
    fn external_check(&self, _: &str, _: bool, _: bool) {}
    fn webhook_request(&self, _: &str, _: &str, _: Option<Duration>) {}
}

/// Prometheus-backed sink.
pub struct PrometheusMetrics {
    registry: Registry,
    http_requests: IntCounterVec,
    http_duration: HistogramVec,
    bootstrap_percent: IntGauge,
    circuit_established: IntGauge,
    ready: IntGauge,
    bytes_read: IntGauge,
    bytes_written: IntGauge,
    external_checks: IntCounterVec,
    webhook_requests: IntCounterVec,
    webhook_duration: HistogramVec,
}

impl PrometheusMetrics {
    /// Create and register every metric on a private registry.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("torwatch".to_string()), None)?;

        let http_requests = IntCounterVec::new(
            Opts::new("http_requests_total", "Total number of HTTP requests"),
            &["path", "method", "status"],
        )?;
        let http_duration = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request duration in seconds",
            ),
            &["path", "method", "status"],
        )?;
        let bootstrap_percent = IntGauge::new(
            "tor_bootstrap_percent",
            "Tor bootstrap progress percentage (0-100)",
        )?;
        let circuit_established = IntGauge::new(
            "tor_circuit_established",
            "Whether Tor has established a circuit (1 = yes, 0 = no)",
        )?;
        let ready = IntGauge::new("tor_ready", "Whether Tor is ready (1 = yes, 0 = no)")?;
        let bytes_read = IntGauge::new("tor_bytes_read", "Total bytes read by Tor")?;
        let bytes_written = IntGauge::new("tor_bytes_written", "Total bytes written by Tor")?;
        let external_checks = IntCounterVec::new(
            Opts::new("external_check_total", "Total number of external egress checks"),
            &["endpoint", "success", "is_tor"],
        )?;
        let webhook_requests = IntCounterVec::new(
            Opts::new("webhook_requests_total", "Total number of webhook deliveries"),
            &["event", "status"],
        )?;
        let webhook_duration = HistogramVec::new(
            HistogramOpts::new(
                "webhook_duration_seconds",
                "Webhook delivery duration in seconds",
            ),
            &["event"],
        )?;

        registry.register(Box::new(http_requests.clone()))?;
        registry.register(Box::new(http_duration.clone()))?;
        registry.register(Box::new(bootstrap_percent.clone()))?;
        registry.register(Box::new(circuit_established.clone()))?;
        registry.register(Box::new(ready.clone()))?;
        registry.register(Box::new(bytes_read.clone()))?;
        registry.register(Box::new(bytes_written.clone()))?;
        registry.register(Box::new(external_checks.clone()))?;
        registry.register(Box::new(webhook_requests.clone()))?;
        registry.register(Box::new(webhook_duration.clone()))?;

        Ok(Self {
            registry,
            http_requests,
            http_duration,
            bootstrap_percent,
            circuit_established,
            ready,
            bytes_read,
            bytes_written,
            external_checks,
            webhook_requests,
            webhook_duration,
        })
    }

    /// Render every registered metric in the text exposition format.
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

fn flag(value: bool) -> i64 {
    i64::from(value)
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl MetricsSink for PrometheusMetrics {
    fn http_request(&self, path: &str, method: &str, status: u16, elapsed: Duration) {
        let status = status.to_string();
        let labels = [path, method, status.as_str()];
        self.http_requests.with_label_values(&labels).inc();
        self.http_duration
            .with_label_values(&labels)
            .observe(elapsed.as_secs_f64());
    }

    fn tor_status(&self, snapshot: &StatusSnapshot) {
        self.bootstrap_percent
            .set(i64::from(snapshot.bootstrap_phase));
        self.circuit_established
            .set(flag(snapshot.circuit_established));
        self.bytes_read.set(saturating_i64(snapshot.traffic.bytes_read));
        self.bytes_written
            .set(saturating_i64(snapshot.traffic.bytes_written));
    }

    fn tor_ready(&self, ready: bool) {
        self.ready.set(flag(ready));
    }

    fn external_check(&self, endpoint: &str, success: bool, is_tor: bool) {
        let success = success.to_string();
        let is_tor = is_tor.to_string();
        self.external_checks
            .with_label_values(&[endpoint, success.as_str(), is_tor.as_str()])
            .inc();
    }

    fn webhook_request(&self, event: &str, status: &str, elapsed: Option<Duration>) {
        self.webhook_requests
            .with_label_values(&[event, status])
            .inc();
        if let Some(elapsed) = elapsed {
            self.webhook_duration
                .with_label_values(&[event])
                .observe(elapsed.as_secs_f64());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::TrafficStats;

    #[test]
    fn test_render_contains_prefixed_names() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.http_request("/ping", "GET", 200, Duration::from_millis(3));
        metrics.tor_ready(true);
        metrics.external_check("https://check.torproject.org/api/ip", true, true);
        metrics.webhook_request("health_changed", "dropped", None);

        let text = metrics.render().unwrap();
        assert!(text.contains("torwatch_http_requests_total{method=\"GET\",path=\"/ping\",status=\"200\"} 1"));
        assert!(text.contains("torwatch_http_request_duration_seconds_bucket"));
        assert!(text.contains("torwatch_tor_ready 1"));
        assert!(text.contains("torwatch_external_check_total{endpoint=\"https://check.torproject.org/api/ip\",is_tor=\"true\",success=\"true\"} 1"));
        assert!(text.contains("torwatch_webhook_requests_total{event=\"health_changed\",status=\"dropped\"} 1"));
    }

    #[test]
    fn test_status_gauges() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.tor_status(&StatusSnapshot {
            version: "0.4.8.12".to_string(),
            bootstrap_phase: 45,
            circuit_established: false,
            num_circuits: 0,
            traffic: TrafficStats {
                bytes_read: 1024,
                bytes_written: u64::MAX,
            },
        });

        let text = metrics.render().unwrap();
        assert!(text.contains("torwatch_tor_bootstrap_percent 45"));
        assert!(text.contains("torwatch_tor_circuit_established 0"));
        assert!(text.contains("torwatch_tor_bytes_read 1024"));
        assert!(text.contains(&format!("torwatch_tor_bytes_written {}", i64::MAX)));
    }
}
