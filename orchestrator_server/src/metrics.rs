//! Prometheus metrics for the image build pipeline.

use metrics::{counter, gauge, histogram};

/// Initialize metrics exporter (Prometheus).
pub fn init_metrics() {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

/// Record a build state transition.
pub fn build_status_changed(status: &str) {
    counter!("orchestrator_builds_total", "status" => status.to_string()).increment(1);
}

/// Record end-to-end build duration.
pub fn build_duration(duration_ms: u64) {
    histogram!("orchestrator_build_duration_ms").record(duration_ms as f64);
}

/// Record a GitHub API call.
pub fn github_request(endpoint: &str) {
    counter!("orchestrator_github_requests_total", "endpoint" => endpoint.to_string()).increment(1);
}

/// Set the number of builds currently executing.
pub fn builds_in_flight(count: usize) {
    gauge!("orchestrator_builds_in_flight").set(count as f64);
}
