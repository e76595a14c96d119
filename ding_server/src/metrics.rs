//! Prometheus metrics for build server observability.

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};

/// Install the Prometheus exporter, serving `/metrics` on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr);
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

/// Record a webhook received event.
pub fn webhook_received(provider: &str) {
    counter!("ding_webhooks_received_total", "provider" => provider.to_string()).increment(1);
}

/// Record a build state transition.
pub fn build_status_changed(status: &str) {
    counter!("ding_builds_total", "status" => status.to_string()).increment(1);
}

/// Record build duration.
pub fn build_duration(duration_ms: u64) {
    histogram!("ding_build_duration_ms").record(duration_ms as f64);
}

/// Record step duration.
pub fn step_duration(step_name: &str, duration_ms: u64) {
    histogram!("ding_step_duration_ms", "step" => step_name.to_string()).record(duration_ms as f64);
}

/// Set the number of builds in the clone or build step.
pub fn active_builds(count: usize) {
    gauge!("ding_active_builds").set(count as f64);
}

/// Set the number of connected event stream subscribers.
pub fn event_subscribers(count: usize) {
    gauge!("ding_event_subscribers").set(count as f64);
}

/// Record an event dropped for a slow subscriber.
pub fn event_dropped() {
    counter!("ding_events_dropped_total").increment(1);
}

/// Record an error occurrence.
pub fn error_recorded(category: &str) {
    counter!("ding_errors_total", "category" => category.to_string()).increment(1);
}
