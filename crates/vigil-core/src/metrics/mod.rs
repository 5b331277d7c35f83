//! Prometheus metric emission.
//!
//! All recording goes through the `metrics` facade macros, which are
//! lock-free on the hot path and become no-ops when no recorder is installed
//! (which is how tests run). The server binary installs the Prometheus
//! recorder at startup and serves the rendered snapshot at `/metrics`.

use std::time::Duration;

use metrics::{counter, gauge, histogram};

use crate::types::{Protocol, Source};

/// Latest height observed for a node on one protocol plane.
pub fn node_height(network: &str, node: &str, protocol: Protocol, source: Source, height: i64) {
    #[allow(clippy::cast_precision_loss)]
    gauge!(
        "vigil_node_height",
        "network" => network.to_string(),
        "node" => node.to_string(),
        "protocol" => protocol.as_str(),
        "source" => source.as_str(),
    )
    .set(height as f64);
}

/// Measured latency of a successful health check.
pub fn node_latency(network: &str, node: &str, protocol: Protocol, latency: Duration) {
    histogram!(
        "vigil_node_latency_seconds",
        "network" => network.to_string(),
        "node" => node.to_string(),
        "protocol" => protocol.as_str(),
    )
    .record(latency.as_secs_f64());
}

/// Availability gauge: 1 when the last probe succeeded, 0 otherwise.
pub fn node_available(network: &str, node: &str, protocol: Protocol, available: bool) {
    gauge!(
        "vigil_node_available",
        "network" => network.to_string(),
        "node" => node.to_string(),
        "protocol" => protocol.as_str(),
    )
    .set(if available { 1.0 } else { 0.0 });
}

/// WebSocket reachability of a node's RPC endpoint.
pub fn node_websocket_available(network: &str, node: &str, protocol: Protocol, available: bool) {
    gauge!(
        "vigil_node_websocket_available",
        "network" => network.to_string(),
        "node" => node.to_string(),
        "protocol" => protocol.as_str(),
    )
    .set(if available { 1.0 } else { 0.0 });
}

/// Typed health-check failure counter.
pub fn height_check_error(network: &str, node: &str, protocol: Protocol, kind: &'static str) {
    counter!(
        "vigil_height_check_errors_total",
        "network" => network.to_string(),
        "node" => node.to_string(),
        "protocol" => protocol.as_str(),
        "kind" => kind,
    )
    .increment(1);
}

/// WebSocket probe failure counter.
pub fn websocket_check_error(network: &str, node: &str, protocol: Protocol, kind: &'static str) {
    counter!(
        "vigil_websocket_check_errors_total",
        "network" => network.to_string(),
        "node" => node.to_string(),
        "protocol" => protocol.as_str(),
        "kind" => kind,
    )
    .increment(1);
}

/// Availability of a peer ring's status surface.
pub fn external_ring_available(external: &str, ring: &str, available: bool) {
    gauge!(
        "vigil_external_ring_available",
        "external" => external.to_string(),
        "ring" => ring.to_string(),
    )
    .set(if available { 1.0 } else { 0.0 });
}

pub fn external_ring_latency(external: &str, ring: &str, latency: Duration) {
    histogram!(
        "vigil_external_ring_latency_seconds",
        "external" => external.to_string(),
        "ring" => ring.to_string(),
    )
    .record(latency.as_secs_f64());
}

pub fn external_ring_error(external: &str, ring: &str, kind: &'static str) {
    counter!(
        "vigil_external_ring_errors_total",
        "external" => external.to_string(),
        "ring" => ring.to_string(),
        "kind" => kind,
    )
    .increment(1);
}

/// Outcome counter for endpoint validation probes.
pub fn external_endpoint_validation(
    network: &str,
    protocol: Protocol,
    external: &str,
    success: bool,
) {
    counter!(
        "vigil_external_endpoint_validation_total",
        "network" => network.to_string(),
        "protocol" => protocol.as_str(),
        "external" => external.to_string(),
        "outcome" => if success { "success" } else { "failure" },
    )
    .increment(1);
}

pub fn external_endpoint_validation_latency(
    network: &str,
    protocol: Protocol,
    external: &str,
    latency: Duration,
) {
    histogram!(
        "vigil_external_endpoint_validation_latency_seconds",
        "network" => network.to_string(),
        "protocol" => protocol.as_str(),
        "external" => external.to_string(),
    )
    .record(latency.as_secs_f64());
}

pub fn external_endpoint_proxy_error(network: &str, protocol: Protocol, url: &str) {
    counter!(
        "vigil_external_endpoint_proxy_errors_total",
        "network" => network.to_string(),
        "protocol" => protocol.as_str(),
        "url" => url.to_string(),
    )
    .increment(1);
}

pub fn external_endpoint_error_count(network: &str, protocol: Protocol, url: &str, count: u32) {
    gauge!(
        "vigil_external_endpoint_error_count",
        "network" => network.to_string(),
        "protocol" => protocol.as_str(),
        "url" => url.to_string(),
    )
    .set(f64::from(count));
}

pub fn external_endpoint_recovery(network: &str, protocol: Protocol, external: &str) {
    counter!(
        "vigil_external_endpoint_recoveries_total",
        "network" => network.to_string(),
        "protocol" => protocol.as_str(),
        "external" => external.to_string(),
    )
    .increment(1);
}

/// Tracked / validated / working gauges per (network, protocol, external).
pub fn external_endpoints_aggregate(
    network: &str,
    protocol: Protocol,
    external: &str,
    tracked: u64,
    validated: u64,
    working: u64,
) {
    #[allow(clippy::cast_precision_loss)]
    {
        gauge!(
            "vigil_external_endpoints_tracked",
            "network" => network.to_string(),
            "protocol" => protocol.as_str(),
            "external" => external.to_string(),
        )
        .set(tracked as f64);
        gauge!(
            "vigil_external_endpoints_validated",
            "network" => network.to_string(),
            "protocol" => protocol.as_str(),
            "external" => external.to_string(),
        )
        .set(validated as f64);
        gauge!(
            "vigil_external_endpoints_working",
            "network" => network.to_string(),
            "protocol" => protocol.as_str(),
            "external" => external.to_string(),
        )
        .set(working as f64);
    }
}

/// Records one routing decision with its reason label.
pub fn routing_selection(network: &str, protocol: Protocol, node: &str, reason: &'static str) {
    counter!(
        "vigil_routing_selections_total",
        "network" => network.to_string(),
        "protocol" => protocol.as_str(),
        "node" => node.to_string(),
        "reason" => reason,
    )
    .increment(1);
}

/// Records a routing failure (`no_nodes` or `zero_height`).
pub fn routing_failure(network: &str, protocol: Protocol, reason: &'static str) {
    counter!(
        "vigil_routing_failures_total",
        "network" => network.to_string(),
        "protocol" => protocol.as_str(),
        "reason" => reason,
    )
    .increment(1);
}

/// Observes how many candidates the selector weighed.
pub fn routing_candidates(network: &str, protocol: Protocol, count: usize) {
    #[allow(clippy::cast_precision_loss)]
    histogram!(
        "vigil_routing_candidates",
        "network" => network.to_string(),
        "protocol" => protocol.as_str(),
    )
    .record(count as f64);
}

pub fn proxy_request_duration(
    network: &str,
    node: &str,
    protocol: Protocol,
    status: &str,
    duration: Duration,
) {
    histogram!(
        "vigil_proxy_request_duration_seconds",
        "network" => network.to_string(),
        "node" => node.to_string(),
        "protocol" => protocol.as_str(),
        "status" => status.to_string(),
    )
    .record(duration.as_secs_f64());
}

pub fn proxy_response_bytes(network: &str, protocol: Protocol, bytes: u64) {
    #[allow(clippy::cast_precision_loss)]
    histogram!(
        "vigil_proxy_response_bytes",
        "network" => network.to_string(),
        "protocol" => protocol.as_str(),
    )
    .record(bytes as f64);
}

pub fn proxy_error(
    network: &str,
    node: &str,
    protocol: Protocol,
    status: &str,
    kind: &'static str,
) {
    counter!(
        "vigil_proxy_errors_total",
        "network" => network.to_string(),
        "node" => node.to_string(),
        "protocol" => protocol.as_str(),
        "status" => status.to_string(),
        "kind" => kind,
    )
    .increment(1);
}

pub fn node_request(network: &str, node: &str, protocol: Protocol, method: &str) {
    counter!(
        "vigil_node_requests_total",
        "network" => network.to_string(),
        "node" => node.to_string(),
        "protocol" => protocol.as_str(),
        "method" => method.to_string(),
    )
    .increment(1);
}

/// Counts work the scheduler dropped because the worker pool was saturated.
pub fn scheduler_task_dropped(task: &'static str) {
    counter!("vigil_scheduler_tasks_dropped_total", "task" => task).increment(1);
}
