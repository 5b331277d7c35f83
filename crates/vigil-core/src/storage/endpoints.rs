//! Peer-advertised endpoint tracking and its validation state machine.
//!
//! Each endpoint advertised by an external ring moves through:
//!
//! ```text
//!              store_advertised
//!   (absent) ───────────────────▶ ADVERTISED
//!                                    │ mark_validated
//!                                    ▼
//!                                 VALIDATED ∧ working ──┐
//!       mark_validation_failed ◀────┤                   │ 3 consecutive
//!                                   │                   │ proxy errors
//!                                   │ recover           ▼
//!                                   └── VALIDATED ∧ ¬working
//! ```
//!
//! `VALIDATED ∧ working` endpoints are eligible selector candidates; failed
//! ones are subject to periodic recovery probing. A "proxy error" is an
//! upstream HTTP status ≥ 500 or a gRPC reply in
//! {Internal, Unavailable, DataLoss, Unknown}.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::metrics;
use crate::types::Protocol;

/// Consecutive proxy errors after which a working endpoint is pulled from
/// the candidate pool.
const ERROR_THRESHOLD: u32 = 3;

/// Full identity of an advertised endpoint.
///
/// The same URL advertised by two rings (or for two networks) is tracked
/// independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub external: String,
    pub ring: String,
    pub network: String,
    pub protocol: Protocol,
    pub url: String,
}

/// One advertised endpoint with its validation state and observed metrics.
#[derive(Debug, Clone)]
pub struct ExternalEndpoint {
    pub url: String,
    pub network: String,
    pub protocol: Protocol,
    pub external: String,
    pub ring: String,

    /// Passed at least one connectivity probe.
    pub is_validated: bool,
    /// Currently eligible; always implies `is_validated`.
    pub is_working: bool,
    /// Consecutive proxy errors since the last successful validation.
    pub error_count: u32,
    pub last_validated: Option<DateTime<Utc>>,
    pub last_error: Option<DateTime<Utc>>,
    /// Whether the ring advertised this gRPC endpoint as plaintext.
    pub grpc_insecure: bool,
    pub websocket_available: bool,

    pub height: i64,
    pub latency: Duration,
}

/// Store of peer-advertised endpoints.
///
/// A single lock guards the map: every operation copies what it needs out
/// before any I/O happens, and `track_proxy_error` needs a full scan anyway
/// because proxies only know the URL, not the advertising ring.
#[derive(Debug, Default)]
pub struct ExternalEndpointStore {
    endpoints: RwLock<HashMap<EndpointKey, ExternalEndpoint>>,
}

impl ExternalEndpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self { endpoints: RwLock::new(HashMap::new()) }
    }

    /// Records an endpoint a peer told us about. New endpoints start
    /// unvalidated and non-working; re-advertising an existing endpoint is a
    /// no-op beyond refreshing the URL.
    pub fn store_advertised(&self, key: &EndpointKey, grpc_insecure: bool) {
        let mut endpoints = self.endpoints.write();

        if let Some(ep) = endpoints.get_mut(key) {
            ep.url = key.url.clone();
            ep.grpc_insecure = grpc_insecure;
            return;
        }

        endpoints.insert(
            key.clone(),
            ExternalEndpoint {
                url: key.url.clone(),
                network: key.network.clone(),
                protocol: key.protocol,
                external: key.external.clone(),
                ring: key.ring.clone(),
                is_validated: false,
                is_working: false,
                error_count: 0,
                last_validated: None,
                last_error: None,
                grpc_insecure,
                websocket_available: false,
                height: 0,
                latency: Duration::ZERO,
            },
        );

        tracing::info!(
            external = %key.external,
            ring = %key.ring,
            network = %key.network,
            protocol = %key.protocol,
            url = %key.url,
            "stored new advertised endpoint"
        );
    }

    /// Marks an endpoint validated and working, resetting its error counter
    /// and recording the observed height and probe latency.
    pub fn mark_validated(&self, key: &EndpointKey, height: i64, latency: Duration) {
        let mut endpoints = self.endpoints.write();
        let Some(ep) = endpoints.get_mut(key) else {
            tracing::warn!(
                external = %key.external,
                network = %key.network,
                protocol = %key.protocol,
                url = %key.url,
                "attempted to validate unknown endpoint"
            );
            return;
        };

        let first_time = !ep.is_validated;
        ep.is_validated = true;
        ep.is_working = true;
        ep.error_count = 0;
        ep.last_validated = Some(Utc::now());
        ep.height = height;
        ep.latency = latency;

        if first_time {
            tracing::info!(
                external = %key.external,
                ring = %key.ring,
                network = %key.network,
                protocol = %key.protocol,
                url = %key.url,
                height,
                latency_ms = latency.as_millis() as u64,
                "endpoint validated"
            );
        } else {
            tracing::debug!(
                external = %key.external,
                network = %key.network,
                protocol = %key.protocol,
                height,
                "endpoint revalidated"
            );
        }

        metrics::external_endpoint_validation(key.network.as_str(), key.protocol, &key.external, true);
        metrics::external_endpoint_validation_latency(
            key.network.as_str(),
            key.protocol,
            &key.external,
            latency,
        );
        metrics::external_endpoint_error_count(key.network.as_str(), key.protocol, &key.url, 0);
    }

    /// Marks a validation probe as failed; the endpoint leaves the candidate
    /// pool until a recovery probe succeeds.
    pub fn mark_validation_failed(&self, key: &EndpointKey) {
        let mut endpoints = self.endpoints.write();
        let Some(ep) = endpoints.get_mut(key) else {
            return;
        };

        ep.is_validated = false;
        ep.is_working = false;
        ep.last_error = Some(Utc::now());

        tracing::warn!(
            external = %key.external,
            ring = %key.ring,
            network = %key.network,
            protocol = %key.protocol,
            url = %key.url,
            "endpoint validation failed"
        );

        metrics::external_endpoint_validation(key.network.as_str(), key.protocol, &key.external, false);
    }

    /// Increments the proxy-error counter for a fully-keyed endpoint. The
    /// working → not-working transition happens in the same update once the
    /// counter reaches the threshold.
    pub fn increment_error_count(&self, key: &EndpointKey) {
        let mut endpoints = self.endpoints.write();
        let Some(ep) = endpoints.get_mut(key) else {
            return;
        };
        bump_error(ep);
    }

    /// URL-addressed variant of [`increment_error_count`] used by the proxies,
    /// which know only (network, protocol, target URL). Returns whether a
    /// matching endpoint was found.
    ///
    /// [`increment_error_count`]: Self::increment_error_count
    pub fn track_proxy_error(&self, network: &str, protocol: Protocol, url: &str) -> bool {
        let mut endpoints = self.endpoints.write();
        for ep in endpoints.values_mut() {
            if ep.network == network && ep.protocol == protocol && ep.url == url {
                bump_error(ep);
                metrics::external_endpoint_proxy_error(network, protocol, url);
                metrics::external_endpoint_error_count(network, protocol, url, ep.error_count);
                return true;
            }
        }
        false
    }

    /// Drops an endpoint that is no longer advertised.
    pub fn remove(&self, key: &EndpointKey) {
        let mut endpoints = self.endpoints.write();
        if endpoints.remove(key).is_some() {
            tracing::info!(
                external = %key.external,
                ring = %key.ring,
                network = %key.network,
                protocol = %key.protocol,
                url = %key.url,
                "removed endpoint no longer advertised"
            );
        }
    }

    /// Copies of all validated, working endpoints for a (network, protocol)
    /// pair — the external candidate pool.
    #[must_use]
    pub fn get_validated(&self, network: &str, protocol: Protocol) -> Vec<ExternalEndpoint> {
        let endpoints = self.endpoints.read();
        endpoints
            .values()
            .filter(|ep| {
                ep.network == network
                    && ep.protocol == protocol
                    && ep.is_validated
                    && ep.is_working
            })
            .cloned()
            .collect()
    }

    /// Copies of all endpoints that were validated once but are currently
    /// failed — the recovery probe worklist.
    #[must_use]
    pub fn get_failed(&self) -> Vec<ExternalEndpoint> {
        let endpoints = self.endpoints.read();
        endpoints.values().filter(|ep| ep.is_validated && !ep.is_working).cloned().collect()
    }

    /// Records the WebSocket reachability of an advertised RPC endpoint.
    pub fn update_websocket(&self, key: &EndpointKey, available: bool) {
        let mut endpoints = self.endpoints.write();
        if let Some(ep) = endpoints.get_mut(key) {
            ep.websocket_available = available;
        }
    }

    /// Recomputes the tracked/validated/working gauges, grouped by
    /// (network, protocol, external). Called on the recovery cadence.
    pub fn update_aggregate_metrics(&self) {
        let endpoints = self.endpoints.read();

        let mut counts: HashMap<(String, Protocol, String), (u64, u64, u64)> = HashMap::new();
        for ep in endpoints.values() {
            let entry = counts
                .entry((ep.network.clone(), ep.protocol, ep.external.clone()))
                .or_insert((0, 0, 0));
            entry.0 += 1;
            if ep.is_validated {
                entry.1 += 1;
            }
            if ep.is_working {
                entry.2 += 1;
            }
        }
        drop(endpoints);

        for ((network, protocol, external), (tracked, validated, working)) in counts {
            metrics::external_endpoints_aggregate(
                &network, protocol, &external, tracked, validated, working,
            );
        }
    }
}

fn bump_error(ep: &mut ExternalEndpoint) {
    ep.error_count += 1;
    ep.last_error = Some(Utc::now());

    if ep.error_count >= ERROR_THRESHOLD && ep.is_working {
        ep.is_working = false;
        tracing::warn!(
            external = %ep.external,
            ring = %ep.ring,
            network = %ep.network,
            protocol = %ep.protocol,
            url = %ep.url,
            error_count = ep.error_count,
            "endpoint marked not working after consecutive proxy errors"
        );
    } else {
        tracing::debug!(
            external = %ep.external,
            network = %ep.network,
            protocol = %ep.protocol,
            url = %ep.url,
            error_count = ep.error_count,
            "endpoint proxy error tracked"
        );
    }
}
