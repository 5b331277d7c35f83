//! Candidate assembly and the (height, latency) ranking policy.
//!
//! The selector reads both stores on every request and ranks candidates by
//! height first, average latency second. Externals are failover/burst
//! capacity, not primary: they join the candidate pool only when no healthy
//! internal exists or the best external leads the best internal by more than
//! the configured threshold. When healthy internals are within the threshold
//! of the leader, the ring prefers them to keep traffic in-region.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ConfigHandle;
use crate::metrics;
use crate::storage::{ExternalEndpointStore, HeightStore, NodeMetrics};
use crate::types::{normalize_url, Protocol, Source, EXTERNAL_PREFIX};

/// Why a candidate won.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionReason {
    /// Only one candidate existed.
    OnlyAvailable,
    /// Exactly one candidate survived the height filter.
    HeightWinner,
    /// Several candidates shared the top height; lowest latency won.
    LatencyTiebreaker,
}

impl SelectionReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SelectionReason::OnlyAvailable => "only_available",
            SelectionReason::HeightWinner => "height_winner",
            SelectionReason::LatencyTiebreaker => "latency_tiebreaker",
        }
    }
}

/// Transient record of one routing decision.
#[derive(Debug, Clone)]
pub struct SelectionDecision {
    pub selected: String,
    pub reason: SelectionReason,
    pub candidates: usize,
    pub max_height: i64,
    pub selected_latency: Duration,
}

/// Chooses the best node for a (network, protocol) pair.
pub struct Selector {
    heights: Arc<HeightStore>,
    endpoints: Arc<ExternalEndpointStore>,
    config: Arc<ConfigHandle>,
}

impl Selector {
    #[must_use]
    pub fn new(
        heights: Arc<HeightStore>,
        endpoints: Arc<ExternalEndpointStore>,
        config: Arc<ConfigHandle>,
    ) -> Self {
        Self { heights, endpoints, config }
    }

    /// Returns the best candidate's metrics, identifier, and the decision, or
    /// `None` when no viable candidate exists (empty pool or all at height 0).
    #[must_use]
    pub fn best_node(
        &self,
        network: &str,
        protocol: Protocol,
    ) -> Option<(NodeMetrics, String, SelectionDecision)> {
        let mut candidates = self.heights.list_by(network, protocol);

        let max_internal = candidates.iter().map(|(_, m)| m.height).max().unwrap_or(0);

        let externals = self.endpoints.get_validated(network, protocol);
        let max_external = externals.iter().map(|ep| ep.height).max().unwrap_or(0);

        let threshold = self.config.snapshot().external_failover_threshold;
        let admit_externals = max_internal == 0 || max_external > max_internal + threshold;

        if admit_externals {
            tracing::debug!(
                network,
                protocol = %protocol,
                max_internal,
                max_external,
                threshold,
                external_count = externals.len(),
                "admitting external endpoints as candidates"
            );
            for ep in externals {
                let identifier = format!("{EXTERNAL_PREFIX}{}", ep.url);
                let node_metrics = NodeMetrics {
                    height: ep.height,
                    timestamp: ep.last_validated.unwrap_or_else(chrono::Utc::now),
                    source: Source::External,
                    latency_history: std::collections::VecDeque::new(),
                    avg_latency: ep.latency,
                    websocket_available: ep.websocket_available,
                };
                candidates.push((identifier, node_metrics));
            }
        }

        if candidates.is_empty() {
            tracing::warn!(network, protocol = %protocol, "no nodes available for routing");
            metrics::routing_failure(network, protocol, "no_nodes");
            return None;
        }

        metrics::routing_candidates(network, protocol, candidates.len());

        // Stores iterate in hash order; sort by identifier so latency ties
        // resolve deterministically.
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        let max_height = candidates.iter().map(|(_, m)| m.height).max().unwrap_or(0);
        if max_height == 0 {
            tracing::warn!(
                network,
                protocol = %protocol,
                candidates = candidates.len(),
                "all candidates at zero height"
            );
            metrics::routing_failure(network, protocol, "zero_height");
            return None;
        }

        let total = candidates.len();
        let at_max: Vec<&(String, NodeMetrics)> =
            candidates.iter().filter(|(_, m)| m.height == max_height).collect();
        let survivors = at_max.len();

        let (name, best) = at_max
            .into_iter()
            .min_by_key(|(_, m)| m.avg_latency)
            .map(|(n, m)| (n.clone(), m.clone()))?;

        let reason = if total == 1 {
            SelectionReason::OnlyAvailable
        } else if survivors == 1 {
            SelectionReason::HeightWinner
        } else {
            SelectionReason::LatencyTiebreaker
        };

        let decision = SelectionDecision {
            selected: name.clone(),
            reason,
            candidates: total,
            max_height,
            selected_latency: best.avg_latency,
        };

        metrics::routing_selection(network, protocol, &name, reason.as_str());
        tracing::debug!(
            network,
            protocol = %protocol,
            selected = %name,
            reason = reason.as_str(),
            candidates = total,
            height = max_height,
            latency_ms = best.avg_latency.as_millis() as u64,
            "node selected"
        );

        Some((best, name, decision))
    }

    /// Resolves a selector identifier to a forwardable target.
    ///
    /// Internal node names map to the configured per-protocol URL (normalized
    /// for api/rpc, verbatim for grpc); `ext:`-prefixed identifiers resolve to
    /// the advertised URL verbatim. Unknown identifiers return `None`, which
    /// proxies report as an internal error.
    #[must_use]
    pub fn resolve_endpoint(&self, identifier: &str, protocol: Protocol) -> Option<String> {
        let cfg = self.config.snapshot();

        if let Some(node) = cfg.node(identifier) {
            let raw = node.endpoint(protocol);
            if raw.is_empty() {
                return None;
            }
            return Some(match protocol {
                Protocol::Api | Protocol::Rpc => normalize_url(raw),
                Protocol::Grpc => raw.to_string(),
            });
        }

        if let Some(url) = identifier.strip_prefix(EXTERNAL_PREFIX) {
            return Some(url.to_string());
        }

        tracing::warn!(identifier, protocol = %protocol, "identifier not found in configuration");
        None
    }

    /// Highest height per protocol, counting validated externals. Serves the
    /// status surface's `/{network}/status` wire format.
    #[must_use]
    pub fn highest_heights(&self, network: &str, protocols: &[Protocol]) -> HashMap<Protocol, i64> {
        let mut result = HashMap::new();
        for &protocol in protocols {
            let mut height = self.heights.highest(network, protocol);
            for ep in self.endpoints.get_validated(network, protocol) {
                height = height.max(ep.height);
            }
            if height > 0 {
                result.insert(protocol, height);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigHandle, NetworkConfig, NodeConfig, VigilConfig};
    use crate::storage::EndpointKey;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn test_config() -> Arc<ConfigHandle> {
        let mut cfg = VigilConfig::default();
        cfg.networks.push(NetworkConfig {
            name: "pocket".to_string(),
            api: String::new(),
            api_listen: "0.0.0.0:8080".to_string(),
            rpc: String::new(),
            rpc_listen: "0.0.0.0:8081".to_string(),
            grpc: String::new(),
            grpc_listen: "0.0.0.0:8082".to_string(),
            grpc_insecure: false,
            grpc_max_recv_msg_size: 0,
            grpc_max_send_msg_size: 0,
        });
        for (name, host) in [("node-1", "node-1.example.com"), ("node-2", "node-2.example.com")] {
            cfg.internals.push(NodeConfig {
                name: name.to_string(),
                network: "pocket".to_string(),
                api: format!("https://{host}:1317"),
                rpc: format!("{host}:26657"),
                grpc: format!("{host}:9090"),
                grpc_insecure: false,
            });
        }
        ConfigHandle::from_config(cfg)
    }

    struct Fixture {
        heights: Arc<HeightStore>,
        endpoints: Arc<ExternalEndpointStore>,
        selector: Selector,
    }

    fn fixture() -> Fixture {
        let heights = Arc::new(HeightStore::new());
        let endpoints = Arc::new(ExternalEndpointStore::new());
        let selector = Selector::new(heights.clone(), endpoints.clone(), test_config());
        Fixture { heights, endpoints, selector }
    }

    fn ext_key(url: &str) -> EndpointKey {
        EndpointKey {
            external: "pnf".to_string(),
            ring: "https://ring-1.example.com".to_string(),
            network: "pocket".to_string(),
            protocol: Protocol::Api,
            url: url.to_string(),
        }
    }

    fn add_external(f: &Fixture, url: &str, height: i64, latency: Duration) {
        let k = ext_key(url);
        f.endpoints.store_advertised(&k, false);
        f.endpoints.mark_validated(&k, height, latency);
    }

    // S1: externals within the threshold stay out; best internal wins.
    #[test]
    fn test_internal_preferred_within_threshold() {
        let f = fixture();
        f.heights.update("pocket", "node-1", Protocol::Api, 100, ms(50), Source::Internal);
        f.heights.update("pocket", "node-2", Protocol::Api, 98, ms(30), Source::Internal);
        add_external(&f, "https://ext1.example.com", 102, ms(20));

        let (m, id, decision) = f.selector.best_node("pocket", Protocol::Api).unwrap();
        assert_eq!(id, "node-1");
        assert_eq!(m.height, 100);
        assert_eq!(decision.candidates, 2);
        assert_eq!(decision.reason, SelectionReason::HeightWinner);
        assert_eq!(decision.max_height, 100);
    }

    // S2: external leading by more than the threshold joins and wins.
    #[test]
    fn test_external_admitted_beyond_threshold() {
        let f = fixture();
        f.heights.update("pocket", "node-1", Protocol::Api, 100, ms(50), Source::Internal);
        f.heights.update("pocket", "node-2", Protocol::Api, 98, ms(30), Source::Internal);
        add_external(&f, "https://ext1.example.com", 103, ms(20));

        let (m, id, decision) = f.selector.best_node("pocket", Protocol::Api).unwrap();
        assert_eq!(id, "ext:https://ext1.example.com");
        assert_eq!(m.height, 103);
        assert!(matches!(m.source, Source::External));
        assert_eq!(decision.candidates, 3);
        assert_eq!(decision.reason, SelectionReason::HeightWinner);
    }

    // S3: no healthy internals at all → pure external failover.
    #[test]
    fn test_external_failover_when_internals_dead() {
        let f = fixture();
        f.heights.update("pocket", "node-1", Protocol::Api, 0, ms(50), Source::Internal);
        add_external(&f, "https://ext1.example.com", 100, ms(20));

        let (m, id, decision) = f.selector.best_node("pocket", Protocol::Api).unwrap();
        assert_eq!(id, "ext:https://ext1.example.com");
        assert_eq!(m.height, 100);
        assert_eq!(decision.max_height, 100);
        // node-1 at height 0 is still a candidate, just filtered by height.
        assert_eq!(decision.candidates, 2);
        assert_eq!(decision.reason, SelectionReason::HeightWinner);
    }

    // S4: equal heights → latency tiebreaker.
    #[test]
    fn test_latency_tiebreaker() {
        let f = fixture();
        f.heights.update("pocket", "node-1", Protocol::Api, 100, ms(100), Source::Internal);
        f.heights.update("pocket", "node-2", Protocol::Api, 100, ms(20), Source::Internal);

        let (m, id, decision) = f.selector.best_node("pocket", Protocol::Api).unwrap();
        assert_eq!(id, "node-2");
        assert_eq!(m.height, 100);
        assert_eq!(decision.reason, SelectionReason::LatencyTiebreaker);
    }

    // S5: height beats latency.
    #[test]
    fn test_height_primacy() {
        let f = fixture();
        f.heights.update("pocket", "node-1", Protocol::Api, 105, ms(100), Source::Internal);
        f.heights.update("pocket", "node-2", Protocol::Api, 100, ms(20), Source::Internal);

        let (_, id, decision) = f.selector.best_node("pocket", Protocol::Api).unwrap();
        assert_eq!(id, "node-1");
        assert_eq!(decision.reason, SelectionReason::HeightWinner);
        assert_eq!(decision.max_height, 105);
    }

    // S6: three proxy errors expel the external; internal wins again.
    #[test]
    fn test_errored_external_excluded() {
        let f = fixture();
        f.heights.update("pocket", "node-1", Protocol::Api, 100, ms(50), Source::Internal);
        add_external(&f, "https://ext1.example.com", 200, ms(20));

        let (_, id, _) = f.selector.best_node("pocket", Protocol::Api).unwrap();
        assert_eq!(id, "ext:https://ext1.example.com");

        for _ in 0..3 {
            f.endpoints.track_proxy_error("pocket", Protocol::Api, "https://ext1.example.com");
        }

        let (m, id, _) = f.selector.best_node("pocket", Protocol::Api).unwrap();
        assert_eq!(id, "node-1");
        assert_eq!(m.height, 100);
    }

    #[test]
    fn test_only_available() {
        let f = fixture();
        f.heights.update("pocket", "node-1", Protocol::Api, 42, ms(50), Source::Internal);

        let (_, _, decision) = f.selector.best_node("pocket", Protocol::Api).unwrap();
        assert_eq!(decision.reason, SelectionReason::OnlyAvailable);
        assert_eq!(decision.candidates, 1);
    }

    #[test]
    fn test_empty_pool_and_zero_height() {
        let f = fixture();
        assert!(f.selector.best_node("pocket", Protocol::Api).is_none());

        f.heights.update("pocket", "node-1", Protocol::Api, 0, ms(50), Source::Internal);
        assert!(f.selector.best_node("pocket", Protocol::Api).is_none());
    }

    // Failover asymmetry: externals appear iff max_internal == 0 or
    // max_external > max_internal + T.
    #[test]
    fn test_failover_asymmetry_boundary() {
        let f = fixture();
        f.heights.update("pocket", "node-1", Protocol::Api, 100, ms(50), Source::Internal);

        // Exactly at threshold (102 == 100 + 2): not admitted.
        add_external(&f, "https://ext1.example.com", 102, ms(1));
        let (_, id, _) = f.selector.best_node("pocket", Protocol::Api).unwrap();
        assert_eq!(id, "node-1");

        // One past the threshold: admitted.
        let k = ext_key("https://ext1.example.com");
        f.endpoints.mark_validated(&k, 103, ms(1));
        let (_, id, _) = f.selector.best_node("pocket", Protocol::Api).unwrap();
        assert_eq!(id, "ext:https://ext1.example.com");
    }

    // Selection is deterministic for fixed candidate state, including
    // latency-identical ties (identifier order breaks them).
    #[test]
    fn test_deterministic_selection() {
        let f = fixture();
        f.heights.update("pocket", "node-1", Protocol::Api, 100, ms(20), Source::Internal);
        f.heights.update("pocket", "node-2", Protocol::Api, 100, ms(20), Source::Internal);

        let (_, first, _) = f.selector.best_node("pocket", Protocol::Api).unwrap();
        for _ in 0..20 {
            let (_, id, decision) = f.selector.best_node("pocket", Protocol::Api).unwrap();
            assert_eq!(id, first);
            assert_eq!(decision.reason, SelectionReason::LatencyTiebreaker);
        }
        assert_eq!(first, "node-1");
    }

    #[test]
    fn test_resolve_endpoint_roundtrip() {
        let f = fixture();

        assert_eq!(
            f.selector.resolve_endpoint("node-1", Protocol::Api).unwrap(),
            "https://node-1.example.com:1317"
        );
        // rpc URL configured without a scheme gets normalized.
        assert_eq!(
            f.selector.resolve_endpoint("node-1", Protocol::Rpc).unwrap(),
            "https://node-1.example.com:26657"
        );
        // grpc targets pass through verbatim.
        assert_eq!(
            f.selector.resolve_endpoint("node-1", Protocol::Grpc).unwrap(),
            "node-1.example.com:9090"
        );

        // ext: prefix strips to the advertised URL, any protocol.
        for protocol in Protocol::ALL {
            assert_eq!(
                f.selector.resolve_endpoint("ext:https://u.example.com", protocol).unwrap(),
                "https://u.example.com"
            );
        }

        assert!(f.selector.resolve_endpoint("unknown-node", Protocol::Api).is_none());
    }

    #[test]
    fn test_highest_heights_includes_externals() {
        let f = fixture();
        f.heights.update("pocket", "node-1", Protocol::Api, 100, ms(50), Source::Internal);
        f.heights.update("pocket", "node-1", Protocol::Rpc, 101, ms(50), Source::Internal);
        add_external(&f, "https://ext1.example.com", 150, ms(20));

        let heights = f.selector.highest_heights("pocket", &Protocol::ALL);
        assert_eq!(heights.get(&Protocol::Api), Some(&150));
        assert_eq!(heights.get(&Protocol::Rpc), Some(&101));
        assert_eq!(heights.get(&Protocol::Grpc), None);
    }
}
