//! Height and latency bookkeeping for monitored nodes.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::types::{Protocol, Source};

/// Number of latency measurements kept per node for the moving average.
pub const LATENCY_WINDOW: usize = 10;

/// Height and latency observations for a single (network, node, protocol).
///
/// Entries are created on the first successful check and never removed while
/// the process lives; only health checkers mutate them. A `height` of 0 means
/// the node is unknown or unhealthy.
#[derive(Debug, Clone)]
pub struct NodeMetrics {
    pub height: i64,
    pub timestamp: DateTime<Utc>,
    pub source: Source,
    /// Last [`LATENCY_WINDOW`] measured latencies, oldest first.
    pub latency_history: VecDeque<Duration>,
    /// Simple mean of `latency_history`; kept consistent on every update.
    pub avg_latency: Duration,
    /// Whether the node's WebSocket endpoint answered the last probe (RPC only).
    pub websocket_available: bool,
}

impl NodeMetrics {
    fn new(source: Source) -> Self {
        Self {
            height: 0,
            timestamp: Utc::now(),
            source,
            latency_history: VecDeque::with_capacity(LATENCY_WINDOW),
            avg_latency: Duration::ZERO,
            websocket_available: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct NodeKey {
    network: String,
    node: String,
    protocol: Protocol,
}

/// Concurrent map of node metrics keyed by (network, node, protocol).
///
/// Built on a sharded map so updates to the same key are serialized while
/// reads and writes on different keys proceed in parallel. All accessors
/// return copies.
#[derive(Debug, Default)]
pub struct HeightStore {
    data: DashMap<NodeKey, NodeMetrics>,
}

impl HeightStore {
    #[must_use]
    pub fn new() -> Self {
        Self { data: DashMap::new() }
    }

    /// Records a successful height check: stores the new height, appends the
    /// latency sample (evicting the oldest beyond the window), and recomputes
    /// the moving average.
    pub fn update(
        &self,
        network: &str,
        node: &str,
        protocol: Protocol,
        height: i64,
        latency: Duration,
        source: Source,
    ) {
        let key = NodeKey { network: network.to_string(), node: node.to_string(), protocol };
        let mut entry = self.data.entry(key).or_insert_with(|| NodeMetrics::new(source));

        entry.height = height;
        entry.timestamp = Utc::now();
        entry.source = source;

        entry.latency_history.push_back(latency);
        if entry.latency_history.len() > LATENCY_WINDOW {
            entry.latency_history.pop_front();
        }

        let sum: Duration = entry.latency_history.iter().sum();
        entry.avg_latency = sum / entry.latency_history.len() as u32;
    }

    /// Returns a copy of the metrics for one node, if tracked.
    #[must_use]
    pub fn get(&self, network: &str, node: &str, protocol: Protocol) -> Option<NodeMetrics> {
        let key = NodeKey { network: network.to_string(), node: node.to_string(), protocol };
        self.data.get(&key).map(|m| m.clone())
    }

    /// Returns copies of all node metrics for a (network, protocol) pair,
    /// keyed by node name.
    #[must_use]
    pub fn list_by(&self, network: &str, protocol: Protocol) -> Vec<(String, NodeMetrics)> {
        self.data
            .iter()
            .filter(|e| e.key().network == network && e.key().protocol == protocol)
            .map(|e| (e.key().node.clone(), e.value().clone()))
            .collect()
    }

    /// Highest height observed for a (network, protocol) pair; 0 when no node
    /// is tracked.
    #[must_use]
    pub fn highest(&self, network: &str, protocol: Protocol) -> i64 {
        self.data
            .iter()
            .filter(|e| e.key().network == network && e.key().protocol == protocol)
            .map(|e| e.value().height)
            .max()
            .unwrap_or(0)
    }

    /// All networks with at least one tracked node.
    #[must_use]
    pub fn networks(&self) -> Vec<String> {
        let mut networks: Vec<String> = self.data.iter().map(|e| e.key().network.clone()).collect();
        networks.sort_unstable();
        networks.dedup();
        networks
    }

    /// Records the outcome of a WebSocket reachability probe. Creates the
    /// entry if the height check has not landed yet.
    pub fn set_websocket(&self, network: &str, node: &str, protocol: Protocol, available: bool) {
        let key = NodeKey { network: network.to_string(), node: node.to_string(), protocol };
        let mut entry =
            self.data.entry(key).or_insert_with(|| NodeMetrics::new(Source::Internal));
        entry.websocket_available = available;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_update_and_get() {
        let store = HeightStore::new();
        store.update("pocket", "node-1", Protocol::Api, 100, ms(50), Source::Internal);

        let m = store.get("pocket", "node-1", Protocol::Api).unwrap();
        assert_eq!(m.height, 100);
        assert_eq!(m.avg_latency, ms(50));
        assert_eq!(m.latency_history.len(), 1);
        assert!(matches!(m.source, Source::Internal));

        assert!(store.get("pocket", "node-1", Protocol::Rpc).is_none());
        assert!(store.get("other", "node-1", Protocol::Api).is_none());
    }

    #[test]
    fn test_latency_window_bound_and_average() {
        let store = HeightStore::new();
        for i in 1..=25u64 {
            store.update("pocket", "node-1", Protocol::Rpc, i as i64, ms(i * 10), Source::Internal);
        }

        let m = store.get("pocket", "node-1", Protocol::Rpc).unwrap();
        assert_eq!(m.latency_history.len(), LATENCY_WINDOW);
        // Window holds samples 16..=25; mean is 205ms.
        assert_eq!(m.avg_latency, ms(205));
        assert_eq!(m.height, 25);
    }

    #[test]
    fn test_window_equals_update_count_before_cap() {
        let store = HeightStore::new();
        for i in 1..=4u64 {
            store.update("net", "n", Protocol::Api, 1, ms(i), Source::Internal);
        }
        let m = store.get("net", "n", Protocol::Api).unwrap();
        assert_eq!(m.latency_history.len(), 4);
    }

    #[test]
    fn test_accessors_return_copies() {
        let store = HeightStore::new();
        store.update("pocket", "node-1", Protocol::Api, 100, ms(50), Source::Internal);

        let mut copy = store.get("pocket", "node-1", Protocol::Api).unwrap();
        copy.height = 999;
        copy.latency_history.clear();

        let fresh = store.get("pocket", "node-1", Protocol::Api).unwrap();
        assert_eq!(fresh.height, 100);
        assert_eq!(fresh.latency_history.len(), 1);
    }

    #[test]
    fn test_list_by_and_highest() {
        let store = HeightStore::new();
        store.update("pocket", "node-1", Protocol::Api, 100, ms(50), Source::Internal);
        store.update("pocket", "node-2", Protocol::Api, 98, ms(30), Source::Internal);
        store.update("pocket", "node-1", Protocol::Rpc, 101, ms(50), Source::Internal);
        store.update("beta", "node-3", Protocol::Api, 500, ms(10), Source::Internal);

        let api = store.list_by("pocket", Protocol::Api);
        assert_eq!(api.len(), 2);
        assert_eq!(store.highest("pocket", Protocol::Api), 100);
        assert_eq!(store.highest("pocket", Protocol::Rpc), 101);
        assert_eq!(store.highest("pocket", Protocol::Grpc), 0);

        let mut networks = store.networks();
        networks.sort();
        assert_eq!(networks, vec!["beta".to_string(), "pocket".to_string()]);
    }

    #[test]
    fn test_set_websocket_creates_entry() {
        let store = HeightStore::new();
        store.set_websocket("pocket", "node-1", Protocol::Rpc, true);

        let m = store.get("pocket", "node-1", Protocol::Rpc).unwrap();
        assert!(m.websocket_available);
        assert_eq!(m.height, 0);

        store.set_websocket("pocket", "node-1", Protocol::Rpc, false);
        assert!(!store.get("pocket", "node-1", Protocol::Rpc).unwrap().websocket_available);
    }

    #[test]
    fn test_concurrent_updates_distinct_keys() {
        let store = std::sync::Arc::new(HeightStore::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                let node = format!("node-{i}");
                for h in 1..=100 {
                    store.update("pocket", &node, Protocol::Api, h, ms(5), Source::Internal);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.list_by("pocket", Protocol::Api).len(), 8);
        assert_eq!(store.highest("pocket", Protocol::Api), 100);
    }
}
