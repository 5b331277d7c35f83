//! Height checks over the CosmosSDK gRPC service.
//!
//! One long-lived client channel is kept per node. The probe is `ABCIQuery`
//! with path `/app/version`: the lightest server-side call that still carries
//! the current block height in its response, avoiding the multi-megabyte
//! latest-block transfer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cosmos_sdk_proto::cosmos::base::tendermint::v1beta1::{
    service_client::ServiceClient, AbciQueryRequest,
};
use dashmap::DashMap;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};

use super::CheckError;
use crate::config::NodeConfig;
use crate::metrics;
use crate::storage::HeightStore;
use crate::types::{Protocol, Source};

/// Keepalive ping interval on backend channels.
pub(crate) const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
/// How long to wait for a keepalive ack before tearing the connection down.
pub(crate) const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(3);
/// Time budget for establishing a new connection.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const WARMUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds a lazily-connecting channel to `target` (`host:port`), plaintext or
/// TLS 1.2+ per `insecure`. The target string reaches the dialer verbatim, so
/// no resolver-side DNS games can stall the connection.
pub(crate) fn build_channel(target: &str, insecure: bool) -> Result<Channel, CheckError> {
    let scheme = if insecure { "http" } else { "https" };
    let uri = if target.contains("://") {
        target.to_string()
    } else {
        format!("{scheme}://{target}")
    };

    let mut endpoint = Endpoint::from_shared(uri)?
        .connect_timeout(CONNECT_TIMEOUT)
        .keep_alive_while_idle(true)
        .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
        .keep_alive_timeout(KEEPALIVE_TIMEOUT)
        .tcp_nodelay(true);

    if !insecure {
        endpoint = endpoint.tls_config(ClientTlsConfig::new().with_native_roots())?;
    }

    Ok(endpoint.connect_lazy())
}

fn abci_probe_request() -> AbciQueryRequest {
    AbciQueryRequest {
        data: Vec::new(),
        path: "/app/version".to_string(),
        height: 0,
        prove: false,
    }
}

/// Maintains per-node channels and issues the lightweight ABCI probe.
pub struct GrpcChecker {
    store: Arc<HeightStore>,
    connections: DashMap<String, Channel>,
}

impl GrpcChecker {
    #[must_use]
    pub fn new(store: Arc<HeightStore>) -> Self {
        Self { store, connections: DashMap::new() }
    }

    /// Performs one gRPC height probe against `node`.
    pub async fn check_node(&self, node: &NodeConfig, timeout: Duration) -> Result<(), CheckError> {
        if node.grpc.is_empty() {
            return Err(CheckError::MissingEndpoint("grpc"));
        }

        let start = Instant::now();
        let result = self.probe(node, timeout).await;
        let latency = start.elapsed();

        match result {
            Ok(height) => {
                self.store.update(
                    &node.network,
                    &node.name,
                    Protocol::Grpc,
                    height,
                    latency,
                    Source::Internal,
                );

                metrics::node_height(&node.network, &node.name, Protocol::Grpc, Source::Internal, height);
                metrics::node_latency(&node.network, &node.name, Protocol::Grpc, latency);
                metrics::node_available(&node.network, &node.name, Protocol::Grpc, true);

                tracing::debug!(
                    node = %node.name,
                    network = %node.network,
                    height,
                    latency_ms = latency.as_millis() as u64,
                    "grpc height check successful"
                );
                Ok(())
            }
            Err(e) => {
                metrics::height_check_error(&node.network, &node.name, Protocol::Grpc, e.kind());
                metrics::node_available(&node.network, &node.name, Protocol::Grpc, false);
                tracing::warn!(
                    node = %node.name,
                    network = %node.network,
                    error_kind = e.kind(),
                    error = %e,
                    "grpc height check failed"
                );
                Err(e)
            }
        }
    }

    async fn probe(&self, node: &NodeConfig, timeout: Duration) -> Result<i64, CheckError> {
        let channel = self.connection(node).await?;
        let mut client = ServiceClient::new(channel);

        let response = tokio::time::timeout(timeout, client.abci_query(abci_probe_request()))
            .await
            .map_err(|_| CheckError::Timeout)??;

        Ok(response.into_inner().height)
    }

    /// Returns the cached channel for this node, dialing a new one on first
    /// use. A fresh channel gets a best-effort warm-up probe: failure is
    /// logged and the channel kept, the first scheduled check establishes it.
    async fn connection(&self, node: &NodeConfig) -> Result<Channel, CheckError> {
        if let Some(existing) = self.connections.get(&node.name) {
            return Ok(existing.clone());
        }

        let channel = build_channel(&node.grpc, node.grpc_insecure)?;

        let mut client = ServiceClient::new(channel.clone());
        match tokio::time::timeout(WARMUP_TIMEOUT, client.abci_query(abci_probe_request())).await {
            Ok(Ok(_)) => {
                tracing::debug!(node = %node.name, target = %node.grpc, "grpc connection established and warmed up");
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    node = %node.name,
                    target = %node.grpc,
                    error = %e,
                    "grpc connection warmup failed, will establish on first health check"
                );
            }
            Err(_) => {
                tracing::warn!(
                    node = %node.name,
                    target = %node.grpc,
                    "grpc connection warmup timed out, will establish on first health check"
                );
            }
        }

        self.connections.insert(node.name.clone(), channel.clone());
        Ok(channel)
    }

    /// Drops all pooled channels. Called last during shutdown.
    pub fn close(&self) {
        self.connections.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_channel_accepts_bare_target() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        assert!(build_channel("node-1.example.com:9090", false).is_ok());
        assert!(build_channel("node-1.example.com:9090", true).is_ok());
        assert!(build_channel("https://node-1.example.com:9090", false).is_ok());
    }

    #[test]
    fn test_probe_request_shape() {
        let req = abci_probe_request();
        assert_eq!(req.path, "/app/version");
        assert!(req.data.is_empty());
        assert_eq!(req.height, 0);
        assert!(!req.prove);
    }

    #[tokio::test]
    async fn test_missing_endpoint() {
        let checker = GrpcChecker::new(Arc::new(HeightStore::new()));
        let node = NodeConfig {
            name: "node-1".to_string(),
            network: "pocket".to_string(),
            api: String::new(),
            rpc: String::new(),
            grpc: String::new(),
            grpc_insecure: false,
        };
        let err = checker.check_node(&node, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind(), "missing_endpoint");
    }
}
