//! Height checks against the Tendermint RPC `/status` endpoint, plus the
//! WebSocket reachability probe.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_tungstenite::tungstenite::Message;

use super::CheckError;
use crate::config::NodeConfig;
use crate::metrics;
use crate::storage::HeightStore;
use crate::types::{normalize_url, Protocol, Source};

/// CometBFT subscription frames used by the reachability probe. The probe
/// subscribes, reads one frame, unsubscribes, and closes cleanly.
const WS_SUBSCRIBE: &str =
    r#"{"jsonrpc":"2.0","method":"subscribe","id":1,"params":{"query":"tm.event='NewBlock'"}}"#;
const WS_UNSUBSCRIBE: &str =
    r#"{"jsonrpc":"2.0","method":"unsubscribe","id":2,"params":{"query":"tm.event='NewBlock'"}}"#;

const WS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
const WS_READ_TIMEOUT: Duration = Duration::from_secs(3);

/// Response shape of the Tendermint RPC `/status` endpoint.
#[derive(Debug, Deserialize)]
struct StatusResponse {
    result: StatusResult,
}

#[derive(Debug, Deserialize)]
struct StatusResult {
    sync_info: SyncInfo,
}

#[derive(Debug, Deserialize)]
struct SyncInfo {
    latest_block_height: String,
}

/// Polls `/status` for height and probes the `/websocket` endpoint.
pub struct RpcChecker {
    store: Arc<HeightStore>,
    client: reqwest::Client,
}

impl RpcChecker {
    pub fn new(store: Arc<HeightStore>) -> Result<Self, reqwest::Error> {
        Ok(Self { store, client: super::probe_client()? })
    }

    /// Performs one RPC height probe. After a successful height update the
    /// WebSocket reachability probe runs on the same host; its outcome only
    /// flips the `websocket_available` flag and never fails the check.
    pub async fn check_node(&self, node: &NodeConfig, timeout: Duration) -> Result<(), CheckError> {
        if node.rpc.is_empty() {
            return Err(CheckError::MissingEndpoint("rpc"));
        }

        let url = format!("{}/status", normalize_url(&node.rpc));

        let start = Instant::now();
        let result = self.probe(&url, timeout).await;
        let latency = start.elapsed();

        let height = match result {
            Ok(height) => height,
            Err(e) => {
                metrics::height_check_error(&node.network, &node.name, Protocol::Rpc, e.kind());
                metrics::node_available(&node.network, &node.name, Protocol::Rpc, false);
                tracing::warn!(
                    node = %node.name,
                    network = %node.network,
                    error_kind = e.kind(),
                    error = %e,
                    "rpc height check failed"
                );
                return Err(e);
            }
        };

        self.store.update(
            &node.network,
            &node.name,
            Protocol::Rpc,
            height,
            latency,
            Source::Internal,
        );

        let ws_available = check_websocket(&node.rpc).await;
        self.store.set_websocket(&node.network, &node.name, Protocol::Rpc, ws_available);
        metrics::node_websocket_available(&node.network, &node.name, Protocol::Rpc, ws_available);
        if !ws_available {
            metrics::websocket_check_error(
                &node.network,
                &node.name,
                Protocol::Rpc,
                "connectivity_failed",
            );
        }

        metrics::node_height(&node.network, &node.name, Protocol::Rpc, Source::Internal, height);
        metrics::node_latency(&node.network, &node.name, Protocol::Rpc, latency);
        metrics::node_available(&node.network, &node.name, Protocol::Rpc, true);

        tracing::debug!(
            node = %node.name,
            network = %node.network,
            height,
            latency_ms = latency.as_millis() as u64,
            websocket_available = ws_available,
            "rpc height check successful"
        );

        Ok(())
    }

    async fn probe(&self, url: &str, timeout: Duration) -> Result<i64, CheckError> {
        let response = self.client.get(url).timeout(timeout).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CheckError::HttpStatus(status.as_u16()));
        }

        let body = response.bytes().await?;
        let parsed: StatusResponse = serde_json::from_slice(&body)?;

        let raw = parsed.result.sync_info.latest_block_height;
        raw.parse::<i64>().map_err(|source| CheckError::HeightParse { raw, source })
    }
}

/// Derives the `/websocket` URL from an RPC base URL: `http → ws`,
/// `https → wss`, scheme-less input assumed TLS.
fn websocket_url(rpc: &str) -> String {
    let base = rpc.strip_suffix('/').unwrap_or(rpc);
    let converted = if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if !base.starts_with('w') {
        format!("wss://{base}")
    } else {
        base.to_string()
    };
    format!("{converted}/websocket")
}

/// Opens a WebSocket to the node, subscribes to `NewBlock`, waits for one
/// frame, then unsubscribes and closes. Every probe builds a fresh connection
/// so probes never share connector state.
async fn check_websocket(rpc: &str) -> bool {
    let url = websocket_url(rpc);

    let connect =
        tokio::time::timeout(WS_HANDSHAKE_TIMEOUT, tokio_tungstenite::connect_async(url.as_str()));
    let (mut ws, _) = match connect.await {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => {
            tracing::debug!(url = %url, error = %e, "websocket connection failed");
            return false;
        }
        Err(_) => {
            tracing::debug!(url = %url, "websocket handshake timed out");
            return false;
        }
    };

    if let Err(e) = ws.send(Message::Text(WS_SUBSCRIBE.to_string().into())).await {
        tracing::debug!(url = %url, error = %e, "websocket write failed");
        return false;
    }

    match tokio::time::timeout(WS_READ_TIMEOUT, ws.next()).await {
        Ok(Some(Ok(_))) => {}
        Ok(Some(Err(e))) => {
            tracing::debug!(url = %url, error = %e, "websocket read failed");
            return false;
        }
        Ok(None) => {
            tracing::debug!(url = %url, "websocket closed before first frame");
            return false;
        }
        Err(_) => {
            tracing::debug!(url = %url, "websocket read timed out");
            return false;
        }
    }

    let _ = ws.send(Message::Text(WS_UNSUBSCRIBE.to_string().into())).await;
    let _ = ws.close(None).await;

    tracing::debug!(url = %url, "websocket check successful");
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse() {
        let body = r#"{
            "jsonrpc": "2.0",
            "id": -1,
            "result": {
                "sync_info": {
                    "latest_block_height": "123456",
                    "catching_up": false
                }
            }
        }"#;
        let parsed: StatusResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.result.sync_info.latest_block_height, "123456");
    }

    #[test]
    fn test_websocket_url_derivation() {
        assert_eq!(websocket_url("http://node:26657"), "ws://node:26657/websocket");
        assert_eq!(websocket_url("https://node:26657/"), "wss://node:26657/websocket");
        assert_eq!(websocket_url("node:26657"), "wss://node:26657/websocket");
        assert_eq!(websocket_url("wss://node:26657"), "wss://node:26657/websocket");
    }

    #[tokio::test]
    async fn test_missing_endpoint() {
        let checker = RpcChecker::new(Arc::new(HeightStore::new())).unwrap();
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

    #[tokio::test]
    async fn test_websocket_probe_unreachable_host() {
        assert!(!check_websocket("http://127.0.0.1:1").await);
    }
}
