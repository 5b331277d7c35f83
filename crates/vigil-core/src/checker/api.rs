//! Height checks against the CosmosSDK REST API.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;

use super::CheckError;
use crate::config::NodeConfig;
use crate::metrics;
use crate::storage::HeightStore;
use crate::types::{normalize_url, Protocol, Source};

/// Response shape of `/cosmos/base/tendermint/v1beta1/blocks/latest`.
///
/// Newer SDKs report the height under `sdk_block`, older ones under `block`;
/// both carry it as a decimal string.
#[derive(Debug, Default, Deserialize)]
struct LatestBlockResponse {
    #[serde(default)]
    block: BlockEnvelope,
    #[serde(default)]
    sdk_block: BlockEnvelope,
}

#[derive(Debug, Default, Deserialize)]
struct BlockEnvelope {
    #[serde(default)]
    header: BlockHeader,
}

#[derive(Debug, Default, Deserialize)]
struct BlockHeader {
    #[serde(default)]
    height: String,
}

/// Polls the REST latest-block endpoint and records height + latency.
pub struct ApiChecker {
    store: Arc<HeightStore>,
    client: reqwest::Client,
}

impl ApiChecker {
    pub fn new(store: Arc<HeightStore>) -> Result<Self, reqwest::Error> {
        Ok(Self { store, client: super::probe_client()? })
    }

    /// Performs one REST height probe against `node`.
    pub async fn check_node(&self, node: &NodeConfig, timeout: Duration) -> Result<(), CheckError> {
        if node.api.is_empty() {
            return Err(CheckError::MissingEndpoint("api"));
        }

        let url =
            format!("{}/cosmos/base/tendermint/v1beta1/blocks/latest", normalize_url(&node.api));

        let start = Instant::now();
        let result = self.probe(&url, timeout).await;
        let latency = start.elapsed();

        match result {
            Ok(height) => {
                self.store.update(
                    &node.network,
                    &node.name,
                    Protocol::Api,
                    height,
                    latency,
                    Source::Internal,
                );

                metrics::node_height(&node.network, &node.name, Protocol::Api, Source::Internal, height);
                metrics::node_latency(&node.network, &node.name, Protocol::Api, latency);
                metrics::node_available(&node.network, &node.name, Protocol::Api, true);

                tracing::debug!(
                    node = %node.name,
                    network = %node.network,
                    height,
                    latency_ms = latency.as_millis() as u64,
                    "api height check successful"
                );
                Ok(())
            }
            Err(e) => {
                metrics::height_check_error(&node.network, &node.name, Protocol::Api, e.kind());
                metrics::node_available(&node.network, &node.name, Protocol::Api, false);
                tracing::warn!(
                    node = %node.name,
                    network = %node.network,
                    error_kind = e.kind(),
                    error = %e,
                    "api height check failed"
                );
                Err(e)
            }
        }
    }

    async fn probe(&self, url: &str, timeout: Duration) -> Result<i64, CheckError> {
        let response = self.client.get(url).timeout(timeout).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CheckError::HttpStatus(status.as_u16()));
        }

        let body = response.bytes().await?;
        let parsed: LatestBlockResponse = serde_json::from_slice(&body)?;
        extract_height(&parsed)
    }
}

/// Reads `sdk_block.header.height`, falling back to `block.header.height`.
fn extract_height(response: &LatestBlockResponse) -> Result<i64, CheckError> {
    let raw = if response.sdk_block.header.height.is_empty() {
        &response.block.header.height
    } else {
        &response.sdk_block.header.height
    };

    if raw.is_empty() {
        return Err(CheckError::HeightMissing);
    }

    raw.parse::<i64>()
        .map_err(|source| CheckError::HeightParse { raw: raw.clone(), source })
}
