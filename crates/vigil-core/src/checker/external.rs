//! Peer-ring discovery, endpoint validation, and failure recovery.
//!
//! For every configured external peer and every monitored network, the
//! checker asks each ring URL for `/{network}/status`, stores whatever
//! endpoints the ring advertises, and immediately probes them: HEAD for
//! api/rpc (any non-5xx counts, since 4xx is normal for endpoints that want
//! auth or specific paths), `GetLatestBlock` for gRPC. A separate recovery
//! pass re-probes failed endpoints on the discovery cadence without blocking
//! it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cosmos_sdk_proto::cosmos::base::tendermint::v1beta1::{
    service_client::ServiceClient, GetLatestBlockRequest,
};
use dashmap::DashMap;
use serde::Deserialize;
use tonic::transport::Channel;

use super::{grpc::build_channel, CheckError};
use crate::config::ExternalConfig;
use crate::metrics;
use crate::storage::{EndpointKey, ExternalEndpointStore};
use crate::types::Protocol;

/// Peer status wire format: `GET {ring}/{network}/status`.
#[derive(Debug, Deserialize)]
pub struct RingStatus {
    pub height: i64,
    #[serde(default)]
    pub api: String,
    #[serde(default)]
    pub rpc: String,
    #[serde(default)]
    pub grpc: String,
    #[serde(default)]
    pub grpc_insecure: bool,
}

/// Queries peer rings and drives the endpoint validation state machine.
pub struct ExternalChecker {
    endpoints: Arc<ExternalEndpointStore>,
    client: reqwest::Client,
    grpc_connections: DashMap<String, Channel>,
}

impl ExternalChecker {
    pub fn new(endpoints: Arc<ExternalEndpointStore>) -> Result<Self, reqwest::Error> {
        Ok(Self { endpoints, client: super::probe_client()?, grpc_connections: DashMap::new() })
    }

    /// Runs one discovery + validation pass for `external` on `network`,
    /// trying every configured ring URL.
    pub async fn check_external(
        &self,
        external: &ExternalConfig,
        network: &str,
        timeout: Duration,
    ) -> Result<(), CheckError> {
        if external.rings.is_empty() {
            return Err(CheckError::MissingEndpoint("rings"));
        }

        for ring in &external.rings {
            if let Err(e) = self.query_ring(external, ring, network, timeout).await {
                metrics::external_ring_error(&external.name, ring, e.kind());
                metrics::external_ring_available(&external.name, ring, false);
                tracing::warn!(
                    external = %external.name,
                    ring = %ring,
                    network,
                    error_kind = e.kind(),
                    error = %e,
                    "external ring check failed"
                );
            }
        }

        Ok(())
    }

    async fn query_ring(
        &self,
        external: &ExternalConfig,
        ring: &str,
        network: &str,
        timeout: Duration,
    ) -> Result<(), CheckError> {
        let base = ring.strip_suffix('/').unwrap_or(ring);
        let url = format!("{base}/{network}/status");

        let start = Instant::now();
        let mut request = self.client.get(&url).timeout(timeout);
        if !external.token.is_empty() {
            request = request.bearer_auth(&external.token);
        }

        let response = request.send().await?;
        let latency = start.elapsed();

        let status = response.status();
        if !status.is_success() {
            return Err(CheckError::HttpStatus(status.as_u16()));
        }

        let body = response.bytes().await?;
        let ring_status: RingStatus = serde_json::from_slice(&body)?;

        // A ring reporting height 0 is not ready; fail the probe for this
        // ring without touching any endpoint state.
        if ring_status.height == 0 {
            return Err(CheckError::ZeroHeight);
        }

        let mut advertised = Vec::new();
        for (protocol, advertised_url, insecure) in [
            (Protocol::Api, &ring_status.api, false),
            (Protocol::Rpc, &ring_status.rpc, false),
            (Protocol::Grpc, &ring_status.grpc, ring_status.grpc_insecure),
        ] {
            if advertised_url.is_empty() {
                continue;
            }
            advertised.push(protocol.as_str());

            let key = EndpointKey {
                external: external.name.clone(),
                ring: ring.to_string(),
                network: network.to_string(),
                protocol,
                url: advertised_url.clone(),
            };
            self.endpoints.store_advertised(&key, insecure);
            self.validate_endpoint(&key, ring_status.height, insecure, timeout).await;
        }

        metrics::external_ring_latency(&external.name, ring, latency);
        metrics::external_ring_available(&external.name, ring, true);

        tracing::debug!(
            external = %external.name,
            ring = %ring,
            network,
            height = ring_status.height,
            advertised = ?advertised,
            latency_ms = latency.as_millis() as u64,
            "external ring check successful"
        );

        Ok(())
    }

    /// Probes one advertised endpoint and records the verdict in the store.
    async fn validate_endpoint(
        &self,
        key: &EndpointKey,
        height: i64,
        grpc_insecure: bool,
        timeout: Duration,
    ) {
        let result = match key.protocol {
            Protocol::Api | Protocol::Rpc => self.validate_http(&key.url, timeout).await,
            Protocol::Grpc => self.validate_grpc(&key.url, grpc_insecure, timeout).await,
        };

        match result {
            Ok(latency) => {
                self.endpoints.mark_validated(key, height, latency);
            }
            Err(e) => {
                self.endpoints.mark_validation_failed(key);
                tracing::warn!(
                    external = %key.external,
                    ring = %key.ring,
                    network = %key.network,
                    protocol = %key.protocol,
                    url = %key.url,
                    error = %e,
                    "external endpoint validation failed"
                );
            }
        }
    }

    /// HEAD connectivity probe. Any non-5xx status counts as working.
    async fn validate_http(&self, url: &str, timeout: Duration) -> Result<Duration, CheckError> {
        let start = Instant::now();
        let response = self.client.head(url).timeout(timeout).send().await?;
        let latency = start.elapsed();

        if response.status().is_server_error() {
            return Err(CheckError::HttpStatus(response.status().as_u16()));
        }
        Ok(latency)
    }

    /// Full gRPC probe: `GetLatestBlock` must return a block with a header.
    async fn validate_grpc(
        &self,
        url: &str,
        insecure: bool,
        timeout: Duration,
    ) -> Result<Duration, CheckError> {
        let channel = self.grpc_connection(url, insecure)?;
        let mut client = ServiceClient::new(channel);

        let start = Instant::now();
        let response =
            tokio::time::timeout(timeout, client.get_latest_block(GetLatestBlockRequest {}))
                .await
                .map_err(|_| CheckError::Timeout)??;
        let latency = start.elapsed();

        let block = response.into_inner();
        let has_header = block.sdk_block.as_ref().is_some_and(|b| b.header.is_some());
        if !has_header {
            return Err(CheckError::InvalidResponse("missing block header".to_string()));
        }

        Ok(latency)
    }

    fn grpc_connection(&self, url: &str, insecure: bool) -> Result<Channel, CheckError> {
        if let Some(existing) = self.grpc_connections.get(url) {
            return Ok(existing.clone());
        }
        let channel = build_channel(url, insecure)?;
        self.grpc_connections.insert(url.to_string(), channel.clone());
        Ok(channel)
    }

    /// Re-probes every failed endpoint; success transitions it back to
    /// validated + working with a reset error counter. Runs on the discovery
    /// cadence but as an independent task so a slow probe never blocks
    /// discovery.
    pub async fn recover_failed(&self, timeout: Duration) {
        let failed = self.endpoints.get_failed();
        if failed.is_empty() {
            return;
        }

        tracing::debug!(count = failed.len(), "probing failed endpoints for recovery");

        for ep in failed {
            let result = match ep.protocol {
                Protocol::Api | Protocol::Rpc => self.validate_http(&ep.url, timeout).await,
                Protocol::Grpc => self.validate_grpc(&ep.url, ep.grpc_insecure, timeout).await,
            };

            let latency = match result {
                Ok(latency) => latency,
                Err(e) => {
                    tracing::debug!(
                        external = %ep.external,
                        network = %ep.network,
                        protocol = %ep.protocol,
                        url = %ep.url,
                        error = %e,
                        "failed endpoint still not working"
                    );
                    continue;
                }
            };

            let key = EndpointKey {
                external: ep.external.clone(),
                ring: ep.ring.clone(),
                network: ep.network.clone(),
                protocol: ep.protocol,
                url: ep.url.clone(),
            };
            self.endpoints.mark_validated(&key, ep.height, latency);
            metrics::external_endpoint_recovery(&ep.network, ep.protocol, &ep.external);

            tracing::info!(
                external = %ep.external,
                ring = %ep.ring,
                network = %ep.network,
                protocol = %ep.protocol,
                url = %ep.url,
                latency_ms = latency.as_millis() as u64,
                "failed endpoint has recovered"
            );
        }
    }

    /// Recomputes the aggregate endpoint gauges.
    pub fn update_endpoint_metrics(&self) {
        self.endpoints.update_aggregate_metrics();
    }

    /// Drops pooled gRPC channels.
    pub fn close(&self) {
        self.grpc_connections.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_status_parse_full() {
        let body = r#"{
            "height": 500,
            "api": "https://a.example.com",
            "rpc": "https://r.example.com",
            "grpc": "g.example.com:9090",
            "grpc_insecure": true
        }"#;
        let status: RingStatus = serde_json::from_str(body).unwrap();
        assert_eq!(status.height, 500);
        assert_eq!(status.api, "https://a.example.com");
        assert_eq!(status.grpc, "g.example.com:9090");
        assert!(status.grpc_insecure);
    }

    #[test]
    fn test_ring_status_parse_partial() {
        let status: RingStatus = serde_json::from_str(r#"{"height": 7}"#).unwrap();
        assert_eq!(status.height, 7);
        assert!(status.api.is_empty());
        assert!(status.rpc.is_empty());
        assert!(status.grpc.is_empty());
        assert!(!status.grpc_insecure);
    }

    #[tokio::test]
    async fn test_check_external_requires_rings() {
        let checker = ExternalChecker::new(Arc::new(ExternalEndpointStore::new())).unwrap();
        let external = ExternalConfig {
            name: "peer".to_string(),
            token: String::new(),
            rings: Vec::new(),
        };
        let err =
            checker.check_external(&external, "pocket", Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind(), "missing_endpoint");
    }

    #[tokio::test]
    async fn test_recover_failed_noop_when_empty() {
        let checker = ExternalChecker::new(Arc::new(ExternalEndpointStore::new())).unwrap();
        checker.recover_failed(Duration::from_millis(10)).await;
    }
}
