//! Reverse proxy for the API and RPC planes.
//!
//! One instance serves one (network, protocol) listener. Plain requests are
//! forwarded through a pooled client with the configured response-header
//! deadline; WebSocket upgrades branch into the raw tunnel in
//! [`super::tunnel`]. Upstream 5xx and transport failures are reported into
//! the endpoint store when the selected candidate was external.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::Router;
use http::header::HeaderMap;
use http::StatusCode;

use super::is_hop_by_hop;
use crate::config::ConfigHandle;
use crate::metrics;
use crate::selector::Selector;
use crate::storage::ExternalEndpointStore;
use crate::types::{Protocol, EXTERNAL_PREFIX};

/// HTTP/RPC reverse proxy for one network.
pub struct HttpProxy {
    network: String,
    protocol: Protocol,
    selector: Arc<Selector>,
    endpoints: Arc<ExternalEndpointStore>,
    config: Arc<ConfigHandle>,
    client: reqwest::Client,
}

impl HttpProxy {
    /// Builds a proxy instance with its own pooled upstream client.
    pub fn new(
        network: String,
        protocol: Protocol,
        selector: Arc<Selector>,
        endpoints: Arc<ExternalEndpointStore>,
        config: Arc<ConfigHandle>,
    ) -> Result<Arc<Self>, reqwest::Error> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .pool_max_idle_per_host(100)
            .connect_timeout(std::time::Duration::from_secs(5))
            .tcp_keepalive(std::time::Duration::from_secs(30))
            .tcp_nodelay(true)
            .use_rustls_tls()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Arc::new(Self { network, protocol, selector, endpoints, config, client }))
    }

    /// Router that forwards every method and path through this proxy.
    #[must_use]
    pub fn router(self: Arc<Self>) -> Router {
        Router::new().fallback(handle).with_state(self)
    }

    pub(crate) fn network(&self) -> &str {
        &self.network
    }

    pub(crate) fn protocol(&self) -> Protocol {
        self.protocol
    }
}

/// Whether this request asks for a WebSocket upgrade.
pub(crate) fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let connection = headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let upgrade = headers
        .get(http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();
    connection.contains("upgrade") && upgrade == "websocket"
}

async fn handle(State(proxy): State<Arc<HttpProxy>>, req: Request) -> Response {
    let start = Instant::now();
    let cfg = proxy.config.snapshot();
    let timeout = cfg.proxy_timeout();

    let Some((node_metrics, node_name, decision)) =
        proxy.selector.best_node(&proxy.network, proxy.protocol)
    else {
        return (StatusCode::SERVICE_UNAVAILABLE, "No available nodes").into_response();
    };

    let Some(target) = proxy.selector.resolve_endpoint(&node_name, proxy.protocol) else {
        tracing::error!(
            node = %node_name,
            protocol = %proxy.protocol,
            "failed to resolve endpoint for selected node"
        );
        return (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response();
    };
    let is_external = node_name.starts_with(EXTERNAL_PREFIX);

    tracing::debug!(
        network = %proxy.network,
        protocol = %proxy.protocol,
        node = %node_name,
        target = %target,
        path = req.uri().path(),
        reason = decision.reason.as_str(),
        "routing decision made"
    );

    if is_websocket_upgrade(req.headers()) {
        // Reuse the metrics of the candidate already selected above instead
        // of asking the selector again: a second call could pick a different
        // node than the one whose URL we resolved.
        if !node_metrics.websocket_available {
            tracing::warn!(
                node = %node_name,
                network = %proxy.network,
                "selected node does not support websocket"
            );
            metrics::proxy_error(
                &proxy.network,
                &node_name,
                proxy.protocol,
                "503",
                "websocket_not_supported",
            );
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                "WebSocket not supported by selected backend",
            )
                .into_response();
        }
        return super::tunnel::proxy_websocket(proxy.clone(), req, &target, &node_name, start)
            .await;
    }

    let (parts, body) = req.into_parts();

    let path_and_query =
        parts.uri.path_and_query().map(http::uri::PathAndQuery::as_str).unwrap_or("/");
    let url = format!("{target}{path_and_query}");

    let mut outbound = proxy
        .client
        .request(parts.method.clone(), &url)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()));
    for (name, value) in &parts.headers {
        if is_hop_by_hop(name) || name == &http::header::HOST {
            continue;
        }
        outbound = outbound.header(name, value);
    }

    // The deadline covers response-header arrival only; the body streams
    // without an additional timeout and relies on client disconnect.
    let response = match tokio::time::timeout(timeout, outbound.send()).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            tracing::error!(
                node = %node_name,
                target = %url,
                error = %e,
                "upstream request failed"
            );
            metrics::proxy_error(&proxy.network, &node_name, proxy.protocol, "502", "upstream_error");
            if is_external {
                proxy.endpoints.track_proxy_error(&proxy.network, proxy.protocol, &target);
            }
            return (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response();
        }
        Err(_) => {
            tracing::error!(node = %node_name, target = %url, "upstream response headers timed out");
            metrics::proxy_error(&proxy.network, &node_name, proxy.protocol, "502", "header_timeout");
            if is_external {
                proxy.endpoints.track_proxy_error(&proxy.network, proxy.protocol, &target);
            }
            return (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response();
        }
    };

    let status = response.status();
    let status_label = status.as_u16().to_string();
    let duration = start.elapsed();

    metrics::proxy_request_duration(
        &proxy.network,
        &node_name,
        proxy.protocol,
        &status_label,
        duration,
    );
    metrics::node_request(&proxy.network, &node_name, proxy.protocol, parts.method.as_str());
    if let Some(len) = response.content_length() {
        metrics::proxy_response_bytes(&proxy.network, proxy.protocol, len);
    }

    if status.as_u16() >= 400 {
        metrics::proxy_error(&proxy.network, &node_name, proxy.protocol, &status_label, "http_error");
    }
    if status.as_u16() >= 500 && is_external {
        if proxy.endpoints.track_proxy_error(&proxy.network, proxy.protocol, &target) {
            tracing::info!(
                url = %target,
                network = %proxy.network,
                protocol = %proxy.protocol,
                status = status.as_u16(),
                "tracked upstream 5xx for external endpoint"
            );
        }
    }

    tracing::debug!(
        network = %proxy.network,
        node = %node_name,
        protocol = %proxy.protocol,
        method = %parts.method,
        status = status.as_u16(),
        duration_ms = duration.as_millis() as u64,
        reason = decision.reason.as_str(),
        "request proxied"
    );

    let mut builder = http::Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in response.headers() {
            if !is_hop_by_hop(name) {
                headers.insert(name.clone(), value.clone());
            }
        }
    }
    builder
        .body(Body::from_stream(response.bytes_stream()))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}
