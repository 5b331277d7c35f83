//! Status surface: health, readiness, metrics, and the control-plane
//! `/{network}/status` endpoint that peer rings poll for discovery.

use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use http::header::AUTHORIZATION;
use http::{HeaderValue, StatusCode};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;

use vigil_core::config::ConfigHandle;
use vigil_core::selector::Selector;
use vigil_core::types::Protocol;

/// Shared state behind the status routes.
#[derive(Clone)]
pub struct StatusState {
    pub selector: Arc<Selector>,
    pub config: Arc<ConfigHandle>,
    pub prometheus: PrometheusHandle,
}

/// Wire format peers consume: the ring's best height plus the endpoints this
/// deployment advertises for the network.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub height: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub api: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub rpc: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub grpc: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub grpc_insecure: bool,
}

/// Protocols the authenticated caller may see, stashed by the auth layer.
#[derive(Debug, Clone)]
struct AllowedProtocols(Vec<Protocol>);

/// Builds the status router. Health, readiness, and metrics stay open; the
/// per-network status endpoint goes through the bearer-token layer when auth
/// is enabled.
pub fn status_router(state: StatusState) -> Router {
    let status = Router::new()
        .route("/{network}/status", get(handle_status))
        .layer(axum::middleware::from_fn_with_state(state.clone(), auth_layer));

    Router::new()
        .route("/health", get(handle_health))
        .route("/ready", get(handle_ready))
        .route("/metrics", get(handle_metrics))
        .merge(status)
        .layer(axum::middleware::from_fn(request_id_layer))
        .with_state(state)
}

/// Honors an inbound `X-Request-ID` or generates one, and echoes it back so
/// peers can correlate control-plane calls.
async fn request_id_layer(req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_string);

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Bearer-token check for the status endpoint. Grants the user's capability
/// set to the handler; with auth disabled every enabled protocol is visible.
async fn auth_layer(
    State(state): State<StatusState>,
    mut req: Request,
    next: Next,
) -> Response {
    let cfg = state.config.snapshot();
    if !cfg.auth {
        return next.run(req).await;
    }

    let token = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = token else {
        return (StatusCode::UNAUTHORIZED, "Missing bearer token").into_response();
    };

    let Some(user) = cfg.find_user(token) else {
        tracing::warn!(path = req.uri().path(), "status request with invalid token");
        return (StatusCode::UNAUTHORIZED, "Invalid token").into_response();
    };

    let allowed: Vec<Protocol> = user
        .allowed_protocols()
        .into_iter()
        .filter(|&p| cfg.protocol_enabled(p))
        .collect();
    req.extensions_mut().insert(AllowedProtocols(allowed));
    next.run(req).await
}

async fn handle_health() -> &'static str {
    "OK"
}

/// Ready once anything is configured to watch; peers should not pull from a
/// ring that can never produce heights.
async fn handle_ready(State(state): State<StatusState>) -> Response {
    let cfg = state.config.snapshot();
    if cfg.internals.is_empty() && cfg.externals.is_empty() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Service not ready: no nodes configured")
            .into_response();
    }
    (StatusCode::OK, "Ready").into_response()
}

async fn handle_metrics(State(state): State<StatusState>) -> String {
    state.prometheus.render()
}

/// `GET /{network}/status` — the peer discovery wire format.
async fn handle_status(
    State(state): State<StatusState>,
    Path(network): Path<String>,
    req: Request,
) -> Response {
    let cfg = state.config.snapshot();
    let enabled = req
        .extensions()
        .get::<AllowedProtocols>()
        .map_or_else(|| cfg.enabled_protocols(), |allowed| allowed.0.clone());

    let heights = state.selector.highest_heights(&network, &enabled);
    if heights.is_empty() {
        return (
            StatusCode::NOT_FOUND,
            format!("No height data available for network: {network}"),
        )
            .into_response();
    }

    let height = heights.values().copied().max().unwrap_or(0);

    let mut response = StatusResponse {
        height,
        api: String::new(),
        rpc: String::new(),
        grpc: String::new(),
        grpc_insecure: false,
    };

    if let Some(network_cfg) = cfg.network(&network) {
        for &protocol in &enabled {
            match protocol {
                Protocol::Api => response.api = network_cfg.api.clone(),
                Protocol::Rpc => response.rpc = network_cfg.rpc.clone(),
                Protocol::Grpc => {
                    response.grpc = network_cfg.grpc.clone();
                    if !network_cfg.grpc.is_empty() {
                        response.grpc_insecure = network_cfg.grpc_insecure;
                    }
                }
            }
        }
    }

    tracing::debug!(
        network = %network,
        height = response.height,
        api = %response.api,
        rpc = %response.rpc,
        grpc = %response.grpc,
        "status request served"
    );

    Json(response).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http::Request as HttpRequest;
    use std::time::Duration;
    use tower::ServiceExt;
    use vigil_core::config::{NetworkConfig, NodeConfig, UserConfig, VigilConfig};
    use vigil_core::storage::{ExternalEndpointStore, HeightStore};
    use vigil_core::types::Source;

    fn test_config(auth: bool) -> VigilConfig {
        let mut cfg = VigilConfig::default();
        cfg.auth = auth;
        cfg.networks.push(NetworkConfig {
            name: "pocket".to_string(),
            api: "https://api.pocket.example.com".to_string(),
            api_listen: "0.0.0.0:8080".to_string(),
            rpc: "https://rpc.pocket.example.com".to_string(),
            rpc_listen: "0.0.0.0:8081".to_string(),
            grpc: "grpc.pocket.example.com:443".to_string(),
            grpc_listen: "0.0.0.0:8082".to_string(),
            grpc_insecure: true,
            grpc_max_recv_msg_size: 0,
            grpc_max_send_msg_size: 0,
        });
        cfg.internals.push(NodeConfig {
            name: "node-1".to_string(),
            network: "pocket".to_string(),
            api: "https://node-1.example.com:1317".to_string(),
            rpc: "https://node-1.example.com:26657".to_string(),
            grpc: "node-1.example.com:9090".to_string(),
            grpc_insecure: false,
        });
        if auth {
            cfg.users.push(UserConfig {
                name: "ops".to_string(),
                token: "good-token".to_string(),
                api: true,
                rpc: true,
                grpc: false,
            });
        }
        cfg
    }

    fn test_state(auth: bool) -> (StatusState, Arc<HeightStore>) {
        let heights = Arc::new(HeightStore::new());
        let endpoints = Arc::new(ExternalEndpointStore::new());
        let config = ConfigHandle::from_config(test_config(auth));
        let selector = Arc::new(Selector::new(heights.clone(), endpoints, config.clone()));
        let prometheus =
            metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder().handle();
        (StatusState { selector, config, prometheus }, heights)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_and_ready() {
        let (state, _) = test_state(false);
        let app = status_router(state);

        let response = app
            .clone()
            .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(HttpRequest::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (state, _) = test_state(false);
        let app = status_router(state);

        let response = app
            .oneshot(HttpRequest::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_wire_format() {
        let (state, heights) = test_state(false);
        heights.update(
            "pocket",
            "node-1",
            Protocol::Api,
            100,
            Duration::from_millis(50),
            Source::Internal,
        );
        heights.update(
            "pocket",
            "node-1",
            Protocol::Rpc,
            102,
            Duration::from_millis(50),
            Source::Internal,
        );

        let app = status_router(state);
        let response = app
            .oneshot(HttpRequest::get("/pocket/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["height"], 102);
        assert_eq!(json["api"], "https://api.pocket.example.com");
        assert_eq!(json["rpc"], "https://rpc.pocket.example.com");
        assert_eq!(json["grpc"], "grpc.pocket.example.com:443");
        assert_eq!(json["grpc_insecure"], true);
    }

    #[tokio::test]
    async fn test_status_unknown_network() {
        let (state, _) = test_state(false);
        let app = status_router(state);

        let response = app
            .oneshot(HttpRequest::get("/nowhere/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status_requires_token_when_auth_enabled() {
        let (state, heights) = test_state(true);
        heights.update(
            "pocket",
            "node-1",
            Protocol::Api,
            100,
            Duration::from_millis(50),
            Source::Internal,
        );
        let app = status_router(state);

        let response = app
            .clone()
            .oneshot(HttpRequest::get("/pocket/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(
                HttpRequest::get("/pocket/status")
                    .header("authorization", "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                HttpRequest::get("/pocket/status")
                    .header("authorization", "Bearer good-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_user_capabilities_restrict_advertised_endpoints() {
        let (state, heights) = test_state(true);
        heights.update(
            "pocket",
            "node-1",
            Protocol::Api,
            100,
            Duration::from_millis(50),
            Source::Internal,
        );
        heights.update(
            "pocket",
            "node-1",
            Protocol::Grpc,
            120,
            Duration::from_millis(50),
            Source::Internal,
        );
        let app = status_router(state);

        // The "ops" user lacks the grpc capability: gRPC heights and the
        // advertised gRPC endpoint must stay invisible.
        let response = app
            .oneshot(
                HttpRequest::get("/pocket/status")
                    .header("authorization", "Bearer good-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["height"], 100);
        assert!(json.get("grpc").is_none());
    }

    #[tokio::test]
    async fn test_request_id_echoed() {
        let (state, _) = test_state(false);
        let app = status_router(state);

        let response = app
            .clone()
            .oneshot(
                HttpRequest::get("/health")
                    .header("x-request-id", "my-id-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers()["x-request-id"], "my-id-123");

        let response = app
            .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let generated = response.headers()["x-request-id"].to_str().unwrap();
        assert!(uuid::Uuid::parse_str(generated).is_ok());
    }

    #[tokio::test]
    async fn test_ready_unavailable_without_nodes() {
        let (mut state, _) = test_state(false);
        let mut cfg = test_config(false);
        cfg.internals.clear();
        cfg.externals.clear();
        state.config = ConfigHandle::from_config(cfg);
        let app = status_router(state);

        let response = app
            .oneshot(HttpRequest::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
