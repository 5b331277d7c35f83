//! Health-check engines and the scheduler that drives them.
//!
//! All checkers share one contract: given a node descriptor and a deadline,
//! perform exactly one probe; on success write the observed height and
//! latency into the [`HeightStore`], on failure record a typed error counter,
//! clear the availability gauge, and return. No checker retries internally —
//! the scheduler's periodicity is the retry mechanism.
//!
//! [`HeightStore`]: crate::storage::HeightStore

use std::time::Duration;

use crate::config::NodeConfig;

pub mod api;
pub mod external;
pub mod grpc;
pub mod rpc;
pub mod scheduler;

pub use api::ApiChecker;
pub use external::ExternalChecker;
pub use grpc::GrpcChecker;
pub use rpc::RpcChecker;
pub use scheduler::Scheduler;

/// A single health-check probe failure.
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("node has no {0} endpoint configured")]
    MissingEndpoint(&'static str),

    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("unexpected status code: {0}")]
    HttpStatus(u16),

    #[error("failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("height not found in response")]
    HeightMissing,

    #[error("failed to parse height '{raw}': {source}")]
    HeightParse {
        raw: String,
        #[source]
        source: std::num::ParseIntError,
    },

    #[error("grpc call failed: {0}")]
    GrpcCall(#[from] tonic::Status),

    #[error("grpc connection failed: {0}")]
    GrpcConnect(#[from] tonic::transport::Error),

    #[error("probe timed out")]
    Timeout,

    #[error("external ring returned zero height")]
    ZeroHeight,

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl CheckError {
    /// Stable label for the per-kind error counters.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            CheckError::MissingEndpoint(_) => "missing_endpoint",
            CheckError::Network(e) => {
                if e.is_builder() {
                    "request_creation"
                } else if e.is_timeout() {
                    "timeout"
                } else if e.is_body() || e.is_decode() {
                    "read_body"
                } else {
                    "network"
                }
            }
            CheckError::HttpStatus(_) => "http_status",
            CheckError::JsonParse(_) => "json_parse",
            CheckError::HeightMissing => "height_missing",
            CheckError::HeightParse { .. } => "height_parse",
            CheckError::GrpcCall(_) => "grpc_call",
            CheckError::GrpcConnect(_) => "connection",
            CheckError::Timeout => "timeout",
            CheckError::ZeroHeight => "zero_height",
            CheckError::InvalidResponse(_) => "invalid_response",
        }
    }
}

/// The three internal checkers behind one dispatch surface, so the scheduler
/// can fan probes out uniformly.
pub enum Checker {
    Api(ApiChecker),
    Rpc(RpcChecker),
    Grpc(GrpcChecker),
}

impl Checker {
    /// Performs one probe against `node` under `timeout`.
    pub async fn check(&self, node: &NodeConfig, timeout: Duration) -> Result<(), CheckError> {
        match self {
            Checker::Api(c) => c.check_node(node, timeout).await,
            Checker::Rpc(c) => c.check_node(node, timeout).await,
            Checker::Grpc(c) => c.check_node(node, timeout).await,
        }
    }
}

/// Shared reqwest client tuned for probe traffic: small keepalive pool,
/// rustls, no redirects out of the pool's control.
pub(crate) fn probe_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .connect_timeout(Duration::from_secs(5))
        .tcp_keepalive(Duration::from_secs(30))
        .tcp_nodelay(true)
        .use_rustls_tls()
        .redirect(reqwest::redirect::Policy::none())
        .user_agent(concat!("vigil/", env!("CARGO_PKG_VERSION")))
        .build()
}
