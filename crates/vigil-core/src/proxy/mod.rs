//! The three forwarding planes.
//!
//! Every proxy consults the [`Selector`] on each request, resolves the
//! winning identifier to a target address, forwards bytes without
//! interpreting them, and reports upstream 5xx (or the gRPC equivalent) into
//! the endpoint store's error counter when the candidate was external.
//!
//! [`Selector`]: crate::selector::Selector

pub mod codec;
pub mod grpc;
pub mod http;
pub mod tunnel;

pub use grpc::GrpcProxy;
pub use http::HttpProxy;

/// Hop-by-hop headers that must not be forwarded between client and backend.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Whether a header is hop-by-hop (per RFC 9110) and owned by each
/// connection rather than the end-to-end exchange.
pub(crate) fn is_hop_by_hop(name: &::http::HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}
