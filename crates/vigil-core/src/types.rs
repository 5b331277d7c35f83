//! Shared type definitions used across stores, checkers, and proxies.

use serde::{Deserialize, Serialize};

/// Prefix that marks a selector identifier as an external candidate.
///
/// Internal candidates carry their configured node name; external candidates
/// carry this prefix followed by the advertised URL. The selector returns the
/// identifier opaquely and [`resolve_endpoint`] strips the prefix back off.
///
/// [`resolve_endpoint`]: crate::selector::Selector::resolve_endpoint
pub const EXTERNAL_PREFIX: &str = "ext:";

/// Backend protocol flavor.
///
/// Every store key, checker, and proxy is scoped to one of the three protocol
/// planes a Cosmos node exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// CosmosSDK REST API (default port 1317 on nodes, 8080 on the proxy).
    Api,
    /// Tendermint JSON-RPC, including the `/websocket` subscription endpoint.
    Rpc,
    /// CosmosSDK gRPC service.
    Grpc,
}

impl Protocol {
    /// All protocols, in the order they appear in configuration.
    pub const ALL: [Protocol; 3] = [Protocol::Api, Protocol::Rpc, Protocol::Grpc];

    /// Static label for metrics and log fields.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Api => "api",
            Protocol::Rpc => "rpc",
            Protocol::Grpc => "grpc",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a height observation came from our own pool or a peer ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Internal,
    External,
}

impl Source {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Internal => "internal",
            Source::External => "external",
        }
    }
}

/// Normalizes a configured HTTP(S) URL: strips a trailing slash and prepends
/// `https://` when the string does not already start with a scheme.
///
/// gRPC targets (`host:port`) are never passed through this.
#[must_use]
pub fn normalize_url(url: &str) -> String {
    let url = url.strip_suffix('/').unwrap_or(url);
    if url.is_empty() {
        return String::new();
    }
    if !url.starts_with('h') {
        return format!("https://{url}");
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_labels() {
        assert_eq!(Protocol::Api.as_str(), "api");
        assert_eq!(Protocol::Rpc.as_str(), "rpc");
        assert_eq!(Protocol::Grpc.as_str(), "grpc");
        assert_eq!(Protocol::Grpc.to_string(), "grpc");
    }

    #[test]
    fn test_protocol_serde_roundtrip() {
        let p: Protocol = serde_json::from_str("\"rpc\"").unwrap();
        assert_eq!(p, Protocol::Rpc);
        assert_eq!(serde_json::to_string(&Protocol::Api).unwrap(), "\"api\"");
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("https://node.example.com/"), "https://node.example.com");
        assert_eq!(normalize_url("http://node.example.com"), "http://node.example.com");
        assert_eq!(normalize_url("node.example.com:1317"), "https://node.example.com:1317");
        assert_eq!(normalize_url(""), "");
    }
}
