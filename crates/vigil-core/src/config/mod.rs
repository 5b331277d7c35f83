//! Declarative configuration with validation and atomic snapshot swapping.
//!
//! Configuration is loaded from a TOML file with `VIGIL`-prefixed environment
//! overrides (`__` as separator, e.g. `VIGIL__TIMEOUTS__PROXY=120`). The
//! current snapshot lives behind an [`arc_swap::ArcSwap`]: readers grab an
//! `Arc` and keep using it for the duration of a request, reloads validate
//! the new document first and swap only on success, so an invalid reload
//! leaves the previous snapshot authoritative.
//!
//! # Example
//!
//! ```toml
//! api = true
//! rpc = true
//! grpc = true
//! listen = "0.0.0.0:3000"
//! external_failover_threshold = 2
//!
//! [timeouts]
//! health_check = 5
//! proxy = 60
//!
//! [[networks]]
//! name = "pocket"
//! api_listen = "0.0.0.0:8080"
//! rpc_listen = "0.0.0.0:8081"
//! grpc_listen = "0.0.0.0:8082"
//!
//! [[internals]]
//! name = "node-1"
//! network = "pocket"
//! rpc = "https://node-1.example.com:26657"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::types::Protocol;

/// Default gRPC message size cap (100 MiB) applied when a network leaves the
/// limit unset or zero.
pub const DEFAULT_GRPC_MSG_SIZE: usize = 100 * 1024 * 1024;

/// Errors produced while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Read(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Health-check and proxy timeouts, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// Per-probe deadline for health checks. Minimum 1 second.
    #[serde(default = "default_health_check_secs")]
    pub health_check: u64,

    /// Response-header deadline for proxied requests. Minimum 1 second.
    #[serde(default = "default_proxy_secs")]
    pub proxy: u64,
}

fn default_health_check_secs() -> u64 {
    5
}

fn default_proxy_secs() -> u64 {
    60
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self { health_check: default_health_check_secs(), proxy: default_proxy_secs() }
    }
}

/// Optional distributed cache settings. The cache itself is a collaborator
/// outside this crate; the section exists so deployments share one document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub uri: String,
}

/// Status-surface rate limiting parameters, consumed by the rate-limit
/// collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub requests_per_second: u32,
    #[serde(default)]
    pub burst: u32,
    #[serde(default)]
    pub trust_proxy: bool,
}

/// Per-network proxy listeners and the URLs this ring advertises to peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,

    /// Advertised API URL (what peers are told to connect to).
    #[serde(default)]
    pub api: String,
    #[serde(default = "default_api_listen")]
    pub api_listen: String,

    /// Advertised RPC URL.
    #[serde(default)]
    pub rpc: String,
    #[serde(default = "default_rpc_listen")]
    pub rpc_listen: String,

    /// Advertised gRPC target (`host:port`).
    #[serde(default)]
    pub grpc: String,
    #[serde(default = "default_grpc_listen")]
    pub grpc_listen: String,

    /// Whether the advertised gRPC endpoint (and backends without a per-node
    /// override) speaks plaintext.
    #[serde(default)]
    pub grpc_insecure: bool,

    /// Max inbound gRPC message size in bytes; 0 means the 100 MiB default.
    #[serde(default)]
    pub grpc_max_recv_msg_size: usize,
    /// Max outbound gRPC message size in bytes; 0 means the 100 MiB default.
    #[serde(default)]
    pub grpc_max_send_msg_size: usize,
}

fn default_api_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_rpc_listen() -> String {
    "0.0.0.0:8081".to_string()
}

fn default_grpc_listen() -> String {
    "0.0.0.0:8082".to_string()
}

impl NetworkConfig {
    /// Effective gRPC (recv, send) message size caps.
    #[must_use]
    pub fn grpc_message_sizes(&self) -> (usize, usize) {
        let recv = if self.grpc_max_recv_msg_size == 0 {
            DEFAULT_GRPC_MSG_SIZE
        } else {
            self.grpc_max_recv_msg_size
        };
        let send = if self.grpc_max_send_msg_size == 0 {
            DEFAULT_GRPC_MSG_SIZE
        } else {
            self.grpc_max_send_msg_size
        };
        (recv, send)
    }
}

/// One internal node in this ring's pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub network: String,
    #[serde(default)]
    pub api: String,
    #[serde(default)]
    pub rpc: String,
    #[serde(default)]
    pub grpc: String,
    /// Whether this node's gRPC endpoint speaks plaintext.
    #[serde(default)]
    pub grpc_insecure: bool,
}

impl NodeConfig {
    /// Configured URL for one protocol plane, empty when not configured.
    #[must_use]
    pub fn endpoint(&self, protocol: Protocol) -> &str {
        match protocol {
            Protocol::Api => &self.api,
            Protocol::Rpc => &self.rpc,
            Protocol::Grpc => &self.grpc,
        }
    }
}

/// A peer deployment: one name, a shared bearer token, one or more ring URLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalConfig {
    pub name: String,
    #[serde(default)]
    pub token: String,
    pub rings: Vec<String>,
}

/// A status-surface user with per-protocol capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub name: String,
    pub token: String,
    #[serde(default)]
    pub api: bool,
    #[serde(default)]
    pub rpc: bool,
    #[serde(default)]
    pub grpc: bool,
}

impl UserConfig {
    #[must_use]
    pub fn allowed_protocols(&self) -> Vec<Protocol> {
        let mut protocols = Vec::new();
        if self.api {
            protocols.push(Protocol::Api);
        }
        if self.rpc {
            protocols.push(Protocol::Rpc);
        }
        if self.grpc {
            protocols.push(Protocol::Grpc);
        }
        protocols
    }
}

/// Root configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VigilConfig {
    #[serde(default = "default_true")]
    pub api: bool,
    #[serde(default = "default_true")]
    pub rpc: bool,
    #[serde(default = "default_true")]
    pub grpc: bool,

    /// Whether the status surface requires bearer-token authentication.
    #[serde(default)]
    pub auth: bool,

    /// Status surface listen address.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Externals are admitted as candidates only when their best height leads
    /// the best internal height by more than this many blocks (or no healthy
    /// internal exists).
    #[serde(default = "default_failover_threshold")]
    pub external_failover_threshold: i64,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub networks: Vec<NetworkConfig>,

    #[serde(default)]
    pub internals: Vec<NodeConfig>,

    #[serde(default)]
    pub externals: Vec<ExternalConfig>,

    #[serde(default)]
    pub users: Vec<UserConfig>,
}

fn default_true() -> bool {
    true
}

fn default_listen() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_failover_threshold() -> i64 {
    2
}

impl Default for VigilConfig {
    fn default() -> Self {
        Self {
            api: true,
            rpc: true,
            grpc: true,
            auth: false,
            listen: default_listen(),
            external_failover_threshold: default_failover_threshold(),
            timeouts: TimeoutsConfig::default(),
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
            networks: Vec::new(),
            internals: Vec::new(),
            externals: Vec::new(),
            users: Vec::new(),
        }
    }
}

impl VigilConfig {
    /// Which protocol planes are globally enabled.
    #[must_use]
    pub fn enabled_protocols(&self) -> Vec<Protocol> {
        let mut protocols = Vec::new();
        if self.api {
            protocols.push(Protocol::Api);
        }
        if self.rpc {
            protocols.push(Protocol::Rpc);
        }
        if self.grpc {
            protocols.push(Protocol::Grpc);
        }
        protocols
    }

    #[must_use]
    pub fn protocol_enabled(&self, protocol: Protocol) -> bool {
        match protocol {
            Protocol::Api => self.api,
            Protocol::Rpc => self.rpc,
            Protocol::Grpc => self.grpc,
        }
    }

    /// Per-probe health-check deadline. Floored at one second so a typo can
    /// never turn every probe into an instant timeout.
    #[must_use]
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.health_check.max(1))
    }

    /// Response-header deadline for proxied requests.
    #[must_use]
    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.proxy.max(1))
    }

    #[must_use]
    pub fn network(&self, name: &str) -> Option<&NetworkConfig> {
        self.networks.iter().find(|n| n.name == name)
    }

    #[must_use]
    pub fn node(&self, name: &str) -> Option<&NodeConfig> {
        self.internals.iter().find(|n| n.name == name)
    }

    /// All distinct network names drawn from both the network list and the
    /// internal node inventory, so externals-only deployments still discover.
    #[must_use]
    pub fn all_networks(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .networks
            .iter()
            .map(|n| n.name.clone())
            .chain(self.internals.iter().map(|n| n.network.clone()))
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Looks up a user by bearer token using constant-time comparison.
    #[must_use]
    pub fn find_user(&self, token: &str) -> Option<&UserConfig> {
        self.users
            .iter()
            .find(|user| user.token.as_bytes().ct_eq(token.as_bytes()).into())
    }

    /// Whether a gRPC dial to `node_name` should skip TLS: per-node flag when
    /// the node is known, otherwise the network-level flag.
    #[must_use]
    pub fn grpc_insecure_for(&self, network: &str, node_name: &str) -> bool {
        if let Some(node) = self.node(node_name) {
            return node.grpc_insecure;
        }
        self.network(network).is_some_and(|n| n.grpc_insecure)
    }

    /// Validates structural constraints; called on every load and reload.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_listen(&self.listen, "listen")?;

        if self.timeouts.health_check == 0 {
            return Err(ConfigError::Invalid("timeouts.health_check cannot be zero".into()));
        }
        if self.timeouts.proxy == 0 {
            return Err(ConfigError::Invalid("timeouts.proxy cannot be zero".into()));
        }
        if self.external_failover_threshold < 0 {
            return Err(ConfigError::Invalid(
                "external_failover_threshold cannot be negative".into(),
            ));
        }

        if self.networks.is_empty() {
            return Err(ConfigError::Invalid("at least one network must be configured".into()));
        }
        if self.internals.is_empty() && self.externals.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one internal node or external ring must be configured".into(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        let mut listens: std::collections::HashMap<&str, &str> = std::collections::HashMap::new();
        for network in &self.networks {
            if network.name.is_empty() {
                return Err(ConfigError::Invalid("network name cannot be empty".into()));
            }
            if !names.insert(network.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate network name '{}'",
                    network.name
                )));
            }

            for (enabled, listen, field) in [
                (self.api, network.api_listen.as_str(), "api_listen"),
                (self.rpc, network.rpc_listen.as_str(), "rpc_listen"),
                (self.grpc, network.grpc_listen.as_str(), "grpc_listen"),
            ] {
                if !enabled {
                    continue;
                }
                if listen.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "network '{}': {field} cannot be empty when the protocol is enabled",
                        network.name
                    )));
                }
                validate_listen(listen, field)?;
                if let Some(other) = listens.insert(listen, network.name.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "network '{}': {field} '{listen}' conflicts with network '{other}'",
                        network.name
                    )));
                }
            }

            if !network.api.is_empty() {
                validate_url(&network.api, "advertised api")?;
            }
            if !network.rpc.is_empty() {
                validate_url(&network.rpc, "advertised rpc")?;
            }
            if !network.grpc.is_empty() && !network.grpc.contains(':') {
                return Err(ConfigError::Invalid(format!(
                    "network '{}': advertised grpc endpoint must include a port",
                    network.name
                )));
            }
        }

        for node in &self.internals {
            if node.name.is_empty() {
                return Err(ConfigError::Invalid("internal node name cannot be empty".into()));
            }
            if node.network.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "internal node '{}': network cannot be empty",
                    node.name
                )));
            }
            if node.api.is_empty() && node.rpc.is_empty() && node.grpc.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "internal node '{}': at least one endpoint must be configured",
                    node.name
                )));
            }
            if !node.api.is_empty() {
                validate_url(&node.api, "api")?;
            }
            if !node.rpc.is_empty() {
                validate_url(&node.rpc, "rpc")?;
            }
            if !node.grpc.is_empty() && !node.grpc.contains(':') {
                return Err(ConfigError::Invalid(format!(
                    "internal node '{}': grpc endpoint must include a port",
                    node.name
                )));
            }
        }

        for external in &self.externals {
            if external.name.is_empty() {
                return Err(ConfigError::Invalid("external name cannot be empty".into()));
            }
            if external.rings.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "external '{}': at least one ring URL must be configured",
                    external.name
                )));
            }
            for ring in &external.rings {
                validate_url(ring, "ring")?;
            }
        }

        if self.auth && self.users.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one user must be configured when auth is enabled".into(),
            ));
        }
        for user in &self.users {
            if user.name.is_empty() {
                return Err(ConfigError::Invalid("user name cannot be empty".into()));
            }
            if user.token.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "user '{}': token cannot be empty",
                    user.name
                )));
            }
            if !user.api && !user.rpc && !user.grpc {
                return Err(ConfigError::Invalid(format!(
                    "user '{}': at least one permission must be granted",
                    user.name
                )));
            }
        }

        Ok(())
    }
}

fn validate_listen(addr: &str, field: &str) -> Result<(), ConfigError> {
    if addr.is_empty() {
        return Err(ConfigError::Invalid(format!("{field} address cannot be empty")));
    }
    if addr.parse::<std::net::SocketAddr>().is_err() {
        return Err(ConfigError::Invalid(format!("invalid {field} address: {addr}")));
    }
    Ok(())
}

fn validate_url(raw: &str, field: &str) -> Result<(), ConfigError> {
    let candidate = if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };
    let parsed = url::Url::parse(&candidate)
        .map_err(|e| ConfigError::Invalid(format!("invalid {field} URL '{raw}': {e}")))?;
    if parsed.host_str().is_none() {
        return Err(ConfigError::Invalid(format!("invalid {field} URL '{raw}': missing host")));
    }
    Ok(())
}

/// Handle to the live configuration snapshot.
///
/// Cloning the handle is cheap; `snapshot()` returns an immutable `Arc` that
/// stays valid for as long as the caller holds it, even across reloads.
pub struct ConfigHandle {
    current: ArcSwap<VigilConfig>,
    path: PathBuf,
}

impl ConfigHandle {
    /// Loads, validates, and installs the initial configuration.
    pub fn load(path: impl AsRef<Path>) -> Result<Arc<Self>, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let cfg = read_config(&path)?;

        tracing::info!(
            path = %path.display(),
            networks = cfg.networks.len(),
            internal_nodes = cfg.internals.len(),
            external_rings = cfg.externals.len(),
            users = cfg.users.len(),
            "configuration loaded"
        );

        Ok(Arc::new(Self { current: ArcSwap::from_pointee(cfg), path }))
    }

    /// Builds a handle around an in-memory config. Used by tests and
    /// embedding callers that manage their own document.
    #[must_use]
    pub fn from_config(cfg: VigilConfig) -> Arc<Self> {
        Arc::new(Self { current: ArcSwap::from_pointee(cfg), path: PathBuf::new() })
    }

    /// Current snapshot. Callers hold the `Arc` for the duration of a request
    /// and are never affected by concurrent reloads.
    #[must_use]
    pub fn snapshot(&self) -> Arc<VigilConfig> {
        self.current.load_full()
    }

    /// Re-reads the file and swaps in the new snapshot. A document that fails
    /// to parse or validate is rejected and the previous snapshot stays
    /// authoritative.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let cfg = read_config(&self.path)?;
        tracing::info!(
            networks = cfg.networks.len(),
            internal_nodes = cfg.internals.len(),
            external_rings = cfg.externals.len(),
            "configuration reloaded"
        );
        self.current.store(Arc::new(cfg));
        Ok(())
    }

    /// Spawns a polling watcher that reloads when the file's mtime changes.
    /// Reload failures are logged and the previous snapshot kept.
    pub fn spawn_watcher(
        self: &Arc<Self>,
        poll_interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let handle = Arc::clone(self);
        tokio::spawn(async move {
            let mut last_mtime = file_mtime(&handle.path);
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        let mtime = file_mtime(&handle.path);
                        if mtime != last_mtime {
                            last_mtime = mtime;
                            if let Err(e) = handle.reload() {
                                tracing::error!(error = %e, "configuration reload rejected, keeping previous snapshot");
                            }
                        }
                    }
                }
            }
        })
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn read_config(path: &Path) -> Result<VigilConfig, ConfigError> {
    let cfg: VigilConfig = Config::builder()
        .add_source(File::from(path).required(true))
        .add_source(Environment::with_prefix("VIGIL").separator("__"))
        .build()?
        .try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> VigilConfig {
        let mut cfg = VigilConfig::default();
        cfg.networks.push(NetworkConfig {
            name: "pocket".to_string(),
            api: String::new(),
            api_listen: "0.0.0.0:8080".to_string(),
            rpc: String::new(),
            rpc_listen: "0.0.0.0:8081".to_string(),
            grpc: String::new(),
            grpc_listen: "0.0.0.0:8082".to_string(),
            grpc_insecure: false,
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
        cfg
    }

    #[test]
    fn test_defaults() {
        let cfg = VigilConfig::default();
        assert!(cfg.api && cfg.rpc && cfg.grpc);
        assert!(!cfg.auth);
        assert_eq!(cfg.listen, "0.0.0.0:3000");
        assert_eq!(cfg.external_failover_threshold, 2);
        assert_eq!(cfg.timeouts.health_check, 5);
        assert_eq!(cfg.timeouts.proxy, 60);
    }

    #[test]
    fn test_toml_deserialization() {
        let doc = r#"
api = true
rpc = true
grpc = false
listen = "0.0.0.0:3000"

[timeouts]
health_check = 3
proxy = 30

[[networks]]
name = "pocket"
api = "https://api.pocket.example.com"
api_listen = "0.0.0.0:8080"
rpc_listen = "0.0.0.0:8081"

[[internals]]
name = "node-1"
network = "pocket"
rpc = "https://node-1.example.com:26657"

[[externals]]
name = "peer-west"
token = "secret"
rings = ["https://vigil.west.example.com:3000"]
"#;
        let cfg: VigilConfig = toml::from_str(doc).unwrap();
        assert!(!cfg.grpc);
        assert_eq!(cfg.timeouts.health_check, 3);
        assert_eq!(cfg.networks[0].name, "pocket");
        assert_eq!(cfg.networks[0].grpc_listen, "0.0.0.0:8082");
        assert_eq!(cfg.externals[0].rings.len(), 1);
        assert_eq!(cfg.enabled_protocols(), vec![Protocol::Api, Protocol::Rpc]);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_validation_rejects_no_networks() {
        let mut cfg = minimal_config();
        cfg.networks.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_timeouts() {
        let mut cfg = minimal_config();
        cfg.timeouts.health_check = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = minimal_config();
        cfg.timeouts.proxy = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_duplicate_listen() {
        let mut cfg = minimal_config();
        let mut second = cfg.networks[0].clone();
        second.name = "pocket-beta".to_string();
        cfg.networks.push(second);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("conflicts"));
    }

    #[test]
    fn test_validation_rejects_grpc_without_port() {
        let mut cfg = minimal_config();
        cfg.internals[0].grpc = "node-1.example.com".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_node_without_endpoints() {
        let mut cfg = minimal_config();
        cfg.internals[0].api = String::new();
        cfg.internals[0].rpc = String::new();
        cfg.internals[0].grpc = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_auth_requires_users() {
        let mut cfg = minimal_config();
        cfg.auth = true;
        assert!(cfg.validate().is_err());

        cfg.users.push(UserConfig {
            name: "ops".to_string(),
            token: "t".to_string(),
            api: true,
            rpc: false,
            grpc: false,
        });
        cfg.validate().unwrap();
    }

    #[test]
    fn test_validation_user_needs_permission() {
        let mut cfg = minimal_config();
        cfg.users.push(UserConfig {
            name: "ops".to_string(),
            token: "t".to_string(),
            api: false,
            rpc: false,
            grpc: false,
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_externals_only_config_is_valid() {
        let mut cfg = minimal_config();
        cfg.internals.clear();
        cfg.externals.push(ExternalConfig {
            name: "peer".to_string(),
            token: String::new(),
            rings: vec!["https://ring.example.com".to_string()],
        });
        cfg.validate().unwrap();
    }

    #[test]
    fn test_find_user_constant_time() {
        let mut cfg = minimal_config();
        cfg.users.push(UserConfig {
            name: "ops".to_string(),
            token: "secret-token".to_string(),
            api: true,
            rpc: true,
            grpc: false,
        });

        let user = cfg.find_user("secret-token").unwrap();
        assert_eq!(user.name, "ops");
        assert_eq!(user.allowed_protocols(), vec![Protocol::Api, Protocol::Rpc]);
        assert!(cfg.find_user("wrong").is_none());
        assert!(cfg.find_user("").is_none());
    }

    #[test]
    fn test_grpc_insecure_resolution() {
        let mut cfg = minimal_config();
        cfg.internals[0].grpc_insecure = true;
        cfg.networks[0].grpc_insecure = false;
        assert!(cfg.grpc_insecure_for("pocket", "node-1"));

        // Unknown node falls back to the network flag.
        cfg.networks[0].grpc_insecure = true;
        assert!(cfg.grpc_insecure_for("pocket", "nonexistent"));
        assert!(!cfg.grpc_insecure_for("nonexistent", "nonexistent"));
    }

    #[test]
    fn test_grpc_message_size_defaults() {
        let cfg = minimal_config();
        assert_eq!(
            cfg.networks[0].grpc_message_sizes(),
            (DEFAULT_GRPC_MSG_SIZE, DEFAULT_GRPC_MSG_SIZE)
        );

        let mut cfg = cfg;
        cfg.networks[0].grpc_max_recv_msg_size = 1024;
        assert_eq!(cfg.networks[0].grpc_message_sizes().0, 1024);
    }

    #[test]
    fn test_snapshot_survives_swap() {
        let handle = ConfigHandle::from_config(minimal_config());
        let before = handle.snapshot();

        let mut changed = minimal_config();
        changed.external_failover_threshold = 9;
        handle.current.store(Arc::new(changed));

        assert_eq!(before.external_failover_threshold, 2);
        assert_eq!(handle.snapshot().external_failover_threshold, 9);
    }

    #[test]
    fn test_all_networks_merges_internals() {
        let mut cfg = minimal_config();
        cfg.internals.push(NodeConfig {
            name: "node-2".to_string(),
            network: "pocket-beta".to_string(),
            api: "https://node-2.example.com".to_string(),
            rpc: String::new(),
            grpc: String::new(),
            grpc_insecure: false,
        });
        assert_eq!(cfg.all_networks(), vec!["pocket".to_string(), "pocket-beta".to_string()]);
    }
}
