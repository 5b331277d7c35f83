//! # Vigil Core
//!
//! Core library for vigil, a height-aware reverse proxy for Cosmos-SDK /
//! Tendermint blockchain nodes.
//!
//! A vigil deployment ("ring") fronts a pool of backend nodes speaking three
//! protocols (REST API, Tendermint JSON-RPC with WebSocket subscriptions, and
//! gRPC). Every client request is routed to whichever healthy backend is most
//! caught-up (highest block height) and, as a tiebreaker, fastest. Rings in
//! different regions discover each other over an HTTP control plane and share
//! candidate pools for cross-region failover.
//!
//! This crate provides:
//!
//! - **[`storage`]**: the two shared stores — per-node height/latency metrics
//!   and the peer-advertised endpoint state machine.
//!
//! - **[`checker`]**: the health-check engines (API, RPC, gRPC, external ring
//!   discovery + recovery) and the periodic scheduler that drives them on a
//!   bounded worker pool.
//!
//! - **[`selector`]**: candidate assembly and the (height, latency) ranking
//!   policy with threshold-based external failover.
//!
//! - **[`proxy`]**: the three forwarding planes — HTTP reverse proxy,
//!   WebSocket hijack tunnel, and transparent gRPC stream bridge.
//!
//! - **[`config`]**: declarative configuration with validation and atomic
//!   snapshot swapping on reload.
//!
//! - **[`metrics`]**: Prometheus metric emission for every plane.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Scheduler                           │
//! │   api / rpc / grpc checkers      external checker + recovery │
//! └────────────┬─────────────────────────────┬───────────────────┘
//!              ▼                             ▼
//!       ┌─────────────┐             ┌──────────────────┐
//!       │ HeightStore │             │  EndpointStore   │
//!       └──────┬──────┘             └────────┬─────────┘
//!              └────────────┬────────────────┘
//!                           ▼
//!                     ┌──────────┐
//!                     │ Selector │
//!                     └────┬─────┘
//!            ┌─────────────┼──────────────┐
//!            ▼             ▼              ▼
//!      ┌───────────┐ ┌───────────┐ ┌────────────┐
//!      │ API proxy │ │ RPC proxy │ │ gRPC proxy │
//!      │           │ │ + WS tun. │ │ (raw codec)│
//!      └───────────┘ └───────────┘ └────────────┘
//! ```
//!
//! Checkers write into the stores; on each client request a proxy consults
//! the selector, which reads both stores and returns an identifier plus a
//! target address. Proxies report upstream 5xx (or the gRPC equivalent) back
//! into the endpoint store's error counter, which drives the external
//! endpoint failure/recovery state machine.

pub mod checker;
pub mod config;
pub mod metrics;
pub mod proxy;
pub mod selector;
pub mod storage;
pub mod types;
