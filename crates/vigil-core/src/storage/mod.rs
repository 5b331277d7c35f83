//! Shared in-memory stores.
//!
//! Two stores back the selection plane: [`HeightStore`] holds per-node height
//! and latency observations written by the internal health checkers, and
//! [`ExternalEndpointStore`] tracks peer-advertised endpoints through their
//! validation/failure/recovery state machine.
//!
//! Both stores serialize writers per key, never block concurrent readers on
//! unrelated keys, and hand out copies so callers cannot mutate shared state.
//! Locks are never held across I/O: callers copy candidate lists out first,
//! then probe or forward.

pub mod endpoints;
pub mod heights;

pub use endpoints::{EndpointKey, ExternalEndpoint, ExternalEndpointStore};
pub use heights::{HeightStore, NodeMetrics, LATENCY_WINDOW};
