//! A logical message router built on [`weft`].
//!
//! Registered peers exchange unicast, multicast, broadcast, and correlated
//! request/response messages over a single multiplexed connection. The
//! router tracks per-client liveness, detects zombie connections, and fans
//! topology-change events out to subscribers.
//!
//! The pieces:
//!
//! - [`RouterCore`]: the registry, message bus, liveness monitor, and event
//!   distributor.
//! - [`router_contract`]: the `router` service (register / ping /
//!   get_online_clients / update_client_metadata / p2p / events) for any
//!   `weft` responder endpoint.
//! - [`RouterServer`]: a WebSocket server running one endpoint per
//!   connection over a shared core.
//! - [`RouterClient`]: the peer-side handle with request/response
//!   correlation and auto-heartbeat.
//! - [`ReconnectingClient`]: a reconnect wrapper that replays registration
//!   after connection loss.

pub mod client;
pub mod core;
pub mod message;
pub mod reconnect;
pub mod server;
pub mod service;

mod events;

pub use client::RouterClient;
pub use core::{RouterConfig, RouterCore};
pub use events::EventStream;
pub use message::{
    ClientInfo, ClientStatus, EventKind, MessageKind, RegisterRequest, RouterEvent, RouterMessage,
};
pub use reconnect::{BackoffStrategy, ConnectionState, ReconnectPolicy, ReconnectingClient};
pub use server::{RouterServer, RouterServerConfig};
pub use service::router_contract;
