//! Self-healing presence gateway client.
//!
//! Owns one WebSocket at a time, implements the handshake / heartbeat /
//! resume / reconnect state machine, delivers activity updates through a
//! conflated queue, and exposes the whole thing behind [`RpcController`].

pub mod backoff;
pub mod connection;
pub mod controller;
mod error;
pub mod queue;
pub mod session;
pub mod socket;
pub mod types;

pub use backoff::ReconnectConfig;
pub use connection::GatewayConnection;
pub use controller::{ControllerConfig, RpcController};
pub use error::GatewayError;
pub use socket::{Connector, WsConnector, WsMessage, WsStreamItem};
pub use types::{ActivitySpec, ConnectionState, GatewayConfig};
