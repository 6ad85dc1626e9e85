//! Public types for the gateway client.

use std::time::Duration;

use lyrebird_protocol::presence::Button;

use crate::backoff::ReconnectConfig;

/// Well-known gateway URL; protocol version and encoding ride as query
/// parameters.
pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

/// Connection state of the gateway. Exactly one value is current at any
/// instant.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Never connected.
    Idle,
    /// Socket dial and handshake in progress.
    Connecting,
    /// Handshake complete, session ready.
    Connected,
    /// Connection lost, attempting to reconnect.
    Reconnecting { attempt: u32 },
    /// Socket closed.
    Disconnected { reason: String },
    /// A connect or send attempt failed; the reconnect loop continues.
    Error { cause: String },
    /// `close()` was requested; no further reconnects.
    Closing,
}

/// Configuration for the gateway connection.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Gateway URL dialed for fresh sessions; a server-supplied resume
    /// URL takes precedence when one is known.
    pub url: String,
    /// How long the presence queue waits for the connection to become
    /// ready before treating a delivery attempt as failed.
    pub ready_timeout: Duration,
    /// Backoff policy shared by reconnection and presence delivery.
    pub reconnect: ReconnectConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_GATEWAY_URL.to_string(),
            ready_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Caller-supplied activity description: the library item mapped into a
/// wire-level presence by the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivitySpec {
    /// Activity name (track title).
    pub name: String,
    pub state: Option<String>,
    pub details: Option<String>,
    /// Image references: external URLs or already-remote asset ids.
    pub large_image: Option<String>,
    pub small_image: Option<String>,
    pub large_text: Option<String>,
    pub small_text: Option<String>,
    /// At most two are used.
    pub buttons: Vec<Button>,
    /// Epoch milliseconds.
    pub start: Option<i64>,
    pub end: Option<i64>,
    /// Overrides the controller-level application id when set.
    pub application_id: Option<String>,
    /// Numeric activity type (0 = playing, 2 = listening).
    pub activity_type: u8,
    /// Online-status string.
    pub status: String,
}

impl Default for ActivitySpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            state: None,
            details: None,
            large_image: None,
            small_image: None,
            large_text: None,
            small_text: None,
            buttons: Vec::new(),
            start: None,
            end: None,
            application_id: None,
            activity_type: 0,
            status: "online".to_string(),
        }
    }
}

/// Current wall-clock time in epoch milliseconds.
pub(crate) fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
