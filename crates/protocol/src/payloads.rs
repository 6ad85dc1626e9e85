//! Handshake payloads carried in the `d` field of gateway frames.

use serde::{Deserialize, Serialize};

/// Server greeting, first frame after the socket opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval: u64,
}

/// Device metadata sent with [`Identify`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: "lyrebird".to_string(),
            device: "lyrebird".to_string(),
        }
    }
}

/// Full handshake establishing a brand-new session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identify {
    pub token: String,
    pub properties: IdentifyProperties,
    pub intents: u64,
}

impl Identify {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            properties: IdentifyProperties::default(),
            intents: 0,
        }
    }
}

/// Abbreviated handshake continuing a previously interrupted session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resume {
    pub token: String,
    pub session_id: String,
    pub seq: u64,
}

/// Payload of the `READY` dispatch event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ready {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_gateway_url: Option<String>,
}
