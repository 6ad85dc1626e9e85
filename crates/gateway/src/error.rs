use tokio_tungstenite::tungstenite;

/// Errors from the gateway connection and controller.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not connected")]
    NotConnected,

    #[error("controller is closed")]
    Closed,

    #[error("timed out waiting for ready state")]
    ReadyTimeout,

    #[error("token must not be empty")]
    EmptyToken,

    #[error("invalid bearer token")]
    InvalidToken,

    #[error("asset resolver error: {0}")]
    Resolver(String),
}
