//! Error taxonomy for the capture side.
//!
//! These cover transport and decode failures; order-level conditions
//! (rejections, expiry) live on the `Order` itself and are never Rust
//! errors.

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),
}
