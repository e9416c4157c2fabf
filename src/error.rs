//! Error types, one enum per concern plus the `CallError` umbrella.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Media permission denied")]
    PermissionDenied,

    #[error("Media device unavailable: {0}")]
    Unavailable(String),

    #[error("Unsupported encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("Capture error: {0}")]
    Capture(String),
}

#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid signaling URL: {0}")]
    InvalidUrl(String),

    #[error("Signaling encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("WebRTC error: {0}")]
    Webrtc(#[from] webrtc::Error),

    #[error("Invalid negotiation state: {0}")]
    InvalidState(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected status: {0}")]
    Status(u16),

    #[error("Not found")]
    NotFound,
}

#[derive(Error, Debug)]
pub enum CallError {
    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Configuration error: {0}")]
    Config(String),
}
