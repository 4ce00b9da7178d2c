//! Error types for the workout_core library.

use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for workout_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The session service answered with a non-success status
    #[error("Server returned status {status}")]
    Api { status: u16 },

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A queued network operation exhausted its retries
    #[error("Delivery failed after {attempts} attempts: {reason}")]
    Delivery { attempts: u32, reason: String },

    /// The delivery queue dropped the operation before it ran
    #[error("Delivery queue closed or cleared")]
    QueueClosed,
}
