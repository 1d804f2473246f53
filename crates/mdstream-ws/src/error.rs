//! WebSocket error types.

use mdstream_core::CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WsError {
    #[error("Connection timed out after {0} ms")]
    ConnectTimeout(u64),

    #[error("Rate limit exceeded: waited {waited_ms} ms for a token")]
    RateLimitExceeded { waited_ms: u64 },

    #[error("Endpoint resolution failed: {0}")]
    Endpoint(String),

    #[error("Invalid input: {0}")]
    Invalid(#[from] CoreError),

    #[error("Tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),
}

impl WsError {
    /// Transient errors are retried by the reconnection scheduler and never
    /// surface to consumers as failures.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Invalid(_))
    }
}

pub type WsResult<T> = Result<T, WsError>;

/// Failure to adapt a single inbound frame.
///
/// Frame errors are logged and the frame skipped; they never tear down
/// the session.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid number in '{field}': {value}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("Invalid record: {0}")]
    InvalidRecord(#[from] CoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
