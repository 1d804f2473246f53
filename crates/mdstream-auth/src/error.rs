//! Auth error types.

use mdstream_core::CoreError;
use mdstream_ws::WsError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Bullet response rejected: code {code}")]
    Rejected { code: String },

    #[error("Bullet response has no instance servers")]
    NoInstanceServer,

    #[error("Invalid credential: {0}")]
    Invalid(#[from] CoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AuthError {
    /// Validation failures are not worth retrying.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Invalid(_))
    }
}

impl From<AuthError> for WsError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Invalid(core) => WsError::Invalid(core),
            other => WsError::Endpoint(other.to_string()),
        }
    }
}

pub type AuthResult<T> = Result<T, AuthError>;
