//! Service error types.

use mdstream_core::{CoreError, Exchange};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    Invalid(#[from] CoreError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<mdstream_ws::WsError>),

    #[error("Auth error: {0}")]
    Auth(#[from] mdstream_auth::AuthError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] mdstream_telemetry::TelemetryError),

    #[error("{0} service is not running")]
    NotRunning(Exchange),

    #[error("{0} is not enabled")]
    ExchangeDisabled(Exchange),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<mdstream_ws::WsError> for ServiceError {
    fn from(e: mdstream_ws::WsError) -> Self {
        match e {
            mdstream_ws::WsError::Invalid(core) => Self::Invalid(core),
            other => Self::WebSocket(Box::new(other)),
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
