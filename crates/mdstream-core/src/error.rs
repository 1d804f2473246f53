//! Error types for mdstream-core.

use thiserror::Error;

/// Core error types.
///
/// All of these are validation failures: they are raised synchronously at
/// the call site and never retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("Invalid timeframe: {0}")]
    InvalidTimeframe(String),

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Non-finite value in field '{field}'")]
    NonFinite { field: &'static str },

    #[error("Order book out of order: {0}")]
    UnorderedBook(String),

    #[error("Empty credential: {0}")]
    EmptyCredential(String),

    #[error("Unknown exchange: {0}")]
    UnknownExchange(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
