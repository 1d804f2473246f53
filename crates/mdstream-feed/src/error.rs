//! Feed error types.

use mdstream_core::CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Invalid data: {0}")]
    InvalidData(#[from] CoreError),
}

pub type FeedResult<T> = Result<T, FeedError>;
