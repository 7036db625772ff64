//! Protocol error types

use thiserror::Error;

/// Errors that can occur while encoding or decoding frames
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame exceeds the configured maximum size
    #[error("Frame too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Binary payload was not valid UTF-8
    #[error("Frame is not valid UTF-8")]
    InvalidUtf8,

    /// JSON (de)serialization error, including unknown frame types
    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),
}
