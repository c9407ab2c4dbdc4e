//! Error types for easel-wire

use thiserror::Error;

/// Result type alias using easel-wire Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when talking to the diagram agent server
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed at the transport level
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The initiating request was rejected or had no usable body
    #[error("Stream request failed with status {status}: {body}")]
    RequestFailed { status: u16, body: String },

    /// A frame's data payload could not be decoded
    #[error("Stream decode error: {0}")]
    Decode(String),

    /// No bytes arrived within the configured stall timeout
    #[error("Stream stalled: no data received within the read timeout")]
    Stalled,
}

impl Error {
    /// Build a `RequestFailed` from a response status and body text.
    pub fn request_failed(status: u16, body: impl Into<String>) -> Self {
        Self::RequestFailed {
            status,
            body: body.into(),
        }
    }
}
