//! Error types for easel-engine

use thiserror::Error;

/// Result type alias using easel-engine Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the conversation engine
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the wire layer
    #[error(transparent)]
    Wire(#[from] easel_wire::Error),

    /// A session could not be created or addressed
    #[error("session error: {0}")]
    Session(String),
}
