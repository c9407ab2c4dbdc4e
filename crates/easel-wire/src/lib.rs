//! easel-wire: Wire protocol and HTTP client for the diagram agent server
//!
//! This crate decodes the server's streamed event frames into typed events
//! and provides the HTTP client for session and render endpoints.

pub mod client;
pub mod decoder;
pub mod error;
pub mod events;
pub mod reader;

pub use client::{ApiClient, RenderArtifact, SessionInfo};
pub use error::{Error, Result};
pub use events::StreamEvent;
pub use reader::{FrameStream, ReaderConfig};
