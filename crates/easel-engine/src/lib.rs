//! easel-engine: Conversation stream engine for the diagram agent client
//!
//! This crate folds the server's streamed events into a durable per-turn
//! timeline: the in-memory thread state, the coalescing persistence layer
//! with blob offload, the process-local render cache, and the engine that
//! orchestrates one user turn end to end.

pub mod api;
pub mod engine;
pub mod error;
pub mod model;
pub mod persist;
pub mod render;
pub mod store;
pub mod thread;

pub use api::DiagramApi;
pub use engine::{ConversationEngine, EngineEvent, TurnRef};
pub use error::{Error, Result};
pub use model::{RenderHandle, SessionMeta, Step, StepOutcome, StepPhase, Turn, Validation};
pub use persist::{PersistConfig, PersistenceCoordinator};
pub use render::RenderCache;
pub use store::{
    BlobStore, FsBlobStore, FsSnapshotStore, MemoryBlobStore, MemorySnapshotStore, SnapshotStore,
    StoreError,
};
pub use thread::ThreadState;
