//! Collaborator interface to the diagram agent server

use async_trait::async_trait;

use easel_wire::client::{ApiClient, RenderArtifact, SessionInfo};
use easel_wire::reader::FrameStream;

/// The server operations the engine consumes. Abstracted so tests can
/// substitute a scripted fake for the network.
#[async_trait]
pub trait DiagramApi: Send + Sync {
    /// Create a session, returning its id.
    async fn create_session(&self) -> easel_wire::Result<String>;

    /// Fetch session metadata.
    async fn get_session(&self, session_id: &str) -> easel_wire::Result<SessionInfo>;

    /// Delete a session on the server.
    async fn delete_session(&self, session_id: &str) -> easel_wire::Result<()>;

    /// Fetch a render artifact's bytes.
    async fn fetch_render(
        &self,
        session_id: &str,
        render_id: &str,
    ) -> easel_wire::Result<RenderArtifact>;

    /// Send a user message and open the response event stream.
    async fn send_message(&self, session_id: &str, text: &str)
    -> easel_wire::Result<FrameStream>;
}

#[async_trait]
impl DiagramApi for ApiClient {
    async fn create_session(&self) -> easel_wire::Result<String> {
        ApiClient::create_session(self).await
    }

    async fn get_session(&self, session_id: &str) -> easel_wire::Result<SessionInfo> {
        ApiClient::get_session(self, session_id).await
    }

    async fn delete_session(&self, session_id: &str) -> easel_wire::Result<()> {
        ApiClient::delete_session(self, session_id).await
    }

    async fn fetch_render(
        &self,
        session_id: &str,
        render_id: &str,
    ) -> easel_wire::Result<RenderArtifact> {
        ApiClient::fetch_render(self, session_id, render_id).await
    }

    async fn send_message(
        &self,
        session_id: &str,
        text: &str,
    ) -> easel_wire::Result<FrameStream> {
        ApiClient::send_message(self, session_id, text).await
    }
}
