//! HTTP client for the diagram agent server

use futures::TryStreamExt;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::reader::{FrameStream, ReaderConfig, decode_stream};

/// Session metadata as reported by the server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub created_at: String,
    pub last_activity: String,
    pub message_count: usize,
    #[serde(default)]
    pub render_ids: Vec<String>,
    #[serde(default)]
    pub current_render_id: Option<String>,
}

/// A fetched render artifact
#[derive(Debug, Clone)]
pub struct RenderArtifact {
    pub bytes: Vec<u8>,
    pub media_type: String,
}

/// Client for the diagram agent's session and render endpoints
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    reader: ReaderConfig,
}

impl ApiClient {
    /// Create a client for the given server base URL (no trailing slash).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            reader: ReaderConfig::default(),
        }
    }

    /// Override the stream reader configuration.
    pub fn with_reader_config(mut self, reader: ReaderConfig) -> Self {
        self.reader = reader;
        self
    }

    /// Create a new conversation session, returning its id.
    pub async fn create_session(&self) -> Result<String> {
        #[derive(Deserialize)]
        struct Created {
            session_id: String,
        }

        let url = format!("{}/sessions", self.base_url);
        let resp = self.http.post(&url).send().await?;
        let resp = check_status(resp).await?;
        let created: Created = resp.json().await?;
        Ok(created.session_id)
    }

    /// Fetch session metadata.
    pub async fn get_session(&self, session_id: &str) -> Result<SessionInfo> {
        let url = format!("{}/sessions/{}", self.base_url, session_id);
        let resp = self.http.get(&url).send().await?;
        let resp = check_status(resp).await?;
        Ok(resp.json().await?)
    }

    /// Delete a session on the server.
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let url = format!("{}/sessions/{}", self.base_url, session_id);
        let resp = self.http.delete(&url).send().await?;
        check_status(resp).await?;
        Ok(())
    }

    /// Fetch a rendered artifact's bytes.
    pub async fn fetch_render(&self, session_id: &str, render_id: &str) -> Result<RenderArtifact> {
        let url = format!(
            "{}/sessions/{}/renders/{}",
            self.base_url, session_id, render_id
        );
        let resp = self.http.get(&url).send().await?;
        let resp = check_status(resp).await?;

        let media_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/png")
            .to_string();
        let bytes = resp.bytes().await?.to_vec();

        Ok(RenderArtifact { bytes, media_type })
    }

    /// Send a user message and open the response event stream.
    ///
    /// Fails with `Error::RequestFailed` if the server rejects the request;
    /// otherwise the returned stream yields decoded events strictly in
    /// arrival order.
    pub async fn send_message(&self, session_id: &str, text: &str) -> Result<FrameStream> {
        #[derive(Serialize)]
        struct Body<'a> {
            content: &'a str,
        }

        let url = format!("{}/sessions/{}/messages", self.base_url, session_id);
        let resp = self
            .http
            .post(&url)
            .json(&Body { content: text })
            .send()
            .await?;
        let resp = check_status(resp).await?;

        tracing::debug!(session = session_id, "opened event stream");

        let bytes = resp.bytes_stream().map_err(Error::Http);
        Ok(decode_stream(bytes, self.reader.clone()))
    }
}

/// Turn a non-success response into `Error::RequestFailed` with its body.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(Error::request_failed(status.as_u16(), body))
}
