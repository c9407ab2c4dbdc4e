//! Conversation data model: sessions, turns, and steps

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use easel_wire::client::RenderArtifact;
use easel_wire::events::{Redaction, ToolErrorInfo};

/// Display metadata for one conversation session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: String,
    pub title: String,
    /// Rendering backend inferred from tool usage
    #[serde(default)]
    pub backend: Option<String>,
    /// Number of prompt/response exchanges
    #[serde(default)]
    pub exchange_count: usize,
    /// Last activity, unix millis
    #[serde(default)]
    pub last_active_ms: i64,
}

impl SessionMeta {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: "New session".to_string(),
            backend: None,
            exchange_count: 0,
            last_active_ms: now_ms(),
        }
    }

    /// Format the last-active timestamp for display
    pub fn last_active_display(&self) -> String {
        use chrono::{TimeZone, Utc};
        Utc.timestamp_millis_opt(self.last_active_ms)
            .single()
            .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// One prompt/response exchange within a session
#[derive(Debug, Clone)]
pub struct Turn {
    pub id: String,
    /// Prompt text, immutable after creation
    pub prompt: String,
    /// Accumulating reply text
    pub reply: String,
    pub render_id: Option<String>,
    /// Process-local handle to the fetched render; never persisted
    pub render: Option<RenderHandle>,
    pub backend: Option<String>,
    pub validation: Option<Validation>,
    /// Tool invocations, insertion order significant
    pub steps: Vec<Step>,
    pub error: Option<String>,
    pub streaming: bool,
    pub created_at_ms: i64,
}

impl Turn {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            reply: String::new(),
            render_id: None,
            render: None,
            backend: None,
            validation: None,
            steps: Vec::new(),
            error: None,
            streaming: true,
            created_at_ms: now_ms(),
        }
    }
}

/// Validation verdict for a render
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    pub score: f64,
    pub passed: bool,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// Lifecycle of a step: created running, closed exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Running,
    Done,
}

/// Reported outcome of a step, separate from its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Ok,
    Error,
}

/// Tool input as recorded at `tool_start`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepInput {
    pub summary: String,
    #[serde(default)]
    pub full: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub truncated: bool,
}

/// Tool result as merged from `tool_result`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepOutput {
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub truncated: bool,
}

/// Structured failure attached to a step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepError {
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub stack_truncated: bool,
}

impl From<&ToolErrorInfo> for StepError {
    fn from(info: &ToolErrorInfo) -> Self {
        Self {
            name: info.name.clone(),
            message: info.message.clone(),
            stack: info.stack.clone(),
            stack_truncated: info.stack_truncated.unwrap_or(false),
        }
    }
}

/// One tool invocation recorded within a turn
#[derive(Debug, Clone)]
pub struct Step {
    pub id: String,
    pub tool: String,
    /// Human-readable label derived from the tool name
    pub label: String,
    /// External correlation id tying the result event to this step
    pub call_id: Option<String>,
    pub input: StepInput,
    pub output: StepOutput,
    pub outcome: Option<StepOutcome>,
    pub phase: StepPhase,
    pub started_at_ms: i64,
    pub ended_at_ms: Option<i64>,
    pub duration_ms: Option<u64>,
    pub redaction: Option<Redaction>,
    pub artifacts: Option<serde_json::Value>,
    pub error: Option<StepError>,
}

/// Process-local reference to a fetched render artifact.
///
/// Cheap to clone; cannot survive a reload, so it is re-resolved through
/// the render cache after every hydration.
#[derive(Debug, Clone)]
pub struct RenderHandle {
    pub media_type: String,
    pub bytes: Arc<Vec<u8>>,
}

impl RenderHandle {
    pub fn new(artifact: RenderArtifact) -> Self {
        Self {
            media_type: artifact.media_type,
            bytes: Arc::new(artifact.bytes),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Map a tool name to the rendering backend it implies, if any.
pub fn backend_for_tool(tool: &str) -> Option<&str> {
    tool.strip_prefix("render_")
}

/// Human label for a tool name.
pub fn label_for_tool(tool: &str) -> String {
    match backend_for_tool(tool) {
        Some(backend) => format!("Render ({backend})"),
        None if tool.starts_with("validate") => "Validate diagram".to_string(),
        None => tool.replace('_', " "),
    }
}

/// Current time in unix millis.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
