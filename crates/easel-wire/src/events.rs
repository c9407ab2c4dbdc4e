//! Typed stream events and their payloads

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Events emitted by the server while a turn is streaming
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental reply text
    TextDelta(TextDelta),
    /// A tool invocation began
    ToolStart(ToolStart),
    /// A tool invocation finished
    ToolResult(ToolResult),
    /// A rendered artifact became available
    RenderReady(RenderReady),
    /// Validation of a render completed
    ValidateResult(ValidateResult),
    /// The turn finished normally
    TurnComplete(TurnComplete),
    /// The turn failed
    Error(ErrorEvent),
    /// An event type this client does not recognize
    Unknown {
        event: String,
        data: serde_json::Value,
    },
}

impl StreamEvent {
    /// Parse a decoded frame into a typed event.
    ///
    /// Unrecognized event names are preserved as `Unknown` so newer servers
    /// do not break older clients. Invalid JSON or a payload missing its
    /// required fields is a decode error.
    pub fn parse(event: &str, data: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(data)
            .map_err(|e| Error::Decode(format!("invalid JSON in '{event}' frame: {e}")))?;

        let parsed = match event {
            "text_delta" => serde_json::from_value(value).map(StreamEvent::TextDelta),
            "tool_start" => serde_json::from_value(value).map(StreamEvent::ToolStart),
            "tool_result" => serde_json::from_value(value).map(StreamEvent::ToolResult),
            "render_ready" => serde_json::from_value(value).map(StreamEvent::RenderReady),
            "validate_result" => serde_json::from_value(value).map(StreamEvent::ValidateResult),
            "turn_complete" => serde_json::from_value(value).map(StreamEvent::TurnComplete),
            "error" => serde_json::from_value(value).map(StreamEvent::Error),
            other => {
                return Ok(StreamEvent::Unknown {
                    event: other.to_string(),
                    data: value,
                });
            }
        };

        parsed.map_err(|e| Error::Decode(format!("malformed '{event}' payload: {e}")))
    }

    /// Check if this event terminates the turn
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::TurnComplete(_) | StreamEvent::Error(_))
    }
}

/// Payload of a `text_delta` event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextDelta {
    pub delta: String,
}

/// Payload of a `tool_start` event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolStart {
    pub tool: String,
    /// Short input summary suitable for display
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub tool_use_id: Option<String>,
    #[serde(default)]
    pub ts_ms: Option<i64>,
    #[serde(default)]
    pub input_full: Option<String>,
    #[serde(default)]
    pub input_full_size_bytes: Option<u64>,
    #[serde(default)]
    pub input_truncated: Option<bool>,
    #[serde(default)]
    pub redaction: Option<Redaction>,
    /// Wire-level frame size, informational only
    #[serde(default)]
    pub size: Option<u64>,
}

/// Payload of a `tool_result` event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool: String,
    #[serde(default)]
    pub tool_use_id: Option<String>,
    #[serde(default)]
    pub ts_ms: Option<i64>,
    /// Outcome: "ok" or "error"
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub result_summary: Option<String>,
    #[serde(default)]
    pub result_text: Option<String>,
    #[serde(default)]
    pub result_text_size_bytes: Option<u64>,
    #[serde(default)]
    pub result_truncated: Option<bool>,
    #[serde(default)]
    pub error: Option<ToolErrorInfo>,
    #[serde(default)]
    pub artifacts: Option<serde_json::Value>,
    #[serde(default)]
    pub redaction: Option<Redaction>,
    #[serde(default)]
    pub size: Option<u64>,
}

/// Payload of a `render_ready` event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderReady {
    pub render_id: String,
    pub backend: String,
}

/// Payload of a `validate_result` event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateResult {
    pub render_id: String,
    pub score: f64,
    pub passed: bool,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// Payload of a `turn_complete` event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnComplete {
    pub reply: String,
    #[serde(default)]
    pub render_id: Option<String>,
}

/// Payload of an `error` event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub message: String,
}

/// Redaction metadata attached to tool events
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Redaction {
    pub mode: String,
    pub applied: bool,
    pub rules: Vec<String>,
}

/// Structured tool failure carried on a `tool_result` event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolErrorInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub stack_truncated: Option<bool>,
}
