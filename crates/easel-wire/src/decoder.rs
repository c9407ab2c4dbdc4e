//! Incremental decoder for blank-line-separated event frames
//!
//! The server writes `event: <type>\ndata: <json>\n\n` frames into one long
//! response body. Network chunking is arbitrary: a chunk may end mid-line,
//! mid-frame, or carry several frames at once. The decoder buffers whatever
//! is incomplete and only emits whole frames, so a frame is never split or
//! duplicated regardless of where the chunk boundaries fall.

/// A complete frame extracted from the stream, not yet JSON-parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Event type from the `event:` line ("message" if absent)
    pub event: String,
    /// All `data:` lines joined with a newline
    pub data: String,
}

/// Incremental push parser for the event-stream framing.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Bytes carried over from a chunk that ended mid-line
    buf: Vec<u8>,
    /// Lines of the frame currently being assembled
    pending: Vec<String>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network chunk; returns every frame completed by it.
    ///
    /// Line boundaries are `\n` (a trailing `\r` is stripped, so CRLF
    /// streams decode identically). An empty line closes the current frame.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<RawFrame> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.buf.drain(..=pos).collect();
            // Lines end at an ASCII newline, so a complete line is always
            // complete UTF-8 even when the chunk split a multi-byte char.
            let mut line = String::from_utf8_lossy(&line_bytes[..line_bytes.len() - 1]).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                if let Some(frame) = assemble(std::mem::take(&mut self.pending)) {
                    frames.push(frame);
                }
            } else {
                self.pending.push(line);
            }
        }

        frames
    }

    /// Whether a partial frame is still buffered (stream ended mid-frame).
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty() || !self.pending.is_empty()
    }
}

/// Assemble buffered lines into a frame. Frames with no `data:` lines
/// (comments, keep-alives) produce nothing.
fn assemble(lines: Vec<String>) -> Option<RawFrame> {
    let mut event: Option<String> = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in &lines {
        if line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }

    if data_lines.is_empty() {
        return None;
    }

    Some(RawFrame {
        event: event.unwrap_or_else(|| "message".to_string()),
        data: data_lines.join("\n"),
    })
}
