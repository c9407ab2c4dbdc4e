//! Persistence: versioned snapshots, blob offload, and write coalescing
//!
//! The primary store has small practical capacity and coarse writes, so
//! the coordinator never writes per mutation. A trailing-edge timer folds
//! a burst of mutations into one snapshot, an in-flight/queued pair acts
//! as a single-writer lock (exactly one follow-up write after an
//! in-flight one), and any string field above the inline threshold is
//! offloaded to the blob store under a content-addressed key.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::model::{
    SessionMeta, Step, StepError, StepInput, StepOutcome, StepOutput, StepPhase, Turn, Validation,
};
use crate::store::{BlobStore, SnapshotStore};
use crate::thread::{SessionThread, ThreadState};

/// Current persisted schema version
pub const SCHEMA_VERSION: u32 = 2;

/// Tunables for the persistence layer
#[derive(Debug, Clone)]
pub struct PersistConfig {
    /// String fields longer than this many bytes go to the blob store
    pub inline_limit: usize,
    /// Trailing-edge delay collapsing mutation bursts into one write
    pub flush_delay: Duration,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            inline_limit: 4096,
            flush_delay: Duration::from_millis(250),
        }
    }
}

// ---- Persisted shapes ----

/// A string field that is either stored inline or offloaded to a blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredText {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

impl StoredText {
    fn inline(value: impl Into<String>) -> Self {
        Self {
            inline: Some(value.into()),
            blob: None,
        }
    }

    fn absent() -> Self {
        Self::default()
    }

    /// Resolve against fetched blobs. `None` means absent or unresolved.
    fn resolve(&self, blobs: &HashMap<String, String>) -> Option<String> {
        if let Some(v) = &self.inline {
            return Some(v.clone());
        }
        let key = self.blob.as_ref()?;
        let resolved = blobs.get(key).cloned();
        if resolved.is_none() {
            tracing::warn!(key = %key, "blob-backed field could not be resolved");
        }
        resolved
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotV2 {
    pub version: u32,
    pub sessions: Vec<SessionSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub meta: SessionMeta,
    pub turns: Vec<TurnSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnSnapshot {
    pub id: String,
    pub prompt: String,
    pub reply: StoredText,
    #[serde(default)]
    pub render_id: Option<String>,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub validation: Option<Validation>,
    pub steps: Vec<StepSnapshot>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub streaming: bool,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSnapshot {
    pub id: String,
    pub tool: String,
    pub label: String,
    #[serde(default)]
    pub call_id: Option<String>,
    pub input_summary: String,
    #[serde(default)]
    pub input_full: StoredText,
    #[serde(default)]
    pub input_size_bytes: Option<u64>,
    #[serde(default)]
    pub input_truncated: bool,
    #[serde(default)]
    pub result_summary: Option<String>,
    #[serde(default)]
    pub result_text: StoredText,
    #[serde(default)]
    pub result_size_bytes: Option<u64>,
    #[serde(default)]
    pub result_truncated: bool,
    #[serde(default)]
    pub outcome: Option<StepOutcome>,
    pub phase: StepPhase,
    pub started_at_ms: i64,
    #[serde(default)]
    pub ended_at_ms: Option<i64>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub redaction: Option<easel_wire::events::Redaction>,
    #[serde(default)]
    pub artifacts: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<StepError>,
}

// ---- Legacy shape (version 1) ----

/// Version 1 stored a single combined step status instead of the separate
/// lifecycle/outcome pair.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotV1 {
    #[serde(default = "default_v1_version")]
    pub version: u32,
    pub sessions: Vec<SessionSnapshotV1>,
}

fn default_v1_version() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionSnapshotV1 {
    pub meta: SessionMeta,
    pub turns: Vec<TurnSnapshotV1>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TurnSnapshotV1 {
    pub id: String,
    pub prompt: String,
    #[serde(default)]
    pub reply: StoredText,
    #[serde(default)]
    pub render_id: Option<String>,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub validation: Option<Validation>,
    #[serde(default)]
    pub steps: Vec<StepSnapshotV1>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepSnapshotV1 {
    pub id: String,
    pub tool: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub input_summary: String,
    #[serde(default)]
    pub input_full: StoredText,
    #[serde(default)]
    pub input_size_bytes: Option<u64>,
    #[serde(default)]
    pub input_truncated: bool,
    #[serde(default)]
    pub result_summary: Option<String>,
    #[serde(default)]
    pub result_text: StoredText,
    #[serde(default)]
    pub result_size_bytes: Option<u64>,
    #[serde(default)]
    pub result_truncated: bool,
    /// Combined lifecycle/outcome field: "running", "done", "ok", "error"
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub started_at_ms: i64,
    #[serde(default)]
    pub ended_at_ms: Option<i64>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub redaction: Option<easel_wire::events::Redaction>,
    #[serde(default)]
    pub artifacts: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<StepError>,
}

/// Pure migration from the version-1 shape, applied once at load.
pub fn migrate_v1(snapshot: SnapshotV1) -> SnapshotV2 {
    SnapshotV2 {
        version: SCHEMA_VERSION,
        sessions: snapshot
            .sessions
            .into_iter()
            .map(|session| SessionSnapshot {
                meta: session.meta,
                turns: session
                    .turns
                    .into_iter()
                    .map(|turn| TurnSnapshot {
                        id: turn.id,
                        prompt: turn.prompt,
                        reply: turn.reply,
                        render_id: turn.render_id,
                        backend: turn.backend,
                        validation: turn.validation,
                        steps: session_steps_v1(turn.steps),
                        error: turn.error,
                        streaming: turn.streaming,
                        created_at_ms: turn.created_at_ms,
                    })
                    .collect(),
            })
            .collect(),
    }
}

fn session_steps_v1(steps: Vec<StepSnapshotV1>) -> Vec<StepSnapshot> {
    steps
        .into_iter()
        .map(|step| {
            let (phase, outcome) = split_legacy_status(step.status.as_deref());
            StepSnapshot {
                id: step.id,
                tool: step.tool,
                label: step.label,
                call_id: step.call_id,
                input_summary: step.input_summary,
                input_full: step.input_full,
                input_size_bytes: step.input_size_bytes,
                input_truncated: step.input_truncated,
                result_summary: step.result_summary,
                result_text: step.result_text,
                result_size_bytes: step.result_size_bytes,
                result_truncated: step.result_truncated,
                outcome,
                phase,
                started_at_ms: step.started_at_ms,
                ended_at_ms: step.ended_at_ms,
                duration_ms: step.duration_ms,
                redaction: step.redaction,
                artifacts: step.artifacts,
                error: step.error,
            }
        })
        .collect()
}

/// Split the legacy combined status into lifecycle + outcome.
fn split_legacy_status(status: Option<&str>) -> (StepPhase, Option<StepOutcome>) {
    match status {
        Some("running") => (StepPhase::Running, None),
        Some("done") => (StepPhase::Done, None),
        Some("ok") => (StepPhase::Done, Some(StepOutcome::Ok)),
        Some("error") => (StepPhase::Done, Some(StepOutcome::Error)),
        _ => (StepPhase::Done, None),
    }
}

/// Parse a raw snapshot, dispatching on the version discriminator.
pub fn parse_snapshot(raw: &str) -> Result<SnapshotV2, serde_json::Error> {
    #[derive(Deserialize)]
    struct VersionProbe {
        #[serde(default = "default_v1_version")]
        version: u32,
    }

    let probe: VersionProbe = serde_json::from_str(raw)?;
    match probe.version {
        1 => Ok(migrate_v1(serde_json::from_str(raw)?)),
        SCHEMA_VERSION => serde_json::from_str(raw),
        other => Err(serde::de::Error::custom(format!(
            "unsupported snapshot version {other}"
        ))),
    }
}

/// Content-addressed key for an offloaded field.
fn blob_key(session_id: &str, turn_id: &str, field: &str) -> String {
    format!("v{SCHEMA_VERSION}:{session_id}:{turn_id}:{field}")
}

// ---- Coordinator ----

#[derive(Default)]
struct FlushFlags {
    timer_armed: bool,
    in_flight: bool,
    queued: bool,
}

/// Serializes `ThreadState` to the primary store with coalescing and
/// blob offload; hydrates it back, migrating legacy shapes.
///
/// All fields are `Arc`-wrapped, so cloning is cheap.
#[derive(Clone)]
pub struct PersistenceCoordinator {
    state: Arc<Mutex<ThreadState>>,
    snapshots: Arc<dyn SnapshotStore>,
    blobs: Arc<dyn BlobStore>,
    config: PersistConfig,
    flags: Arc<Mutex<FlushFlags>>,
}

impl PersistenceCoordinator {
    pub fn new(
        state: Arc<Mutex<ThreadState>>,
        snapshots: Arc<dyn SnapshotStore>,
        blobs: Arc<dyn BlobStore>,
        config: PersistConfig,
    ) -> Self {
        Self {
            state,
            snapshots,
            blobs,
            config,
            flags: Arc::new(Mutex::new(FlushFlags::default())),
        }
    }

    /// Request a write. Bursts within the flush delay coalesce into one
    /// snapshot; a request during an in-flight write queues exactly one
    /// follow-up, so the final state is always eventually captured.
    pub fn schedule(&self) {
        {
            let mut flags = self.flags.lock();
            if flags.in_flight {
                flags.queued = true;
                return;
            }
            if flags.timer_armed {
                return;
            }
            flags.timer_armed = true;
        }

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.config.flush_delay).await;
            this.run_flush().await;
        });
    }

    /// Write immediately, bypassing the coalescing timer (shutdown path).
    pub async fn flush_now(&self) {
        self.run_flush().await;
    }

    async fn run_flush(&self) {
        {
            let mut flags = self.flags.lock();
            flags.timer_armed = false;
            if flags.in_flight {
                flags.queued = true;
                return;
            }
            flags.in_flight = true;
        }

        loop {
            self.write_snapshot().await;

            let mut flags = self.flags.lock();
            if flags.queued {
                flags.queued = false;
                // keep in_flight set; one more write captures the latest state
            } else {
                flags.in_flight = false;
                break;
            }
        }
    }

    async fn write_snapshot(&self) {
        let snapshot = build_snapshot(&self.state.lock());
        let snapshot = self.offload(snapshot).await;

        match serde_json::to_string(&snapshot) {
            Ok(json) => {
                if let Err(e) = self.snapshots.save(&json).await {
                    tracing::warn!(error = %e, "snapshot write failed; will retry on next flush");
                }
            }
            Err(e) => tracing::warn!(error = %e, "snapshot serialization failed"),
        }
    }

    /// Move every over-threshold field into the blob store. A failed blob
    /// write keeps the value inline rather than losing it.
    async fn offload(&self, mut snapshot: SnapshotV2) -> SnapshotV2 {
        for session in &mut snapshot.sessions {
            let session_id = session.meta.id.clone();
            for turn in &mut session.turns {
                let turn_id = turn.id.clone();
                self.offload_field(&mut turn.reply, &session_id, &turn_id, "reply")
                    .await;
                for step in &mut turn.steps {
                    let input_field = format!("step:{}:input_full", step.id);
                    let result_field = format!("step:{}:result_text", step.id);
                    self.offload_field(&mut step.input_full, &session_id, &turn_id, &input_field)
                        .await;
                    self.offload_field(&mut step.result_text, &session_id, &turn_id, &result_field)
                        .await;
                }
            }
        }
        snapshot
    }

    async fn offload_field(
        &self,
        field: &mut StoredText,
        session_id: &str,
        turn_id: &str,
        name: &str,
    ) {
        let Some(value) = &field.inline else {
            return;
        };
        if value.len() <= self.config.inline_limit {
            return;
        }

        let key = blob_key(session_id, turn_id, name);
        match self.blobs.put(&key, value).await {
            Ok(()) => {
                field.inline = None;
                field.blob = Some(key);
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "blob write failed; keeping value inline");
            }
        }
    }

    /// Load the snapshot, resolve blob-backed fields with one batched
    /// read, and replace the in-memory state. Render handles are always
    /// cleared and any turn still marked streaming is forced off (a
    /// stream cannot be resumed across a reload).
    pub async fn hydrate(&self) {
        let state = self.load_state().await;
        *self.state.lock() = state;
    }

    async fn load_state(&self) -> ThreadState {
        let raw = match self.snapshots.load().await {
            Ok(Some(raw)) => raw,
            Ok(None) => return ThreadState::new(),
            Err(e) => {
                tracing::warn!(error = %e, "primary store unreadable; starting empty");
                return ThreadState::new();
            }
        };

        let snapshot = match parse_snapshot(&raw) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(error = %e, "persisted snapshot corrupt; clearing primary store");
                if let Err(e) = self.snapshots.clear().await {
                    tracing::warn!(error = %e, "failed to clear corrupt snapshot");
                }
                return ThreadState::new();
            }
        };

        let keys = collect_blob_keys(&snapshot);
        let resolved = if keys.is_empty() {
            HashMap::new()
        } else {
            match self.blobs.get_many(&keys).await {
                Ok(resolved) => resolved,
                Err(e) => {
                    tracing::warn!(error = %e, "blob store unavailable; blob-backed fields unresolved");
                    HashMap::new()
                }
            }
        };

        restore_state(snapshot, &resolved)
    }
}

/// Snapshot the live state with all values still inline.
fn build_snapshot(state: &ThreadState) -> SnapshotV2 {
    SnapshotV2 {
        version: SCHEMA_VERSION,
        sessions: state
            .iter()
            .map(|session| SessionSnapshot {
                meta: session.meta.clone(),
                turns: session.turns.iter().map(snapshot_turn).collect(),
            })
            .collect(),
    }
}

fn snapshot_turn(turn: &Turn) -> TurnSnapshot {
    TurnSnapshot {
        id: turn.id.clone(),
        prompt: turn.prompt.clone(),
        reply: StoredText::inline(turn.reply.clone()),
        render_id: turn.render_id.clone(),
        backend: turn.backend.clone(),
        validation: turn.validation.clone(),
        steps: turn.steps.iter().map(snapshot_step).collect(),
        error: turn.error.clone(),
        streaming: turn.streaming,
        created_at_ms: turn.created_at_ms,
    }
}

fn snapshot_step(step: &Step) -> StepSnapshot {
    StepSnapshot {
        id: step.id.clone(),
        tool: step.tool.clone(),
        label: step.label.clone(),
        call_id: step.call_id.clone(),
        input_summary: step.input.summary.clone(),
        input_full: step
            .input
            .full
            .clone()
            .map(StoredText::inline)
            .unwrap_or_else(StoredText::absent),
        input_size_bytes: step.input.size_bytes,
        input_truncated: step.input.truncated,
        result_summary: step.output.summary.clone(),
        result_text: step
            .output
            .text
            .clone()
            .map(StoredText::inline)
            .unwrap_or_else(StoredText::absent),
        result_size_bytes: step.output.size_bytes,
        result_truncated: step.output.truncated,
        outcome: step.outcome,
        phase: step.phase,
        started_at_ms: step.started_at_ms,
        ended_at_ms: step.ended_at_ms,
        duration_ms: step.duration_ms,
        redaction: step.redaction.clone(),
        artifacts: step.artifacts.clone(),
        error: step.error.clone(),
    }
}

/// Every blob key referenced by the snapshot, deduplicated.
fn collect_blob_keys(snapshot: &SnapshotV2) -> Vec<String> {
    let mut keys = BTreeSet::new();
    for session in &snapshot.sessions {
        for turn in &session.turns {
            if let Some(key) = &turn.reply.blob {
                keys.insert(key.clone());
            }
            for step in &turn.steps {
                if let Some(key) = &step.input_full.blob {
                    keys.insert(key.clone());
                }
                if let Some(key) = &step.result_text.blob {
                    keys.insert(key.clone());
                }
            }
        }
    }
    keys.into_iter().collect()
}

/// Rebuild live state from a parsed snapshot and resolved blobs.
fn restore_state(snapshot: SnapshotV2, blobs: &HashMap<String, String>) -> ThreadState {
    let sessions = snapshot
        .sessions
        .into_iter()
        .map(|session| SessionThread {
            meta: session.meta,
            turns: session
                .turns
                .into_iter()
                .map(|turn| restore_turn(turn, blobs))
                .collect(),
        })
        .collect();
    ThreadState::from_sessions(sessions)
}

fn restore_turn(turn: TurnSnapshot, blobs: &HashMap<String, String>) -> Turn {
    Turn {
        id: turn.id,
        prompt: turn.prompt,
        reply: turn.reply.resolve(blobs).unwrap_or_default(),
        render_id: turn.render_id,
        // Handles are process-local; the recovery pass re-resolves them.
        render: None,
        backend: turn.backend,
        validation: turn.validation,
        steps: turn
            .steps
            .into_iter()
            .map(|step| restore_step(step, blobs))
            .collect(),
        error: turn.error,
        // A reload is the only cancellation event; an in-flight stream
        // cannot be resumed, so streaming is always forced off.
        streaming: false,
        created_at_ms: turn.created_at_ms,
    }
}

fn restore_step(step: StepSnapshot, blobs: &HashMap<String, String>) -> Step {
    Step {
        id: step.id,
        tool: step.tool,
        label: step.label,
        call_id: step.call_id,
        input: StepInput {
            summary: step.input_summary,
            full: step.input_full.resolve(blobs),
            size_bytes: step.input_size_bytes,
            truncated: step.input_truncated,
        },
        output: StepOutput {
            summary: step.result_summary,
            text: step.result_text.resolve(blobs),
            size_bytes: step.result_size_bytes,
            truncated: step.result_truncated,
        },
        outcome: step.outcome,
        phase: step.phase,
        started_at_ms: step.started_at_ms,
        ended_at_ms: step.ended_at_ms,
        duration_ms: step.duration_ms,
        redaction: step.redaction,
        artifacts: step.artifacts,
        error: step.error,
    }
}
