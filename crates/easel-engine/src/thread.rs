//! In-memory thread state: the authoritative model of every session's
//! turns and steps, mutated by stream events and rebuilt on hydration.
//!
//! Every operation is a no-op when the target session or turn does not
//! exist; callers schedule persistence after each mutation.

use easel_wire::events::{ToolResult, ToolStart};

use crate::model::{
    RenderHandle, SessionMeta, Step, StepInput, StepOutcome, StepPhase, Turn, Validation,
    backend_for_tool, label_for_tool, now_ms,
};

/// One session's metadata and ordered turns
#[derive(Debug, Clone)]
pub struct SessionThread {
    pub meta: SessionMeta,
    pub turns: Vec<Turn>,
}

/// All sessions known to this client
#[derive(Debug, Clone, Default)]
pub struct ThreadState {
    sessions: Vec<SessionThread>,
}

impl ThreadState {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- Session management ----

    /// Register a session. Replaces an existing entry with the same id.
    pub fn add_session(&mut self, meta: SessionMeta) {
        if let Some(existing) = self.session_mut(&meta.id) {
            existing.meta = meta;
        } else {
            self.sessions.push(SessionThread {
                meta,
                turns: Vec::new(),
            });
        }
    }

    /// Prune a session and all of its turns.
    pub fn remove_session(&mut self, session_id: &str) {
        self.sessions.retain(|s| s.meta.id != session_id);
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions.iter().any(|s| s.meta.id == session_id)
    }

    /// Session metadata, in insertion order.
    pub fn sessions(&self) -> Vec<SessionMeta> {
        self.sessions.iter().map(|s| s.meta.clone()).collect()
    }

    /// Ordered turns for a session.
    pub fn turns(&self, session_id: &str) -> Vec<Turn> {
        self.session(session_id)
            .map(|s| s.turns.clone())
            .unwrap_or_default()
    }

    /// A single turn, for inspection.
    pub fn turn(&self, session_id: &str, turn_id: &str) -> Option<Turn> {
        self.session(session_id)
            .and_then(|s| s.turns.iter().find(|t| t.id == turn_id))
            .cloned()
    }

    /// True iff any turn in the session is still streaming.
    pub fn is_streaming(&self, session_id: &str) -> bool {
        self.session(session_id)
            .is_some_and(|s| s.turns.iter().any(|t| t.streaming))
    }

    /// Refresh display metadata after a turn completed.
    pub fn update_session_meta(&mut self, session_id: &str) {
        let Some(session) = self.session_mut(session_id) else {
            return;
        };
        session.meta.exchange_count = session.turns.len();
        session.meta.last_active_ms = now_ms();
        if let Some(backend) = session.turns.iter().rev().find_map(|t| t.backend.clone()) {
            session.meta.backend = Some(backend);
        }
        if session.meta.title == "New session" {
            if let Some(first) = session.turns.first() {
                session.meta.title = title_from_prompt(&first.prompt);
            }
        }
    }

    // ---- Turn mutations ----

    /// Append a new streaming turn; returns its id, or None if the session
    /// is unknown.
    pub fn create_turn(&mut self, session_id: &str, prompt: &str) -> Option<String> {
        let session = self.session_mut(session_id)?;
        let turn = Turn::new(prompt);
        let id = turn.id.clone();
        session.turns.push(turn);
        Some(id)
    }

    /// Concatenate a delta onto the turn's reply; never replaces.
    pub fn append_reply_delta(&mut self, session_id: &str, turn_id: &str, delta: &str) {
        if let Some(turn) = self.turn_mut(session_id, turn_id) {
            turn.reply.push_str(delta);
        }
    }

    /// Overwrite the reply; used only at terminal completion.
    pub fn set_reply(&mut self, session_id: &str, turn_id: &str, text: &str) {
        if let Some(turn) = self.turn_mut(session_id, turn_id) {
            turn.reply = text.to_string();
        }
    }

    pub fn set_render_id(&mut self, session_id: &str, turn_id: &str, render_id: &str) {
        if let Some(turn) = self.turn_mut(session_id, turn_id) {
            turn.render_id = Some(render_id.to_string());
        }
    }

    pub fn set_render_handle(&mut self, session_id: &str, turn_id: &str, handle: RenderHandle) {
        if let Some(turn) = self.turn_mut(session_id, turn_id) {
            turn.render = Some(handle);
        }
    }

    pub fn set_backend(&mut self, session_id: &str, turn_id: &str, backend: &str) {
        if let Some(turn) = self.turn_mut(session_id, turn_id) {
            turn.backend = Some(backend.to_string());
        }
    }

    pub fn set_validation(&mut self, session_id: &str, turn_id: &str, validation: Validation) {
        if let Some(turn) = self.turn_mut(session_id, turn_id) {
            turn.validation = Some(validation);
        }
    }

    /// Clear the streaming flag; reply and steps are untouched.
    pub fn finish_turn(&mut self, session_id: &str, turn_id: &str) {
        if let Some(turn) = self.turn_mut(session_id, turn_id) {
            turn.streaming = false;
        }
    }

    /// Record a turn failure. Idempotent: overwrites the message and
    /// clears the streaming flag whichever terminal event arrived first.
    pub fn fail_turn(&mut self, session_id: &str, turn_id: &str, message: &str) {
        if let Some(turn) = self.turn_mut(session_id, turn_id) {
            turn.error = Some(message.to_string());
            turn.streaming = false;
        }
    }

    // ---- Step mutations ----

    /// Append a running step from a `tool_start` event. Updates the turn's
    /// inferred backend when the tool maps to one.
    pub fn start_step(&mut self, session_id: &str, turn_id: &str, start: &ToolStart) {
        let Some(turn) = self.turn_mut(session_id, turn_id) else {
            return;
        };
        if let Some(backend) = backend_for_tool(&start.tool) {
            turn.backend = Some(backend.to_string());
        }
        turn.steps.push(Step {
            id: uuid::Uuid::new_v4().to_string(),
            tool: start.tool.clone(),
            label: label_for_tool(&start.tool),
            call_id: start.tool_use_id.clone(),
            input: StepInput {
                summary: start.input.clone(),
                full: start.input_full.clone(),
                size_bytes: start.input_full_size_bytes,
                truncated: start.input_truncated.unwrap_or(false),
            },
            output: Default::default(),
            outcome: None,
            phase: StepPhase::Running,
            started_at_ms: start.ts_ms.unwrap_or_else(now_ms),
            ended_at_ms: None,
            duration_ms: None,
            redaction: start.redaction.clone(),
            artifacts: None,
            error: None,
        });
    }

    /// Close the step matching a `tool_result` event.
    ///
    /// Steps are scanned most-recent-first. An exact correlation-id match
    /// among running steps wins; without a correlation id (or when none
    /// matches) the most recent running step with the same tool name is
    /// taken, since the tool name alone is ambiguous under concurrent
    /// same-tool calls. Only fields present in the payload are merged.
    ///
    /// Returns false when no step could be matched.
    pub fn finish_step(&mut self, session_id: &str, turn_id: &str, result: &ToolResult) -> bool {
        let Some(turn) = self.turn_mut(session_id, turn_id) else {
            return false;
        };

        let by_call_id = result.tool_use_id.as_deref().and_then(|cid| {
            turn.steps
                .iter()
                .rposition(|s| s.phase == StepPhase::Running && s.call_id.as_deref() == Some(cid))
        });
        let idx = by_call_id.or_else(|| {
            turn.steps
                .iter()
                .rposition(|s| s.phase == StepPhase::Running && s.tool == result.tool)
        });
        let Some(idx) = idx else {
            return false;
        };

        let step = &mut turn.steps[idx];
        step.phase = StepPhase::Done;
        step.ended_at_ms = Some(result.ts_ms.unwrap_or_else(now_ms));

        if let Some(status) = result.status.as_deref() {
            match status {
                "ok" => step.outcome = Some(StepOutcome::Ok),
                "error" => step.outcome = Some(StepOutcome::Error),
                other => tracing::warn!(status = other, "unrecognized tool result status"),
            }
        }
        if let Some(v) = &result.result_summary {
            step.output.summary = Some(v.clone());
        }
        if let Some(v) = &result.result_text {
            step.output.text = Some(v.clone());
        }
        if let Some(v) = result.result_text_size_bytes {
            step.output.size_bytes = Some(v);
        }
        if let Some(v) = result.result_truncated {
            step.output.truncated = v;
        }
        if let Some(v) = &result.error {
            step.error = Some(v.into());
        }
        if let Some(v) = &result.artifacts {
            step.artifacts = Some(v.clone());
        }
        if let Some(v) = &result.redaction {
            step.redaction = Some(v.clone());
        }
        let elapsed = step
            .ended_at_ms
            .map(|end| end.saturating_sub(step.started_at_ms).max(0) as u64);
        step.duration_ms = result.duration_ms.or(elapsed);

        true
    }

    // ---- Internal lookups ----

    fn session(&self, session_id: &str) -> Option<&SessionThread> {
        self.sessions.iter().find(|s| s.meta.id == session_id)
    }

    fn session_mut(&mut self, session_id: &str) -> Option<&mut SessionThread> {
        self.sessions.iter_mut().find(|s| s.meta.id == session_id)
    }

    fn turn_mut(&mut self, session_id: &str, turn_id: &str) -> Option<&mut Turn> {
        self.session_mut(session_id)?
            .turns
            .iter_mut()
            .find(|t| t.id == turn_id)
    }

    /// Iterate all sessions, for snapshot building.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &SessionThread> {
        self.sessions.iter()
    }

    /// Rebuild from hydrated sessions.
    pub(crate) fn from_sessions(sessions: Vec<SessionThread>) -> Self {
        Self { sessions }
    }
}

fn title_from_prompt(prompt: &str) -> String {
    let flat = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut title: String = flat.chars().take(60).collect();
    if flat.chars().count() > 60 {
        title.push('…');
    }
    if title.is_empty() {
        "New session".to_string()
    } else {
        title
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_turn() -> (ThreadState, String) {
        let mut state = ThreadState::new();
        state.add_session(SessionMeta::new("s1"));
        let turn = state.create_turn("s1", "draw a graph").unwrap();
        (state, turn)
    }

    fn tool_start(tool: &str, call_id: Option<&str>) -> ToolStart {
        ToolStart {
            tool: tool.to_string(),
            input: format!("{tool} input"),
            tool_use_id: call_id.map(str::to_string),
            ts_ms: None,
            input_full: None,
            input_full_size_bytes: None,
            input_truncated: None,
            redaction: None,
            size: None,
        }
    }

    fn tool_result(tool: &str, call_id: Option<&str>) -> ToolResult {
        ToolResult {
            tool: tool.to_string(),
            tool_use_id: call_id.map(str::to_string),
            ts_ms: None,
            status: None,
            duration_ms: None,
            result_summary: None,
            result_text: None,
            result_text_size_bytes: None,
            result_truncated: None,
            error: None,
            artifacts: None,
            redaction: None,
            size: None,
        }
    }

    #[test]
    fn test_reply_is_concatenation_of_deltas_in_order() {
        let (mut state, turn) = state_with_turn();
        for delta in ["Here ", "is ", "your ", "diagram."] {
            state.append_reply_delta("s1", &turn, delta);
        }
        assert_eq!(state.turn("s1", &turn).unwrap().reply, "Here is your diagram.");
    }

    #[test]
    fn test_mutations_are_noops_on_missing_targets() {
        let (mut state, turn) = state_with_turn();
        state.append_reply_delta("nope", &turn, "x");
        state.append_reply_delta("s1", "nope", "x");
        assert!(state.create_turn("nope", "p").is_none());
        state.fail_turn("s1", "nope", "boom");
        assert_eq!(state.turn("s1", &turn).unwrap().reply, "");
        assert!(state.turn("s1", &turn).unwrap().streaming);
    }

    #[test]
    fn test_correlation_id_match_beats_recency() {
        // Scenario: two concurrent render_tikz calls; the result for "a1"
        // must close the first step, not the most recent one.
        let (mut state, turn) = state_with_turn();
        state.start_step("s1", &turn, &tool_start("render_tikz", Some("a1")));
        state.start_step("s1", &turn, &tool_start("render_tikz", Some("a2")));

        assert!(state.finish_step("s1", &turn, &tool_result("render_tikz", Some("a1"))));

        let steps = state.turn("s1", &turn).unwrap().steps;
        assert_eq!(steps[0].phase, StepPhase::Done);
        assert_eq!(steps[1].phase, StepPhase::Running);
    }

    #[test]
    fn test_correlation_id_ignores_other_running_steps() {
        // An earlier different-tool step without a correlation id must not
        // swallow a correlated result.
        let (mut state, turn) = state_with_turn();
        state.start_step("s1", &turn, &tool_start("fetch_data", None));
        state.start_step("s1", &turn, &tool_start("render_tikz", Some("r1")));

        assert!(state.finish_step("s1", &turn, &tool_result("render_tikz", Some("r1"))));

        let steps = state.turn("s1", &turn).unwrap().steps;
        assert_eq!(steps[0].phase, StepPhase::Running, "fetch_data untouched");
        assert_eq!(steps[1].phase, StepPhase::Done);
    }

    #[test]
    fn test_no_correlation_id_falls_back_to_most_recent_same_tool() {
        let (mut state, turn) = state_with_turn();
        state.start_step("s1", &turn, &tool_start("render_tikz", None));
        state.start_step("s1", &turn, &tool_start("render_tikz", None));

        assert!(state.finish_step("s1", &turn, &tool_result("render_tikz", None)));

        let steps = state.turn("s1", &turn).unwrap().steps;
        assert_eq!(steps[0].phase, StepPhase::Running);
        assert_eq!(steps[1].phase, StepPhase::Done, "tail step closed first");
    }

    #[test]
    fn test_unmatched_correlation_id_falls_back_to_tool_name() {
        let (mut state, turn) = state_with_turn();
        state.start_step("s1", &turn, &tool_start("render_tikz", Some("known")));

        assert!(state.finish_step("s1", &turn, &tool_result("render_tikz", Some("other"))));
        assert_eq!(
            state.turn("s1", &turn).unwrap().steps[0].phase,
            StepPhase::Done
        );
    }

    #[test]
    fn test_result_with_no_match_is_reported() {
        let (mut state, turn) = state_with_turn();
        assert!(!state.finish_step("s1", &turn, &tool_result("render_tikz", Some("a1"))));
    }

    #[test]
    fn test_partial_result_preserves_unmentioned_fields() {
        let (mut state, turn) = state_with_turn();
        state.start_step("s1", &turn, &tool_start("render_tikz", Some("a1")));

        let mut first = tool_result("render_tikz", Some("a1"));
        first.status = Some("ok".to_string());
        first.result_summary = Some("rendered 2 nodes".to_string());
        first.result_text = Some("full output".to_string());
        state.finish_step("s1", &turn, &first);

        // A later partial payload for the same tool (new invocation) must
        // not be able to erase the recorded fields of the closed step; and
        // within one merge, absent fields stay as they were.
        let closed = state.turn("s1", &turn).unwrap();
        let step = &closed.steps[0];
        assert_eq!(step.outcome, Some(StepOutcome::Ok));
        assert_eq!(step.output.summary.as_deref(), Some("rendered 2 nodes"));
        assert_eq!(step.output.text.as_deref(), Some("full output"));
        assert_eq!(step.phase, StepPhase::Done);
    }

    #[test]
    fn test_merge_only_present_fields() {
        let (mut state, turn) = state_with_turn();
        let mut start = tool_start("render_tikz", Some("a1"));
        start.input_full = Some("\\begin{tikzpicture}".to_string());
        state.start_step("s1", &turn, &start);

        // Result carries only a duration; everything else stays untouched.
        let mut result = tool_result("render_tikz", Some("a1"));
        result.duration_ms = Some(99);
        state.finish_step("s1", &turn, &result);

        let closed = state.turn("s1", &turn).unwrap();
        let step = &closed.steps[0];
        assert_eq!(step.duration_ms, Some(99));
        assert!(step.outcome.is_none(), "status absent: outcome unset");
        assert!(step.output.summary.is_none());
        assert_eq!(
            step.input.full.as_deref(),
            Some("\\begin{tikzpicture}"),
            "input recorded at start survives the result merge"
        );
    }

    #[test]
    fn test_step_error_merged() {
        let (mut state, turn) = state_with_turn();
        state.start_step("s1", &turn, &tool_start("render_graphviz", Some("g1")));

        let mut result = tool_result("render_graphviz", Some("g1"));
        result.status = Some("error".to_string());
        result.error = Some(easel_wire::events::ToolErrorInfo {
            name: "RenderError".to_string(),
            message: "syntax error near node".to_string(),
            stack: None,
            stack_truncated: None,
        });
        state.finish_step("s1", &turn, &result);

        let closed = state.turn("s1", &turn).unwrap();
        let step = &closed.steps[0];
        assert_eq!(step.outcome, Some(StepOutcome::Error));
        assert_eq!(step.error.as_ref().unwrap().name, "RenderError");
    }

    #[test]
    fn test_backend_inferred_from_tool_start() {
        let (mut state, turn) = state_with_turn();
        state.start_step("s1", &turn, &tool_start("render_matplotlib", None));
        assert_eq!(
            state.turn("s1", &turn).unwrap().backend.as_deref(),
            Some("matplotlib")
        );
    }

    #[test]
    fn test_streaming_lifecycle() {
        let (mut state, turn) = state_with_turn();
        assert!(state.is_streaming("s1"));

        state.finish_turn("s1", &turn);
        assert!(!state.is_streaming("s1"));
        assert!(state.turn("s1", &turn).unwrap().error.is_none());
    }

    #[test]
    fn test_fail_turn_is_idempotent_and_terminal() {
        let (mut state, turn) = state_with_turn();
        state.fail_turn("s1", &turn, "first");
        state.fail_turn("s1", &turn, "second");

        let t = state.turn("s1", &turn).unwrap();
        assert!(!t.streaming);
        assert_eq!(t.error.as_deref(), Some("second"));
    }

    #[test]
    fn test_set_reply_overwrites() {
        let (mut state, turn) = state_with_turn();
        state.append_reply_delta("s1", &turn, "partial");
        state.set_reply("s1", &turn, "final reply");
        assert_eq!(state.turn("s1", &turn).unwrap().reply, "final reply");
    }

    #[test]
    fn test_session_meta_updated_after_turn() {
        let (mut state, turn) = state_with_turn();
        state.start_step("s1", &turn, &tool_start("render_tikz", None));
        state.finish_turn("s1", &turn);
        state.update_session_meta("s1");

        let sessions = state.sessions();
        let meta = &sessions[0];
        assert_eq!(meta.exchange_count, 1);
        assert_eq!(meta.title, "draw a graph");
        assert_eq!(meta.backend.as_deref(), Some("tikz"));
    }

    #[test]
    fn test_remove_session_prunes_turns() {
        let (mut state, _turn) = state_with_turn();
        state.remove_session("s1");
        assert!(!state.has_session("s1"));
        assert!(state.turns("s1").is_empty());
    }

    #[test]
    fn test_long_prompt_title_truncated() {
        let mut state = ThreadState::new();
        state.add_session(SessionMeta::new("s1"));
        let prompt = "x".repeat(200);
        state.create_turn("s1", &prompt).unwrap();
        state.update_session_meta("s1");
        let sessions = state.sessions();
        let title = &sessions[0].title;
        assert_eq!(title.chars().count(), 61);
        assert!(title.ends_with('…'));
    }
}
