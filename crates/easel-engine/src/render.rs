//! Process-local cache of resolved render handles
//!
//! Handles cannot survive a reload, so after hydration a recovery pass
//! re-resolves every turn that has a render id but no handle. There is no
//! eviction: the number of distinct renders is bounded by turn count.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::api::DiagramApi;
use crate::model::RenderHandle;
use crate::thread::ThreadState;

/// Memoizes `"{session}:{render_id}"` → local render handle.
pub struct RenderCache {
    api: Arc<dyn DiagramApi>,
    handles: Mutex<HashMap<String, RenderHandle>>,
}

impl RenderCache {
    pub fn new(api: Arc<dyn DiagramApi>) -> Self {
        Self {
            api,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Cache hit, available synchronously.
    pub fn get(&self, session_id: &str, render_id: &str) -> Option<RenderHandle> {
        self.handles.lock().get(&cache_key(session_id, render_id)).cloned()
    }

    /// Return the cached handle or fetch, wrap, and memoize it.
    pub async fn resolve(
        &self,
        session_id: &str,
        render_id: &str,
    ) -> easel_wire::Result<RenderHandle> {
        if let Some(handle) = self.get(session_id, render_id) {
            return Ok(handle);
        }

        let artifact = self.api.fetch_render(session_id, render_id).await?;
        let handle = RenderHandle::new(artifact);
        self.handles
            .lock()
            .insert(cache_key(session_id, render_id), handle.clone());
        Ok(handle)
    }

    /// Re-resolve every turn that has a render id but no handle.
    ///
    /// Failures are per turn: an expired or missing render is logged and
    /// skipped so it does not block recovery of the others.
    pub async fn recover(&self, state: &Arc<Mutex<ThreadState>>) {
        let targets: Vec<(String, String, String)> = {
            let st = state.lock();
            st.sessions()
                .iter()
                .flat_map(|meta| {
                    st.turns(&meta.id)
                        .into_iter()
                        .filter(|turn| turn.render_id.is_some() && turn.render.is_none())
                        .map(|turn| {
                            (
                                meta.id.clone(),
                                turn.id.clone(),
                                turn.render_id.clone().unwrap_or_default(),
                            )
                        })
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        for (session_id, turn_id, render_id) in targets {
            match self.resolve(&session_id, &render_id).await {
                Ok(handle) => {
                    state.lock().set_render_handle(&session_id, &turn_id, handle);
                }
                Err(e) => {
                    tracing::warn!(
                        session = %session_id,
                        render = %render_id,
                        error = %e,
                        "render could not be re-resolved; turn will have no preview"
                    );
                }
            }
        }
    }
}

fn cache_key(session_id: &str, render_id: &str) -> String {
    format!("{session_id}:{render_id}")
}
