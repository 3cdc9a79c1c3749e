use std::collections::HashMap;

use parking_lot::RwLock;

/// Bidirectional `run_id` <-> `session_id` registry.
///
/// Bindings are last-write-wins: session creation is serialized per run by
/// the task handler's critical path, so only the newest binding is live.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: RwLock<Maps>,
}

#[derive(Debug, Default)]
struct Maps {
    run_to_session: HashMap<String, String>,
    session_to_run: HashMap<String, String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_for_run(&self, run_id: &str) -> Option<String> {
        self.inner.read().run_to_session.get(run_id).cloned()
    }

    pub fn run_for_session(&self, session_id: &str) -> Option<String> {
        self.inner.read().session_to_run.get(session_id).cloned()
    }

    pub fn bind(&self, run_id: &str, session_id: &str) {
        let mut maps = self.inner.write();
        maps.run_to_session
            .insert(run_id.to_string(), session_id.to_string());
        maps.session_to_run
            .insert(session_id.to_string(), run_id.to_string());
    }
}
