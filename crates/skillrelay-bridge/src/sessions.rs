//! Session affinity: which conversations already have a live relay session.
//!
//! The first message in a conversation gets a full preamble; later ones are
//! sent raw with `--continue`. The registry lives in the bridge context so
//! two bridges in one process never share state.

use dashmap::DashSet;

#[derive(Default)]
pub struct SessionRegistry {
    active: DashSet<String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.active.contains(key)
    }

    /// Mark `key` as having a session. Returns `true` if it was new.
    pub fn activate(&self, key: &str) -> bool {
        self.active.insert(key.to_string())
    }

    pub fn forget(&self, key: &str) -> bool {
        self.active.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}
