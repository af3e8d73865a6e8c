// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process-wide registry of in-flight builds.

use crate::state::BuildState;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Exclusive owner of every [`BuildState`], keyed by build id. States are
/// registered at submit time and removed lazily after their log stream has
/// drained.
#[derive(Default)]
pub struct StateStore {
    states: RwLock<HashMap<String, Arc<BuildState>>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a state under `id`. Overwriting a live entry is an
    /// anomaly, logged but honored.
    pub fn register(&self, id: &str, state: Arc<BuildState>) {
        if state.id() != id {
            tracing::error!(requested = %id, stored = %state.id(), "registering state under mismatched id");
        }
        let mut states = self.states.write();
        if states.contains_key(id) {
            tracing::warn!(%id, "overwriting existing build state");
        }
        states.insert(id.to_string(), state);
    }

    /// Looks up a state by id. A stored state whose internal id differs
    /// from the requested one is treated as a miss.
    pub fn get(&self, id: &str) -> Option<Arc<BuildState>> {
        let states = self.states.read();
        let state = states.get(id)?;
        if state.id() != id {
            tracing::error!(requested = %id, stored = %state.id(), "state id mismatch, treating as miss");
            return None;
        }
        Some(state.clone())
    }

    pub fn remove(&self, id: &str) {
        self.states.write().remove(id);
    }

    pub fn ids(&self) -> Vec<String> {
        self.states.read().keys().cloned().collect()
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
