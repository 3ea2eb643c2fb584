use std::sync::Arc;

use dashmap::DashMap;
use tracing::warn;

use crate::error::{Result, ScriptError};
use crate::script::Script;

/// Concurrent registry of runnable scripts, keyed by script ID.
///
/// Populated once at startup from configuration, then read by the scheduler
/// at every fire. Registration after startup is allowed (the map is
/// lock-free), tasks simply resolve whatever is present at fire time.
pub struct ScriptRegistry {
    scripts: DashMap<String, Arc<dyn Script>>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self {
            scripts: DashMap::new(),
        }
    }

    /// Register a script under its own ID. Re-registering an ID replaces the
    /// previous script.
    pub fn register(&self, script: Arc<dyn Script>) {
        let id = script.id().to_string();
        if self.scripts.insert(id.clone(), script).is_some() {
            warn!(script_id = %id, "script re-registered; replacing previous entry");
        }
    }

    /// Look up a script, failing with [`ScriptError::NotFound`].
    pub fn resolve(&self, id: &str) -> Result<Arc<dyn Script>> {
        self.scripts
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ScriptError::NotFound { id: id.to_string() })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.scripts.contains_key(id)
    }

    /// All registered IDs, sorted for stable display.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.scripts.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

impl Default for ScriptRegistry {
    fn default() -> Self {
        Self::new()
    }
}
