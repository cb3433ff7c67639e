//! Executor registry -- a named collection of available executors.
//!
//! The registry lets the scheduler resolve the executor a task selects at
//! runtime (via `schemas.method`, falling back to the task name).

use std::collections::HashMap;
use std::sync::Arc;

use super::trait_def::Executor;

/// A collection of registered [`Executor`] implementations, keyed by id.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor under the id returned by [`Executor::id`].
    /// If one with the same id is already registered, it is replaced and
    /// the old one is returned.
    pub fn register(&mut self, executor: impl Executor + 'static) -> Option<Arc<dyn Executor>> {
        let id = executor.id().to_string();
        self.executors.insert(id, Arc::new(executor))
    }

    /// Look up an executor by id.
    pub fn get(&self, id: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(id).cloned()
    }

    /// Ids of all registered executors, sorted for stable output.
    pub fn list(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.executors.keys().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    /// Iterate registered executors (for agent-card skill advertising).
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Executor>> {
        self.executors.values()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("executors", &self.list())
            .finish()
    }
}
