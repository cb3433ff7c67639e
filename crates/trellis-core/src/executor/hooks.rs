//! Pre- and post-execution hooks.
//!
//! Hooks are registered once at process start. Pre-hooks may mutate a
//! task's inputs in place before execution and run in registration order;
//! post-hooks observe the outcome and run in reverse order. A failing
//! hook is logged and skipped unless the set is configured strict.

use std::sync::Arc;

use serde_json::Value;

use trellis_db::models::Task;

use super::trait_def::ExecOutcome;

pub type PreHook = Arc<dyn Fn(&mut Task) -> anyhow::Result<()> + Send + Sync>;
pub type PostHook = Arc<dyn Fn(&Task, &Value, &ExecOutcome) -> anyhow::Result<()> + Send + Sync>;

/// The hook lists consumed by the executor adapter.
#[derive(Clone, Default)]
pub struct HookSet {
    pre: Vec<PreHook>,
    post: Vec<PostHook>,
    /// When set, a hook error fails the task instead of being logged.
    strict: bool,
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn register_pre(
        &mut self,
        hook: impl Fn(&mut Task) -> anyhow::Result<()> + Send + Sync + 'static,
    ) {
        self.pre.push(Arc::new(hook));
    }

    pub fn register_post(
        &mut self,
        hook: impl Fn(&Task, &Value, &ExecOutcome) -> anyhow::Result<()> + Send + Sync + 'static,
    ) {
        self.post.push(Arc::new(hook));
    }

    /// Run pre-hooks in registration order against the task about to
    /// execute.
    pub fn run_pre(&self, task: &mut Task) -> anyhow::Result<()> {
        for (index, hook) in self.pre.iter().enumerate() {
            if let Err(e) = hook(task) {
                if self.strict {
                    return Err(e.context(format!("pre-hook {index} failed")));
                }
                tracing::warn!(
                    task_id = %task.id,
                    hook = index,
                    error = %e,
                    "pre-hook failed (ignored)"
                );
            }
        }
        Ok(())
    }

    /// Run post-hooks in reverse registration order.
    pub fn run_post(&self, task: &Task, inputs: &Value, outcome: &ExecOutcome) -> anyhow::Result<()> {
        for (index, hook) in self.post.iter().enumerate().rev() {
            if let Err(e) = hook(task, inputs, outcome) {
                if self.strict {
                    return Err(e.context(format!("post-hook {index} failed")));
                }
                tracing::warn!(
                    task_id = %task.id,
                    hook = index,
                    error = %e,
                    "post-hook failed (ignored)"
                );
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for HookSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookSet")
            .field("pre", &self.pre.len())
            .field("post", &self.post.len())
            .field("strict", &self.strict)
            .finish()
    }
}
