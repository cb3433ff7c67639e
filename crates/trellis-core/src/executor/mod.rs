//! The executor adapter: bridges the scheduler to pluggable executors.
//!
//! The scheduler only knows the [`Executor`] capability set; this module
//! resolves the selected executor, composes effective inputs, runs the
//! hook lists, and returns the discriminated outcome.

pub mod hooks;
pub mod inputs;
pub mod registry;
pub mod trait_def;

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use trellis_db::models::{Dependency, Task};

pub use hooks::HookSet;
pub use inputs::InputResolutionError;
pub use registry::ExecutorRegistry;
pub use trait_def::{ExecContext, ExecOutcome, Executor, ProgressHandle};

/// Run one task through the full adapter path: executor lookup, input
/// composition, pre-hooks (the highest-priority layer), required-field
/// validation, execution, post-hooks.
///
/// Adapter-level failures (unknown executor, unresolvable inputs, strict
/// hook errors) come back as [`ExecOutcome::Failed`]; the scheduler does
/// not distinguish them from executor-reported failures.
pub async fn invoke(
    registry: &ExecutorRegistry,
    hooks: &HookSet,
    task: &Task,
    root_task_id: Uuid,
    dep_results: Vec<(Dependency, Option<Value>)>,
    cancel: CancellationToken,
    progress: ProgressHandle,
) -> ExecOutcome {
    let selector = task.executor_selector();
    let Some(executor) = registry.get(selector) else {
        return ExecOutcome::Failed(format!("no executor registered for {selector:?}"));
    };
    let schema = executor.input_schema();

    // Lowest to highest: schema defaults, persisted inputs, dependency
    // results, then pre-hook mutations on the composed map.
    let mut task = task.clone();
    task.inputs = inputs::compose(&schema, &task.inputs, &dep_results);
    if let Err(e) = hooks.run_pre(&mut task) {
        return ExecOutcome::Failed(format!("pre-hook failed: {e:#}"));
    }
    if let Err(e) = inputs::validate_required(&schema, &task.inputs) {
        return ExecOutcome::Failed(e.to_string());
    }
    let resolved = task.inputs.clone();

    let ctx = ExecContext {
        task_id: task.id,
        root_task_id,
        inputs: resolved.clone(),
        params: task.params.clone(),
        cancel,
        progress,
    };
    let outcome = executor.execute(ctx).await;

    if let Err(e) = hooks.run_post(&task, &resolved, &outcome) {
        return ExecOutcome::Failed(format!("post-hook failed: {e:#}"));
    }

    outcome
}

/// Convenience: resolve the dependency results of `task` against a lookup
/// function, preserving declaration order so executors see a
/// deterministic layout.
pub fn dependency_results(
    task: &Task,
    lookup: impl Fn(Uuid) -> Option<Value>,
) -> Vec<(Dependency, Option<Value>)> {
    task.dependencies
        .iter()
        .map(|dep| (dep.clone(), lookup(dep.id)))
        .collect()
}

// Re-exported for executor implementations that need an Arc'd registry.
pub type SharedRegistry = Arc<ExecutorRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct Doubler;

    #[async_trait]
    impl Executor for Doubler {
        fn id(&self) -> &str {
            "doubler"
        }

        fn input_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"value": {"type": "number"}},
                "required": ["value"]
            })
        }

        async fn execute(&self, ctx: ExecContext) -> ExecOutcome {
            let value = ctx.inputs["value"].as_f64().unwrap_or(0.0);
            ExecOutcome::Completed(json!(value * 2.0))
        }
    }

    fn task_named(name: &str, inputs: Value) -> Task {
        let now = chrono::Utc::now();
        Task {
            id: Uuid::new_v4(),
            parent_id: None,
            user_id: "u1".to_string(),
            name: name.to_string(),
            schemas: json!({}),
            priority: trellis_db::models::Priority::Normal,
            dependencies: vec![],
            inputs,
            params: json!({}),
            status: trellis_db::models::TaskStatus::Pending,
            progress: 0.0,
            result: None,
            error: None,
            seq: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            original_task_id: None,
            has_copy: false,
        }
    }

    #[tokio::test]
    async fn invoke_happy_path() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Doubler);
        let task = task_named("doubler", json!({"value": 21}));

        let outcome = invoke(
            &registry,
            &HookSet::new(),
            &task,
            task.id,
            vec![],
            CancellationToken::new(),
            ProgressHandle::noop(),
        )
        .await;
        assert_eq!(outcome, ExecOutcome::Completed(json!(42.0)));
    }

    #[tokio::test]
    async fn invoke_unknown_executor_fails() {
        let registry = ExecutorRegistry::new();
        let task = task_named("ghost", json!({}));
        let outcome = invoke(
            &registry,
            &HookSet::new(),
            &task,
            task.id,
            vec![],
            CancellationToken::new(),
            ProgressHandle::noop(),
        )
        .await;
        match outcome {
            ExecOutcome::Failed(msg) => assert!(msg.contains("ghost")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invoke_unresolved_inputs_fail() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Doubler);
        let task = task_named("doubler", json!({}));
        let outcome = invoke(
            &registry,
            &HookSet::new(),
            &task,
            task.id,
            vec![],
            CancellationToken::new(),
            ProgressHandle::noop(),
        )
        .await;
        match outcome {
            ExecOutcome::Failed(msg) => assert!(msg.starts_with("INPUT_RESOLUTION")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invoke_respects_schemas_method_override() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Doubler);
        let mut task = task_named("Display label, not a selector", json!({"value": 1}));
        task.schemas = json!({"method": "doubler"});
        let outcome = invoke(
            &registry,
            &HookSet::new(),
            &task,
            task.id,
            vec![],
            CancellationToken::new(),
            ProgressHandle::noop(),
        )
        .await;
        assert_eq!(outcome, ExecOutcome::Completed(json!(2.0)));
    }

    #[tokio::test]
    async fn pre_hook_feeds_inputs() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Doubler);
        let mut hooks = HookSet::new();
        hooks.register_pre(|task| {
            task.inputs["value"] = json!(5);
            Ok(())
        });
        let task = task_named("doubler", json!({}));
        let outcome = invoke(
            &registry,
            &hooks,
            &task,
            task.id,
            vec![],
            CancellationToken::new(),
            ProgressHandle::noop(),
        )
        .await;
        assert_eq!(outcome, ExecOutcome::Completed(json!(10.0)));
    }

    #[tokio::test]
    async fn pre_hook_overrides_bound_dependency_result() {
        // Pre-hooks are the highest layer: when a hook and a bound
        // required dependency target the same key, the hook wins.
        let mut registry = ExecutorRegistry::new();
        registry.register(Doubler);
        let mut hooks = HookSet::new();
        hooks.register_pre(|task| {
            task.inputs["value"] = json!(7);
            Ok(())
        });

        let dep = trellis_db::models::Dependency {
            id: Uuid::new_v4(),
            required: true,
            bind: Some("value".to_string()),
        };
        let task = task_named("doubler", json!({"value": 1}));
        let outcome = invoke(
            &registry,
            &hooks,
            &task,
            task.id,
            vec![(dep, Some(json!(3)))],
            CancellationToken::new(),
            ProgressHandle::noop(),
        )
        .await;
        assert_eq!(outcome, ExecOutcome::Completed(json!(14.0)));
    }
}
