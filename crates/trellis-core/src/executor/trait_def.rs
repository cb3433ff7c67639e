//! The `Executor` trait -- the adapter interface for pluggable task
//! runtimes.
//!
//! Each concrete executor (HTTP call, shell command, LLM invocation, ...)
//! implements this trait. The trait is intentionally object-safe so it can
//! be stored as `Arc<dyn Executor>` in the [`super::ExecutorRegistry`].

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything an executor receives for one invocation.
#[derive(Clone)]
pub struct ExecContext {
    pub task_id: Uuid,
    pub root_task_id: Uuid,
    /// Fully-resolved inputs (schema defaults, persisted inputs,
    /// dependency results, pre-hook mutations merged).
    pub inputs: Value,
    /// Construction arguments persisted on the task.
    pub params: Value,
    /// Cancellation is cooperative: implementations should observe this
    /// token at their own suspension points.
    pub cancel: CancellationToken,
    /// Channel for executor-reported progress in `[0, 1]`.
    pub progress: ProgressHandle,
}

/// The terminal outcome of one executor invocation.
///
/// Executors report failure as a value rather than an error type; the
/// scheduler branches on the tag and records the payload on the task.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecOutcome {
    Completed(Value),
    Failed(String),
    /// Cancelled, optionally carrying a partial result.
    Cancelled(Option<Value>),
}

/// Adapter interface for running a single task's work.
///
/// # Object Safety
///
/// This trait is object-safe: it can be stored as `Arc<dyn Executor>` in
/// collections such as [`super::ExecutorRegistry`].
#[async_trait]
pub trait Executor: Send + Sync {
    /// Registry key; tasks select an executor by this identifier
    /// (`schemas.method`, falling back to the task name).
    fn id(&self) -> &str;

    /// Human-readable name, advertised on the agent card.
    fn name(&self) -> &str {
        self.id()
    }

    fn description(&self) -> &str {
        ""
    }

    /// JSON-Schema for the inputs. Property defaults seed input
    /// resolution; `required` entries must be bound before execution.
    fn input_schema(&self) -> Value {
        serde_json::json!({"type": "object"})
    }

    /// Run the task. Must be suspendable by `ctx.cancel`; a cancelled
    /// invocation should return [`ExecOutcome::Cancelled`], preserving a
    /// partial result when one exists.
    async fn execute(&self, ctx: ExecContext) -> ExecOutcome;
}

// Compile-time assertion: Executor must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Executor) {}
};

/// Callback used by executors to report progress mid-run.
///
/// The scheduler wires this to the event bus; the no-op variant keeps
/// executors testable in isolation.
#[derive(Clone)]
pub struct ProgressHandle {
    report: Arc<dyn Fn(f64) + Send + Sync>,
}

impl ProgressHandle {
    pub fn new(report: impl Fn(f64) + Send + Sync + 'static) -> Self {
        Self {
            report: Arc::new(report),
        }
    }

    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn report(&self, progress: f64) {
        (self.report)(progress.clamp(0.0, 1.0));
    }
}

impl std::fmt::Debug for ProgressHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProgressHandle")
    }
}
