//! Built-in executors registered at startup.
//!
//! Concrete production executors (HTTP, SSH, containers, LLMs) live
//! outside this crate and plug in through the registry; these two exist
//! so a fresh install has something to run and the example trees work.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use trellis_core::executor::{ExecContext, ExecOutcome, Executor};

/// Completes with its resolved inputs.
pub struct EchoExecutor;

#[async_trait]
impl Executor for EchoExecutor {
    fn id(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Completes immediately, returning its resolved inputs."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": {"type": "string", "default": "hello"}
            }
        })
    }

    async fn execute(&self, ctx: ExecContext) -> ExecOutcome {
        ExecOutcome::Completed(ctx.inputs)
    }
}

/// Sleeps for `duration_ms`, reporting progress and honouring
/// cancellation.
pub struct SleepExecutor;

#[async_trait]
impl Executor for SleepExecutor {
    fn id(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Sleeps for duration_ms milliseconds, reporting progress."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "duration_ms": {"type": "integer", "default": 1000}
            }
        })
    }

    async fn execute(&self, ctx: ExecContext) -> ExecOutcome {
        let total = ctx.inputs["duration_ms"].as_u64().unwrap_or(1000);
        let step = (total / 10).max(1);
        let mut elapsed = 0u64;
        while elapsed < total {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(step)) => {
                    elapsed += step;
                    ctx.progress.report(elapsed as f64 / total as f64);
                }
                _ = ctx.cancel.cancelled() => {
                    return ExecOutcome::Cancelled(Some(json!({"slept_ms": elapsed})));
                }
            }
        }
        ExecOutcome::Completed(json!({"slept_ms": total}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;
    use trellis_core::executor::ProgressHandle;
    use uuid::Uuid;

    fn ctx(inputs: Value) -> ExecContext {
        ExecContext {
            task_id: Uuid::new_v4(),
            root_task_id: Uuid::new_v4(),
            inputs,
            params: json!({}),
            cancel: CancellationToken::new(),
            progress: ProgressHandle::noop(),
        }
    }

    #[tokio::test]
    async fn echo_returns_inputs() {
        let outcome = EchoExecutor.execute(ctx(json!({"message": "hi"}))).await;
        assert_eq!(outcome, ExecOutcome::Completed(json!({"message": "hi"})));
    }

    #[tokio::test]
    async fn sleep_completes() {
        let outcome = SleepExecutor.execute(ctx(json!({"duration_ms": 20}))).await;
        match outcome {
            ExecOutcome::Completed(v) => assert_eq!(v["slept_ms"], 20),
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sleep_honours_cancel() {
        let mut context = ctx(json!({"duration_ms": 60_000}));
        let token = CancellationToken::new();
        context.cancel = token.clone();
        let handle = tokio::spawn(async move { SleepExecutor.execute(context).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, ExecOutcome::Cancelled(Some(_))));
    }
}
