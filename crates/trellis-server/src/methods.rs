//! Maps JSON-RPC methods onto the service and the scheduler, and picks
//! the response mode for execution requests (sync, streaming, or push
//! callback).

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use uuid::Uuid;

use trellis_core::push::PushNotificationConfig;
use trellis_core::service::UpdateRequest;
use trellis_core::{Principal, RunOptions, TaskEvent};
use trellis_db::models::{NewTask, TaskFilter, TaskStatus};

use crate::rpc::{RpcError, RpcRequest, SERVER_ERROR, result_response};
use crate::state::AppState;

/// How the dispatcher wants the transport layer to answer.
pub enum Dispatch {
    /// A plain JSON-RPC result envelope body.
    Value(Value),
    /// A streaming run: the envelope is the first SSE frame, then events
    /// from the subscription until `StreamEnd`.
    Stream {
        envelope: Value,
        events: broadcast::Receiver<TaskEvent>,
        root_task_id: Uuid,
    },
}

/// Resolve legacy aliases onto the dotted method surface.
pub fn canonical_method(method: &str) -> &str {
    match method {
        "execute_task_tree" => "tasks.execute",
        "create_task_tree" => "tasks.create",
        "get_task" => "tasks.get",
        "update_task" => "tasks.update",
        "delete_task" => "tasks.delete",
        "list_tasks" => "tasks.list",
        "cancel_task" | "cancel" | "tasks.running.cancel" => "tasks.cancel",
        "copy_task_tree" => "tasks.copy",
        "generate_task_tree" => "tasks.generate",
        other => other,
    }
}

fn params<T: serde::de::DeserializeOwned>(request: &RpcRequest) -> Result<T, RpcError> {
    serde_json::from_value(request.params.clone())
        .map_err(|e| RpcError::invalid_params(format!("invalid params: {e}")))
}

#[derive(Debug, Deserialize)]
struct TaskIdParams {
    task_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct ExecuteParams {
    #[serde(default)]
    task_id: Option<Uuid>,
    #[serde(default)]
    tasks: Option<Vec<NewTask>>,
    #[serde(default)]
    reexecute: Option<bool>,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    metadata: Value,
    #[serde(default)]
    configuration: Value,
}

#[derive(Debug, Deserialize)]
struct CreateParams {
    tasks: Vec<NewTask>,
}

#[derive(Debug, Deserialize)]
struct UpdateParams {
    task_id: Uuid,
    #[serde(flatten)]
    fields: UpdateRequest,
}

#[derive(Debug, Deserialize)]
struct ListParams {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    status: Option<TaskStatus>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct CopyParams {
    task_id: Uuid,
    #[serde(default)]
    children: bool,
}

#[derive(Debug, Default, Deserialize)]
struct CancelParams {
    #[serde(default)]
    task_ids: Option<Vec<Uuid>>,
    #[serde(default)]
    task_id: Option<Uuid>,
    #[serde(default)]
    context_id: Option<Uuid>,
    #[serde(default)]
    metadata: Value,
}

impl CancelParams {
    /// Identifier resolution order: `task_id`, `context_id`,
    /// `metadata.task_id`, `metadata.context_id`.
    fn resolve_ids(&self) -> Result<Vec<Uuid>, RpcError> {
        if let Some(ids) = &self.task_ids {
            if !ids.is_empty() {
                return Ok(ids.clone());
            }
        }
        let from_metadata = |key: &str| {
            self.metadata
                .get(key)
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok())
        };
        self.task_id
            .or(self.context_id)
            .or_else(|| from_metadata("task_id"))
            .or_else(|| from_metadata("context_id"))
            .map(|id| vec![id])
            .ok_or_else(|| RpcError::invalid_params("no task identifier in cancel request"))
    }
}

#[derive(Debug, Deserialize)]
struct LlmKeyParams {
    #[serde(default)]
    key: Option<String>,
}

/// Dispatch one request. `protocol` tags the response envelope.
pub async fn dispatch(
    state: &AppState,
    principal: &Principal,
    protocol: &'static str,
    request: &RpcRequest,
) -> Result<Dispatch, RpcError> {
    let method = canonical_method(&request.method);
    match method {
        "tasks.execute" => execute(state, principal, protocol, request).await,
        "tasks.create" => {
            let p: CreateParams = params(request)?;
            let created = state.service.create_tree(principal, p.tasks).await?;
            let root = created.iter().find(|t| t.parent_id.is_none());
            Ok(Dispatch::Value(json!({
                "root_task_id": root.map(|t| t.id),
                "tasks": created,
            })))
        }
        "tasks.get" => {
            let p: TaskIdParams = params(request)?;
            let task = state.service.get(principal, p.task_id).await?;
            Ok(Dispatch::Value(serde_json::to_value(task).unwrap_or(Value::Null)))
        }
        "tasks.update" => {
            let p: UpdateParams = params(request)?;
            let task = state.service.update(principal, p.task_id, p.fields).await?;
            Ok(Dispatch::Value(serde_json::to_value(task).unwrap_or(Value::Null)))
        }
        "tasks.delete" => {
            let p: TaskIdParams = params(request)?;
            let deleted = state.service.delete(principal, p.task_id).await?;
            Ok(Dispatch::Value(json!({"deleted": deleted})))
        }
        "tasks.detail" => {
            let p: TaskIdParams = params(request)?;
            let detail = state.service.detail(principal, p.task_id).await?;
            Ok(Dispatch::Value(serde_json::to_value(detail).unwrap_or(Value::Null)))
        }
        "tasks.tree" => {
            let p: TaskIdParams = params(request)?;
            let tree = state.service.tree(principal, p.task_id).await?;
            Ok(Dispatch::Value(serde_json::to_value(tree).unwrap_or(Value::Null)))
        }
        "tasks.children" => {
            let p: TaskIdParams = params(request)?;
            let children = state.service.children(principal, p.task_id).await?;
            Ok(Dispatch::Value(json!({"children": children})))
        }
        "tasks.list" => {
            let p: ListParams = params(request)?;
            let filter = TaskFilter {
                user_id: p.user_id,
                status: p.status,
                limit: p.limit.unwrap_or(50),
                offset: p.offset.unwrap_or(0),
            };
            let tasks = state.service.list(principal, filter).await?;
            Ok(Dispatch::Value(json!({"tasks": tasks})))
        }
        "tasks.running.list" => {
            let views = visible_runs(state, principal).await;
            Ok(Dispatch::Value(json!({"running": views})))
        }
        "tasks.running.count" => {
            let views = visible_runs(state, principal).await;
            Ok(Dispatch::Value(json!({"count": views.len()})))
        }
        "tasks.running.status" => {
            let p: TaskIdParams = params(request)?;
            state.service.get(principal, p.task_id).await?;
            let root = state
                .service
                .repository()
                .get_root(p.task_id)
                .await
                .map_err(trellis_core::CoreError::from)?;
            Ok(Dispatch::Value(json!({
                "run": state.scheduler.run_status(root.id),
            })))
        }
        "tasks.cancel" => {
            let p: CancelParams = params(request)?;
            let ids = p.resolve_ids()?;
            let mut cancelled = Vec::with_capacity(ids.len());
            for id in ids {
                state.service.get(principal, id).await?;
                state.scheduler.cancel(id).await?;
                cancelled.push(id);
            }
            Ok(Dispatch::Value(json!({"cancelled": cancelled})))
        }
        "tasks.copy" => {
            let p: CopyParams = params(request)?;
            let root = state
                .service
                .copy(principal, p.task_id, p.children)
                .await?;
            Ok(Dispatch::Value(serde_json::to_value(root).unwrap_or(Value::Null)))
        }
        "tasks.generate" => Err(RpcError::new(
            SERVER_ERROR,
            "tasks.generate requires a task-generation backend; none is configured",
        )),
        "system.health" => Ok(Dispatch::Value(json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "active_runs": state.scheduler.running_count(),
        }))),
        "config.llm_key.set" => {
            let p: LlmKeyParams = params(request)?;
            let key = p
                .key
                .ok_or_else(|| RpcError::invalid_params("missing key"))?;
            state
                .llm_keys
                .write()
                .await
                .insert(principal.user_id.clone(), key);
            Ok(Dispatch::Value(json!({"status": "ok"})))
        }
        "config.llm_key.get" => {
            let keys = state.llm_keys.read().await;
            let masked = keys.get(&principal.user_id).map(|k| mask_key(k));
            Ok(Dispatch::Value(json!({"key": masked})))
        }
        "config.llm_key.delete" => {
            let removed = state
                .llm_keys
                .write()
                .await
                .remove(&principal.user_id)
                .is_some();
            Ok(Dispatch::Value(json!({"deleted": removed})))
        }
        "examples.init" => {
            let created = state
                .service
                .create_tree(principal, example_tree())
                .await?;
            Ok(Dispatch::Value(json!({
                "root_task_id": created.first().map(|t| t.id),
                "created": created.len(),
            })))
        }
        "examples.status" => {
            let tasks = state
                .service
                .list(principal, TaskFilter {
                    limit: 1,
                    ..Default::default()
                })
                .await?;
            Ok(Dispatch::Value(json!({"initialized": !tasks.is_empty()})))
        }
        other => Err(RpcError::method_not_found(other)),
    }
}

/// Execution request: create-or-resolve the target, then pick the
/// response mode (`metadata.stream`, push callback config, or sync).
async fn execute(
    state: &AppState,
    principal: &Principal,
    protocol: &'static str,
    request: &RpcRequest,
) -> Result<Dispatch, RpcError> {
    let p: ExecuteParams = params(request)?;

    // Both input shapes normalise to "execute this task id": an embedded
    // task array is created first, then its root executes.
    let target_id = match (p.tasks, p.task_id) {
        (Some(tasks), _) => {
            let created = state.service.create_tree(principal, tasks).await?;
            created
                .iter()
                .find(|t| t.parent_id.is_none())
                .map(|t| t.id)
                .ok_or_else(|| RpcError::invalid_params("submission has no root"))?
        }
        (None, Some(task_id)) => {
            state.service.get(principal, task_id).await?;
            task_id
        }
        (None, None) => {
            return Err(RpcError::invalid_params(
                "tasks.execute needs task_id or a tasks array",
            ));
        }
    };

    let opts = RunOptions {
        reexecute: p.reexecute.unwrap_or(false),
        deadline: p.timeout_secs.map(std::time::Duration::from_secs),
    };

    let root = state
        .service
        .repository()
        .get_root(target_id)
        .await
        .map_err(trellis_core::CoreError::from)?;

    let stream_requested = p
        .metadata
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let push_config: Option<PushNotificationConfig> = p
        .configuration
        .get("push_notification_config")
        .map(|raw| {
            serde_json::from_value(raw.clone()).map_err(|e| {
                RpcError::invalid_params(format!("bad push_notification_config: {e}"))
            })
        })
        .transpose()?;

    if stream_requested {
        // Subscribe before the run starts: delivery is live-only.
        let events = state.bus.subscribe(root.id);
        let root_id = state.scheduler.start(target_id, opts).await?;
        let envelope = result_response(request.id.clone(), protocol, json!({
            "status": "started",
            "task_id": target_id,
            "root_task_id": root_id,
        }));
        return Ok(Dispatch::Stream {
            envelope,
            events,
            root_task_id: root_id,
        });
    }

    if let Some(push_config) = push_config {
        state
            .pusher
            .attach(&state.bus, root.id, push_config, protocol);
        let root_id = state.scheduler.start(target_id, opts).await?;
        return Ok(Dispatch::Value(json!({
            "status": "started",
            "task_id": target_id,
            "root_task_id": root_id,
        })));
    }

    let summary = state.scheduler.execute(target_id, opts).await?;
    Ok(Dispatch::Value(
        serde_json::to_value(summary).unwrap_or(Value::Null),
    ))
}

async fn visible_runs(
    state: &AppState,
    principal: &Principal,
) -> Vec<trellis_core::RunView> {
    let mut visible = Vec::new();
    for view in state.scheduler.running_roots() {
        if state
            .service
            .get(principal, view.root_task_id)
            .await
            .is_ok()
        {
            visible.push(view);
        }
    }
    visible
}

fn mask_key(key: &str) -> String {
    if key.len() <= 4 {
        "*".repeat(key.len())
    } else {
        format!("{}{}", "*".repeat(key.len() - 4), &key[key.len() - 4..])
    }
}

/// The sample tree seeded by `examples.init`.
fn example_tree() -> Vec<NewTask> {
    let root = Uuid::new_v4();
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    serde_json::from_value(json!([
        {
            "id": root,
            "name": "echo",
            "inputs": {"message": "example root"}
        },
        {
            "id": first,
            "parent_id": root,
            "name": "sleep",
            "inputs": {"duration_ms": 100}
        },
        {
            "id": second,
            "parent_id": root,
            "name": "echo",
            "dependencies": [{"id": first, "required": true}],
            "inputs": {"message": "after the sleep"}
        }
    ]))
    .expect("example tree is a valid submission")
}
