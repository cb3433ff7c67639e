//! JSON-RPC 2.0 envelopes and the engine-error mapping.

use serde::Deserialize;
use serde_json::{Value, json};

use trellis_core::CoreError;

pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const SERVER_ERROR: i64 = -32000;
pub const PERMISSION_DENIED: i64 = -32001;

/// A parsed JSON-RPC request.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    pub fn parse(body: &Value) -> Result<Self, RpcError> {
        let request: RpcRequest = serde_json::from_value(body.clone())
            .map_err(|e| RpcError::new(INVALID_REQUEST, format!("invalid request: {e}")))?;
        if let Some(version) = &request.jsonrpc {
            if version != "2.0" {
                return Err(RpcError::new(
                    INVALID_REQUEST,
                    format!("unsupported jsonrpc version {version:?}"),
                ));
            }
        }
        Ok(request)
    }
}

/// A JSON-RPC error object.
#[derive(Debug, Clone)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("method {method:?} not found"))
    }

    fn to_value(&self) -> Value {
        let mut err = json!({"code": self.code, "message": self.message});
        if let Some(data) = &self.data {
            err["data"] = data.clone();
        }
        err
    }
}

impl From<CoreError> for RpcError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(issues) => {
                let data = serde_json::to_value(&issues).unwrap_or(Value::Null);
                RpcError::new(INVALID_PARAMS, "validation failed").with_data(json!({
                    "issues": data
                }))
            }
            CoreError::NotFound(id) => {
                RpcError::new(SERVER_ERROR, format!("task {id} not found"))
            }
            CoreError::PermissionDenied(msg) => RpcError::new(PERMISSION_DENIED, msg),
            CoreError::State(msg) => RpcError::new(SERVER_ERROR, msg),
            CoreError::AlreadyRunning(root) => RpcError::new(
                SERVER_ERROR,
                format!("ALREADY_RUNNING: root task {root} has an active run"),
            ),
            CoreError::DependencyUnsatisfied { task_id, dep_id } => RpcError::new(
                SERVER_ERROR,
                format!("task {task_id} has unsatisfied dependency {dep_id}"),
            ),
            CoreError::Executor(msg) => RpcError::new(SERVER_ERROR, msg),
            CoreError::Transport(msg) => RpcError::new(SERVER_ERROR, msg),
            CoreError::Internal { correlation_id, .. } => RpcError::new(
                INTERNAL_ERROR,
                format!("internal error (correlation id {correlation_id})"),
            ),
        }
    }
}

/// Success envelope, tagged with the endpoint's protocol.
pub fn result_response(id: Option<Value>, protocol: &str, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id.unwrap_or(Value::Null),
        "protocol": protocol,
        "result": result,
    })
}

/// Error envelope, tagged with the endpoint's protocol.
pub fn error_response(id: Option<Value>, protocol: &str, error: &RpcError) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id.unwrap_or(Value::Null),
        "protocol": protocol,
        "error": error.to_value(),
    })
}
