//! Router assembly and the JSON-RPC endpoint handlers.

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::Value;
use tower_http::cors::CorsLayer;

use crate::agent_card::agent_card;
use crate::auth;
use crate::methods::{Dispatch, dispatch};
use crate::rpc::{PERMISSION_DENIED, RpcError, RpcRequest, error_response, result_response};
use crate::sse;
use crate::state::AppState;
use crate::ws;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", post(agent_endpoint))
        .route("/tasks", post(tasks_endpoint))
        .route("/system", post(system_endpoint))
        .route("/ws", get(ws::ws_handler))
        .route("/.well-known/agent-card", get(agent_card_endpoint))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn agent_card_endpoint(State(state): State<AppState>) -> Response {
    Json(agent_card(&state)).into_response()
}

/// The agent protocol endpoint; responses tagged `a2a`.
async fn agent_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    rpc_endpoint(state, headers, body, "a2a").await
}

/// Task CRUD/control; responses tagged `jsonrpc`.
async fn tasks_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    rpc_endpoint(state, headers, body, "jsonrpc").await
}

/// System methods share the dispatcher and the `jsonrpc` tag.
async fn system_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    rpc_endpoint(state, headers, body, "jsonrpc").await
}

async fn rpc_endpoint(
    state: AppState,
    headers: HeaderMap,
    body: Value,
    protocol: &'static str,
) -> Response {
    let request = match RpcRequest::parse(&body) {
        Ok(request) => request,
        Err(err) => return Json(error_response(None, protocol, &err)).into_response(),
    };
    let id = request.id.clone();

    let principal =
        match auth::extract_principal(&headers, &state.config.engine.default_user_id) {
            Ok(principal) => principal,
            Err(e) => {
                let err = RpcError::new(PERMISSION_DENIED, e.to_string());
                return Json(error_response(id, protocol, &err)).into_response();
            }
        };

    match dispatch(&state, &principal, protocol, &request).await {
        Ok(Dispatch::Value(result)) => {
            Json(result_response(id, protocol, result)).into_response()
        }
        Ok(Dispatch::Stream {
            envelope,
            events,
            root_task_id,
        }) => sse::run_stream(envelope, events, root_task_id).into_response(),
        Err(err) => Json(error_response(id, protocol, &err)).into_response(),
    }
}
