//! WebSocket transport: one socket multiplexing many topics.
//!
//! The client sends `{action: subscribe|unsubscribe|ping, task_id?}`;
//! the server answers pings with `pong` and otherwise forwards topic
//! events tagged with their task id. A topic whose buffer the socket
//! falls behind is dropped with a diagnostic frame.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::StreamMap;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use uuid::Uuid;

use trellis_core::{Principal, StreamEndReason, TaskEvent};

use crate::auth;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct ClientMessage {
    action: String,
    #[serde(default)]
    task_id: Option<Uuid>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let principal = auth::extract_principal(&headers, &state.config.engine.default_user_id);
    ws.on_upgrade(move |socket| async move {
        match principal {
            Ok(principal) => {
                if let Err(e) = handle_socket(socket, state, principal).await {
                    tracing::debug!(error = %e, "websocket session ended with error");
                }
            }
            Err(e) => {
                let mut socket = socket;
                let _ = socket
                    .send(Message::Text(
                        json!({"error": e.to_string()}).to_string().into(),
                    ))
                    .await;
            }
        }
    })
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    principal: Principal,
) -> anyhow::Result<()> {
    let (mut sender, mut receiver) = socket.split();
    // Topic streams keyed by the *root* task id of each subscription.
    let mut topics: StreamMap<Uuid, BroadcastStream<TaskEvent>> = StreamMap::new();

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let Some(message) = incoming else { break };
                match message? {
                    Message::Text(text) => {
                        if let Some(reply) =
                            handle_client_message(&state, &principal, &mut topics, &text).await
                        {
                            sender.send(Message::Text(reply.to_string().into())).await?;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some((root, item)) = topics.next(), if !topics.is_empty() => {
                match item {
                    Ok(event) => {
                        let end = event.is_stream_end();
                        let frame = serde_json::to_string(&event)?;
                        sender.send(Message::Text(frame.into())).await?;
                        if end {
                            topics.remove(&root);
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(missed)) => {
                        tracing::warn!(
                            root_task_id = %root,
                            missed,
                            "websocket subscriber lagged; dropping topic"
                        );
                        let end = TaskEvent::stream_end(root, StreamEndReason::Lagged);
                        sender
                            .send(Message::Text(serde_json::to_string(&end)?.into()))
                            .await?;
                        topics.remove(&root);
                    }
                }
            }
        }
    }

    Ok(())
}

async fn handle_client_message(
    state: &AppState,
    principal: &Principal,
    topics: &mut StreamMap<Uuid, BroadcastStream<TaskEvent>>,
    text: &str,
) -> Option<serde_json::Value> {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => return Some(json!({"error": format!("bad message: {e}")})),
    };

    match message.action.as_str() {
        "ping" => Some(json!({"action": "pong"})),
        "subscribe" => {
            let Some(task_id) = message.task_id else {
                return Some(json!({"error": "subscribe needs task_id"}));
            };
            // Ownership check, then resolve the topic (the task's root).
            if let Err(e) = state.service.get(principal, task_id).await {
                return Some(json!({"error": e.to_string()}));
            }
            let root = match state.service.repository().get_root(task_id).await {
                Ok(root) => root.id,
                Err(e) => return Some(json!({"error": e.to_string()})),
            };
            topics.insert(root, BroadcastStream::new(state.bus.subscribe(root)));
            Some(json!({"action": "subscribed", "task_id": task_id, "root_task_id": root}))
        }
        "unsubscribe" => {
            let Some(task_id) = message.task_id else {
                return Some(json!({"error": "unsubscribe needs task_id"}));
            };
            let root = match state.service.repository().get_root(task_id).await {
                Ok(root) => root.id,
                Err(_) => task_id,
            };
            topics.remove(&root);
            Some(json!({"action": "unsubscribed", "task_id": task_id}))
        }
        other => Some(json!({"error": format!("unknown action {other:?}")})),
    }
}
