//! SSE transport: one `data: <json>` frame per event.
//!
//! For RPC-initiated streaming runs the first frame is the JSON-RPC
//! result envelope confirming the run started; the connection closes on
//! `StreamEnd` or client disconnect. A subscriber that falls behind its
//! buffer is disconnected with a diagnostic final frame.

use std::convert::Infallible;

use async_stream::stream;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use trellis_core::{StreamEndReason, TaskEvent};

pub fn run_stream(
    envelope: Value,
    mut events: broadcast::Receiver<TaskEvent>,
    root_task_id: Uuid,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = stream! {
        yield Ok(Event::default().data(envelope.to_string()));

        loop {
            match events.recv().await {
                Ok(event) => {
                    let end = event.is_stream_end();
                    match serde_json::to_string(&event) {
                        Ok(frame) => yield Ok(Event::default().data(frame)),
                        Err(e) => {
                            tracing::error!(error = %e, "failed to serialise event frame");
                        }
                    }
                    if end {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(
                        root_task_id = %root_task_id,
                        missed,
                        "SSE subscriber lagged; disconnecting"
                    );
                    let end = TaskEvent::stream_end(root_task_id, StreamEndReason::Lagged);
                    if let Ok(frame) = serde_json::to_string(&end) {
                        yield Ok(Event::default().data(frame));
                    }
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}
