//! HTTP push callbacks: a bus subscriber that POSTs every event to a
//! configured URL.
//!
//! Transport errors and 5xx responses are retried with exponential
//! backoff (base delay doubling per retry, at most `1 + max_retries`
//! attempts); a 4xx response is final. Delivery failures never fail the
//! task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::CoreError;
use crate::events::{EventBus, RunStatus, StreamEndReason, TaskEvent};

/// Where and how to push events for one run.
#[derive(Debug, Clone, Deserialize)]
pub struct PushNotificationConfig {
    pub url: String,
    /// Extra headers attached to every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// HTTP verb; POST when unset.
    #[serde(default)]
    pub method: Option<String>,
}

/// Pushes task events to webhook URLs.
pub struct CallbackPusher {
    client: reqwest::Client,
    max_retries: u32,
    base_backoff: Duration,
}

impl CallbackPusher {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            max_retries: config.callback_max_retries,
            base_backoff: config.callback_base_backoff,
        }
    }

    /// Delay before retry number `retry` (0-based): base doubled each
    /// time.
    fn backoff_delay(base: Duration, retry: u32) -> Duration {
        base.saturating_mul(2u32.saturating_pow(retry))
    }

    /// Subscribe to a root's topic and push every event until the stream
    /// ends. Returns the forwarding task's handle.
    pub fn attach(
        self: &Arc<Self>,
        bus: &EventBus,
        root_task_id: Uuid,
        config: PushNotificationConfig,
        protocol: &str,
    ) -> JoinHandle<()> {
        let mut rx = bus.subscribe(root_task_id);
        let pusher = self.clone();
        let protocol = protocol.to_string();
        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(
                            root_task_id = %root_task_id,
                            missed,
                            "callback subscriber lagged; disconnecting"
                        );
                        // Diagnostic final frame, then drop the
                        // subscription.
                        let end = TaskEvent::stream_end(root_task_id, StreamEndReason::Lagged);
                        if let Err(e) = pusher.deliver(&config, &protocol, &end).await {
                            tracing::warn!(root_task_id = %root_task_id, error = %e, "final callback failed");
                        }
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let is_end = event.is_stream_end();
                if let Err(e) = pusher.deliver(&config, &protocol, &event).await {
                    tracing::warn!(
                        root_task_id = %root_task_id,
                        url = %config.url,
                        error = %e,
                        "callback delivery failed"
                    );
                }
                if is_end {
                    break;
                }
            }
        })
    }

    /// Deliver one event, retrying per the backoff policy.
    pub async fn deliver(
        &self,
        config: &PushNotificationConfig,
        protocol: &str,
        event: &TaskEvent,
    ) -> Result<(), CoreError> {
        let method = config
            .method
            .as_deref()
            .map(|m| Method::from_bytes(m.to_ascii_uppercase().as_bytes()))
            .transpose()
            .map_err(|e| CoreError::Transport(format!("invalid callback method: {e}")))?
            .unwrap_or(Method::POST);
        let headers = build_headers(&config.headers);
        let body = callback_body(protocol, event);

        let mut last_error = String::new();
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Self::backoff_delay(self.base_backoff, attempt - 1)).await;
            }
            let response = self
                .client
                .request(method.clone(), &config.url)
                .headers(headers.clone())
                .json(&body)
                .send()
                .await;
            match response {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) if resp.status().is_client_error() => {
                    return Err(CoreError::Transport(format!(
                        "callback rejected with {} (no retry)",
                        resp.status()
                    )));
                }
                Ok(resp) => {
                    last_error = format!("server responded {}", resp.status());
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }
            tracing::debug!(
                url = %config.url,
                attempt = attempt + 1,
                error = %last_error,
                "callback attempt failed"
            );
        }
        Err(CoreError::Transport(format!(
            "callback to {} failed after {} attempt(s): {last_error}",
            config.url,
            self.max_retries + 1
        )))
    }
}

fn build_headers(raw: &HashMap<String, String>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in raw {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!(header = %name, "invalid callback header skipped"),
        }
    }
    headers
}

/// The agent-protocol body shape pushed for each event.
fn callback_body(protocol: &str, event: &TaskEvent) -> Value {
    let root = event.root_task_id();
    let task_id = event.task_id().unwrap_or(root);
    let state = match event {
        TaskEvent::TaskStarted { .. } | TaskEvent::TaskProgress { .. } => "working",
        TaskEvent::TaskCompleted { .. } => "completed",
        TaskEvent::TaskFailed { .. } => "failed",
        TaskEvent::TaskCancelled { .. } => "canceled",
        TaskEvent::RunFinal { status, .. } => match status {
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "canceled",
        },
        TaskEvent::StreamEnd { .. } => "completed",
    };
    let is_final = matches!(
        event,
        TaskEvent::RunFinal { .. } | TaskEvent::StreamEnd { .. }
    );

    let mut data = serde_json::to_value(event).unwrap_or_else(|_| json!({}));
    if let Some(map) = data.as_object_mut() {
        map.insert("protocol".to_string(), json!(protocol));
    }

    json!({
        "task_id": task_id,
        "context_id": root,
        "status": {
            "state": state,
            "message": {
                "role": "agent",
                "parts": [{ "kind": "data", "data": data }]
            }
        },
        "final": is_final
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_pusher(max_retries: u32) -> CallbackPusher {
        CallbackPusher {
            client: reqwest::Client::new(),
            max_retries,
            base_backoff: Duration::from_millis(5),
        }
    }

    fn completed_event() -> TaskEvent {
        let root = Uuid::new_v4();
        TaskEvent::TaskCompleted {
            task_id: root,
            root_task_id: root,
            timestamp: Utc::now(),
            progress: 1.0,
            result: Some(json!({"ok": true})),
        }
    }

    #[derive(Clone)]
    struct Hits {
        count: Arc<AtomicU32>,
        /// Status returned until `succeed_after` requests have been seen.
        failure: StatusCode,
        succeed_after: u32,
    }

    async fn serve(hits: Hits) -> String {
        async fn handler(State(hits): State<Hits>) -> StatusCode {
            let n = hits.count.fetch_add(1, Ordering::SeqCst) + 1;
            if n > hits.succeed_after {
                StatusCode::OK
            } else {
                hits.failure
            }
        }
        let app = Router::new().route("/hook", post(handler)).with_state(hits);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/hook")
    }

    #[test]
    fn backoff_doubles() {
        let base = Duration::from_secs(1);
        assert_eq!(CallbackPusher::backoff_delay(base, 0), Duration::from_secs(1));
        assert_eq!(CallbackPusher::backoff_delay(base, 1), Duration::from_secs(2));
        assert_eq!(CallbackPusher::backoff_delay(base, 2), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn retries_5xx_then_succeeds() {
        let count = Arc::new(AtomicU32::new(0));
        let url = serve(Hits {
            count: count.clone(),
            failure: StatusCode::INTERNAL_SERVER_ERROR,
            succeed_after: 2,
        })
        .await;

        let pusher = test_pusher(5);
        let config = PushNotificationConfig {
            url,
            headers: HashMap::new(),
            method: None,
        };
        pusher
            .deliver(&config, "jsonrpc", &completed_event())
            .await
            .expect("delivery should eventually succeed");
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempts_bounded_by_max_retries() {
        let count = Arc::new(AtomicU32::new(0));
        let url = serve(Hits {
            count: count.clone(),
            failure: StatusCode::INTERNAL_SERVER_ERROR,
            succeed_after: u32::MAX,
        })
        .await;

        let pusher = test_pusher(2);
        let config = PushNotificationConfig {
            url,
            headers: HashMap::new(),
            method: None,
        };
        let err = pusher
            .deliver(&config, "jsonrpc", &completed_event())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Transport(_)));
        // 1 initial + 2 retries.
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_error_is_final() {
        let count = Arc::new(AtomicU32::new(0));
        let url = serve(Hits {
            count: count.clone(),
            failure: StatusCode::NOT_FOUND,
            succeed_after: u32::MAX,
        })
        .await;

        let pusher = test_pusher(5);
        let config = PushNotificationConfig {
            url,
            headers: HashMap::new(),
            method: None,
        };
        let err = pusher
            .deliver(&config, "jsonrpc", &completed_event())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Transport(_)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn body_shape_matches_protocol() {
        let event = completed_event();
        let body = callback_body("a2a", &event);
        assert_eq!(body["status"]["state"], "completed");
        assert_eq!(body["status"]["message"]["role"], "agent");
        assert_eq!(body["final"], false);
        let data = &body["status"]["message"]["parts"][0]["data"];
        assert_eq!(data["protocol"], "a2a");
        assert_eq!(data["type"], "task_completed");
    }

    #[test]
    fn run_final_marks_final() {
        let root = Uuid::new_v4();
        let event = TaskEvent::RunFinal {
            root_task_id: root,
            timestamp: Utc::now(),
            status: RunStatus::Failed,
            completed: 1,
            failed: 1,
            cancelled: 0,
        };
        let body = callback_body("jsonrpc", &event);
        assert_eq!(body["final"], true);
        assert_eq!(body["status"]["state"], "failed");
        assert_eq!(body["task_id"], json!(root));
    }
}
