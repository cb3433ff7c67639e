//! The event bus: per-root fan-out of status events.
//!
//! One topic per root task id, backed by a `tokio::sync::broadcast`
//! channel. The scheduler is the single publisher; transports (SSE
//! writers, the WebSocket multiplexer, the callback pusher) subscribe.
//! Delivery is live-only: a subscriber sees events from the moment of
//! subscription, and a subscriber that falls a full buffer behind is
//! disconnected by its transport with a diagnostic final frame.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Aggregate outcome of a run, carried by [`TaskEvent::RunFinal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Why a stream closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEndReason {
    /// The run finished; `RunFinal` was the previous frame.
    Finished,
    /// The subscriber fell behind its buffer and was disconnected.
    Lagged,
    /// The process is shutting down.
    Shutdown,
}

/// A progress event on a root task's topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    TaskStarted {
        task_id: Uuid,
        root_task_id: Uuid,
        timestamp: DateTime<Utc>,
        progress: f64,
    },
    TaskProgress {
        task_id: Uuid,
        root_task_id: Uuid,
        timestamp: DateTime<Utc>,
        progress: f64,
    },
    TaskCompleted {
        task_id: Uuid,
        root_task_id: Uuid,
        timestamp: DateTime<Utc>,
        progress: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    TaskFailed {
        task_id: Uuid,
        root_task_id: Uuid,
        timestamp: DateTime<Utc>,
        progress: f64,
        error: String,
    },
    TaskCancelled {
        task_id: Uuid,
        root_task_id: Uuid,
        timestamp: DateTime<Utc>,
        progress: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    /// Aggregate, emitted exactly once per run.
    RunFinal {
        root_task_id: Uuid,
        timestamp: DateTime<Utc>,
        status: RunStatus,
        completed: usize,
        failed: usize,
        cancelled: usize,
    },
    /// Always the last frame on a stream.
    StreamEnd {
        root_task_id: Uuid,
        timestamp: DateTime<Utc>,
        reason: StreamEndReason,
    },
}

impl TaskEvent {
    pub fn root_task_id(&self) -> Uuid {
        match self {
            Self::TaskStarted { root_task_id, .. }
            | Self::TaskProgress { root_task_id, .. }
            | Self::TaskCompleted { root_task_id, .. }
            | Self::TaskFailed { root_task_id, .. }
            | Self::TaskCancelled { root_task_id, .. }
            | Self::RunFinal { root_task_id, .. }
            | Self::StreamEnd { root_task_id, .. } => *root_task_id,
        }
    }

    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            Self::TaskStarted { task_id, .. }
            | Self::TaskProgress { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskCancelled { task_id, .. } => Some(*task_id),
            Self::RunFinal { .. } | Self::StreamEnd { .. } => None,
        }
    }

    /// `StreamEnd` terminates a subscription.
    pub fn is_stream_end(&self) -> bool {
        matches!(self, Self::StreamEnd { .. })
    }

    pub fn stream_end(root_task_id: Uuid, reason: StreamEndReason) -> Self {
        Self::StreamEnd {
            root_task_id,
            timestamp: Utc::now(),
            reason,
        }
    }
}

/// Per-root broadcast topics.
///
/// Publishing is non-blocking; a topic with no subscribers drops events
/// (delivery is live-only by design).
pub struct EventBus {
    topics: Mutex<HashMap<Uuid, broadcast::Sender<TaskEvent>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to the topic for a root task, creating it if absent.
    pub fn subscribe(&self, root_task_id: Uuid) -> broadcast::Receiver<TaskEvent> {
        let mut topics = self.topics.lock().expect("event bus lock poisoned");
        topics
            .entry(root_task_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish an event on its root's topic. `StreamEnd` retires the
    /// topic: subscribers drain what is buffered and then see the channel
    /// close.
    pub fn publish(&self, event: TaskEvent) {
        let root = event.root_task_id();
        let is_end = event.is_stream_end();
        let mut topics = self.topics.lock().expect("event bus lock poisoned");
        if let Some(sender) = topics.get(&root) {
            // An Err here just means no live subscribers.
            let _ = sender.send(event);
        }
        if is_end {
            topics.remove(&root);
        }
    }

    /// Number of currently live topics (for shutdown draining).
    pub fn topic_count(&self) -> usize {
        self.topics.lock().expect("event bus lock poisoned").len()
    }

    /// Emit `StreamEnd` on every live topic (process shutdown).
    pub fn close_all(&self, reason: StreamEndReason) {
        let mut topics = self.topics.lock().expect("event bus lock poisoned");
        for (root, sender) in topics.drain() {
            let _ = sender.send(TaskEvent::stream_end(root, reason));
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("topics", &self.topic_count())
            .field("capacity", &self.capacity)
            .finish()
    }
}
