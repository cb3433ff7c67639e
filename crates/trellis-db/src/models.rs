use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses never transition further except through the
    /// tree-copy mechanism (`failed` additionally allows re-execution).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Scheduling priority. Lower value dispatches earlier; the wire format is
/// the bare integer 0..=3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

impl TryFrom<i64> for Priority {
    type Error = PriorityParseError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Critical),
            1 => Ok(Self::High),
            2 => Ok(Self::Normal),
            3 => Ok(Self::Low),
            other => Err(PriorityParseError(other)),
        }
    }
}

impl Serialize for Priority {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = i64::deserialize(deserializer)?;
        Priority::try_from(raw).map_err(serde::de::Error::custom)
    }
}

/// Error returned for a priority value outside 0..=3.
#[derive(Debug, Clone)]
pub struct PriorityParseError(pub i64);

impl fmt::Display for PriorityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid priority {} (expected 0..=3)", self.0)
    }
}

impl std::error::Error for PriorityParseError {}

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

/// A dependency edge carried on the depending task.
///
/// `required` deps gate readiness on the dependency completing; optional
/// deps only require it to be terminal. `bind` names the input key the
/// dependency's result is projected under at input-resolution time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub id: Uuid,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Dependency {
    pub fn required(id: Uuid) -> Self {
        Self {
            id,
            required: true,
            bind: None,
        }
    }

    pub fn optional(id: Uuid) -> Self {
        Self {
            id,
            required: false,
            bind: None,
        }
    }
}

/// Wire form of a dependency: either a bare id string or a full object.
/// Normalised to [`Dependency`] (bare id means `required = true`).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DependencySpec {
    Id(Uuid),
    Full(Dependency),
}

impl From<DependencySpec> for Dependency {
    fn from(spec: DependencySpec) -> Self {
        match spec {
            DependencySpec::Id(id) => Dependency::required(id),
            DependencySpec::Full(dep) => dep,
        }
    }
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task -- the persisted unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub user_id: String,
    pub name: String,
    pub schemas: serde_json::Value,
    pub priority: Priority,
    pub dependencies: Vec<Dependency>,
    pub inputs: serde_json::Value,
    pub params: serde_json::Value,
    pub status: TaskStatus,
    pub progress: f64,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Persisted creation order; drives submission-order tie-breaks.
    pub seq: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub original_task_id: Option<Uuid>,
    pub has_copy: bool,
}

impl Task {
    /// The executor selector: `schemas.method` when present, else `name`.
    pub fn executor_selector(&self) -> &str {
        self.schemas
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.name)
    }
}

/// A task submission, before ids are assigned and rows persisted.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub user_id: Option<String>,
    pub name: String,
    #[serde(default = "empty_object")]
    pub schemas: serde_json::Value,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
    #[serde(default = "empty_object")]
    pub inputs: serde_json::Value,
    #[serde(default = "empty_object")]
    pub params: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Partial update applied by [`crate::Repository::update`].
///
/// `parent_id` and `user_id` are deliberately absent: they are permanent
/// fields and rejecting them happens at the request boundary.
/// Double-`Option` fields distinguish "leave unchanged" from "set NULL".
#[derive(Debug, Clone, Default)]
pub struct TaskDelta {
    pub name: Option<String>,
    pub schemas: Option<serde_json::Value>,
    pub priority: Option<Priority>,
    pub dependencies: Option<Vec<Dependency>>,
    pub inputs: Option<serde_json::Value>,
    pub params: Option<serde_json::Value>,
    pub status: Option<TaskStatus>,
    pub progress: Option<f64>,
    pub result: Option<Option<serde_json::Value>>,
    pub error: Option<Option<String>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub has_copy: Option<bool>,
}

/// Filter for [`crate::Repository::list`]. Results are newest-first.
#[derive(Debug, Clone)]
pub struct TaskFilter {
    pub user_id: Option<String>,
    pub status: Option<TaskStatus>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            user_id: None,
            status: None,
            limit: 50,
            offset: 0,
        }
    }
}

/// A materialised subtree: a task with its children in insertion order.
#[derive(Debug, Clone, Serialize)]
pub struct TaskNode {
    #[serde(flatten)]
    pub task: Task,
    pub children: Vec<TaskNode>,
}

impl TaskNode {
    /// Iterate the node and every descendant, depth-first.
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        let mut out = Vec::new();
        fn walk<'a>(node: &'a TaskNode, out: &mut Vec<&'a Task>) {
            out.push(&node.task);
            for child in &node.children {
                walk(child, out);
            }
        }
        walk(self, &mut out);
        out.into_iter()
    }
}

/// A fully-computed copy, applied atomically by
/// [`crate::Repository::copy_subtree`]. The tree-copy engine computes the
/// rows; the repository only persists them and flags the originals.
#[derive(Debug, Clone)]
pub struct CopyPlan {
    /// New root id (present in `tasks`).
    pub new_root_id: Uuid,
    /// Fresh rows to insert, in creation order.
    pub tasks: Vec<Task>,
    /// Originals to flag with `has_copy = true`.
    pub mark_has_copy: Vec<Uuid>,
}

// ---------------------------------------------------------------------------
// Delta application
// ---------------------------------------------------------------------------

/// Apply a delta to a task, enforcing the row-level invariants shared by
/// every backend:
///
/// - terminal monotonicity: `cancelled` never leaves its status;
///   `failed` may move back to `pending` or `in_progress`, and
///   `completed` may re-enter `in_progress` (both are re-execution
///   edges driven by the scheduler -- the request boundary holds
///   external callers to the stricter rule);
/// - progress is forced to 1.0 on `completed` and frozen on
///   `failed`/`cancelled`.
///
/// The caller is responsible for bumping `updated_at`.
pub fn apply_delta(task: &mut Task, delta: &TaskDelta) -> Result<(), DeltaError> {
    if let Some(status) = delta.status {
        if status != task.status {
            let allowed = match task.status {
                TaskStatus::Cancelled => false,
                TaskStatus::Completed => matches!(status, TaskStatus::InProgress),
                TaskStatus::Failed => {
                    matches!(status, TaskStatus::Pending | TaskStatus::InProgress)
                }
                _ => true,
            };
            if !allowed {
                return Err(DeltaError::TerminalStatus {
                    from: task.status,
                    to: status,
                });
            }
        }
        task.status = status;
    }

    if let Some(progress) = delta.progress {
        if !(0.0..=1.0).contains(&progress) {
            return Err(DeltaError::ProgressRange(progress));
        }
        // Frozen once failed or cancelled.
        if !matches!(task.status, TaskStatus::Failed | TaskStatus::Cancelled) {
            task.progress = progress;
        }
    }
    if task.status == TaskStatus::Completed {
        task.progress = 1.0;
    }

    if let Some(name) = &delta.name {
        task.name = name.clone();
    }
    if let Some(schemas) = &delta.schemas {
        task.schemas = schemas.clone();
    }
    if let Some(priority) = delta.priority {
        task.priority = priority;
    }
    if let Some(deps) = &delta.dependencies {
        task.dependencies = deps.clone();
    }
    if let Some(inputs) = &delta.inputs {
        task.inputs = inputs.clone();
    }
    if let Some(params) = &delta.params {
        task.params = params.clone();
    }
    if let Some(result) = &delta.result {
        task.result = result.clone();
    }
    if let Some(error) = &delta.error {
        task.error = error.clone();
    }
    if let Some(started_at) = delta.started_at {
        task.started_at = started_at;
    }
    if let Some(completed_at) = delta.completed_at {
        task.completed_at = completed_at;
    }
    if let Some(has_copy) = delta.has_copy {
        task.has_copy = has_copy;
    }

    Ok(())
}

/// Invariant violation raised by [`apply_delta`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeltaError {
    #[error("cannot transition task out of terminal status {from} to {to}")]
    TerminalStatus { from: TaskStatus, to: TaskStatus },
    #[error("progress {0} outside [0, 1]")]
    ProgressRange(f64),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            parent_id: None,
            user_id: "user-1".to_string(),
            name: "echo".to_string(),
            schemas: serde_json::json!({}),
            priority: Priority::Normal,
            dependencies: vec![],
            inputs: serde_json::json!({}),
            params: serde_json::json!({}),
            status: TaskStatus::Pending,
            progress: 0.0,
            result: None,
            error: None,
            seq: 1,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            original_task_id: None,
            has_copy: false,
        }
    }

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        let result = "done".parse::<TaskStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }

    #[test]
    fn priority_wire_format_is_integer() {
        let json = serde_json::to_string(&Priority::Critical).unwrap();
        assert_eq!(json, "0");
        let parsed: Priority = serde_json::from_str("3").unwrap();
        assert_eq!(parsed, Priority::Low);
    }

    #[test]
    fn priority_out_of_range() {
        assert!(serde_json::from_str::<Priority>("4").is_err());
        assert!(serde_json::from_str::<Priority>("-1").is_err());
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::Normal < Priority::Low);
    }

    #[test]
    fn dependency_spec_bare_id() {
        let id = Uuid::new_v4();
        let spec: DependencySpec = serde_json::from_value(serde_json::json!(id)).unwrap();
        let dep: Dependency = spec.into();
        assert_eq!(dep.id, id);
        assert!(dep.required);
        assert!(dep.bind.is_none());
    }

    #[test]
    fn dependency_spec_object() {
        let id = Uuid::new_v4();
        let spec: DependencySpec =
            serde_json::from_value(serde_json::json!({"id": id, "required": false, "bind": "upstream"}))
                .unwrap();
        let dep: Dependency = spec.into();
        assert!(!dep.required);
        assert_eq!(dep.bind.as_deref(), Some("upstream"));
    }

    #[test]
    fn dependency_spec_defaults_required() {
        let id = Uuid::new_v4();
        let spec: DependencySpec = serde_json::from_value(serde_json::json!({"id": id})).unwrap();
        let dep: Dependency = spec.into();
        assert!(dep.required);
    }

    #[test]
    fn executor_selector_prefers_schemas_method() {
        let mut task = sample_task();
        assert_eq!(task.executor_selector(), "echo");
        task.schemas = serde_json::json!({"method": "shell"});
        assert_eq!(task.executor_selector(), "shell");
    }

    #[test]
    fn apply_delta_completed_forces_progress() {
        let mut task = sample_task();
        let delta = TaskDelta {
            status: Some(TaskStatus::Completed),
            ..Default::default()
        };
        apply_delta(&mut task, &delta).unwrap();
        assert_eq!(task.progress, 1.0);
    }

    #[test]
    fn apply_delta_rejects_leaving_completed() {
        let mut task = sample_task();
        task.status = TaskStatus::Completed;
        let delta = TaskDelta {
            status: Some(TaskStatus::Pending),
            ..Default::default()
        };
        let err = apply_delta(&mut task, &delta).unwrap_err();
        assert!(matches!(err, DeltaError::TerminalStatus { .. }));
    }

    #[test]
    fn apply_delta_completed_may_reenter_in_progress() {
        // The re-execution edge: the scheduler restarts a completed task
        // in a re-run closure.
        let mut task = sample_task();
        task.status = TaskStatus::Completed;
        task.progress = 1.0;
        let delta = TaskDelta {
            status: Some(TaskStatus::InProgress),
            progress: Some(0.0),
            result: Some(None),
            ..Default::default()
        };
        apply_delta(&mut task, &delta).unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.progress, 0.0);
        assert!(task.result.is_none());
    }

    #[test]
    fn apply_delta_cancelled_is_strictly_terminal() {
        let mut task = sample_task();
        task.status = TaskStatus::Cancelled;
        let delta = TaskDelta {
            status: Some(TaskStatus::InProgress),
            ..Default::default()
        };
        assert!(apply_delta(&mut task, &delta).is_err());
    }

    #[test]
    fn apply_delta_failed_may_reenter_in_progress() {
        let mut task = sample_task();
        task.status = TaskStatus::Failed;
        let delta = TaskDelta {
            status: Some(TaskStatus::InProgress),
            ..Default::default()
        };
        apply_delta(&mut task, &delta).unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
    }

    #[test]
    fn apply_delta_freezes_progress_on_failed() {
        let mut task = sample_task();
        task.progress = 0.4;
        let delta = TaskDelta {
            status: Some(TaskStatus::Failed),
            progress: Some(0.9),
            ..Default::default()
        };
        apply_delta(&mut task, &delta).unwrap();
        assert_eq!(task.progress, 0.4);
    }

    #[test]
    fn apply_delta_progress_range_checked() {
        let mut task = sample_task();
        let delta = TaskDelta {
            progress: Some(1.5),
            ..Default::default()
        };
        assert!(apply_delta(&mut task, &delta).is_err());
    }

    #[test]
    fn task_node_iter_depth_first() {
        let a = sample_task();
        let mut b = sample_task();
        b.parent_id = Some(a.id);
        let mut c = sample_task();
        c.parent_id = Some(a.id);
        let node = TaskNode {
            task: a.clone(),
            children: vec![
                TaskNode {
                    task: b.clone(),
                    children: vec![],
                },
                TaskNode {
                    task: c.clone(),
                    children: vec![],
                },
            ],
        };
        let ids: Vec<Uuid> = node.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
    }
}
