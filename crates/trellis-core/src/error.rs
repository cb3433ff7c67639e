//! The engine error taxonomy.
//!
//! Validation failures aggregate every issue found in one request into a
//! single payload; everything else is a single-cause error. The RPC layer
//! maps these onto JSON-RPC error codes.

use std::fmt;

use serde::Serialize;
use uuid::Uuid;

use trellis_db::StoreError;

/// Machine-readable code attached to a validation issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCode {
    CircularDep,
    MultiRoot,
    UnknownRef,
    UserMismatch,
    DuplicateDep,
    PermanentField,
    DepsLocked,
    DeleteBlocked,
    BadPriority,
    InputResolution,
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CircularDep => "CIRCULAR_DEP",
            Self::MultiRoot => "MULTI_ROOT",
            Self::UnknownRef => "UNKNOWN_REF",
            Self::UserMismatch => "USER_MISMATCH",
            Self::DuplicateDep => "DUPLICATE_DEP",
            Self::PermanentField => "PERMANENT_FIELD",
            Self::DepsLocked => "DEPS_LOCKED",
            Self::DeleteBlocked => "DELETE_BLOCKED",
            Self::BadPriority => "BAD_PRIORITY",
            Self::InputResolution => "INPUT_RESOLUTION",
        };
        f.write_str(s)
    }
}

/// One violation found while validating a request.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    pub code: IssueCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
}

impl ValidationIssue {
    pub fn new(code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            task_id: None,
        }
    }

    pub fn for_task(code: IssueCode, task_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            task_id: Some(task_id),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.task_id {
            Some(id) => write!(f, "{}: {} (task {})", self.code, self.message, id),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

/// Errors surfaced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Shape or invariant violations, aggregated per request.
    #[error("validation failed: {}", format_issues(.0))]
    Validation(Vec<ValidationIssue>),

    #[error("task {0} not found")]
    NotFound(Uuid),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Operation not valid for the task's current status.
    #[error("invalid state: {0}")]
    State(String),

    /// A required dependency ended failed or cancelled.
    #[error("DEPENDENCY_UNSATISFIED: {dep_id}")]
    DependencyUnsatisfied { task_id: Uuid, dep_id: Uuid },

    /// The executor returned `failed` or raised; recorded on the task.
    #[error("executor error: {0}")]
    Executor(String),

    /// Push delivery failed after retries; non-fatal to the task.
    #[error("transport error: {0}")]
    Transport(String),

    /// A run for this root is already active.
    #[error("ALREADY_RUNNING: root task {0} has an active run")]
    AlreadyRunning(Uuid),

    #[error("internal error (correlation id {correlation_id}): {message}")]
    Internal {
        correlation_id: Uuid,
        message: String,
    },
}

impl CoreError {
    pub fn validation(issue: ValidationIssue) -> Self {
        Self::Validation(vec![issue])
    }

    pub fn internal(message: impl Into<String>) -> Self {
        let correlation_id = Uuid::new_v4();
        let message = message.into();
        tracing::error!(correlation_id = %correlation_id, %message, "internal error");
        Self::Internal {
            correlation_id,
            message,
        }
    }
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::Conflict { id, .. } => {
                Self::State(format!("task {id} was modified concurrently; retry"))
            }
            StoreError::DeleteBlocked {
                blocking_descendants,
                blocking_dependents,
            } => {
                let mut issues = Vec::new();
                for id in blocking_descendants {
                    issues.push(ValidationIssue::for_task(
                        IssueCode::DeleteBlocked,
                        id,
                        "descendant is not pending",
                    ));
                }
                for id in blocking_dependents {
                    issues.push(ValidationIssue::for_task(
                        IssueCode::DeleteBlocked,
                        id,
                        "task outside the subtree depends on it",
                    ));
                }
                Self::Validation(issues)
            }
            StoreError::Invariant { id, source } => {
                Self::State(format!("task {id}: {source}"))
            }
            StoreError::Database(e) => Self::internal(format!("database error: {e}")),
            StoreError::Corrupt { id, reason } => {
                Self::internal(format!("corrupt row for task {id}: {reason}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_codes_render_screaming_snake() {
        assert_eq!(IssueCode::CircularDep.to_string(), "CIRCULAR_DEP");
        assert_eq!(IssueCode::DeleteBlocked.to_string(), "DELETE_BLOCKED");
    }

    #[test]
    fn validation_error_aggregates_messages() {
        let err = CoreError::Validation(vec![
            ValidationIssue::new(IssueCode::MultiRoot, "two roots"),
            ValidationIssue::new(IssueCode::CircularDep, "a -> b -> a"),
        ]);
        let rendered = err.to_string();
        assert!(rendered.contains("MULTI_ROOT"));
        assert!(rendered.contains("CIRCULAR_DEP"));
    }

    #[test]
    fn delete_blocked_maps_to_validation() {
        let blocked = StoreError::DeleteBlocked {
            blocking_descendants: vec![Uuid::new_v4()],
            blocking_dependents: vec![Uuid::new_v4(), Uuid::new_v4()],
        };
        match CoreError::from(blocked) {
            CoreError::Validation(issues) => assert_eq!(issues.len(), 3),
            other => panic!("expected Validation, got {other:?}"),
        }
    }
}
