//! The persistence contract consumed by the scheduler and service layers.
//!
//! Any backend satisfying this trait is acceptable; the engine ships an
//! in-memory store and a PostgreSQL store. Every mutating operation is
//! atomic, and multi-row reads (tree builds) are consistent with a single
//! point in time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{CopyPlan, Task, TaskDelta, TaskFilter, TaskNode};

/// Error raised by repository operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(Uuid),

    /// Optimistic-concurrency failure: the row changed since it was read.
    #[error("concurrent update on task {id}: updated_at moved past {expected}")]
    Conflict { id: Uuid, expected: DateTime<Utc> },

    /// Delete refused because the subtree is not wholly `pending` or has
    /// dependents outside it. Carries the precise blockers.
    #[error(
        "delete blocked: {} non-pending descendant(s), {} external dependent(s)",
        blocking_descendants.len(),
        blocking_dependents.len()
    )]
    DeleteBlocked {
        blocking_descendants: Vec<Uuid>,
        blocking_dependents: Vec<Uuid>,
    },

    /// Row-level invariant violated by an update.
    #[error("invariant violation on task {id}: {source}")]
    Invariant {
        id: Uuid,
        source: crate::models::DeltaError,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A persisted row failed to decode into the model types.
    #[error("corrupt row for task {id}: {reason}")]
    Corrupt { id: Uuid, reason: String },
}

/// Abstract durable store for task rows. Object-safe; the engine holds it
/// as `Arc<dyn Repository>`.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Insert a batch of fully-formed rows in one transaction, assigning
    /// `seq`, `created_at`, and `updated_at`. Returns the created rows in
    /// submission order.
    async fn create_many(&self, tasks: Vec<Task>) -> Result<Vec<Task>, StoreError>;

    /// Fetch a single task.
    async fn get(&self, id: Uuid) -> Result<Option<Task>, StoreError>;

    /// List tasks matching the filter, newest-first.
    async fn list(&self, filter: TaskFilter) -> Result<Vec<Task>, StoreError>;

    /// Walk `parent_id` links from a task to its root.
    async fn get_root(&self, id: Uuid) -> Result<Task, StoreError>;

    /// Materialise the root plus all descendants, children in insertion
    /// order.
    async fn build_subtree(&self, root_id: Uuid) -> Result<TaskNode, StoreError>;

    /// Transitive children of a task (the task itself excluded).
    async fn get_all_descendants(&self, id: Uuid) -> Result<Vec<Task>, StoreError>;

    /// Tasks in the same tree whose dependency list references `id`.
    async fn find_dependents(&self, id: Uuid) -> Result<Vec<Task>, StoreError>;

    /// Iterative dependent closure of a set of tasks, bounded to their
    /// trees. The seed tasks themselves are excluded.
    async fn transitive_dependents(&self, ids: &[Uuid]) -> Result<Vec<Task>, StoreError>;

    /// Atomic partial update. When `expected_updated_at` is set, the write
    /// only lands if the stored `updated_at` still matches (optimistic
    /// concurrency); otherwise [`StoreError::Conflict`]. Bumps
    /// `updated_at` and returns the updated row.
    async fn update(
        &self,
        id: Uuid,
        delta: TaskDelta,
        expected_updated_at: Option<DateTime<Utc>>,
    ) -> Result<Task, StoreError>;

    /// Physically remove a task and its transitive children, refusing with
    /// [`StoreError::DeleteBlocked`] unless every member is `pending` and
    /// no outside task depends on any of them. All-or-nothing.
    async fn delete_subtree(&self, root_id: Uuid) -> Result<Vec<Uuid>, StoreError>;

    /// Persist a computed copy in one transaction: insert the fresh rows
    /// and set `has_copy = true` on the originals. Returns the new root.
    async fn copy_subtree(&self, plan: CopyPlan) -> Result<Task, StoreError>;
}
