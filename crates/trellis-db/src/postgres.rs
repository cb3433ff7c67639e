//! PostgreSQL repository backend.
//!
//! Runtime-checked sqlx queries (no live database needed at compile time).
//! Every mutating operation runs in one transaction; multi-row reads fetch
//! the whole tree inside a transaction so the result is consistent with a
//! single point in time.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::{
    CopyPlan, Dependency, Priority, Task, TaskDelta, TaskFilter, TaskNode, TaskStatus, apply_delta,
};
use crate::repository::{Repository, StoreError};

/// Raw row shape; converted to [`Task`] after decoding the JSONB columns.
#[derive(Debug, FromRow)]
struct TaskRow {
    id: Uuid,
    parent_id: Option<Uuid>,
    user_id: String,
    name: String,
    schemas: serde_json::Value,
    priority: i16,
    dependencies: serde_json::Value,
    inputs: serde_json::Value,
    params: serde_json::Value,
    status: TaskStatus,
    progress: f64,
    result: Option<serde_json::Value>,
    error: Option<String>,
    seq: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    original_task_id: Option<Uuid>,
    has_copy: bool,
}

impl TryFrom<TaskRow> for Task {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let priority = Priority::try_from(i64::from(row.priority)).map_err(|e| {
            StoreError::Corrupt {
                id: row.id,
                reason: e.to_string(),
            }
        })?;
        let dependencies: Vec<Dependency> =
            serde_json::from_value(row.dependencies).map_err(|e| StoreError::Corrupt {
                id: row.id,
                reason: format!("bad dependencies column: {e}"),
            })?;
        Ok(Task {
            id: row.id,
            parent_id: row.parent_id,
            user_id: row.user_id,
            name: row.name,
            schemas: row.schemas,
            priority,
            dependencies,
            inputs: row.inputs,
            params: row.params,
            status: row.status,
            progress: row.progress,
            result: row.result,
            error: row.error,
            seq: row.seq,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            original_task_id: row.original_task_id,
            has_copy: row.has_copy,
        })
    }
}

/// PostgreSQL-backed [`Repository`].
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_row(
        tx: &mut Transaction<'_, Postgres>,
        task: &Task,
    ) -> Result<Task, StoreError> {
        let deps = serde_json::to_value(&task.dependencies).unwrap_or_default();
        let row = sqlx::query_as::<_, TaskRow>(
            "INSERT INTO tasks (id, parent_id, user_id, name, schemas, priority, dependencies, \
                                inputs, params, status, progress, result, error, \
                                started_at, completed_at, original_task_id, has_copy) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17) \
             RETURNING *",
        )
        .bind(task.id)
        .bind(task.parent_id)
        .bind(&task.user_id)
        .bind(&task.name)
        .bind(&task.schemas)
        .bind(i16::from(task.priority.as_u8()))
        .bind(deps)
        .bind(&task.inputs)
        .bind(&task.params)
        .bind(task.status)
        .bind(task.progress)
        .bind(&task.result)
        .bind(&task.error)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(task.original_task_id)
        .bind(task.has_copy)
        .fetch_one(&mut **tx)
        .await?;
        Task::try_from(row)
    }

    /// Fetch every task in the tree containing `id`, ordered by `seq`,
    /// inside the given transaction.
    async fn fetch_tree(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "WITH RECURSIVE up AS ( \
                 SELECT * FROM tasks WHERE id = $1 \
                 UNION ALL \
                 SELECT t.* FROM tasks t JOIN up ON up.parent_id = t.id \
             ), down AS ( \
                 SELECT * FROM up WHERE parent_id IS NULL \
                 UNION ALL \
                 SELECT t.* FROM tasks t JOIN down ON t.parent_id = down.id \
             ) \
             SELECT * FROM down ORDER BY seq ASC",
        )
        .bind(id)
        .fetch_all(&mut **tx)
        .await?;

        if rows.is_empty() {
            return Err(StoreError::NotFound(id));
        }
        rows.into_iter().map(Task::try_from).collect()
    }

    /// Order a batch parent-first so self-referencing FK inserts succeed.
    fn parent_first(tasks: Vec<Task>) -> Vec<Task> {
        let in_batch: HashSet<Uuid> = tasks.iter().map(|t| t.id).collect();
        let mut by_parent: HashMap<Option<Uuid>, Vec<Task>> = HashMap::new();
        for task in tasks {
            let key = task.parent_id.filter(|p| in_batch.contains(p));
            by_parent.entry(key).or_default().push(task);
        }
        let mut ordered = Vec::new();
        let mut queue: VecDeque<Task> =
            by_parent.remove(&None).unwrap_or_default().into();
        while let Some(task) = queue.pop_front() {
            if let Some(children) = by_parent.remove(&Some(task.id)) {
                queue.extend(children);
            }
            ordered.push(task);
        }
        // Anything left has an unreachable parent; append so the database
        // reports the FK violation rather than silently dropping rows.
        for (_, rest) in by_parent {
            ordered.extend(rest);
        }
        ordered
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn create_many(&self, tasks: Vec<Task>) -> Result<Vec<Task>, StoreError> {
        let submitted: Vec<Uuid> = tasks.iter().map(|t| t.id).collect();
        let mut tx = self.pool.begin().await?;
        let mut created_by_id = HashMap::with_capacity(tasks.len());
        for task in Self::parent_first(tasks) {
            let created = Self::insert_row(&mut tx, &task).await?;
            created_by_id.insert(created.id, created);
        }
        tx.commit().await?;
        // Return rows in submission order.
        Ok(submitted
            .into_iter()
            .filter_map(|id| created_by_id.remove(&id))
            .collect())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Task::try_from).transpose()
    }

    async fn list(&self, filter: TaskFilter) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM tasks \
             WHERE ($1::text IS NULL OR user_id = $1) \
               AND ($2::text IS NULL OR status = $2) \
             ORDER BY seq DESC \
             LIMIT $3 OFFSET $4",
        )
        .bind(filter.user_id)
        .bind(filter.status.map(|s| s.to_string()))
        .bind(filter.limit.max(0))
        .bind(filter.offset.max(0))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn get_root(&self, id: Uuid) -> Result<Task, StoreError> {
        let row = sqlx::query_as::<_, TaskRow>(
            "WITH RECURSIVE up AS ( \
                 SELECT * FROM tasks WHERE id = $1 \
                 UNION ALL \
                 SELECT t.* FROM tasks t JOIN up ON up.parent_id = t.id \
             ) \
             SELECT * FROM up WHERE parent_id IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Task::try_from)
            .transpose()?
            .ok_or(StoreError::NotFound(id))
    }

    async fn build_subtree(&self, root_id: Uuid) -> Result<TaskNode, StoreError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query_as::<_, TaskRow>(
            "WITH RECURSIVE down AS ( \
                 SELECT * FROM tasks WHERE id = $1 \
                 UNION ALL \
                 SELECT t.* FROM tasks t JOIN down ON t.parent_id = down.id \
             ) \
             SELECT * FROM down ORDER BY seq ASC",
        )
        .bind(root_id)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let tasks: Vec<Task> = rows
            .into_iter()
            .map(Task::try_from)
            .collect::<Result<_, _>>()?;
        let root = tasks
            .iter()
            .find(|t| t.id == root_id)
            .cloned()
            .ok_or(StoreError::NotFound(root_id))?;

        let mut children_of: HashMap<Uuid, Vec<Task>> = HashMap::new();
        for task in tasks {
            if task.id == root_id {
                continue;
            }
            if let Some(parent) = task.parent_id {
                children_of.entry(parent).or_default().push(task);
            }
        }

        fn build(task: Task, children_of: &mut HashMap<Uuid, Vec<Task>>) -> TaskNode {
            let children = children_of.remove(&task.id).unwrap_or_default();
            TaskNode {
                task,
                children: children
                    .into_iter()
                    .map(|c| build(c, children_of))
                    .collect(),
            }
        }

        Ok(build(root, &mut children_of))
    }

    async fn get_all_descendants(&self, id: Uuid) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "WITH RECURSIVE down AS ( \
                 SELECT * FROM tasks WHERE id = $1 \
                 UNION ALL \
                 SELECT t.* FROM tasks t JOIN down ON t.parent_id = down.id \
             ) \
             SELECT * FROM down WHERE id != $1 ORDER BY seq ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn find_dependents(&self, id: Uuid) -> Result<Vec<Task>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let tree = Self::fetch_tree(&mut tx, id).await?;
        tx.commit().await?;
        Ok(tree
            .into_iter()
            .filter(|t| t.dependencies.iter().any(|d| d.id == id))
            .collect())
    }

    async fn transitive_dependents(&self, ids: &[Uuid]) -> Result<Vec<Task>, StoreError> {
        let mut tx = self.pool.begin().await?;
        // Group the seeds by tree and fetch each tree once.
        let mut trees: Vec<Vec<Task>> = Vec::new();
        let mut covered: HashSet<Uuid> = HashSet::new();
        for id in ids {
            if covered.contains(id) {
                continue;
            }
            let tree = Self::fetch_tree(&mut tx, *id).await?;
            covered.extend(tree.iter().map(|t| t.id));
            trees.push(tree);
        }
        tx.commit().await?;

        let mut seen: HashSet<Uuid> = ids.iter().copied().collect();
        let mut queue: VecDeque<Uuid> = ids.iter().copied().collect();
        let mut out = Vec::new();
        while let Some(current) = queue.pop_front() {
            for tree in &trees {
                for task in tree {
                    if task.dependencies.iter().any(|d| d.id == current)
                        && seen.insert(task.id)
                    {
                        queue.push_back(task.id);
                        out.push(task.clone());
                    }
                }
            }
        }
        out.sort_by_key(|t| t.seq);
        Ok(out)
    }

    async fn update(
        &self,
        id: Uuid,
        delta: TaskDelta,
        expected_updated_at: Option<DateTime<Utc>>,
    ) -> Result<Task, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let mut task = row
            .map(Task::try_from)
            .transpose()?
            .ok_or(StoreError::NotFound(id))?;

        if let Some(expected) = expected_updated_at {
            if task.updated_at != expected {
                return Err(StoreError::Conflict { id, expected });
            }
        }

        apply_delta(&mut task, &delta).map_err(|source| StoreError::Invariant { id, source })?;
        task.updated_at = Utc::now();

        let deps = serde_json::to_value(&task.dependencies).unwrap_or_default();
        let row = sqlx::query_as::<_, TaskRow>(
            "UPDATE tasks \
             SET name = $2, schemas = $3, priority = $4, dependencies = $5, \
                 inputs = $6, params = $7, status = $8, progress = $9, \
                 result = $10, error = $11, updated_at = $12, \
                 started_at = $13, completed_at = $14, has_copy = $15 \
             WHERE id = $1 \
             RETURNING *",
        )
        .bind(task.id)
        .bind(&task.name)
        .bind(&task.schemas)
        .bind(i16::from(task.priority.as_u8()))
        .bind(deps)
        .bind(&task.inputs)
        .bind(&task.params)
        .bind(task.status)
        .bind(task.progress)
        .bind(&task.result)
        .bind(&task.error)
        .bind(task.updated_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(task.has_copy)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Task::try_from(row)
    }

    async fn delete_subtree(&self, root_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let tree = Self::fetch_tree(&mut tx, root_id).await?;
        if !tree.iter().any(|t| t.id == root_id) {
            return Err(StoreError::NotFound(root_id));
        }

        let mut subtree: HashSet<Uuid> = HashSet::from([root_id]);
        // The tree is seq-ordered, so parents are visited before children.
        for task in &tree {
            if let Some(parent) = task.parent_id {
                if subtree.contains(&parent) {
                    subtree.insert(task.id);
                }
            }
        }

        let blocking_descendants: Vec<Uuid> = tree
            .iter()
            .filter(|t| subtree.contains(&t.id) && t.status != TaskStatus::Pending)
            .map(|t| t.id)
            .collect();
        let blocking_dependents: Vec<Uuid> = tree
            .iter()
            .filter(|t| !subtree.contains(&t.id))
            .filter(|t| t.dependencies.iter().any(|d| subtree.contains(&d.id)))
            .map(|t| t.id)
            .collect();

        if !blocking_descendants.is_empty() || !blocking_dependents.is_empty() {
            return Err(StoreError::DeleteBlocked {
                blocking_descendants,
                blocking_dependents,
            });
        }

        let removed: Vec<Uuid> = subtree.into_iter().collect();
        sqlx::query("DELETE FROM tasks WHERE id = ANY($1)")
            .bind(&removed)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(removed)
    }

    async fn copy_subtree(&self, plan: CopyPlan) -> Result<Task, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut new_root = None;
        for task in Self::parent_first(plan.tasks) {
            let created = Self::insert_row(&mut tx, &task).await?;
            if created.id == plan.new_root_id {
                new_root = Some(created);
            }
        }
        let updated = sqlx::query(
            "UPDATE tasks SET has_copy = TRUE, updated_at = NOW() WHERE id = ANY($1)",
        )
        .bind(&plan.mark_has_copy)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() != plan.mark_has_copy.len() as u64 {
            // An original disappeared between planning and persisting.
            return Err(StoreError::NotFound(
                plan.mark_has_copy.first().copied().unwrap_or(plan.new_root_id),
            ));
        }
        tx.commit().await?;
        new_root.ok_or(StoreError::NotFound(plan.new_root_id))
    }
}
