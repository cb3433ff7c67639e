//! The task service: validated, permission-checked CRUD over the
//! repository. The RPC dispatcher translates requests into calls here and
//! into the scheduler; nothing above this layer touches the store
//! directly.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use trellis_db::Repository;
use trellis_db::models::{
    Dependency, DependencySpec, NewTask, Priority, Task, TaskDelta, TaskFilter, TaskNode,
    TaskStatus,
};

use crate::copy;
use crate::error::{CoreError, IssueCode, ValidationIssue};
use crate::graph;
use crate::principal::Principal;

/// Wire shape of a `tasks.update` request. `parent_id` and `user_id` are
/// captured only so their presence can be rejected.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateRequest {
    pub name: Option<String>,
    pub schemas: Option<Value>,
    pub priority: Option<Priority>,
    pub dependencies: Option<Vec<DependencySpec>>,
    pub inputs: Option<Value>,
    pub params: Option<Value>,
    pub status: Option<TaskStatus>,
    pub progress: Option<f64>,
    pub result: Option<Value>,
    pub error: Option<String>,
    #[serde(default)]
    pub parent_id: Option<Value>,
    #[serde(default)]
    pub user_id: Option<Value>,
}

/// A task together with its relations, for `tasks.detail`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskDetail {
    #[serde(flatten)]
    pub task: Task,
    pub dependents: Vec<Uuid>,
    pub children: Vec<Uuid>,
}

/// Validated, permission-checked operations over the repository.
pub struct TaskService {
    repo: Arc<dyn Repository>,
}

impl TaskService {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> Arc<dyn Repository> {
        self.repo.clone()
    }

    /// Create one tree from a submission: normalise, validate every
    /// invariant (aggregating violations), then persist atomically.
    pub async fn create_tree(
        &self,
        principal: &Principal,
        submission: Vec<NewTask>,
    ) -> Result<Vec<Task>, CoreError> {
        if submission.is_empty() {
            return Err(CoreError::validation(ValidationIssue::new(
                IssueCode::MultiRoot,
                "submission is empty",
            )));
        }

        let tasks = graph::materialize(submission, &principal.user_id);

        if !principal.is_admin() {
            if let Some(task) = tasks.iter().find(|t| t.user_id != principal.user_id) {
                return Err(CoreError::PermissionDenied(format!(
                    "cannot create tasks for user {:?}",
                    task.user_id
                )));
            }
        }

        // Resolve dependency targets outside the submission against the
        // store; only tasks the caller can touch count as known.
        let submitted: HashSet<Uuid> = tasks.iter().map(|t| t.id).collect();
        let mut external = HashSet::new();
        let candidate_dep_ids: Vec<Uuid> = tasks
            .iter()
            .flat_map(|t| t.dependencies.iter().map(|d| d.id))
            .filter(|id| !submitted.contains(id))
            .collect();
        for dep_id in candidate_dep_ids {
            if let Some(dep) = self.repo.get(dep_id).await? {
                if principal.can_access(&dep) {
                    external.insert(dep_id);
                }
            }
        }

        let issues = graph::validate(&tasks, &external);
        if !issues.is_empty() {
            return Err(CoreError::Validation(issues));
        }

        Ok(self.repo.create_many(tasks).await?)
    }

    pub async fn get(&self, principal: &Principal, id: Uuid) -> Result<Task, CoreError> {
        let task = self.repo.get(id).await?.ok_or(CoreError::NotFound(id))?;
        self.check_access(principal, &task)?;
        Ok(task)
    }

    pub async fn list(
        &self,
        principal: &Principal,
        mut filter: TaskFilter,
    ) -> Result<Vec<Task>, CoreError> {
        if !principal.is_admin() {
            filter.user_id = Some(principal.user_id.clone());
        }
        Ok(self.repo.list(filter).await?)
    }

    pub async fn tree(&self, principal: &Principal, id: Uuid) -> Result<TaskNode, CoreError> {
        self.get(principal, id).await?;
        Ok(self.repo.build_subtree(id).await?)
    }

    pub async fn children(
        &self,
        principal: &Principal,
        id: Uuid,
    ) -> Result<Vec<Task>, CoreError> {
        let node = self.tree(principal, id).await?;
        Ok(node.children.into_iter().map(|c| c.task).collect())
    }

    pub async fn detail(&self, principal: &Principal, id: Uuid) -> Result<TaskDetail, CoreError> {
        let task = self.get(principal, id).await?;
        let dependents = self
            .repo
            .find_dependents(id)
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();
        let children = self
            .repo
            .build_subtree(id)
            .await?
            .children
            .into_iter()
            .map(|c| c.task.id)
            .collect();
        Ok(TaskDetail {
            task,
            dependents,
            children,
        })
    }

    /// Selective update. Permanent fields are rejected, dependency edits
    /// are re-validated against the tree, and status changes maintain the
    /// lifecycle timestamps. All violations aggregate into one payload.
    pub async fn update(
        &self,
        principal: &Principal,
        id: Uuid,
        request: UpdateRequest,
    ) -> Result<Task, CoreError> {
        let task = self.get(principal, id).await?;
        let mut issues = Vec::new();

        if request.parent_id.is_some() {
            issues.push(ValidationIssue::for_task(
                IssueCode::PermanentField,
                id,
                "parent_id is immutable",
            ));
        }
        if request.user_id.is_some() {
            issues.push(ValidationIssue::for_task(
                IssueCode::PermanentField,
                id,
                "user_id is immutable",
            ));
        }

        let dependencies: Option<Vec<Dependency>> = request
            .dependencies
            .map(|deps| deps.into_iter().map(Into::into).collect());
        if let Some(new_deps) = &dependencies {
            if task.status != TaskStatus::Pending {
                issues.push(ValidationIssue::for_task(
                    IssueCode::DepsLocked,
                    id,
                    format!(
                        "dependencies are only mutable while pending (status is {})",
                        task.status
                    ),
                ));
            }
            let busy_dependents: Vec<Uuid> = self
                .repo
                .find_dependents(id)
                .await?
                .into_iter()
                .filter(|t| t.status == TaskStatus::InProgress)
                .map(|t| t.id)
                .collect();
            for dependent in busy_dependents {
                issues.push(ValidationIssue::for_task(
                    IssueCode::DepsLocked,
                    id,
                    format!("dependent task {dependent} is in progress"),
                ));
            }
            let root = self.repo.get_root(id).await?;
            let tree: Vec<Task> = self
                .repo
                .build_subtree(root.id)
                .await?
                .iter()
                .cloned()
                .collect();
            issues.extend(graph::validate_dependency_update(&tree, id, new_deps));
        }

        if !issues.is_empty() {
            return Err(CoreError::Validation(issues));
        }

        // Terminal monotonicity at the request boundary: completed and
        // cancelled tasks only change through the tree-copy mechanism;
        // failed may be reset for re-execution.
        if let Some(status) = request.status {
            if status != task.status
                && matches!(task.status, TaskStatus::Completed | TaskStatus::Cancelled)
            {
                return Err(CoreError::State(format!(
                    "task {id} is {} and cannot transition to {status}",
                    task.status
                )));
            }
        }

        let mut delta = TaskDelta {
            name: request.name,
            schemas: request.schemas,
            priority: request.priority,
            dependencies,
            inputs: request.inputs,
            params: request.params,
            status: request.status,
            progress: request.progress,
            result: request.result.map(Some),
            error: request.error.map(Some),
            ..Default::default()
        };
        // Status changes carry their timestamps.
        match request.status {
            Some(TaskStatus::InProgress) => delta.started_at = Some(Some(Utc::now())),
            Some(status) if status.is_terminal() => {
                delta.completed_at = Some(Some(Utc::now()));
            }
            _ => {}
        }

        Ok(self
            .repo
            .update(id, delta, Some(task.updated_at))
            .await?)
    }

    /// Physically delete a task and its subtree (all-pending, no external
    /// dependents). Returns the removed ids.
    pub async fn delete(&self, principal: &Principal, id: Uuid) -> Result<Vec<Uuid>, CoreError> {
        self.get(principal, id).await?;
        Ok(self.repo.delete_subtree(id).await?)
    }

    /// Clone a subtree for re-execution; see the tree-copy engine.
    pub async fn copy(
        &self,
        principal: &Principal,
        id: Uuid,
        include_children: bool,
    ) -> Result<Task, CoreError> {
        self.get(principal, id).await?;
        copy::copy_tree(self.repo.as_ref(), id, include_children).await
    }

    fn check_access(&self, principal: &Principal, task: &Task) -> Result<(), CoreError> {
        if principal.can_access(task) {
            Ok(())
        } else {
            Err(CoreError::PermissionDenied(format!(
                "task {} belongs to another user",
                task.id
            )))
        }
    }
}

impl std::fmt::Debug for TaskService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TaskService")
    }
}
