//! In-memory repository backend.
//!
//! The default store when `repository_url` is `memory:` (or unset), and
//! the backend the engine test-suites run against. A single `RwLock`
//! around the whole table gives every mutating operation the same
//! all-or-nothing semantics as a database transaction.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{CopyPlan, Task, TaskDelta, TaskFilter, TaskNode, TaskStatus, apply_delta};
use crate::repository::{Repository, StoreError};

#[derive(Default)]
struct Inner {
    tasks: HashMap<Uuid, Task>,
    next_seq: i64,
}

impl Inner {
    fn root_of(&self, id: Uuid) -> Result<Uuid, StoreError> {
        let mut current = id;
        let mut hops = 0usize;
        loop {
            let task = self.tasks.get(&current).ok_or(StoreError::NotFound(current))?;
            match task.parent_id {
                Some(parent) => current = parent,
                None => return Ok(current),
            }
            hops += 1;
            if hops > self.tasks.len() {
                return Err(StoreError::Corrupt {
                    id,
                    reason: "parent chain does not terminate".to_string(),
                });
            }
        }
    }

    fn descendants_of(&self, id: Uuid) -> Vec<Uuid> {
        let mut out = Vec::new();
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            let mut children: Vec<&Task> = self
                .tasks
                .values()
                .filter(|t| t.parent_id == Some(current))
                .collect();
            children.sort_by_key(|t| t.seq);
            for child in children {
                out.push(child.id);
                queue.push_back(child.id);
            }
        }
        out
    }

    /// Ids of every task in the same tree as `id`.
    fn tree_of(&self, id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let root = self.root_of(id)?;
        let mut ids = vec![root];
        ids.extend(self.descendants_of(root));
        Ok(ids)
    }

    fn dependents_within(&self, target: Uuid, tree: &[Uuid]) -> Vec<Uuid> {
        let mut out: Vec<&Task> = tree
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter(|t| t.dependencies.iter().any(|d| d.id == target))
            .collect();
        out.sort_by_key(|t| t.seq);
        out.iter().map(|t| t.id).collect()
    }
}

/// In-memory [`Repository`].
#[derive(Default)]
pub struct MemoryRepository {
    inner: RwLock<Inner>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn create_many(&self, tasks: Vec<Task>) -> Result<Vec<Task>, StoreError> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let mut created = Vec::with_capacity(tasks.len());
        for mut task in tasks {
            inner.next_seq += 1;
            task.seq = inner.next_seq;
            task.created_at = now;
            task.updated_at = now;
            inner.tasks.insert(task.id, task.clone());
            created.push(task);
        }
        Ok(created)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.tasks.get(&id).cloned())
    }

    async fn list(&self, filter: TaskFilter) -> Result<Vec<Task>, StoreError> {
        let inner = self.inner.read().await;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| {
                filter
                    .user_id
                    .as_deref()
                    .is_none_or(|u| t.user_id == u)
            })
            .filter(|t| filter.status.is_none_or(|s| t.status == s))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.seq.cmp(&a.seq));
        let offset = filter.offset.max(0) as usize;
        let limit = filter.limit.max(0) as usize;
        Ok(tasks.into_iter().skip(offset).take(limit).collect())
    }

    async fn get_root(&self, id: Uuid) -> Result<Task, StoreError> {
        let inner = self.inner.read().await;
        let root_id = inner.root_of(id)?;
        inner
            .tasks
            .get(&root_id)
            .cloned()
            .ok_or(StoreError::NotFound(root_id))
    }

    async fn build_subtree(&self, root_id: Uuid) -> Result<TaskNode, StoreError> {
        let inner = self.inner.read().await;
        let root = inner
            .tasks
            .get(&root_id)
            .cloned()
            .ok_or(StoreError::NotFound(root_id))?;

        fn build(inner: &Inner, task: Task) -> TaskNode {
            let mut children: Vec<Task> = inner
                .tasks
                .values()
                .filter(|t| t.parent_id == Some(task.id))
                .cloned()
                .collect();
            children.sort_by_key(|t| t.seq);
            TaskNode {
                task,
                children: children.into_iter().map(|c| build(inner, c)).collect(),
            }
        }

        Ok(build(&inner, root))
    }

    async fn get_all_descendants(&self, id: Uuid) -> Result<Vec<Task>, StoreError> {
        let inner = self.inner.read().await;
        if !inner.tasks.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        Ok(inner
            .descendants_of(id)
            .into_iter()
            .filter_map(|d| inner.tasks.get(&d).cloned())
            .collect())
    }

    async fn find_dependents(&self, id: Uuid) -> Result<Vec<Task>, StoreError> {
        let inner = self.inner.read().await;
        let tree = inner.tree_of(id)?;
        Ok(inner
            .dependents_within(id, &tree)
            .into_iter()
            .filter_map(|d| inner.tasks.get(&d).cloned())
            .collect())
    }

    async fn transitive_dependents(&self, ids: &[Uuid]) -> Result<Vec<Task>, StoreError> {
        let inner = self.inner.read().await;
        let mut seen: HashSet<Uuid> = ids.iter().copied().collect();
        let mut queue: VecDeque<Uuid> = ids.iter().copied().collect();
        let mut out = Vec::new();
        while let Some(current) = queue.pop_front() {
            let tree = inner.tree_of(current)?;
            for dep_id in inner.dependents_within(current, &tree) {
                if seen.insert(dep_id) {
                    queue.push_back(dep_id);
                    if let Some(task) = inner.tasks.get(&dep_id) {
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
        let mut inner = self.inner.write().await;
        let task = inner.tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if let Some(expected) = expected_updated_at {
            if task.updated_at != expected {
                return Err(StoreError::Conflict { id, expected });
            }
        }
        let mut updated = task.clone();
        apply_delta(&mut updated, &delta).map_err(|source| StoreError::Invariant { id, source })?;
        updated.updated_at = Utc::now();
        *task = updated.clone();
        Ok(updated)
    }

    async fn delete_subtree(&self, root_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.tasks.contains_key(&root_id) {
            return Err(StoreError::NotFound(root_id));
        }
        let mut subtree = vec![root_id];
        subtree.extend(inner.descendants_of(root_id));
        let members: HashSet<Uuid> = subtree.iter().copied().collect();

        let blocking_descendants: Vec<Uuid> = subtree
            .iter()
            .filter(|id| {
                inner
                    .tasks
                    .get(id)
                    .is_some_and(|t| t.status != TaskStatus::Pending)
            })
            .copied()
            .collect();

        let tree = inner.tree_of(root_id)?;
        let mut blocking_dependents: Vec<Uuid> = Vec::new();
        for member in &subtree {
            for dep in inner.dependents_within(*member, &tree) {
                if !members.contains(&dep) && !blocking_dependents.contains(&dep) {
                    blocking_dependents.push(dep);
                }
            }
        }

        if !blocking_descendants.is_empty() || !blocking_dependents.is_empty() {
            return Err(StoreError::DeleteBlocked {
                blocking_descendants,
                blocking_dependents,
            });
        }

        for id in &subtree {
            inner.tasks.remove(id);
        }
        Ok(subtree)
    }

    async fn copy_subtree(&self, plan: CopyPlan) -> Result<Task, StoreError> {
        let mut inner = self.inner.write().await;
        for original in &plan.mark_has_copy {
            if !inner.tasks.contains_key(original) {
                return Err(StoreError::NotFound(*original));
            }
        }
        let now = Utc::now();
        let mut new_root = None;
        for mut task in plan.tasks {
            inner.next_seq += 1;
            task.seq = inner.next_seq;
            task.created_at = now;
            task.updated_at = now;
            if task.id == plan.new_root_id {
                new_root = Some(task.clone());
            }
            inner.tasks.insert(task.id, task);
        }
        for original in &plan.mark_has_copy {
            if let Some(task) = inner.tasks.get_mut(original) {
                task.has_copy = true;
                task.updated_at = now;
            }
        }
        new_root.ok_or(StoreError::NotFound(plan.new_root_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Dependency, Priority};

    fn task(id: Uuid, parent: Option<Uuid>, deps: Vec<Dependency>) -> Task {
        let now = Utc::now();
        Task {
            id,
            parent_id: parent,
            user_id: "u1".to_string(),
            name: "t".to_string(),
            schemas: serde_json::json!({}),
            priority: Priority::Normal,
            dependencies: deps,
            inputs: serde_json::json!({}),
            params: serde_json::json!({}),
            status: TaskStatus::Pending,
            progress: 0.0,
            result: None,
            error: None,
            seq: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            original_task_id: None,
            has_copy: false,
        }
    }

    #[tokio::test]
    async fn create_assigns_monotonic_seq() {
        let repo = MemoryRepository::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let created = repo
            .create_many(vec![task(a, None, vec![]), task(b, Some(a), vec![])])
            .await
            .unwrap();
        assert!(created[0].seq < created[1].seq);
    }

    #[tokio::test]
    async fn get_root_walks_parents() {
        let repo = MemoryRepository::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        repo.create_many(vec![
            task(a, None, vec![]),
            task(b, Some(a), vec![]),
            task(c, Some(b), vec![]),
        ])
        .await
        .unwrap();
        assert_eq!(repo.get_root(c).await.unwrap().id, a);
    }

    #[tokio::test]
    async fn subtree_children_in_insertion_order() {
        let repo = MemoryRepository::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        repo.create_many(vec![
            task(a, None, vec![]),
            task(b, Some(a), vec![]),
            task(c, Some(a), vec![]),
        ])
        .await
        .unwrap();
        let node = repo.build_subtree(a).await.unwrap();
        let child_ids: Vec<Uuid> = node.children.iter().map(|n| n.task.id).collect();
        assert_eq!(child_ids, vec![b, c]);
    }

    #[tokio::test]
    async fn find_dependents_is_tree_bounded() {
        let repo = MemoryRepository::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        // A second tree with a (bogus) edge onto `a` must not show up.
        let other = Uuid::new_v4();
        repo.create_many(vec![
            task(a, None, vec![]),
            task(b, Some(a), vec![Dependency::required(a)]),
            task(other, None, vec![Dependency::required(a)]),
        ])
        .await
        .unwrap();
        let deps = repo.find_dependents(a).await.unwrap();
        let ids: Vec<Uuid> = deps.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![b]);
    }

    #[tokio::test]
    async fn transitive_dependents_closes_over_chains() {
        let repo = MemoryRepository::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        repo.create_many(vec![
            task(a, None, vec![]),
            task(b, Some(a), vec![Dependency::required(a)]),
            task(c, Some(a), vec![Dependency::required(b)]),
        ])
        .await
        .unwrap();
        let closure = repo.transitive_dependents(&[a]).await.unwrap();
        let ids: Vec<Uuid> = closure.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![b, c]);
    }

    #[tokio::test]
    async fn update_optimistic_concurrency() {
        let repo = MemoryRepository::new();
        let a = Uuid::new_v4();
        let created = repo.create_many(vec![task(a, None, vec![])]).await.unwrap();
        let stale = created[0].updated_at;

        let delta = TaskDelta {
            name: Some("renamed".to_string()),
            ..Default::default()
        };
        repo.update(a, delta.clone(), Some(stale)).await.unwrap();

        // Second write against the stale timestamp must conflict.
        let err = repo.update(a, delta, Some(stale)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn delete_blocked_by_non_pending_descendant() {
        let repo = MemoryRepository::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        repo.create_many(vec![task(a, None, vec![]), task(b, Some(a), vec![])])
            .await
            .unwrap();
        repo.update(
            b,
            TaskDelta {
                status: Some(TaskStatus::Completed),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();

        let err = repo.delete_subtree(a).await.unwrap_err();
        match err {
            StoreError::DeleteBlocked {
                blocking_descendants,
                ..
            } => assert_eq!(blocking_descendants, vec![b]),
            other => panic!("expected DeleteBlocked, got {other:?}"),
        }
        // Nothing was removed.
        assert!(repo.get(a).await.unwrap().is_some());
        assert!(repo.get(b).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_blocked_by_external_dependent() {
        let repo = MemoryRepository::new();
        let root = Uuid::new_v4();
        let inner_task = Uuid::new_v4();
        let outside = Uuid::new_v4();
        repo.create_many(vec![
            task(root, None, vec![]),
            task(inner_task, Some(root), vec![]),
            task(outside, Some(root), vec![Dependency::required(inner_task)]),
        ])
        .await
        .unwrap();

        let err = repo.delete_subtree(inner_task).await.unwrap_err();
        match err {
            StoreError::DeleteBlocked {
                blocking_dependents,
                ..
            } => assert_eq!(blocking_dependents, vec![outside]),
            other => panic!("expected DeleteBlocked, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_removes_whole_subtree() {
        let repo = MemoryRepository::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        repo.create_many(vec![
            task(a, None, vec![]),
            task(b, Some(a), vec![]),
            task(c, Some(b), vec![]),
        ])
        .await
        .unwrap();
        let removed = repo.delete_subtree(a).await.unwrap();
        assert_eq!(removed.len(), 3);
        assert!(repo.get(c).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_newest_first_with_filters() {
        let repo = MemoryRepository::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        repo.create_many(vec![task(a, None, vec![]), task(b, None, vec![])])
            .await
            .unwrap();
        let listed = repo.list(TaskFilter::default()).await.unwrap();
        assert_eq!(listed[0].id, b);
        assert_eq!(listed[1].id, a);

        let none = repo
            .list(TaskFilter {
                user_id: Some("someone-else".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
