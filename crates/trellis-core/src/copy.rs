//! The tree-copy engine: produce a `pending` duplicate of a subtree for
//! fresh execution while keeping the original's history intact.
//!
//! The engine is a pure repository consumer: it computes the copy set and
//! the fresh rows, and hands the finished [`CopyPlan`] to
//! [`Repository::copy_subtree`] for atomic persistence.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use uuid::Uuid;

use trellis_db::Repository;
use trellis_db::models::{CopyPlan, Task, TaskStatus};

use crate::error::CoreError;

/// Copy the subtree rooted at `source_root_id` and persist it. Returns the
/// new root task.
pub async fn copy_tree(
    repo: &dyn Repository,
    source_root_id: Uuid,
    include_children: bool,
) -> Result<Task, CoreError> {
    let plan = plan_copy(repo, source_root_id, include_children).await?;
    Ok(repo.copy_subtree(plan).await?)
}

/// Compute the copy set and the reset rows without persisting anything.
pub async fn plan_copy(
    repo: &dyn Repository,
    source_root_id: Uuid,
    include_children: bool,
) -> Result<CopyPlan, CoreError> {
    let source = repo
        .get(source_root_id)
        .await?
        .ok_or(CoreError::NotFound(source_root_id))?;

    // Core set: the source task, plus its descendants when requested.
    let mut members: HashMap<Uuid, Task> = HashMap::from([(source.id, source.clone())]);
    if include_children {
        for task in repo.get_all_descendants(source_root_id).await? {
            members.insert(task.id, task);
        }
    }

    // Dependent closure: everything anywhere in the tree that depends on a
    // member, transitively, so the copy stays re-executable as a unit.
    let core_ids: Vec<Uuid> = members.keys().copied().collect();
    for task in repo.transitive_dependents(&core_ids).await? {
        members.insert(task.id, task);
    }

    // Failed-leaf rule: dependents that never started of a failed leaf are
    // excluded from the copy.
    let excluded = failed_leaf_exclusions(&members);
    for id in &excluded {
        members.remove(id);
        tracing::debug!(task_id = %id, "excluded never-started dependent of failed leaf from copy");
    }

    // Fresh ids for every copied row.
    let id_map: HashMap<Uuid, Uuid> = members
        .keys()
        .map(|old| (*old, Uuid::new_v4()))
        .collect();
    let new_root_id = id_map[&source.id];

    let mut ordered: Vec<&Task> = members.values().collect();
    ordered.sort_by_key(|t| t.seq);

    let now = Utc::now();
    let mut tasks = Vec::with_capacity(ordered.len());
    for original in ordered {
        let parent_id = if original.id == source.id {
            // The copy becomes a root of its own.
            None
        } else {
            match original.parent_id.and_then(|p| id_map.get(&p)) {
                Some(new_parent) => Some(*new_parent),
                None => {
                    // Parent was not copied (dependent pulled in from
                    // elsewhere in the tree): reattach under the new root
                    // to keep the copy a single tree.
                    tracing::debug!(
                        task_id = %original.id,
                        "copied dependent reattached under the new root"
                    );
                    Some(new_root_id)
                }
            }
        };

        let mut dependencies = Vec::with_capacity(original.dependencies.len());
        for dep in &original.dependencies {
            if let Some(new_id) = id_map.get(&dep.id) {
                let mut copied = dep.clone();
                copied.id = *new_id;
                dependencies.push(copied);
            } else if repo.get(dep.id).await?.is_some() {
                // External dependency: kept as an immutable reference to
                // the original so its result is inherited.
                dependencies.push(dep.clone());
            } else {
                tracing::warn!(
                    task_id = %original.id,
                    dep_id = %dep.id,
                    "stale dependency edge dropped from copy"
                );
            }
        }

        tasks.push(Task {
            id: id_map[&original.id],
            parent_id,
            user_id: original.user_id.clone(),
            name: original.name.clone(),
            schemas: original.schemas.clone(),
            priority: original.priority,
            dependencies,
            inputs: original.inputs.clone(),
            params: original.params.clone(),
            status: TaskStatus::Pending,
            progress: 0.0,
            result: None,
            error: None,
            seq: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            original_task_id: Some(source_root_id),
            has_copy: false,
        });
    }

    Ok(CopyPlan {
        new_root_id,
        tasks,
        mark_has_copy: members.keys().copied().collect(),
    })
}

/// Dependents of a failed leaf that are still `pending` never ran; copying
/// them would just re-create rows with no history. Returns the ids to drop
/// from the copy set.
fn failed_leaf_exclusions(members: &HashMap<Uuid, Task>) -> HashSet<Uuid> {
    let mut excluded = HashSet::new();
    for task in members.values() {
        if task.status != TaskStatus::Failed {
            continue;
        }
        let is_leaf = !members.values().any(|t| t.parent_id == Some(task.id));
        if !is_leaf {
            continue;
        }
        let dependents: Vec<&Task> = members
            .values()
            .filter(|t| t.dependencies.iter().any(|d| d.id == task.id))
            .collect();
        if !dependents.is_empty()
            && dependents.iter().all(|t| t.status == TaskStatus::Pending)
        {
            excluded.extend(dependents.iter().map(|t| t.id));
        }
    }
    excluded
}
