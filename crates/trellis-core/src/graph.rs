//! Task-graph construction and validation.
//!
//! A submission is an array of task descriptions forming one tree
//! (parent/child) overlaid with a dependency DAG. This module materialises
//! the rows (id assignment, dependency normalisation, defaults) and checks
//! the structural invariants, collecting every violation so the caller can
//! report them in a single payload.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use uuid::Uuid;

use trellis_db::models::{NewTask, Priority, Task, TaskStatus};

use crate::error::{IssueCode, ValidationIssue};

/// Turn a submission into fully-formed rows: assign missing ids, normalise
/// dependency specs, default the priority, and fill `user_id` from the
/// caller where a task does not carry one.
pub fn materialize(submission: Vec<NewTask>, fallback_user: &str) -> Vec<Task> {
    let now = Utc::now();
    submission
        .into_iter()
        .map(|new| Task {
            id: new.id.unwrap_or_else(Uuid::new_v4),
            parent_id: new.parent_id,
            user_id: new.user_id.unwrap_or_else(|| fallback_user.to_string()),
            name: new.name,
            schemas: new.schemas,
            priority: new.priority.unwrap_or(Priority::Normal),
            dependencies: new.dependencies.into_iter().map(Into::into).collect(),
            inputs: new.inputs,
            params: new.params,
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
        })
        .collect()
}

/// Validate a materialised submission.
///
/// `external` is the set of dependency targets that already exist in the
/// store; everything else must resolve within the submission. Returns
/// every violation found, in invariant order (user uniformity, single
/// root, closed dependencies, acyclicity, parent reachability).
pub fn validate(tasks: &[Task], external: &HashSet<Uuid>) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let by_id: HashMap<Uuid, &Task> = tasks.iter().map(|t| (t.id, t)).collect();

    if by_id.len() != tasks.len() {
        issues.push(ValidationIssue::new(
            IssueCode::UnknownRef,
            "duplicate task ids in submission",
        ));
    }

    // User uniformity.
    if let Some(first) = tasks.first() {
        for task in tasks {
            if task.user_id != first.user_id {
                issues.push(ValidationIssue::for_task(
                    IssueCode::UserMismatch,
                    task.id,
                    format!(
                        "task user {:?} differs from tree user {:?}",
                        task.user_id, first.user_id
                    ),
                ));
            }
        }
    }

    // Single root.
    let roots: Vec<&Task> = tasks.iter().filter(|t| t.parent_id.is_none()).collect();
    match roots.len() {
        1 => {}
        0 => issues.push(ValidationIssue::new(
            IssueCode::MultiRoot,
            "submission has no task with a null parent_id",
        )),
        n => issues.push(ValidationIssue::new(
            IssueCode::MultiRoot,
            format!("submission has {n} root tasks, expected exactly one"),
        )),
    }

    // Closed dependencies, duplicates.
    for task in tasks {
        let mut seen = HashSet::new();
        for dep in &task.dependencies {
            if !seen.insert(dep.id) {
                issues.push(ValidationIssue::for_task(
                    IssueCode::DuplicateDep,
                    task.id,
                    format!("dependency {} declared more than once", dep.id),
                ));
            }
            if dep.id == task.id {
                issues.push(ValidationIssue::for_task(
                    IssueCode::CircularDep,
                    task.id,
                    "task depends on itself",
                ));
            } else if !by_id.contains_key(&dep.id) && !external.contains(&dep.id) {
                issues.push(ValidationIssue::for_task(
                    IssueCode::UnknownRef,
                    task.id,
                    format!("dependency {} is not in the submission or the tree", dep.id),
                ));
            }
        }
    }

    // Acyclicity (within the submission; external deps cannot cycle back).
    if let Some(cycle) = find_cycle(tasks, &by_id) {
        let path = cycle
            .iter()
            .map(Uuid::to_string)
            .collect::<Vec<_>>()
            .join(" -> ");
        issues.push(ValidationIssue::new(
            IssueCode::CircularDep,
            format!("dependency cycle: {path}"),
        ));
    }

    // Parent reachability: every parent resolves in the submission, and
    // every task is reachable from the root.
    for task in tasks {
        if let Some(parent) = task.parent_id {
            if !by_id.contains_key(&parent) {
                issues.push(ValidationIssue::for_task(
                    IssueCode::UnknownRef,
                    task.id,
                    format!("parent {parent} is not in the submission"),
                ));
            }
        }
    }
    if let [root] = roots.as_slice() {
        let mut reachable = HashSet::from([root.id]);
        let mut frontier = vec![root.id];
        while let Some(current) = frontier.pop() {
            for task in tasks {
                if task.parent_id == Some(current) && reachable.insert(task.id) {
                    frontier.push(task.id);
                }
            }
        }
        for task in tasks {
            if !reachable.contains(&task.id) {
                issues.push(ValidationIssue::for_task(
                    IssueCode::MultiRoot,
                    task.id,
                    "task is not reachable from the submission root",
                ));
            }
        }
    }

    issues
}

/// The single root of a validated submission.
pub fn root_of(tasks: &[Task]) -> Option<&Task> {
    tasks.iter().find(|t| t.parent_id.is_none())
}

/// Validate a proposed dependency list for one task against its tree:
/// every target must live in the tree, duplicates and self-references are
/// rejected, and the substituted edge set must stay acyclic.
pub fn validate_dependency_update(
    tree: &[Task],
    task_id: Uuid,
    new_deps: &[trellis_db::models::Dependency],
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let tree_ids: HashSet<Uuid> = tree.iter().map(|t| t.id).collect();

    let mut seen = HashSet::new();
    for dep in new_deps {
        if !seen.insert(dep.id) {
            issues.push(ValidationIssue::for_task(
                IssueCode::DuplicateDep,
                task_id,
                format!("dependency {} declared more than once", dep.id),
            ));
        }
        if dep.id == task_id {
            issues.push(ValidationIssue::for_task(
                IssueCode::CircularDep,
                task_id,
                "task depends on itself",
            ));
        } else if !tree_ids.contains(&dep.id) {
            issues.push(ValidationIssue::for_task(
                IssueCode::UnknownRef,
                task_id,
                format!("dependency {} is not in the tree", dep.id),
            ));
        }
    }

    // Substitute the proposed list and re-run the cycle search.
    let substituted: Vec<Task> = tree
        .iter()
        .map(|t| {
            let mut t = t.clone();
            if t.id == task_id {
                t.dependencies = new_deps.to_vec();
            }
            t
        })
        .collect();
    let by_id: HashMap<Uuid, &Task> = substituted.iter().map(|t| (t.id, t)).collect();
    if let Some(cycle) = find_cycle(&substituted, &by_id) {
        let path = cycle
            .iter()
            .map(Uuid::to_string)
            .collect::<Vec<_>>()
            .join(" -> ");
        issues.push(ValidationIssue::for_task(
            IssueCode::CircularDep,
            task_id,
            format!("dependency cycle: {path}"),
        ));
    }

    issues
}

/// Depth-first cycle search over the dependency edges, recording the cycle
/// path for diagnostics.
fn find_cycle(tasks: &[Task], by_id: &HashMap<Uuid, &Task>) -> Option<Vec<Uuid>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        id: Uuid,
        by_id: &HashMap<Uuid, &Task>,
        marks: &mut HashMap<Uuid, Mark>,
        stack: &mut Vec<Uuid>,
    ) -> Option<Vec<Uuid>> {
        match marks.get(&id) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                // Close the loop: everything on the stack from the first
                // occurrence of `id` is the cycle.
                let start = stack.iter().position(|s| *s == id).unwrap_or(0);
                let mut cycle = stack[start..].to_vec();
                cycle.push(id);
                return Some(cycle);
            }
            None => {}
        }
        marks.insert(id, Mark::Visiting);
        stack.push(id);
        if let Some(task) = by_id.get(&id) {
            for dep in &task.dependencies {
                if by_id.contains_key(&dep.id) {
                    if let Some(cycle) = visit(dep.id, by_id, marks, stack) {
                        return Some(cycle);
                    }
                }
            }
        }
        stack.pop();
        marks.insert(id, Mark::Done);
        None
    }

    let mut marks = HashMap::new();
    let mut stack = Vec::new();
    for task in tasks {
        if let Some(cycle) = visit(task.id, by_id, &mut marks, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_db::models::Dependency;

    fn new_task(id: Uuid, parent: Option<Uuid>, deps: Vec<Dependency>) -> Task {
        let mut tasks = materialize(
            vec![NewTask {
                id: Some(id),
                parent_id: parent,
                user_id: None,
                name: "t".to_string(),
                schemas: serde_json::json!({}),
                priority: None,
                dependencies: vec![],
                inputs: serde_json::json!({}),
                params: serde_json::json!({}),
            }],
            "u1",
        );
        let mut task = tasks.remove(0);
        task.dependencies = deps;
        task
    }

    #[test]
    fn valid_tree_passes() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let tasks = vec![
            new_task(a, None, vec![]),
            new_task(b, Some(a), vec![Dependency::required(a)]),
        ];
        assert!(validate(&tasks, &HashSet::new()).is_empty());
    }

    #[test]
    fn zero_roots_rejected() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let tasks = vec![new_task(a, Some(b), vec![]), new_task(b, Some(a), vec![])];
        let issues = validate(&tasks, &HashSet::new());
        assert!(issues.iter().any(|i| i.code == IssueCode::MultiRoot));
    }

    #[test]
    fn two_roots_rejected() {
        let tasks = vec![
            new_task(Uuid::new_v4(), None, vec![]),
            new_task(Uuid::new_v4(), None, vec![]),
        ];
        let issues = validate(&tasks, &HashSet::new());
        assert!(issues.iter().any(|i| i.code == IssueCode::MultiRoot));
    }

    #[test]
    fn unknown_dependency_rejected() {
        let a = Uuid::new_v4();
        let ghost = Uuid::new_v4();
        let tasks = vec![new_task(a, None, vec![Dependency::required(ghost)])];
        let issues = validate(&tasks, &HashSet::new());
        assert!(issues.iter().any(|i| i.code == IssueCode::UnknownRef));
    }

    #[test]
    fn external_dependency_accepted() {
        let a = Uuid::new_v4();
        let persisted = Uuid::new_v4();
        let tasks = vec![new_task(a, None, vec![Dependency::required(persisted)])];
        let external = HashSet::from([persisted]);
        assert!(validate(&tasks, &external).is_empty());
    }

    #[test]
    fn cycle_rejected_with_path() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let tasks = vec![
            new_task(a, None, vec![Dependency::required(c)]),
            new_task(b, Some(a), vec![Dependency::required(a)]),
            new_task(c, Some(a), vec![Dependency::required(b)]),
        ];
        let issues = validate(&tasks, &HashSet::new());
        let cycle = issues
            .iter()
            .find(|i| i.code == IssueCode::CircularDep)
            .expect("cycle should be reported");
        assert!(cycle.message.contains(" -> "));
    }

    #[test]
    fn self_dependency_rejected() {
        let a = Uuid::new_v4();
        let tasks = vec![new_task(a, None, vec![Dependency::required(a)])];
        let issues = validate(&tasks, &HashSet::new());
        assert!(issues.iter().any(|i| i.code == IssueCode::CircularDep));
    }

    #[test]
    fn duplicate_dependency_rejected() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let tasks = vec![
            new_task(a, None, vec![]),
            new_task(
                b,
                Some(a),
                vec![Dependency::required(a), Dependency::optional(a)],
            ),
        ];
        let issues = validate(&tasks, &HashSet::new());
        assert!(issues.iter().any(|i| i.code == IssueCode::DuplicateDep));
    }

    #[test]
    fn mixed_users_rejected() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut tasks = vec![new_task(a, None, vec![]), new_task(b, Some(a), vec![])];
        tasks[1].user_id = "someone-else".to_string();
        let issues = validate(&tasks, &HashSet::new());
        assert!(issues.iter().any(|i| i.code == IssueCode::UserMismatch));
    }

    #[test]
    fn disconnected_task_rejected() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        // c's parent is b, but b's parent is c: both unreachable from a.
        let tasks = vec![
            new_task(a, None, vec![]),
            new_task(b, Some(c), vec![]),
            new_task(c, Some(b), vec![]),
        ];
        let issues = validate(&tasks, &HashSet::new());
        assert!(issues.iter().any(|i| i.code == IssueCode::MultiRoot));
    }

    #[test]
    fn aggregates_multiple_violations() {
        let a = Uuid::new_v4();
        let ghost = Uuid::new_v4();
        let mut tasks = vec![
            new_task(a, None, vec![Dependency::required(ghost)]),
            new_task(Uuid::new_v4(), None, vec![]),
        ];
        tasks[1].user_id = "intruder".to_string();
        let issues = validate(&tasks, &HashSet::new());
        assert!(issues.len() >= 3, "expected aggregation, got {issues:?}");
    }
}
