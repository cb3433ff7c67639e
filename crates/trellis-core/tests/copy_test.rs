//! Tree-copy engine: reset semantics, history preservation, and
//! re-execution of copies.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use trellis_core::executor::{ExecutorRegistry, HookSet};
use trellis_core::{
    EngineConfig, EventBus, Principal, RunOptions, RunStatus, Scheduler, TaskService,
};
use trellis_db::MemoryRepository;
use trellis_db::models::TaskStatus;
use trellis_test_utils::{StubExecutor, TaskSpec, submission};

struct TestRig {
    scheduler: Arc<Scheduler>,
    service: TaskService,
    principal: Principal,
}

fn rig() -> TestRig {
    let mut registry = ExecutorRegistry::new();
    registry.register(StubExecutor::succeeding("ok"));
    registry.register(StubExecutor::failing("boom", "exploded"));

    let config = EngineConfig {
        cancel_grace: Duration::from_millis(100),
        ..EngineConfig::default()
    };
    let repo = Arc::new(MemoryRepository::new());
    let bus = Arc::new(EventBus::new(config.stream_buffer_size));
    let scheduler = Arc::new(Scheduler::new(
        repo.clone(),
        bus,
        Arc::new(registry),
        Arc::new(HookSet::new()),
        config,
    ));
    TestRig {
        scheduler,
        service: TaskService::new(repo),
        principal: Principal::new("u1"),
    }
}

/// Build and fully execute R -> {X, Y dep X}; returns (r, x, y).
async fn completed_tree(rig: &TestRig) -> (Uuid, Uuid, Uuid) {
    let r = TaskSpec::new("ok");
    let x = TaskSpec::new("ok").parent(&r);
    let y = TaskSpec::new("ok").parent(&r).depends_on(&x);
    let ids = (r.id(), x.id(), y.id());

    rig.service
        .create_tree(&rig.principal, submission(vec![r, x, y]))
        .await
        .unwrap();
    let summary = rig
        .scheduler
        .execute(ids.0, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    ids
}

#[tokio::test]
async fn copy_resets_run_state_and_flags_originals() {
    let rig = rig();
    let (r, x, y) = completed_tree(&rig).await;

    let original_root = rig.service.get(&rig.principal, r).await.unwrap();

    let new_root = rig.service.copy(&rig.principal, r, true).await.unwrap();
    assert_ne!(new_root.id, r);
    assert!(new_root.parent_id.is_none());

    let copied = rig.service.tree(&rig.principal, new_root.id).await.unwrap();
    let copied_tasks: Vec<_> = copied.iter().cloned().collect();
    assert_eq!(copied_tasks.len(), 3);
    for task in &copied_tasks {
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0.0);
        assert!(task.result.is_none());
        assert!(task.error.is_none());
        assert!(task.started_at.is_none());
        assert!(task.completed_at.is_none());
        assert_eq!(task.original_task_id, Some(r));
        assert!(!task.has_copy);
        // Fresh ids throughout.
        assert!(![r, x, y].contains(&task.id));
    }

    // Dependency edges were rewritten into the copy.
    let copied_y = copied_tasks
        .iter()
        .find(|t| !t.dependencies.is_empty())
        .expect("copied Y keeps its dependency");
    let dep_target = copied_y.dependencies[0].id;
    assert!(copied_tasks.iter().any(|t| t.id == dep_target));
    assert_ne!(dep_target, x);

    // Originals are flagged but otherwise untouched.
    for id in [r, x, y] {
        let original = rig.service.get(&rig.principal, id).await.unwrap();
        assert!(original.has_copy);
        assert_eq!(original.status, TaskStatus::Completed);
    }
    let after = rig.service.get(&rig.principal, r).await.unwrap();
    assert_eq!(after.result, original_root.result);
    assert_eq!(after.started_at, original_root.started_at);
    assert_eq!(after.completed_at, original_root.completed_at);
}

#[tokio::test]
async fn copy_without_children_takes_only_the_task() {
    let rig = rig();
    let (r, _, _) = completed_tree(&rig).await;

    let new_root = rig.service.copy(&rig.principal, r, false).await.unwrap();
    let copied = rig.service.tree(&rig.principal, new_root.id).await.unwrap();
    assert_eq!(copied.iter().count(), 1);
    assert_eq!(copied.task.original_task_id, Some(r));
}

#[tokio::test]
async fn copied_tree_executes_while_original_stays_frozen() {
    let rig = rig();
    let (r, _, _) = completed_tree(&rig).await;
    let before = rig.service.get(&rig.principal, r).await.unwrap();

    let new_root = rig.service.copy(&rig.principal, r, true).await.unwrap();
    let summary = rig
        .scheduler
        .execute(new_root.id, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.completed, 3);

    let after = rig.service.get(&rig.principal, r).await.unwrap();
    assert_eq!(after.status, before.status);
    assert_eq!(after.result, before.result);
    assert_eq!(after.completed_at, before.completed_at);
    // Only the has_copy flag moved updated_at.
    assert!(after.updated_at >= before.updated_at);
}

#[tokio::test]
async fn copying_a_sub_task_pulls_in_its_dependents() {
    let rig = rig();
    // R -> {X, Y dep X}: copying X alone must also copy Y (its dependent),
    // reattached under the new root.
    let (_, x, y) = completed_tree(&rig).await;

    let new_root = rig.service.copy(&rig.principal, x, false).await.unwrap();
    let copied = rig.service.tree(&rig.principal, new_root.id).await.unwrap();
    let copied_tasks: Vec<_> = copied.iter().cloned().collect();
    assert_eq!(copied_tasks.len(), 2);
    assert!(copied_tasks.iter().all(|t| t.original_task_id == Some(x)));

    // Y's copy hangs off the new root and depends on X's copy.
    let y_copy = copied_tasks
        .iter()
        .find(|t| t.id != new_root.id)
        .unwrap();
    assert_eq!(y_copy.parent_id, Some(new_root.id));
    assert_eq!(y_copy.dependencies.len(), 1);
    assert_eq!(y_copy.dependencies[0].id, new_root.id);
    assert_ne!(y_copy.id, y);
}

#[tokio::test]
async fn never_started_dependents_of_failed_leaves_are_not_copied() {
    let rig = rig();
    let r = TaskSpec::new("ok");
    let f = TaskSpec::new("boom").parent(&r);
    let waiting = TaskSpec::new("ok").parent(&r).depends_on(&f);
    let (r_id, f_id) = (r.id(), f.id());

    rig.service
        .create_tree(&rig.principal, submission(vec![r, f, waiting]))
        .await
        .unwrap();
    // Run only the failing branch so `waiting` stays pending.
    let summary = rig
        .scheduler
        .execute(f_id, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(summary.status, RunStatus::Failed);

    let new_root = rig.service.copy(&rig.principal, r_id, true).await.unwrap();
    let copied = rig.service.tree(&rig.principal, new_root.id).await.unwrap();
    // R and the failed leaf are copied; the never-started dependent is not.
    assert_eq!(copied.iter().count(), 2);
}
