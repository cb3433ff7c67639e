//! Dependency-aware scheduler: runs a task tree to completion by
//! dispatching ready tasks in priority order, enforcing a shared worker
//! pool, failing dependents of unsatisfied required dependencies, and
//! publishing every transition on the run's topic.

pub mod ready;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use trellis_db::Repository;
use trellis_db::models::{Dependency, Task, TaskDelta, TaskStatus};

use crate::config::EngineConfig;
use crate::error::CoreError;
use crate::events::{EventBus, RunStatus, StreamEndReason, TaskEvent};
use crate::executor::{self, ExecOutcome, ExecutorRegistry, HookSet, ProgressHandle};

use ready::ReadyQueue;

/// Options for one execution request.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Re-execute the target and everything it transitively depends on,
    /// regardless of prior status.
    pub reexecute: bool,
    /// Deadline for the whole run; expiry triggers the cancel path.
    pub deadline: Option<Duration>,
}

/// Aggregate result of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub root_task_id: Uuid,
    pub status: RunStatus,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Live view of an active run, for the `tasks.running.*` surface.
#[derive(Debug, Clone, Serialize)]
pub struct RunView {
    pub root_task_id: Uuid,
    pub target_task_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub total: usize,
    pub finished: usize,
    pub running: Vec<Uuid>,
}

struct LiveState {
    running: HashSet<Uuid>,
    finished: usize,
    total: usize,
}

struct RunShared {
    target_task_id: Uuid,
    started_at: DateTime<Utc>,
    members: HashSet<Uuid>,
    live: StdMutex<LiveState>,
}

impl RunShared {
    fn view(&self, root_task_id: Uuid) -> RunView {
        let live = self.live.lock().expect("run state lock poisoned");
        let mut running: Vec<Uuid> = live.running.iter().copied().collect();
        running.sort();
        RunView {
            root_task_id,
            target_task_id: self.target_task_id,
            started_at: self.started_at,
            total: live.total,
            finished: live.finished,
            running,
        }
    }

    fn mark_running(&self, id: Uuid) {
        self.live
            .lock()
            .expect("run state lock poisoned")
            .running
            .insert(id);
    }

    fn mark_finished(&self, id: Uuid) {
        let mut live = self.live.lock().expect("run state lock poisoned");
        live.running.remove(&id);
        live.finished += 1;
    }
}

enum ControlMsg {
    CancelTask(Uuid),
}

struct ActiveRun {
    control: mpsc::UnboundedSender<ControlMsg>,
    run_cancel: CancellationToken,
    shared: Arc<RunShared>,
}

/// Message sent from spawned task workers back to the dispatch loop.
struct TaskDone {
    task_id: Uuid,
    outcome: ExecOutcome,
}

/// Everything the dispatch loop needs for one run, computed up front from
/// the repository.
struct PreparedRun {
    root_id: Uuid,
    graph: HashMap<Uuid, Task>,
    candidates: HashSet<Uuid>,
    state: HashMap<Uuid, TaskStatus>,
    results: HashMap<Uuid, Option<Value>>,
    waiters: HashMap<Uuid, Vec<Uuid>>,
    deadline: Option<Duration>,
    control_rx: mpsc::UnboundedReceiver<ControlMsg>,
    run_cancel: CancellationToken,
    shared: Arc<RunShared>,
}

#[derive(Default)]
struct Counters {
    completed: usize,
    failed: usize,
    cancelled: usize,
}

/// The process-wide scheduler. One instance owns the in-memory run state;
/// the repository stays authoritative for task rows.
pub struct Scheduler {
    repo: Arc<dyn Repository>,
    bus: Arc<EventBus>,
    registry: Arc<ExecutorRegistry>,
    hooks: Arc<HookSet>,
    workers: Arc<Semaphore>,
    config: EngineConfig,
    runs: StdMutex<HashMap<Uuid, ActiveRun>>,
}

impl Scheduler {
    pub fn new(
        repo: Arc<dyn Repository>,
        bus: Arc<EventBus>,
        registry: Arc<ExecutorRegistry>,
        hooks: Arc<HookSet>,
        config: EngineConfig,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.worker_pool_size.max(1)));
        Self {
            repo,
            bus,
            registry,
            hooks,
            workers,
            config,
            runs: StdMutex::new(HashMap::new()),
        }
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    /// Execute the tree containing `target_id` and wait for the aggregate
    /// result.
    pub async fn execute(
        self: &Arc<Self>,
        target_id: Uuid,
        opts: RunOptions,
    ) -> Result<RunSummary, CoreError> {
        let run = self.prepare(target_id, opts).await?;
        Ok(self.clone().drive(run).await)
    }

    /// Start a run in the background; events flow on the root's topic.
    /// Returns the root task id (the topic key).
    pub async fn start(
        self: &Arc<Self>,
        target_id: Uuid,
        opts: RunOptions,
    ) -> Result<Uuid, CoreError> {
        let run = self.prepare(target_id, opts).await?;
        let root_id = run.root_id;
        let this = self.clone();
        tokio::spawn(async move {
            this.drive(run).await;
        });
        Ok(root_id)
    }

    /// Cancel a task. A running task gets its cancel signal; a pending
    /// task is marked cancelled without invoking any executor.
    pub async fn cancel(&self, task_id: Uuid) -> Result<(), CoreError> {
        let task = self
            .repo
            .get(task_id)
            .await?
            .ok_or(CoreError::NotFound(task_id))?;
        if task.status.is_terminal() {
            return Err(CoreError::State(format!(
                "cannot cancel task {task_id}: status is {}",
                task.status
            )));
        }

        // Route through the owning run when one is active so in-memory
        // state stays coherent.
        {
            let runs = self.runs.lock().expect("scheduler runs lock poisoned");
            if let Some(run) = runs.values().find(|r| r.shared.members.contains(&task_id)) {
                let _ = run.control.send(ControlMsg::CancelTask(task_id));
                return Ok(());
            }
        }

        match task.status {
            TaskStatus::Pending => {
                self.repo
                    .update(
                        task_id,
                        TaskDelta {
                            status: Some(TaskStatus::Cancelled),
                            completed_at: Some(Some(Utc::now())),
                            ..Default::default()
                        },
                        None,
                    )
                    .await?;
                Ok(())
            }
            _ => Err(CoreError::State(format!(
                "task {task_id} is {} but not managed by this scheduler",
                task.status
            ))),
        }
    }

    pub fn running_roots(&self) -> Vec<RunView> {
        let runs = self.runs.lock().expect("scheduler runs lock poisoned");
        let mut views: Vec<RunView> = runs
            .iter()
            .map(|(root, run)| run.shared.view(*root))
            .collect();
        views.sort_by_key(|v| v.started_at);
        views
    }

    pub fn running_count(&self) -> usize {
        self.runs.lock().expect("scheduler runs lock poisoned").len()
    }

    pub fn run_status(&self, root_id: Uuid) -> Option<RunView> {
        let runs = self.runs.lock().expect("scheduler runs lock poisoned");
        runs.get(&root_id).map(|run| run.shared.view(root_id))
    }

    /// Drain: signal every active run to cancel, wait for the registry to
    /// empty (bounded), then end any remaining streams.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        {
            let runs = self.runs.lock().expect("scheduler runs lock poisoned");
            for run in runs.values() {
                run.run_cancel.cancel();
            }
        }
        let deadline = tokio::time::Instant::now() + drain_timeout;
        while self.running_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.bus.close_all(StreamEndReason::Shutdown);
    }

    // -----------------------------------------------------------------
    // Run preparation
    // -----------------------------------------------------------------

    /// Load the minimal run closure: the target's subtree, plus every
    /// task it transitively depends on across the tree.
    async fn prepare(
        &self,
        target_id: Uuid,
        opts: RunOptions,
    ) -> Result<PreparedRun, CoreError> {
        let target = self
            .repo
            .get(target_id)
            .await?
            .ok_or(CoreError::NotFound(target_id))?;
        let root = self.repo.get_root(target.id).await?;

        let subtree = self.repo.build_subtree(target_id).await?;
        let mut graph: HashMap<Uuid, Task> =
            subtree.iter().map(|t| (t.id, t.clone())).collect();
        let subtree_ids: HashSet<Uuid> = graph.keys().copied().collect();

        // Pull in dependency ancestors from anywhere in the tree.
        let mut queue: VecDeque<Uuid> = graph
            .values()
            .flat_map(|t| t.dependencies.iter().map(|d| d.id))
            .collect();
        while let Some(dep_id) = queue.pop_front() {
            if graph.contains_key(&dep_id) {
                continue;
            }
            match self.repo.get(dep_id).await? {
                Some(dep) => {
                    queue.extend(dep.dependencies.iter().map(|d| d.id));
                    graph.insert(dep_id, dep);
                }
                None => {
                    tracing::warn!(
                        dep_id = %dep_id,
                        "dependency references a missing task; edge ignored"
                    );
                }
            }
        }

        // Re-execution closure: the target plus everything it depends on.
        let mut reexec: HashSet<Uuid> = HashSet::new();
        if opts.reexecute {
            let mut frontier = vec![target_id];
            while let Some(id) = frontier.pop() {
                if !reexec.insert(id) {
                    continue;
                }
                if let Some(task) = graph.get(&id) {
                    frontier.extend(task.dependencies.iter().map(|d| d.id));
                }
            }
        }

        let mut candidates: HashSet<Uuid> = HashSet::new();
        let mut state: HashMap<Uuid, TaskStatus> = HashMap::new();
        let mut results: HashMap<Uuid, Option<Value>> = HashMap::new();
        for task in graph.values() {
            let rerun = reexec.contains(&task.id)
                || (opts.reexecute
                    && subtree_ids.contains(&task.id)
                    && task.status == TaskStatus::Failed);
            if task.status == TaskStatus::Pending || rerun {
                // Reset happens in memory only; the persisted edge is
                // pending -> in_progress when the task actually starts.
                candidates.insert(task.id);
                state.insert(task.id, TaskStatus::Pending);
            } else {
                state.insert(task.id, task.status);
                if task.status == TaskStatus::Completed {
                    results.insert(task.id, task.result.clone());
                }
            }
        }

        let mut waiters: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for id in &candidates {
            for dep in &graph[id].dependencies {
                if graph.contains_key(&dep.id) {
                    waiters.entry(dep.id).or_default().push(*id);
                }
            }
        }

        let shared = Arc::new(RunShared {
            target_task_id: target_id,
            started_at: Utc::now(),
            members: graph.keys().copied().collect(),
            live: StdMutex::new(LiveState {
                running: HashSet::new(),
                finished: 0,
                total: candidates.len(),
            }),
        });
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let run_cancel = CancellationToken::new();

        {
            let mut runs = self.runs.lock().expect("scheduler runs lock poisoned");
            if runs.contains_key(&root.id) {
                return Err(CoreError::AlreadyRunning(root.id));
            }
            runs.insert(
                root.id,
                ActiveRun {
                    control: control_tx,
                    run_cancel: run_cancel.clone(),
                    shared: shared.clone(),
                },
            );
        }

        tracing::info!(
            root_task_id = %root.id,
            target_task_id = %target_id,
            candidates = candidates.len(),
            reexecute = opts.reexecute,
            "run prepared"
        );

        Ok(PreparedRun {
            root_id: root.id,
            graph,
            candidates,
            state,
            results,
            waiters,
            deadline: opts.deadline,
            control_rx,
            run_cancel,
            shared,
        })
    }

    // -----------------------------------------------------------------
    // Dispatch loop
    // -----------------------------------------------------------------

    async fn drive(self: Arc<Self>, mut run: PreparedRun) -> RunSummary {
        let root_id = run.root_id;
        let run_cancel = run.run_cancel.clone();
        if let Some(deadline) = run.deadline {
            let token = run_cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                token.cancel();
            });
        }

        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<TaskDone>();
        let mut ready = ReadyQueue::new();
        let mut cancel_tokens: HashMap<Uuid, CancellationToken> = HashMap::new();
        let mut counters = Counters::default();
        let mut in_flight = 0usize;
        let mut cancelling = false;

        // Seed: evaluate every candidate in submission order so fail-fast
        // and initial readiness are deterministic.
        let mut seeds: Vec<Uuid> = run.candidates.iter().copied().collect();
        seeds.sort_by_key(|id| run.graph[id].seq);
        self.evaluate(&mut run, &mut ready, &mut counters, seeds).await;

        let mut control_rx =
            std::mem::replace(&mut run.control_rx, mpsc::unbounded_channel().1);

        loop {
            if run_cancel.is_cancelled() && !cancelling {
                cancelling = true;
                for token in cancel_tokens.values() {
                    token.cancel();
                }
                self.cancel_pending(&mut run, &mut ready, &mut counters).await;
            }

            if !ready.is_empty() && !cancelling {
                tokio::select! {
                    biased;
                    Some(done) = done_rx.recv() => {
                        in_flight -= 1;
                        cancel_tokens.remove(&done.task_id);
                        self.handle_done(&mut run, &mut ready, &mut counters, done).await;
                    }
                    Some(msg) = control_rx.recv() => {
                        self.handle_control(&mut run, &mut ready, &mut counters, &cancel_tokens, msg).await;
                    }
                    _ = run_cancel.cancelled() => {}
                    permit = self.workers.clone().acquire_owned() => {
                        let Ok(permit) = permit else { break };
                        if let Some(id) = ready.pop() {
                            if run.state.get(&id) == Some(&TaskStatus::Pending) {
                                in_flight += 1;
                                let token = CancellationToken::new();
                                cancel_tokens.insert(id, token.clone());
                                run.state.insert(id, TaskStatus::InProgress);
                                self.spawn_task(&run, id, token, permit, done_tx.clone());
                            }
                        }
                    }
                }
            } else if in_flight > 0 {
                tokio::select! {
                    biased;
                    Some(done) = done_rx.recv() => {
                        in_flight -= 1;
                        cancel_tokens.remove(&done.task_id);
                        self.handle_done(&mut run, &mut ready, &mut counters, done).await;
                    }
                    Some(msg) = control_rx.recv() => {
                        self.handle_control(&mut run, &mut ready, &mut counters, &cancel_tokens, msg).await;
                    }
                    _ = run_cancel.cancelled(), if !cancelling => {}
                }
            } else {
                break;
            }
        }

        let status = if counters.failed > 0 {
            RunStatus::Failed
        } else if counters.cancelled > 0 {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };

        self.bus.publish(TaskEvent::RunFinal {
            root_task_id: root_id,
            timestamp: Utc::now(),
            status,
            completed: counters.completed,
            failed: counters.failed,
            cancelled: counters.cancelled,
        });
        self.bus
            .publish(TaskEvent::stream_end(root_id, StreamEndReason::Finished));

        self.runs
            .lock()
            .expect("scheduler runs lock poisoned")
            .remove(&root_id);

        tracing::info!(
            root_task_id = %root_id,
            status = %status,
            completed = counters.completed,
            failed = counters.failed,
            cancelled = counters.cancelled,
            "run finished"
        );

        RunSummary {
            root_task_id: root_id,
            status,
            completed: counters.completed,
            failed: counters.failed,
            cancelled: counters.cancelled,
        }
    }

    fn spawn_task(
        &self,
        run: &PreparedRun,
        id: Uuid,
        token: CancellationToken,
        permit: tokio::sync::OwnedSemaphorePermit,
        done_tx: mpsc::UnboundedSender<TaskDone>,
    ) {
        let task = run.graph[&id].clone();
        let root_id = run.root_id;
        let dep_results: Vec<(Dependency, Option<Value>)> = task
            .dependencies
            .iter()
            .map(|d| (d.clone(), run.results.get(&d.id).cloned().flatten()))
            .collect();
        run.shared.mark_running(id);

        let repo = self.repo.clone();
        let bus = self.bus.clone();
        let registry = self.registry.clone();
        let hooks = self.hooks.clone();
        let grace = self.config.cancel_grace;

        tokio::spawn(async move {
            let _permit = permit;

            // The persisted edge is (pending|failed|completed) ->
            // in_progress; re-runs clear the previous attempt's outcome.
            let start = repo
                .update(
                    id,
                    TaskDelta {
                        status: Some(TaskStatus::InProgress),
                        progress: Some(0.0),
                        result: Some(None),
                        error: Some(None),
                        started_at: Some(Some(Utc::now())),
                        completed_at: Some(None),
                        ..Default::default()
                    },
                    None,
                )
                .await;
            if let Err(e) = start {
                tracing::error!(task_id = %id, error = %e, "failed to persist task start");
                let _ = done_tx.send(TaskDone {
                    task_id: id,
                    outcome: ExecOutcome::Failed(format!("internal: could not start task: {e}")),
                });
                return;
            }

            bus.publish(TaskEvent::TaskStarted {
                task_id: id,
                root_task_id: root_id,
                timestamp: Utc::now(),
                progress: 0.0,
            });

            let progress = {
                let bus = bus.clone();
                let repo = repo.clone();
                ProgressHandle::new(move |p| {
                    bus.publish(TaskEvent::TaskProgress {
                        task_id: id,
                        root_task_id: root_id,
                        timestamp: Utc::now(),
                        progress: p,
                    });
                    let repo = repo.clone();
                    tokio::spawn(async move {
                        let delta = TaskDelta {
                            progress: Some(p),
                            ..Default::default()
                        };
                        if let Err(e) = repo.update(id, delta, None).await {
                            tracing::debug!(task_id = %id, error = %e, "progress persist skipped");
                        }
                    });
                })
            };

            let fut = executor::invoke(
                &registry,
                &hooks,
                &task,
                root_id,
                dep_results,
                token.clone(),
                progress,
            );
            tokio::pin!(fut);

            let outcome = tokio::select! {
                outcome = &mut fut => outcome,
                _ = token.cancelled() => {
                    // Cooperative cancellation: give the executor a grace
                    // period to wind down, then abandon it.
                    match tokio::time::timeout(grace, &mut fut).await {
                        Ok(outcome) => outcome,
                        Err(_) => ExecOutcome::Cancelled(None),
                    }
                }
            };

            // Once the cancel signal was observed the task ends cancelled;
            // a late success is kept only as a partial result.
            let outcome = if token.is_cancelled() {
                match outcome {
                    ExecOutcome::Cancelled(partial) => ExecOutcome::Cancelled(partial),
                    ExecOutcome::Completed(v) => ExecOutcome::Cancelled(Some(v)),
                    ExecOutcome::Failed(_) => ExecOutcome::Cancelled(None),
                }
            } else {
                outcome
            };

            let _ = done_tx.send(TaskDone {
                task_id: id,
                outcome,
            });
        });
    }

    async fn handle_done(
        &self,
        run: &mut PreparedRun,
        ready: &mut ReadyQueue,
        counters: &mut Counters,
        done: TaskDone,
    ) {
        let id = done.task_id;
        run.shared.mark_finished(id);
        let now = Utc::now();

        match done.outcome {
            ExecOutcome::Completed(result) => {
                self.persist_terminal(
                    id,
                    TaskDelta {
                        status: Some(TaskStatus::Completed),
                        progress: Some(1.0),
                        result: Some(Some(result.clone())),
                        completed_at: Some(Some(now)),
                        ..Default::default()
                    },
                )
                .await;
                run.state.insert(id, TaskStatus::Completed);
                run.results.insert(id, Some(result.clone()));
                counters.completed += 1;
                self.bus.publish(TaskEvent::TaskCompleted {
                    task_id: id,
                    root_task_id: run.root_id,
                    timestamp: now,
                    progress: 1.0,
                    result: Some(result),
                });
            }
            ExecOutcome::Failed(error) => {
                self.persist_terminal(
                    id,
                    TaskDelta {
                        status: Some(TaskStatus::Failed),
                        error: Some(Some(error.clone())),
                        completed_at: Some(Some(now)),
                        ..Default::default()
                    },
                )
                .await;
                run.state.insert(id, TaskStatus::Failed);
                counters.failed += 1;
                self.bus.publish(TaskEvent::TaskFailed {
                    task_id: id,
                    root_task_id: run.root_id,
                    timestamp: now,
                    progress: run.graph.get(&id).map(|t| t.progress).unwrap_or(0.0),
                    error,
                });
            }
            ExecOutcome::Cancelled(partial) => {
                self.persist_terminal(
                    id,
                    TaskDelta {
                        status: Some(TaskStatus::Cancelled),
                        result: Some(partial.clone()),
                        completed_at: Some(Some(now)),
                        ..Default::default()
                    },
                )
                .await;
                run.state.insert(id, TaskStatus::Cancelled);
                counters.cancelled += 1;
                self.bus.publish(TaskEvent::TaskCancelled {
                    task_id: id,
                    root_task_id: run.root_id,
                    timestamp: now,
                    progress: run.graph.get(&id).map(|t| t.progress).unwrap_or(0.0),
                    result: partial,
                });
            }
        }

        let dependents = run.waiters.get(&id).cloned().unwrap_or_default();
        self.evaluate(run, ready, counters, dependents).await;
    }

    async fn handle_control(
        &self,
        run: &mut PreparedRun,
        ready: &mut ReadyQueue,
        counters: &mut Counters,
        cancel_tokens: &HashMap<Uuid, CancellationToken>,
        msg: ControlMsg,
    ) {
        match msg {
            ControlMsg::CancelTask(id) => {
                if let Some(token) = cancel_tokens.get(&id) {
                    token.cancel();
                    return;
                }
                if run.state.get(&id) == Some(&TaskStatus::Pending)
                    && run.candidates.contains(&id)
                {
                    ready.remove(id);
                    self.mark_cancelled_without_start(run, counters, id).await;
                    let dependents = run.waiters.get(&id).cloned().unwrap_or_default();
                    self.evaluate(run, ready, counters, dependents).await;
                }
            }
        }
    }

    /// Run-level cancellation: everything still pending is marked
    /// cancelled without ever invoking an executor.
    async fn cancel_pending(
        &self,
        run: &mut PreparedRun,
        ready: &mut ReadyQueue,
        counters: &mut Counters,
    ) {
        ready.drain();
        let mut pending: Vec<Uuid> = run
            .candidates
            .iter()
            .filter(|id| run.state.get(id) == Some(&TaskStatus::Pending))
            .copied()
            .collect();
        pending.sort_by_key(|id| run.graph[id].seq);
        for id in pending {
            self.mark_cancelled_without_start(run, counters, id).await;
        }
    }

    async fn mark_cancelled_without_start(
        &self,
        run: &mut PreparedRun,
        counters: &mut Counters,
        id: Uuid,
    ) {
        let now = Utc::now();
        self.persist_terminal(
            id,
            TaskDelta {
                status: Some(TaskStatus::Cancelled),
                completed_at: Some(Some(now)),
                ..Default::default()
            },
        )
        .await;
        run.state.insert(id, TaskStatus::Cancelled);
        run.shared.mark_finished(id);
        counters.cancelled += 1;
        self.bus.publish(TaskEvent::TaskCancelled {
            task_id: id,
            root_task_id: run.root_id,
            timestamp: now,
            progress: run.graph.get(&id).map(|t| t.progress).unwrap_or(0.0),
            result: None,
        });
    }

    /// Re-evaluate a set of candidates: fail-fast those with a terminally
    /// unsatisfied required dependency (cascading to their own waiters),
    /// and push the rest to `ready` once eligible.
    async fn evaluate(
        &self,
        run: &mut PreparedRun,
        ready: &mut ReadyQueue,
        counters: &mut Counters,
        seeds: Vec<Uuid>,
    ) {
        let mut worklist: VecDeque<Uuid> = seeds.into();
        while let Some(id) = worklist.pop_front() {
            if !run.candidates.contains(&id)
                || run.state.get(&id) != Some(&TaskStatus::Pending)
                || ready.contains(id)
            {
                continue;
            }

            let deps = run.graph[&id].dependencies.clone();
            let mut unsatisfied: Option<Uuid> = None;
            let mut all_ready = true;
            for dep in &deps {
                let Some(dep_state) = run.state.get(&dep.id) else {
                    // Dangling reference, already logged at load time.
                    continue;
                };
                if dep.required {
                    match dep_state {
                        TaskStatus::Completed => {}
                        TaskStatus::Failed | TaskStatus::Cancelled => {
                            unsatisfied = Some(dep.id);
                            break;
                        }
                        _ => all_ready = false,
                    }
                } else if !dep_state.is_terminal() {
                    all_ready = false;
                }
            }

            if let Some(dep_id) = unsatisfied {
                // Required dependency ended failed/cancelled: fail without
                // invoking the executor, then cascade.
                let now = Utc::now();
                let error = format!("DEPENDENCY_UNSATISFIED: {dep_id}");
                self.persist_terminal(
                    id,
                    TaskDelta {
                        status: Some(TaskStatus::Failed),
                        error: Some(Some(error.clone())),
                        completed_at: Some(Some(now)),
                        ..Default::default()
                    },
                )
                .await;
                run.state.insert(id, TaskStatus::Failed);
                run.shared.mark_finished(id);
                counters.failed += 1;
                self.bus.publish(TaskEvent::TaskFailed {
                    task_id: id,
                    root_task_id: run.root_id,
                    timestamp: now,
                    progress: run.graph.get(&id).map(|t| t.progress).unwrap_or(0.0),
                    error,
                });
                if let Some(dependents) = run.waiters.get(&id) {
                    worklist.extend(dependents.iter().copied());
                }
            } else if all_ready {
                let task = &run.graph[&id];
                ready.push(task.priority, task.seq, id);
            }
        }
    }

    async fn persist_terminal(&self, id: Uuid, delta: TaskDelta) {
        if let Err(e) = self.repo.update(id, delta, None).await {
            tracing::error!(task_id = %id, error = %e, "failed to persist task transition");
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("active_runs", &self.running_count())
            .field("worker_pool_size", &self.config.worker_pool_size)
            .finish()
    }
}
