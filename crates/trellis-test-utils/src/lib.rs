//! Shared test utilities for trellis integration tests.
//!
//! Provides scriptable stub executors, a terse task-submission builder,
//! and a shared PostgreSQL instance (via testcontainers) for the tests
//! that exercise the sqlx backend.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor as _, PgPool};
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use trellis_core::executor::{ExecContext, ExecOutcome, Executor};
use trellis_db::models::{DependencySpec, NewTask};
use trellis_db::pool;

// ---------------------------------------------------------------------------
// Stub executors
// ---------------------------------------------------------------------------

/// What a [`StubExecutor`] does when invoked.
#[derive(Debug, Clone)]
pub enum StubBehavior {
    /// Complete with the given result after an optional delay.
    Succeed(Value),
    /// Fail with the given error message.
    Fail(String),
    /// Sleep until cancelled, honouring the cancel signal cooperatively.
    BlockUntilCancelled,
    /// Sleep forever and ignore the cancel signal (exercises the grace
    /// path).
    IgnoreCancel,
}

/// Shared log of executor invocations, in start order.
#[derive(Debug, Clone, Default)]
pub struct InvocationLog {
    entries: Arc<Mutex<Vec<Uuid>>>,
}

impl InvocationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, task_id: Uuid) {
        self.entries.lock().unwrap().push(task_id);
    }

    pub fn entries(&self) -> Vec<Uuid> {
        self.entries.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

/// A scriptable executor for scheduler tests.
pub struct StubExecutor {
    id: String,
    behavior: StubBehavior,
    delay: Duration,
    log: Option<InvocationLog>,
    schema: Value,
}

impl StubExecutor {
    pub fn new(id: &str, behavior: StubBehavior) -> Self {
        Self {
            id: id.to_string(),
            behavior,
            delay: Duration::ZERO,
            log: None,
            schema: json!({"type": "object"}),
        }
    }

    pub fn succeeding(id: &str) -> Self {
        Self::new(id, StubBehavior::Succeed(json!({"ok": true})))
    }

    pub fn failing(id: &str, error: &str) -> Self {
        Self::new(id, StubBehavior::Fail(error.to_string()))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_log(mut self, log: InvocationLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = schema;
        self
    }
}

#[async_trait]
impl Executor for StubExecutor {
    fn id(&self) -> &str {
        &self.id
    }

    fn input_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(&self, ctx: ExecContext) -> ExecOutcome {
        if let Some(log) = &self.log {
            log.record(ctx.task_id);
        }
        match &self.behavior {
            StubBehavior::Succeed(result) => {
                if !self.delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(self.delay) => {}
                        _ = ctx.cancel.cancelled() => return ExecOutcome::Cancelled(None),
                    }
                }
                ExecOutcome::Completed(result.clone())
            }
            StubBehavior::Fail(error) => {
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                ExecOutcome::Failed(error.clone())
            }
            StubBehavior::BlockUntilCancelled => {
                ctx.cancel.cancelled().await;
                ExecOutcome::Cancelled(Some(json!({"partial": true})))
            }
            StubBehavior::IgnoreCancel => {
                // Deliberately deaf to the cancel signal.
                loop {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Submission builder
// ---------------------------------------------------------------------------

/// Terse builder for one task in a submission.
pub struct TaskSpec {
    task: NewTask,
}

impl TaskSpec {
    pub fn new(name: &str) -> Self {
        Self {
            task: NewTask {
                id: Some(Uuid::new_v4()),
                parent_id: None,
                user_id: None,
                name: name.to_string(),
                schemas: json!({}),
                priority: None,
                dependencies: vec![],
                inputs: json!({}),
                params: json!({}),
            },
        }
    }

    pub fn id(&self) -> Uuid {
        self.task.id.expect("TaskSpec always assigns an id")
    }

    pub fn parent(mut self, parent: &TaskSpec) -> Self {
        self.task.parent_id = Some(parent.id());
        self
    }

    pub fn user(mut self, user_id: &str) -> Self {
        self.task.user_id = Some(user_id.to_string());
        self
    }

    pub fn priority(mut self, priority: trellis_db::models::Priority) -> Self {
        self.task.priority = Some(priority);
        self
    }

    pub fn depends_on(mut self, dep: &TaskSpec) -> Self {
        self.task.dependencies.push(DependencySpec::Id(dep.id()));
        self
    }

    pub fn depends_on_optional(mut self, dep: &TaskSpec) -> Self {
        self.task
            .dependencies
            .push(DependencySpec::Full(trellis_db::models::Dependency::optional(dep.id())));
        self
    }

    pub fn inputs(mut self, inputs: Value) -> Self {
        self.task.inputs = inputs;
        self
    }

    pub fn method(mut self, method: &str) -> Self {
        self.task.schemas = json!({"method": method});
        self
    }

    pub fn build(self) -> NewTask {
        self.task
    }
}

/// Collect specs into a submission array.
pub fn submission(specs: Vec<TaskSpec>) -> Vec<NewTask> {
    specs.into_iter().map(TaskSpec::build).collect()
}

// ---------------------------------------------------------------------------
// PostgreSQL (testcontainers)
// ---------------------------------------------------------------------------

struct SharedPg {
    base_url: String,
    /// Held to keep the container alive. `None` when using an external URL.
    _container: Option<ContainerAsync<Postgres>>,
}

static SHARED_PG: OnceCell<SharedPg> = OnceCell::const_new();

async fn init_shared_pg() -> SharedPg {
    // A setup script may have started a server already.
    if let Ok(url) = std::env::var("TRELLIS_TEST_PG_URL") {
        return SharedPg {
            base_url: url,
            _container: None,
        };
    }

    let container = Postgres::default()
        .start()
        .await
        .expect("failed to start PostgreSQL container");

    let host = container.get_host().await.expect("failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("failed to get mapped port");

    SharedPg {
        base_url: format!("postgresql://postgres:postgres@{host}:{port}"),
        _container: Some(container),
    }
}

/// Base URL for the shared PostgreSQL instance; lazily starts a container
/// on first call unless `TRELLIS_TEST_PG_URL` is set.
pub async fn pg_url() -> &'static str {
    let shared = SHARED_PG.get_or_init(init_shared_pg).await;
    &shared.base_url
}

/// Create a temporary database with migrations applied.
///
/// Returns `(pool, db_name)`; call [`drop_test_db`] with the name when the
/// test is done.
pub async fn create_test_db() -> (PgPool, String) {
    let base_url = pg_url().await;

    let maint_url = format!("{base_url}/postgres");
    let maint_pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&maint_url)
        .await
        .expect("failed to connect to maintenance database in container");

    let db_name = format!("trellis_test_{}", Uuid::new_v4().simple());
    let stmt = format!("CREATE DATABASE {db_name}");
    maint_pool
        .execute(stmt.as_str())
        .await
        .unwrap_or_else(|e| panic!("failed to create temp database {db_name}: {e}"));
    maint_pool.close().await;

    let temp_url = format!("{base_url}/{db_name}");
    let temp_pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&temp_url)
        .await
        .unwrap_or_else(|e| panic!("failed to connect to temp database {db_name}: {e}"));

    pool::run_migrations(&temp_pool)
        .await
        .expect("migrations should succeed");

    (temp_pool, db_name)
}

/// Drop a temporary database, terminating stray connections first.
pub async fn drop_test_db(db_name: &str) {
    let base_url = pg_url().await;
    let maint_url = format!("{base_url}/postgres");

    let maint_pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&maint_url)
        .await
        .expect("failed to connect to maintenance database for cleanup");

    let terminate = format!(
        "SELECT pg_terminate_backend(pid) \
         FROM pg_stat_activity \
         WHERE datname = '{db_name}' AND pid <> pg_backend_pid()"
    );
    let _ = maint_pool.execute(terminate.as_str()).await;

    let stmt = format!("DROP DATABASE IF EXISTS {db_name}");
    let _ = maint_pool.execute(stmt.as_str()).await;
    maint_pool.close().await;
}
