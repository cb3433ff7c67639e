//! Shared server state: the engine singletons plus small server-side
//! stores (LLM keys).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use trellis_core::executor::ExecutorRegistry;
use trellis_core::push::CallbackPusher;
use trellis_core::{EventBus, Scheduler, TaskService};
use trellis_db::Repository;

use crate::config::ServerConfig;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<TaskService>,
    pub scheduler: Arc<Scheduler>,
    pub bus: Arc<EventBus>,
    pub registry: Arc<ExecutorRegistry>,
    pub pusher: Arc<CallbackPusher>,
    pub config: Arc<ServerConfig>,
    /// Per-user LLM API keys, kept in memory only.
    pub llm_keys: Arc<RwLock<HashMap<String, String>>>,
}

impl AppState {
    pub fn new(
        repo: Arc<dyn Repository>,
        registry: ExecutorRegistry,
        config: ServerConfig,
    ) -> Self {
        let registry = Arc::new(registry);
        let bus = Arc::new(EventBus::new(config.engine.stream_buffer_size));
        let scheduler = Arc::new(Scheduler::new(
            repo.clone(),
            bus.clone(),
            registry.clone(),
            Arc::new(trellis_core::executor::HookSet::new()),
            config.engine.clone(),
        ));
        let pusher = Arc::new(CallbackPusher::new(&config.engine));
        Self {
            service: Arc::new(TaskService::new(repo)),
            scheduler,
            bus,
            registry,
            pusher,
            config: Arc::new(config),
            llm_keys: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}
