//! The orchestration engine: graph validation, the dependency scheduler,
//! the executor adapter, the event bus, the tree-copy engine, and the
//! callback pusher. Persistence lives in `trellis-db`; the RPC surface in
//! `trellis-server`.

pub mod config;
pub mod copy;
pub mod error;
pub mod events;
pub mod executor;
pub mod graph;
pub mod principal;
pub mod push;
pub mod scheduler;
pub mod service;

pub use config::EngineConfig;
pub use error::{CoreError, IssueCode, ValidationIssue};
pub use events::{EventBus, RunStatus, StreamEndReason, TaskEvent};
pub use principal::Principal;
pub use scheduler::{RunOptions, RunSummary, RunView, Scheduler};
pub use service::TaskService;
