//! Task persistence: the data model, the abstract [`Repository`] contract,
//! and its two backends (in-memory and PostgreSQL).

pub mod config;
pub mod memory;
pub mod models;
pub mod pool;
pub mod postgres;
pub mod repository;

pub use config::RepositoryConfig;
pub use memory::MemoryRepository;
pub use postgres::PgRepository;
pub use repository::{Repository, StoreError};
