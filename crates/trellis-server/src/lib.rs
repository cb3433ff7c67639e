//! The HTTP surface: JSON-RPC dispatch, SSE and WebSocket streaming,
//! agent discovery, and principal extraction.

pub mod agent_card;
pub mod auth;
pub mod builtins;
pub mod config;
pub mod methods;
pub mod routes;
pub mod rpc;
pub mod sse;
pub mod state;
pub mod ws;

pub use config::{FileConfig, ServerConfig};
pub use routes::build_router;
pub use state::AppState;
