//! Agent discovery: `GET /.well-known/agent-card`, public, advertising
//! the endpoint's capabilities and the registered executors as skills.

use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct AgentCard {
    pub name: String,
    pub description: String,
    pub url: String,
    pub version: String,
    pub capabilities: Capabilities,
    pub skills: Vec<Skill>,
}

#[derive(Debug, Serialize)]
pub struct Capabilities {
    pub streaming: bool,
    pub push_notifications: bool,
}

#[derive(Debug, Serialize)]
pub struct Skill {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
}

pub fn agent_card(state: &AppState) -> AgentCard {
    let skills = state
        .registry
        .iter()
        .map(|executor| Skill {
            id: executor.id().to_string(),
            name: executor.name().to_string(),
            description: executor.description().to_string(),
            tags: vec!["task".to_string()],
        })
        .collect();

    AgentCard {
        name: "trellis".to_string(),
        description: "Task-tree orchestration engine".to_string(),
        url: format!("http://{}:{}/", state.config.bind, state.config.port),
        version: env!("CARGO_PKG_VERSION").to_string(),
        capabilities: Capabilities {
            streaming: true,
            push_notifications: true,
        },
        skills,
    }
}
