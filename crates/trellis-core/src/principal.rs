//! The authenticated caller, as resolved by an external authenticator.
//!
//! The engine never parses or validates tokens; it consumes the decoded
//! `{user_id, roles}` pair and enforces ownership with it.

use serde::{Deserialize, Serialize};

use trellis_db::models::Task;

/// Role granting unrestricted access to every tree.
pub const ADMIN_ROLE: &str = "admin";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Principal {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            roles: Vec::new(),
        }
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            roles: vec![ADMIN_ROLE.to_string()],
        }
    }

    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|r| r == ADMIN_ROLE)
    }

    /// Whether this principal may touch the given task.
    pub fn can_access(&self, task: &Task) -> bool {
        self.is_admin() || task.user_id == self.user_id
    }
}
