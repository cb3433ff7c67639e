use std::env;

/// Storage configuration.
///
/// Reads from the `TRELLIS_REPOSITORY_URL` environment variable, falling
/// back to the in-memory store when unset. A `postgresql://` URL selects
/// the PostgreSQL backend.
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    /// Where persistent state lives: `memory:` or a PostgreSQL URL.
    pub repository_url: String,
}

impl RepositoryConfig {
    /// The default store used when no environment variable is set.
    pub const DEFAULT_URL: &str = "memory:";

    /// Build a config from the environment.
    pub fn from_env() -> Self {
        let repository_url =
            env::var("TRELLIS_REPOSITORY_URL").unwrap_or_else(|_| Self::DEFAULT_URL.to_owned());
        Self { repository_url }
    }

    /// Build a config from an explicit URL (useful for tests and CLI flags).
    pub fn new(repository_url: impl Into<String>) -> Self {
        Self {
            repository_url: repository_url.into(),
        }
    }

    pub fn is_memory(&self) -> bool {
        self.repository_url == "memory:" || self.repository_url.is_empty()
    }

    /// Extract the database name from a PostgreSQL URL.
    ///
    /// Returns `None` for the memory store or a URL with no path component.
    pub fn database_name(&self) -> Option<&str> {
        if self.is_memory() {
            return None;
        }
        self.repository_url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
    }

    /// Return a URL pointing at the `postgres` maintenance database on the
    /// same host. Used to issue `CREATE DATABASE` when the target DB does
    /// not yet exist.
    pub fn maintenance_url(&self) -> String {
        match self.repository_url.rfind('/') {
            Some(pos) => {
                let mut url = self.repository_url[..pos].to_owned();
                url.push_str("/postgres");
                url
            }
            None => self.repository_url.clone(),
        }
    }
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_is_default() {
        let cfg = RepositoryConfig::new(RepositoryConfig::DEFAULT_URL);
        assert!(cfg.is_memory());
        assert_eq!(cfg.database_name(), None);
    }

    #[test]
    fn database_name_extraction() {
        let cfg = RepositoryConfig::new("postgresql://localhost:5432/trellis");
        assert!(!cfg.is_memory());
        assert_eq!(cfg.database_name(), Some("trellis"));
    }

    #[test]
    fn maintenance_url_replaces_db() {
        let cfg = RepositoryConfig::new("postgresql://localhost:5432/trellis");
        assert_eq!(
            cfg.maintenance_url(),
            "postgresql://localhost:5432/postgres"
        );
    }
}
