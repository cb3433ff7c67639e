//! Server configuration: an optional TOML file under the user config
//! directory, overridden by `TRELLIS_*` environment variables, overridden
//! by CLI flags.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

use trellis_core::EngineConfig;
use trellis_db::RepositoryConfig;

/// Shape of `~/.config/trellis/config.toml`. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub repository_url: Option<String>,
    pub default_user_id: Option<String>,
    pub worker_pool_size: Option<usize>,
    pub stream_buffer_size: Option<usize>,
    pub callback_max_retries: Option<u32>,
}

impl FileConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("trellis").join("config.toml"))
    }

    /// Load the config file when present; absent file means defaults.
    pub fn load() -> Result<Self> {
        let Some(path) = Self::default_path() else {
            return Ok(Self::default());
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }
}

/// Fully-resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub engine: EngineConfig,
    pub repository: RepositoryConfig,
}

impl ServerConfig {
    /// Resolve from file + environment, then apply CLI overrides.
    pub fn resolve(
        file: FileConfig,
        bind: Option<String>,
        port: Option<u16>,
        repository_url: Option<String>,
    ) -> Self {
        let mut engine = EngineConfig::from_env();
        if let Some(v) = file.default_user_id.clone() {
            if std::env::var("TRELLIS_DEFAULT_USER_ID").is_err() {
                engine.default_user_id = v;
            }
        }
        if let Some(v) = file.worker_pool_size {
            if std::env::var("TRELLIS_WORKER_POOL_SIZE").is_err() {
                engine.worker_pool_size = v;
            }
        }
        if let Some(v) = file.stream_buffer_size {
            if std::env::var("TRELLIS_STREAM_BUFFER_SIZE").is_err() {
                engine.stream_buffer_size = v;
            }
        }
        if let Some(v) = file.callback_max_retries {
            if std::env::var("TRELLIS_CALLBACK_MAX_RETRIES").is_err() {
                engine.callback_max_retries = v;
            }
        }

        let repository = match repository_url
            .or_else(|| std::env::var("TRELLIS_REPOSITORY_URL").ok())
            .or(file.repository_url)
        {
            Some(url) => RepositoryConfig::new(url),
            None => RepositoryConfig::new(RepositoryConfig::DEFAULT_URL),
        };

        Self {
            bind: bind.or(file.bind).unwrap_or_else(|| "127.0.0.1".to_string()),
            port: port.or(file.port).unwrap_or(7432),
            engine,
            repository,
        }
    }
}
