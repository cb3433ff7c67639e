//! Engine configuration, captured once at process start.

use std::env;
use std::time::Duration;

/// Tunables for the scheduler, event bus, and callback pusher.
///
/// Every field can be overridden through a `TRELLIS_*` environment
/// variable; unparseable values fall back to the default.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Hard cap on concurrently executing tasks, shared across runs.
    pub worker_pool_size: usize,
    /// Per-subscriber event buffer; a subscriber that falls this far
    /// behind is disconnected.
    pub stream_buffer_size: usize,
    /// Upper bound on push-callback retries (attempts = 1 + retries).
    pub callback_max_retries: u32,
    /// Initial push-callback retry delay; doubles each retry.
    pub callback_base_backoff: Duration,
    /// Principal used when a request carries no token.
    pub default_user_id: String,
    /// How long a cancelled executor gets to wind down before the task is
    /// marked cancelled regardless.
    pub cancel_grace: Duration,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_pool_size: env_parse("TRELLIS_WORKER_POOL_SIZE", defaults.worker_pool_size),
            stream_buffer_size: env_parse(
                "TRELLIS_STREAM_BUFFER_SIZE",
                defaults.stream_buffer_size,
            ),
            callback_max_retries: env_parse(
                "TRELLIS_CALLBACK_MAX_RETRIES",
                defaults.callback_max_retries,
            ),
            callback_base_backoff: Duration::from_millis(env_parse(
                "TRELLIS_CALLBACK_BASE_BACKOFF_MS",
                defaults.callback_base_backoff.as_millis() as u64,
            )),
            default_user_id: env::var("TRELLIS_DEFAULT_USER_ID")
                .unwrap_or(defaults.default_user_id),
            cancel_grace: Duration::from_millis(env_parse(
                "TRELLIS_CANCEL_GRACE_MS",
                defaults.cancel_grace.as_millis() as u64,
            )),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 8,
            stream_buffer_size: 256,
            callback_max_retries: 5,
            callback_base_backoff: Duration::from_secs(1),
            default_user_id: "anonymous".to_string(),
            cancel_grace: Duration::from_secs(5),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert!(cfg.worker_pool_size > 0);
        assert!(cfg.stream_buffer_size > 0);
        assert_eq!(cfg.callback_base_backoff, Duration::from_secs(1));
    }
}
