use crate::{env_parse, env_required, ConfigError, FromEnv};
use std::time::Duration;

/// Connection settings for the Redis-backed resource store.
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub url: String,
    pub connect_timeout: Duration,
    /// Key prefix shared by every record and the event stream.
    pub key_prefix: String,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(5),
            key_prefix: "courier".to_string(),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl FromEnv for RedisConfig {
    /// Requires `REDIS_URL`. `REDIS_CONNECT_TIMEOUT_MS` and `REDIS_KEY_PREFIX` are optional.
    fn from_env() -> Result<Self, ConfigError> {
        let url = env_required("REDIS_URL")?;
        let timeout_ms: u64 = env_parse("REDIS_CONNECT_TIMEOUT_MS", 5_000)?;
        let prefix = env_parse("REDIS_KEY_PREFIX", "courier".to_string())?;

        Ok(Self::new(url)
            .with_key_prefix(prefix)
            .with_connect_timeout(Duration::from_millis(timeout_ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config_from_env_success() {
        temp_env::with_vars(
            [
                ("REDIS_URL", Some("redis://localhost:6379")),
                ("REDIS_CONNECT_TIMEOUT_MS", Some("250")),
                ("REDIS_KEY_PREFIX", None),
            ],
            || {
                let config = RedisConfig::from_env().unwrap();
                assert_eq!(config.url, "redis://localhost:6379");
                assert_eq!(config.connect_timeout, Duration::from_millis(250));
                assert_eq!(config.key_prefix, "courier");
            },
        );
    }

    #[test]
    fn test_redis_config_from_env_missing() {
        temp_env::with_var_unset("REDIS_URL", || {
            let err = RedisConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("REDIS_URL"));
        });
    }
}
