use core_config::{env_flag, env_or_default, env_parse, ConfigError, FromEnv};
use std::time::Duration;

pub const DEFAULT_RESEND_API_BASE: &str = "https://api.resend.com";

const DEFAULT_MAX_BACKOFF_SECS: u64 = 24 * 60 * 60;

/// Defaults and knobs shared by the delivery and sender-config reconcilers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryConfig {
    /// Retry delay when a request has no `backoffSeconds`.
    pub default_backoff: Duration,
    /// Ceiling on any retry delay, including client-supplied ones.
    pub max_backoff: Duration,
    /// Per-attempt timeout when a SenderConfig has none.
    pub default_timeout: Duration,
    pub default_smtp_port: u16,
    /// Bound on each store read made by the resolver.
    pub store_timeout: Duration,
    /// Whether SenderConfig validation makes an authenticated provider call.
    pub verify_sender_credentials: bool,
    pub resend_api_base: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            default_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(DEFAULT_MAX_BACKOFF_SECS),
            default_timeout: Duration::from_secs(30),
            default_smtp_port: 587,
            store_timeout: Duration::from_millis(5000),
            verify_sender_credentials: false,
            resend_api_base: DEFAULT_RESEND_API_BASE.to_string(),
        }
    }
}

impl FromEnv for DeliveryConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let default_smtp_port: u16 = env_parse("DELIVERY_DEFAULT_SMTP_PORT", 587)?;
        if default_smtp_port == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DELIVERY_DEFAULT_SMTP_PORT".to_string(),
                details: "port must be non-zero".to_string(),
            });
        }

        let max_backoff_secs: u64 =
            env_parse("DELIVERY_MAX_BACKOFF_SECS", DEFAULT_MAX_BACKOFF_SECS)?;
        if max_backoff_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DELIVERY_MAX_BACKOFF_SECS".to_string(),
                details: "must be greater than 0".to_string(),
            });
        }

        Ok(Self {
            default_backoff: Duration::from_secs(env_parse("DELIVERY_DEFAULT_BACKOFF_SECS", 10)?),
            max_backoff: Duration::from_secs(max_backoff_secs),
            default_timeout: Duration::from_secs(env_parse("DELIVERY_DEFAULT_TIMEOUT_SECS", 30)?),
            default_smtp_port,
            store_timeout: Duration::from_millis(env_parse("DELIVERY_STORE_TIMEOUT_MS", 5000)?),
            verify_sender_credentials: env_flag("VERIFY_SENDER_CREDENTIALS", false)?,
            resend_api_base: env_or_default("RESEND_API_BASE", DEFAULT_RESEND_API_BASE)
                .trim_end_matches('/')
                .to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 7] = [
        "DELIVERY_DEFAULT_BACKOFF_SECS",
        "DELIVERY_MAX_BACKOFF_SECS",
        "DELIVERY_DEFAULT_TIMEOUT_SECS",
        "DELIVERY_DEFAULT_SMTP_PORT",
        "DELIVERY_STORE_TIMEOUT_MS",
        "VERIFY_SENDER_CREDENTIALS",
        "RESEND_API_BASE",
    ];

    #[test]
    fn test_defaults_when_unset() {
        temp_env::with_vars(VARS.map(|k| (k, None::<&str>)), || {
            let config = DeliveryConfig::from_env().unwrap();
            assert_eq!(config, DeliveryConfig::default());
        });
    }

    #[test]
    fn test_overrides() {
        temp_env::with_vars(
            [
                ("DELIVERY_DEFAULT_BACKOFF_SECS", Some("45")),
                ("DELIVERY_DEFAULT_SMTP_PORT", Some("2525")),
                ("VERIFY_SENDER_CREDENTIALS", Some("true")),
                ("RESEND_API_BASE", Some("http://localhost:9999/")),
            ],
            || {
                let config = DeliveryConfig::from_env().unwrap();
                assert_eq!(config.default_backoff, Duration::from_secs(45));
                assert_eq!(config.default_smtp_port, 2525);
                assert!(config.verify_sender_credentials);
                assert_eq!(config.resend_api_base, "http://localhost:9999");
            },
        );
    }

    #[test]
    fn test_rejects_zero_port() {
        temp_env::with_var("DELIVERY_DEFAULT_SMTP_PORT", Some("0"), || {
            assert!(matches!(
                DeliveryConfig::from_env(),
                Err(ConfigError::InvalidValue { .. })
            ));
        });
    }

    #[test]
    fn test_max_backoff() {
        temp_env::with_var("DELIVERY_MAX_BACKOFF_SECS", Some("3600"), || {
            let config = DeliveryConfig::from_env().unwrap();
            assert_eq!(config.max_backoff, Duration::from_secs(3600));
        });
        temp_env::with_var("DELIVERY_MAX_BACKOFF_SECS", Some("0"), || {
            assert!(matches!(
                DeliveryConfig::from_env(),
                Err(ConfigError::InvalidValue { .. })
            ));
        });
    }

    #[test]
    fn test_rejects_garbage() {
        temp_env::with_var("DELIVERY_STORE_TIMEOUT_MS", Some("soon"), || {
            assert!(matches!(
                DeliveryConfig::from_env(),
                Err(ConfigError::ParseError { .. })
            ));
        });
    }
}
