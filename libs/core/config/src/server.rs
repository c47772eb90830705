use crate::{env_or_default, env_parse, ConfigError, FromEnv};
use std::net::Ipv4Addr;

const DEFAULT_HEALTH_PORT: u16 = 8083;

/// Bind address of the worker's health/metrics endpoint.
#[derive(Clone, Debug)]
pub struct HealthServerConfig {
    pub host: String,
    pub port: u16,
}

impl HealthServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port`, suitable for `TcpListener::bind`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromEnv for HealthServerConfig {
    /// `HEALTH_HOST` (default `0.0.0.0`) and `HEALTH_PORT` (default 8083).
    fn from_env() -> Result<Self, ConfigError> {
        let host = env_or_default("HEALTH_HOST", &Ipv4Addr::UNSPECIFIED.to_string());
        let port = env_parse("HEALTH_PORT", DEFAULT_HEALTH_PORT)?;

        Ok(Self { host, port })
    }
}

impl Default for HealthServerConfig {
    fn default() -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED.to_string(), DEFAULT_HEALTH_PORT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_server_defaults() {
        temp_env::with_vars(
            [("HEALTH_HOST", None::<&str>), ("HEALTH_PORT", None::<&str>)],
            || {
                let config = HealthServerConfig::from_env().unwrap();
                assert_eq!(config.address(), "0.0.0.0:8083");
            },
        );
    }

    #[test]
    fn test_health_server_custom_values() {
        temp_env::with_vars(
            [("HEALTH_HOST", Some("127.0.0.1")), ("HEALTH_PORT", Some("9100"))],
            || {
                let config = HealthServerConfig::from_env().unwrap();
                assert_eq!(config.host, "127.0.0.1");
                assert_eq!(config.port, 9100);
            },
        );
    }

    #[test]
    fn test_health_server_port_out_of_range() {
        temp_env::with_var("HEALTH_PORT", Some("99999"), || {
            let err = HealthServerConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("HEALTH_PORT"));
        });
    }
}
