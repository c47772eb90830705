pub mod redis;
pub mod server;
pub mod tracing;

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use thiserror::Error;

/// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment variable '{0}' is required but not set")]
    MissingEnvVar(String),

    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },

    #[error("Invalid value for '{key}': {details}")]
    InvalidValue { key: String, details: String },
}

/// Deployment environment, selected by `APP_ENV`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn from_env() -> Self {
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        if app_env.eq_ignore_ascii_case("production") {
            Environment::Production
        } else {
            Environment::Development
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

/// Trait for configuration that can be loaded from environment variables
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, ConfigError>;
}

/// Read a variable, falling back to `default` when unset.
pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Read a variable or fail with [`ConfigError::MissingEnvVar`].
pub fn env_required(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Read and parse a variable, using `default` when unset.
///
/// A set-but-unparseable value is an error rather than a silent fallback.
pub fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::ParseError {
            key: key.to_string(),
            details: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// Read a boolean flag. Accepts `1/0`, `true/false`, `yes/no`, `on/off`.
pub fn env_flag(key: &str, default: bool) -> Result<bool, ConfigError> {
    let Ok(raw) = env::var(key) else {
        return Ok(default);
    };

    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(ConfigError::ParseError {
            key: key.to_string(),
            details: format!("'{other}' is not a boolean"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_defaults_to_development() {
        temp_env::with_var_unset("APP_ENV", || {
            let env = Environment::from_env();
            assert_eq!(env, Environment::Development);
            assert!(env.is_development());
            assert!(!env.is_production());
        });
    }

    #[test]
    fn test_environment_production_case_insensitive() {
        temp_env::with_var("APP_ENV", Some("PRODUCTION"), || {
            assert_eq!(Environment::from_env(), Environment::Production);
        });
        temp_env::with_var("APP_ENV", Some("staging"), || {
            assert_eq!(Environment::from_env(), Environment::Development);
        });
    }

    #[test]
    fn test_env_or_default() {
        temp_env::with_var("COURIER_TEST_VAR", Some("set"), || {
            assert_eq!(env_or_default("COURIER_TEST_VAR", "fallback"), "set");
        });
        temp_env::with_var_unset("COURIER_TEST_VAR", || {
            assert_eq!(env_or_default("COURIER_TEST_VAR", "fallback"), "fallback");
        });
    }

    #[test]
    fn test_env_required_missing() {
        temp_env::with_var_unset("COURIER_REQUIRED", || {
            let err = env_required("COURIER_REQUIRED").unwrap_err();
            assert!(err.to_string().contains("COURIER_REQUIRED"));
            assert!(err.to_string().contains("required"));
        });
    }

    #[test]
    fn test_env_parse_uses_default_when_unset() {
        temp_env::with_var_unset("COURIER_WORKERS", || {
            assert_eq!(env_parse("COURIER_WORKERS", 4usize).unwrap(), 4);
        });
    }

    #[test]
    fn test_env_parse_reads_and_trims_value() {
        temp_env::with_var("COURIER_WORKERS", Some(" 12 "), || {
            assert_eq!(env_parse("COURIER_WORKERS", 4usize).unwrap(), 12);
        });
    }

    #[test]
    fn test_env_parse_rejects_garbage() {
        temp_env::with_var("COURIER_WORKERS", Some("lots"), || {
            let err = env_parse("COURIER_WORKERS", 4usize).unwrap_err();
            assert!(matches!(err, ConfigError::ParseError { ref key, .. } if key == "COURIER_WORKERS"));
        });
    }

    #[test]
    fn test_env_flag_variants() {
        temp_env::with_var("COURIER_FLAG", Some("Yes"), || {
            assert!(env_flag("COURIER_FLAG", false).unwrap());
        });
        temp_env::with_var("COURIER_FLAG", Some("off"), || {
            assert!(!env_flag("COURIER_FLAG", true).unwrap());
        });
        temp_env::with_var_unset("COURIER_FLAG", || {
            assert!(env_flag("COURIER_FLAG", true).unwrap());
        });
        temp_env::with_var("COURIER_FLAG", Some("maybe"), || {
            assert!(env_flag("COURIER_FLAG", true).is_err());
        });
    }
}
