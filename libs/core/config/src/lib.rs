//! Process configuration shared by the worker binaries.
//!
//! Everything is read from environment variables. Library crates implement
//! [`FromEnv`] for their own settings on top of the helpers here.

pub mod nats;
pub mod tracing;

pub use nats::NatsConfig;

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use thiserror::Error;

const APP_ENV: &str = "APP_ENV";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {key}: {details}")]
    ParseError { key: String, details: String },
}

/// Deployment environment, selects the log format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    /// `APP_ENV=production` (any case) selects production.
    pub fn from_env() -> Self {
        match env::var(APP_ENV) {
            Ok(value) => Self::parse(&value),
            Err(_) => Self::default(),
        }
    }

    fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("production") {
            Self::Production
        } else {
            Self::Development
        }
    }

    pub fn is_production(&self) -> bool {
        *self == Self::Production
    }

    pub fn is_development(&self) -> bool {
        *self == Self::Development
    }
}

/// Settings loadable from the process environment.
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, ConfigError>;
}

/// Value of `key`, or `default` when unset.
pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

pub fn env_required(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_owned()))
}

/// Parse `key` (trimmed) into `T`, or return `default` when unset.
pub fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    let Ok(raw) = env::var(key) else {
        return Ok(default);
    };
    raw.trim().parse().map_err(|e: T::Err| ConfigError::ParseError {
        key: key.to_owned(),
        details: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_parsing() {
        for (raw, expected) in [
            ("production", Environment::Production),
            (" PRODUCTION ", Environment::Production),
            ("staging", Environment::Development),
            ("", Environment::Development),
        ] {
            assert_eq!(Environment::parse(raw), expected, "APP_ENV={raw:?}");
        }

        temp_env::with_var_unset(APP_ENV, || {
            assert!(Environment::from_env().is_development());
        });
        temp_env::with_var(APP_ENV, Some("Production"), || {
            assert!(Environment::from_env().is_production());
        });
    }

    #[test]
    fn test_env_or_default() {
        temp_env::with_var("CORE_CONFIG_SET", Some("set"), || {
            assert_eq!(env_or_default("CORE_CONFIG_SET", "fallback"), "set");
        });
        temp_env::with_var_unset("CORE_CONFIG_UNSET", || {
            assert_eq!(env_or_default("CORE_CONFIG_UNSET", "fallback"), "fallback");
        });
    }

    #[test]
    fn test_env_required_reports_key() {
        temp_env::with_var_unset("CORE_CONFIG_REQUIRED", || {
            let err = env_required("CORE_CONFIG_REQUIRED").unwrap_err();
            assert!(matches!(err, ConfigError::MissingEnvVar(ref key) if key == "CORE_CONFIG_REQUIRED"));
        });
    }

    #[test]
    fn test_env_parse() {
        temp_env::with_var("CORE_CONFIG_NUM", Some(" 12 "), || {
            assert_eq!(env_parse::<u32>("CORE_CONFIG_NUM", 1).unwrap(), 12);
        });
        temp_env::with_var_unset("CORE_CONFIG_NUM", || {
            assert_eq!(env_parse::<u32>("CORE_CONFIG_NUM", 1).unwrap(), 1);
        });
        temp_env::with_var("CORE_CONFIG_NUM", Some("twelve"), || {
            let err = env_parse::<u32>("CORE_CONFIG_NUM", 1).unwrap_err();
            assert!(err.to_string().contains("CORE_CONFIG_NUM"));
        });
    }
}
