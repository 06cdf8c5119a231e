use crate::{env_or_default, ConfigError, FromEnv};

/// NATS connection settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NatsConfig {
    /// Server URL (`NATS_URL`, default `nats://localhost:4222`)
    pub url: String,
    /// Client name reported to the server (`NATS_CLIENT_NAME`)
    pub name: String,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            name: "workqueue".to_string(),
        }
    }
}

impl FromEnv for NatsConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            url: env_or_default("NATS_URL", &defaults.url),
            name: env_or_default("NATS_CLIENT_NAME", &defaults.name),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nats_config_defaults() {
        temp_env::with_vars_unset(["NATS_URL", "NATS_CLIENT_NAME"], || {
            let config = NatsConfig::from_env().unwrap();
            assert_eq!(config, NatsConfig::default());
        });
    }

    #[test]
    fn test_nats_config_from_env() {
        temp_env::with_vars(
            [
                ("NATS_URL", Some("nats://queue:4222")),
                ("NATS_CLIENT_NAME", Some("jobs-worker")),
            ],
            || {
                let config = NatsConfig::from_env().unwrap();
                assert_eq!(config.url, "nats://queue:4222");
                assert_eq!(config.name, "jobs-worker");
            },
        );
    }
}
