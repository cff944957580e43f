use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine-wide timing and retry settings
///
/// All durations are in milliseconds. A strategy may override the poll
/// interval for itself; everything else applies to every runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default wait between polls for strategies without their own interval
    pub poll_interval_ms: u64,
    /// OrderMonitor sweep interval
    pub monitor_interval_ms: u64,
    /// Timeout applied to each market-data call and status query
    pub call_timeout_ms: u64,
    /// Retries after the first failed attempt for transient data errors
    pub max_retries: u32,
    /// First backoff delay, doubled on every retry
    pub initial_backoff_ms: u64,
    /// How long shutdown waits for runners to acknowledge cancellation
    pub shutdown_grace_ms: u64,
    /// Buffered events per subscriber before lagging ones drop events
    pub event_capacity: usize,
    /// How long finished runners stay queryable before being pruned
    pub finished_retention_ms: u64,
    /// Optional cap on market-data requests across all runners
    ///
    /// Runners queue for a request slot before each call; the queueing time
    /// does not count against `call_timeout_ms`. Cancellation still ends the wait.
    pub max_data_requests_per_minute: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            monitor_interval_ms: 5_000,
            call_timeout_ms: 3_000,
            max_retries: 3,
            initial_backoff_ms: 500,
            shutdown_grace_ms: 10_000,
            event_capacity: 1_024,
            finished_retention_ms: 300_000,
            max_data_requests_per_minute: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `config/` and the environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    ///
    /// Sources, later ones winning: `default.toml`, `{STOCKBOT_ENV}.toml`
    /// (default `development`), then `STOCKBOT__*` environment variables.
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let env_name = std::env::var("STOCKBOT_ENV").unwrap_or_else(|_| "development".to_string());

        let config: EngineConfig = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join(env_name)).required(false))
            .add_source(
                Environment::with_prefix("STOCKBOT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Message("poll_interval_ms must be positive".into()));
        }
        if self.monitor_interval_ms == 0 {
            return Err(ConfigError::Message("monitor_interval_ms must be positive".into()));
        }
        if self.call_timeout_ms == 0 {
            return Err(ConfigError::Message("call_timeout_ms must be positive".into()));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Message("event_capacity must be positive".into()));
        }
        if self.max_data_requests_per_minute == Some(0) {
            return Err(ConfigError::Message(
                "max_data_requests_per_minute must be positive when set".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn finished_retention(&self) -> Duration {
        Duration::from_millis(self.finished_retention_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.monitor_interval(), Duration::from_secs(5));
        assert_eq!(config.max_retries, 3);
        assert!(config.max_data_requests_per_minute.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let config = EngineConfig {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_missing_dir_uses_defaults() {
        let config = EngineConfig::load_from("does-not-exist").unwrap();
        assert_eq!(config.shutdown_grace_ms, EngineConfig::default().shutdown_grace_ms);
    }

    #[test]
    fn test_load_from_file_overrides() {
        let dir = std::env::temp_dir().join(format!("stockbot-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("default.toml"),
            "poll_interval_ms = 250\nmax_retries = 5\n",
        )
        .unwrap();

        let config = EngineConfig::load_from(&dir).unwrap();
        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.monitor_interval_ms, 5_000);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
