//! Broker configuration.
//!
//! Configuration is resolved in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via `HMQ_CONFIG`)
//! 3. Environment variables

use crate::CONFIG_ENV;
use hmq_remoting::executor::DEFAULT_QUEUE_CAPACITY;
use hmq_server::{ConfigError, ServerConfig};
use hmq_store::StoreConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Broker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Remoting server settings.
    pub server: ServerConfig,
    /// Commit log settings.
    pub store: StoreConfig,
    /// Threads running the send-message processor.
    pub send_message_threads: usize,
    /// Queue capacity of the send-message pool.
    pub send_message_queue_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            send_message_threads: 8,
            send_message_queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl BrokerConfig {
    /// Loads configuration from the file named by `HMQ_CONFIG`, if any, then
    /// applies environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))
    }

    pub fn apply_env_overrides(&mut self) {
        self.server.apply_env_overrides();
        self.store.apply_env_overrides();

        if let Ok(threads) = std::env::var("HMQ_SEND_MESSAGE_THREADS") {
            if let Ok(n) = threads.parse() {
                self.send_message_threads = n;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        if self.send_message_threads == 0 {
            return Err(ConfigError::ValidationError(
                "send_message_threads must be at least 1".to_string(),
            ));
        }
        if self.store.segment_size == 0 {
            return Err(ConfigError::ValidationError(
                "store.segment_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hmq_store::FlushPolicy;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.server.listen_addr.to_string(), "0.0.0.0:8888");
        assert_eq!(config.send_message_threads, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_nested_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "server:\n  listen_addr: \"127.0.0.1:9876\"\n  channel_max_idle_ms: 5000\n\
             store:\n  data_dir: /var/lib/hmq\n  flush_policy: never\n\
             send_message_threads: 2"
        )
        .unwrap();

        let config = BrokerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.server.listen_addr.to_string(), "127.0.0.1:9876");
        assert_eq!(config.server.channel_max_idle_ms, 5000);
        assert_eq!(config.server.public_executor_threads, 4);
        assert_eq!(config.store.data_dir, Path::new("/var/lib/hmq"));
        assert_eq!(config.store.flush_policy, FlushPolicy::Never);
        assert_eq!(config.send_message_threads, 2);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("broker.yaml");
        let mut config = BrokerConfig::default();
        config.store = StoreConfig::new("/tmp/hmq").with_flush_policy(FlushPolicy::EveryN(16));
        config.save(&path).unwrap();
        assert_eq!(BrokerConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file_and_validation() {
        let err = BrokerConfig::from_file("/nonexistent/broker.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError(..)));

        let config = BrokerConfig {
            send_message_threads: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }
}
