//! Server configuration.
//!
//! Configuration is resolved in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (usually the `server` section of the broker config)
//! 3. Environment variables

use hmq_protocol::{DEFAULT_PORT, MAX_FRAME_SIZE};
use hmq_remoting::executor::DEFAULT_QUEUE_CAPACITY;
use hmq_remoting::remoting::{DEFAULT_ASYNC_PERMITS, DEFAULT_ONEWAY_PERMITS};
use hmq_remoting::RemotingConfig;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Remoting server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on.
    #[serde(with = "socket_addr_serde")]
    pub listen_addr: SocketAddr,
    /// Threads running processors registered without their own pool.
    pub public_executor_threads: usize,
    /// Threads running callbacks of server-initiated async calls.
    pub callback_executor_threads: usize,
    /// Queue capacity of each pool.
    pub executor_queue_capacity: usize,
    /// Connections idle longer than this are closed, in milliseconds.
    pub channel_max_idle_ms: u64,
    pub socket_send_buf_size: u32,
    pub socket_rcv_buf_size: u32,
    /// Listen backlog.
    pub backlog: u32,
    pub max_frame_size: u32,
    /// Maximum in-flight server-initiated asynchronous requests.
    pub async_permits: usize,
    /// Maximum in-flight server-initiated oneway requests.
    pub oneway_permits: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            public_executor_threads: 4,
            callback_executor_threads: 4,
            executor_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            channel_max_idle_ms: 120_000,
            socket_send_buf_size: 65535,
            socket_rcv_buf_size: 65535,
            backlog: 1024,
            max_frame_size: MAX_FRAME_SIZE,
            async_permits: DEFAULT_ASYNC_PERMITS,
            oneway_permits: DEFAULT_ONEWAY_PERMITS,
        }
    }
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("HMQ_LISTEN_ADDR") {
            if let Ok(parsed) = addr.parse() {
                self.listen_addr = parsed;
            }
        }

        if let Ok(threads) = std::env::var("HMQ_SERVER_WORKER_THREADS") {
            if let Ok(n) = threads.parse() {
                self.public_executor_threads = n;
            }
        }

        if let Ok(threads) = std::env::var("HMQ_SERVER_CALLBACK_THREADS") {
            if let Ok(n) = threads.parse() {
                self.callback_executor_threads = n;
            }
        }

        if let Ok(idle) = std::env::var("HMQ_SERVER_CHANNEL_MAX_IDLE_MS") {
            if let Ok(ms) = idle.parse() {
                self.channel_max_idle_ms = ms;
            }
        }

        if let Ok(size) = std::env::var("HMQ_SOCKET_SNDBUF_SIZE") {
            if let Ok(n) = size.parse() {
                self.socket_send_buf_size = n;
            }
        }

        if let Ok(size) = std::env::var("HMQ_SOCKET_RCVBUF_SIZE") {
            if let Ok(n) = size.parse() {
                self.socket_rcv_buf_size = n;
            }
        }

        if let Ok(size) = std::env::var("HMQ_MAX_FRAME_SIZE") {
            if let Ok(n) = size.parse() {
                self.max_frame_size = n;
            }
        }
    }

    /// Rejects settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.public_executor_threads == 0 {
            return Err(ConfigError::ValidationError(
                "public_executor_threads must be at least 1".to_string(),
            ));
        }
        if self.channel_max_idle_ms == 0 {
            return Err(ConfigError::ValidationError(
                "channel_max_idle_ms must be positive".to_string(),
            ));
        }
        if self.max_frame_size < 64 {
            return Err(ConfigError::ValidationError(format!(
                "max_frame_size {} is too small",
                self.max_frame_size
            )));
        }
        Ok(())
    }

    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_channel_max_idle(mut self, idle: Duration) -> Self {
        self.channel_max_idle_ms = idle.as_millis() as u64;
        self
    }

    pub fn with_public_executor_threads(mut self, threads: usize) -> Self {
        self.public_executor_threads = threads;
        self
    }

    pub fn channel_max_idle(&self) -> Duration {
        Duration::from_millis(self.channel_max_idle_ms)
    }

    pub fn remoting_config(&self) -> RemotingConfig {
        RemotingConfig {
            async_permits: self.async_permits,
            oneway_permits: self.oneway_permits,
            max_frame_size: self.max_frame_size,
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serializes a `SocketAddr` as a plain string in YAML.
pub mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
