//! Client configuration.
//!
//! Values start from defaults and may be overridden by environment variables.

use hmq_protocol::MAX_FRAME_SIZE;
use hmq_remoting::executor::DEFAULT_QUEUE_CAPACITY;
use hmq_remoting::remoting::{DEFAULT_ASYNC_PERMITS, DEFAULT_ONEWAY_PERMITS};
use hmq_remoting::RemotingConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default socket send and receive buffer size.
pub const DEFAULT_SOCKET_BUF_SIZE: u32 = 65535;

/// Remoting client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Bound on waiting for the connection table lock, in milliseconds.
    pub lock_timeout_ms: u64,
    /// Threads running async callbacks.
    pub callback_executor_threads: usize,
    /// Threads running processors registered without their own pool.
    pub public_executor_threads: usize,
    /// Queue capacity of each pool.
    pub executor_queue_capacity: usize,
    pub socket_send_buf_size: u32,
    pub socket_rcv_buf_size: u32,
    /// Close the connection when a synchronous call times out.
    pub close_socket_if_timeout: bool,
    pub max_frame_size: u32,
    /// Maximum in-flight asynchronous requests.
    pub async_permits: usize,
    /// Maximum in-flight oneway requests.
    pub oneway_permits: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 3000,
            lock_timeout_ms: 3000,
            callback_executor_threads: 4,
            public_executor_threads: 4,
            executor_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            socket_send_buf_size: DEFAULT_SOCKET_BUF_SIZE,
            socket_rcv_buf_size: DEFAULT_SOCKET_BUF_SIZE,
            close_socket_if_timeout: false,
            max_frame_size: MAX_FRAME_SIZE,
            async_permits: DEFAULT_ASYNC_PERMITS,
            oneway_permits: DEFAULT_ONEWAY_PERMITS,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with environment variable overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(ms) = env_parse("HMQ_CLIENT_CONNECT_TIMEOUT_MS") {
            self.connect_timeout_ms = ms;
        }
        if let Some(threads) = env_parse("HMQ_CLIENT_CALLBACK_THREADS") {
            self.callback_executor_threads = threads;
        }
        if let Some(size) = env_parse("HMQ_SOCKET_SNDBUF_SIZE") {
            self.socket_send_buf_size = size;
        }
        if let Some(size) = env_parse("HMQ_SOCKET_RCVBUF_SIZE") {
            self.socket_rcv_buf_size = size;
        }
        if let Some(size) = env_parse("HMQ_MAX_FRAME_SIZE") {
            self.max_frame_size = size;
        }
        if let Ok(value) = std::env::var("HMQ_CLIENT_CLOSE_SOCKET_IF_TIMEOUT") {
            self.close_socket_if_timeout = value == "1" || value.eq_ignore_ascii_case("true");
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_close_socket_if_timeout(mut self, close: bool) -> Self {
        self.close_socket_if_timeout = close;
        self
    }

    pub fn with_callback_executor_threads(mut self, threads: usize) -> Self {
        self.callback_executor_threads = threads;
        self
    }

    pub fn with_async_permits(mut self, permits: usize) -> Self {
        self.async_permits = permits;
        self
    }

    pub fn with_max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn remoting_config(&self) -> RemotingConfig {
        RemotingConfig {
            async_permits: self.async_permits,
            oneway_permits: self.oneway_permits,
            max_frame_size: self.max_frame_size,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
