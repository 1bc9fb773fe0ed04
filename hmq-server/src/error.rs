//! Server error types.

use crate::config::ConfigError;
use hmq_remoting::RemotingError;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("remoting error: {0}")]
    Remoting(#[from] RemotingError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    #[error("server already started")]
    AlreadyStarted,

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServerError::Remoting(e) => e.is_retryable(),
            ServerError::Io(_) | ServerError::Bind { .. } => true,
            _ => false,
        }
    }
}
