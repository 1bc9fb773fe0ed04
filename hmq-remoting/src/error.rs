//! Remoting error types.

use hmq_protocol::ProtocolError;
use thiserror::Error;

/// Errors surfaced by the remoting layer.
#[derive(Debug, Error)]
pub enum RemotingError {
    #[error("connect to {addr} failed")]
    Connect { addr: String },

    #[error("send request to <{addr}> failed: {cause}")]
    SendRequest { addr: String, cause: String },

    #[error("wait response on the channel <{addr}> timeout, {timeout_ms}(ms)")]
    Timeout { addr: String, timeout_ms: u64 },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("too many requests: {0}")]
    TooManyRequests(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("remoting service is shutting down")]
    ShuttingDown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemotingError {
    /// Returns whether the call may succeed if retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemotingError::Connect { .. }
                | RemotingError::SendRequest { .. }
                | RemotingError::Timeout { .. }
                | RemotingError::TooManyRequests(_)
                | RemotingError::Io(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RemotingError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = RemotingError::Timeout {
            addr: "127.0.0.1:8888".to_string(),
            timeout_ms: 3000,
        };
        assert_eq!(
            err.to_string(),
            "wait response on the channel <127.0.0.1:8888> timeout, 3000(ms)"
        );
        assert!(err.is_timeout());
    }

    #[test]
    fn test_is_retryable() {
        assert!(RemotingError::Connect {
            addr: "a".to_string()
        }
        .is_retryable());
        assert!(!RemotingError::ShuttingDown.is_retryable());
        assert!(!RemotingError::Protocol(ProtocolError::InvalidFrameLength(0)).is_retryable());
    }
}
