//! Broker and producer error types.

use hmq_protocol::ProtocolError;
use hmq_remoting::RemotingError;
use hmq_server::{ConfigError, ServerError};
use hmq_store::StoreError;
use thiserror::Error;

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("server error: {0}")]
    Server(#[from] ServerError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("remoting error: {0}")]
    Remoting(#[from] RemotingError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The broker answered with a non-success code.
    #[error("broker responded {code}: {remark}")]
    Broker { code: i16, remark: String },

    #[error("{0} not started")]
    NotStarted(&'static str),
}

impl BrokerError {
    /// Returns whether the operation may succeed if retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            BrokerError::Remoting(e) => e.is_retryable(),
            BrokerError::Server(e) => e.is_retryable(),
            BrokerError::Store(e) => e.is_retryable(),
            BrokerError::Broker { code, .. } => hmq_protocol::ResponseCode::from_code(*code)
                .map(|code| code.is_retryable())
                .unwrap_or(false),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hmq_protocol::ResponseCode;

    #[test]
    fn test_display() {
        let err = BrokerError::Broker {
            code: ResponseCode::SystemBusy.code(),
            remark: "[OVERLOAD]system busy".to_string(),
        };
        assert_eq!(err.to_string(), "broker responded 2: [OVERLOAD]system busy");
        assert!(err.is_retryable());
        assert_eq!(BrokerError::NotStarted("producer").to_string(), "producer not started");
    }

    #[test]
    fn test_retryable() {
        let err: BrokerError = RemotingError::Connect {
            addr: "127.0.0.1:8888".to_string(),
        }
        .into();
        assert!(err.is_retryable());

        let err = BrokerError::Broker {
            code: ResponseCode::SystemError.code(),
            remark: String::new(),
        };
        assert!(!err.is_retryable());
        assert!(!BrokerError::Store(StoreError::Closed).is_retryable());
    }
}
