//! Protocol error types and response codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Protocol-level errors raised while framing or decoding commands.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: u32 },

    #[error("invalid frame length: {0}")]
    InvalidFrameLength(u32),

    #[error("header too large: {0} bytes (max 16777215)")]
    HeaderTooLarge(usize),

    #[error("unsupported serialize type: {0}")]
    UnsupportedSerializeType(u8),

    #[error("truncated {section}: need {needed} bytes, {available} available")]
    Truncated {
        section: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("extension key too long: {0} bytes (max 65535)")]
    KeyTooLong(usize),

    #[error("missing required header field: {0}")]
    MissingField(String),

    #[error("invalid value for header field {field}: {value:?}")]
    InvalidFieldValue { field: String, value: String },
}

/// Well-known response codes carried in the `code` of a response command.
///
/// These values are part of the protocol contract and must remain stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseCode {
    Success,
    SystemError,
    SystemBusy,
    RequestCodeNotSupported,
}

impl ResponseCode {
    /// Wire value of the code.
    pub fn code(&self) -> i16 {
        match self {
            ResponseCode::Success => 0,
            ResponseCode::SystemError => 1,
            ResponseCode::SystemBusy => 2,
            ResponseCode::RequestCodeNotSupported => 3,
        }
    }

    /// Maps a wire value back to a well-known code.
    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(ResponseCode::Success),
            1 => Some(ResponseCode::SystemError),
            2 => Some(ResponseCode::SystemBusy),
            3 => Some(ResponseCode::RequestCodeNotSupported),
            _ => None,
        }
    }

    /// Returns whether a caller may retry after receiving this code.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ResponseCode::SystemBusy)
    }
}

impl From<ResponseCode> for i16 {
    fn from(code: ResponseCode) -> Self {
        code.code()
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResponseCode::Success => "SUCCESS",
            ResponseCode::SystemError => "SYSTEM_ERROR",
            ResponseCode::SystemBusy => "SYSTEM_BUSY",
            ResponseCode::RequestCodeNotSupported => "REQUEST_CODE_NOT_SUPPORTED",
        };
        write!(f, "{}", s)
    }
}
