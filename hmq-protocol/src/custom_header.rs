//! Typed projection between header structs and the extension map.
//!
//! Each header type spells out its own fields:
//!
//! ```
//! use hmq_protocol::custom_header::{optional, put, put_optional, required};
//! use hmq_protocol::{CustomHeader, ExtFields, ProtocolError};
//!
//! struct PullHeader {
//!     topic: String,
//!     max_msgs: i32,
//!     tag: Option<String>,
//! }
//!
//! impl CustomHeader for PullHeader {
//!     fn to_fields(&self, fields: &mut ExtFields) {
//!         put(fields, "topic", &self.topic);
//!         put(fields, "maxMsgs", &self.max_msgs);
//!         put_optional(fields, "tag", &self.tag);
//!     }
//!
//!     fn from_fields(fields: &ExtFields) -> Result<Self, ProtocolError> {
//!         Ok(Self {
//!             topic: required(fields, "topic")?,
//!             max_msgs: required(fields, "maxMsgs")?,
//!             tag: optional(fields, "tag")?,
//!         })
//!     }
//! }
//! ```

use crate::error::ProtocolError;
use std::collections::HashMap;

/// The generic extensible header carried by every command.
pub type ExtFields = HashMap<String, String>;

/// A typed view over a command's extension fields.
pub trait CustomHeader: Sized {
    /// Writes every set field into `fields`. Unset optional fields are skipped.
    fn to_fields(&self, fields: &mut ExtFields);

    /// Reads the header back, failing on missing required or malformed fields.
    fn from_fields(fields: &ExtFields) -> Result<Self, ProtocolError>;
}

/// Header for commands that carry no typed fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmptyHeader;

impl CustomHeader for EmptyHeader {
    fn to_fields(&self, _fields: &mut ExtFields) {}

    fn from_fields(_fields: &ExtFields) -> Result<Self, ProtocolError> {
        Ok(EmptyHeader)
    }
}

/// A scalar that can be stored as a header string.
pub trait HeaderValue: Sized {
    fn to_header_value(&self) -> String;
    fn from_header_value(value: &str) -> Option<Self>;
}

impl HeaderValue for String {
    fn to_header_value(&self) -> String {
        self.clone()
    }

    fn from_header_value(value: &str) -> Option<Self> {
        Some(value.to_string())
    }
}

impl HeaderValue for i32 {
    fn to_header_value(&self) -> String {
        self.to_string()
    }

    fn from_header_value(value: &str) -> Option<Self> {
        value.trim().parse().ok()
    }
}

impl HeaderValue for i64 {
    fn to_header_value(&self) -> String {
        self.to_string()
    }

    fn from_header_value(value: &str) -> Option<Self> {
        value.trim().parse().ok()
    }
}

impl HeaderValue for f64 {
    fn to_header_value(&self) -> String {
        self.to_string()
    }

    fn from_header_value(value: &str) -> Option<Self> {
        value.trim().parse().ok()
    }
}

impl HeaderValue for bool {
    fn to_header_value(&self) -> String {
        self.to_string()
    }

    fn from_header_value(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("true") {
            Some(true)
        } else if value.eq_ignore_ascii_case("false") {
            Some(false)
        } else {
            None
        }
    }
}

/// Stores a field.
pub fn put<T: HeaderValue>(fields: &mut ExtFields, name: &str, value: &T) {
    fields.insert(name.to_string(), value.to_header_value());
}

/// Stores a field only when it is set.
pub fn put_optional<T: HeaderValue>(fields: &mut ExtFields, name: &str, value: &Option<T>) {
    if let Some(value) = value {
        put(fields, name, value);
    }
}

/// Reads a field that must be present.
pub fn required<T: HeaderValue>(fields: &ExtFields, name: &str) -> Result<T, ProtocolError> {
    optional(fields, name)?.ok_or_else(|| ProtocolError::MissingField(name.to_string()))
}

/// Reads a field that may be absent. A present but unparsable value is an error.
pub fn optional<T: HeaderValue>(fields: &ExtFields, name: &str) -> Result<Option<T>, ProtocolError> {
    match fields.get(name) {
        None => Ok(None),
        Some(raw) => T::from_header_value(raw)
            .map(Some)
            .ok_or_else(|| ProtocolError::InvalidFieldValue {
                field: name.to_string(),
                value: raw.clone(),
            }),
    }
}
