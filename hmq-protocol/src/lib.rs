//! # hmq-protocol
//!
//! Wire protocol implementation for hmq remoting.
//!
//! This crate provides:
//! - The `Command` model shared by requests and responses
//! - Length-prefixed framing with a serialization-type marker
//! - The compact binary (HMQ) header codec and its extension map
//! - Typed header projection through the `CustomHeader` trait
//! - Error types and well-known response codes

pub mod codec;
pub mod command;
pub mod custom_header;
pub mod error;
pub mod frame;
pub mod header;

pub use codec::{Decoder, Encoder};
pub use command::{remoting_version, Command, CommandType};
pub use custom_header::{CustomHeader, EmptyHeader, ExtFields, HeaderValue};
pub use error::{ProtocolError, ResponseCode};
pub use frame::{Frame, SerializeType, LENGTH_FIELD_SIZE, MAX_HEADER_LENGTH};

/// Default broker port.
pub const DEFAULT_PORT: u16 = 8888;

/// Maximum size of a whole frame, length field included (16 MiB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Environment variable holding the protocol version stamped on new commands.
pub const REMOTING_VERSION_ENV: &str = "HMQ_REMOTING_VERSION";
