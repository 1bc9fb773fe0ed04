//! The command model shared by requests and responses.

use crate::custom_header::{CustomHeader, ExtFields};
use crate::error::{ProtocolError, ResponseCode};
use crate::frame::Frame;
use crate::header::{decode_header, encode_header, HeaderFields};
use crate::{MAX_FRAME_SIZE, REMOTING_VERSION_ENV};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::sync::OnceLock;

/// Flag bit marking a response.
const RESPONSE_BIT: i32 = 1 << 0;
/// Flag bit marking a oneway request.
const ONEWAY_BIT: i32 = 1 << 1;

static REMOTING_VERSION: OnceLock<i16> = OnceLock::new();

/// Version stamped on every new command.
///
/// Read once from `HMQ_REMOTING_VERSION`; unset or unparsable means 0.
pub fn remoting_version() -> i16 {
    *REMOTING_VERSION.get_or_init(|| {
        std::env::var(REMOTING_VERSION_ENV)
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    })
}

/// Whether a command is a request or a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    Request,
    Response,
}

/// A single RPC command.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Request code or response status.
    pub code: i16,
    pub version: i16,
    /// Correlation key; assigned by the issuing side.
    pub opaque: i32,
    pub flag: i32,
    pub remark: Option<String>,
    pub ext_fields: ExtFields,
    pub body: Bytes,
}

impl Command {
    fn with_code(code: i16) -> Self {
        Self {
            code,
            version: remoting_version(),
            opaque: 0,
            flag: 0,
            remark: None,
            ext_fields: ExtFields::new(),
            body: Bytes::new(),
        }
    }

    /// Creates a request with the given code.
    pub fn request(code: i16) -> Self {
        Self::with_code(code)
    }

    /// Creates a request carrying a typed header.
    pub fn request_with_header<H: CustomHeader>(code: i16, header: &H) -> Self {
        Self::with_code(code).with_header(header)
    }

    /// Creates a response with one of the well-known codes.
    pub fn response(code: ResponseCode, remark: impl Into<String>) -> Self {
        Self::response_with_code(code.code(), remark)
    }

    /// Creates a response with an arbitrary status code.
    pub fn response_with_code(code: i16, remark: impl Into<String>) -> Self {
        let mut command = Self::with_code(code).with_remark(remark);
        command.mark_response();
        command
    }

    /// Creates a successful response carrying a typed header.
    pub fn success_with_header<H: CustomHeader>(header: &H) -> Self {
        Self::response(ResponseCode::Success, "").with_header(header)
    }

    /// Sets the remark. An empty remark is the same as no remark.
    pub fn with_remark(mut self, remark: impl Into<String>) -> Self {
        let remark = remark.into();
        self.remark = if remark.is_empty() { None } else { Some(remark) };
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_opaque(mut self, opaque: i32) -> Self {
        self.opaque = opaque;
        self
    }

    /// Writes a typed header into the extension fields.
    pub fn with_header<H: CustomHeader>(mut self, header: &H) -> Self {
        header.to_fields(&mut self.ext_fields);
        self
    }

    /// Adds a single extension field.
    pub fn with_ext_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ext_fields.insert(key.into(), value.into());
        self
    }

    /// Projects the extension fields onto a typed header.
    pub fn decode_header<H: CustomHeader>(&self) -> Result<H, ProtocolError> {
        H::from_fields(&self.ext_fields)
    }

    pub fn mark_response(&mut self) {
        self.flag |= RESPONSE_BIT;
    }

    pub fn is_response(&self) -> bool {
        self.flag & RESPONSE_BIT != 0
    }

    pub fn mark_oneway(&mut self) {
        self.flag |= ONEWAY_BIT;
    }

    pub fn is_oneway(&self) -> bool {
        self.flag & ONEWAY_BIT != 0
    }

    pub fn command_type(&self) -> CommandType {
        if self.is_response() {
            CommandType::Response
        } else {
            CommandType::Request
        }
    }

    /// Returns the well-known response code, if `code` is one.
    pub fn response_code(&self) -> Option<ResponseCode> {
        ResponseCode::from_code(self.code)
    }

    /// Builds the wire frame for this command.
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        let mut header = BytesMut::new();
        encode_header(
            self.code,
            self.version,
            self.opaque,
            self.flag,
            self.remark.as_deref(),
            &self.ext_fields,
            &mut header,
        )?;
        Ok(Frame::new(header.freeze(), self.body.clone()))
    }

    /// Rebuilds a command from a decoded frame.
    pub fn from_frame(frame: Frame) -> Result<Self, ProtocolError> {
        let HeaderFields {
            code,
            version,
            opaque,
            flag,
            remark,
            ext_fields,
        } = decode_header(frame.header)?;
        Ok(Self {
            code,
            version,
            opaque,
            flag,
            remark,
            ext_fields,
            body: frame.body,
        })
    }

    /// Encodes the command into a complete frame.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        self.to_frame()?.encode(MAX_FRAME_SIZE)
    }

    /// Decodes a command from a buffer holding exactly one complete frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = BytesMut::from(bytes);
        match Frame::decode(&mut buf, MAX_FRAME_SIZE)? {
            Some(frame) => Self::from_frame(frame),
            None => Err(ProtocolError::Truncated {
                section: "frame",
                needed: frame_len_hint(bytes),
                available: bytes.len(),
            }),
        }
    }
}

fn frame_len_hint(bytes: &[u8]) -> usize {
    match bytes.get(0..4) {
        Some(len) => 4 + u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize,
        None => 4,
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Command [code={}, version={}, opaque={}, flag(B)={:b}, remark={}, ext_fields={:?}, type={:?}, body_len={}]",
            self.code,
            self.version,
            self.opaque,
            self.flag,
            self.remark.as_deref().unwrap_or(""),
            self.ext_fields,
            self.command_type(),
            self.body.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custom_header::{put, required};
    use proptest::collection::hash_map;
    use proptest::prelude::*;

    struct TopicHeader {
        topic: String,
    }

    impl CustomHeader for TopicHeader {
        fn to_fields(&self, fields: &mut ExtFields) {
            put(fields, "topic", &self.topic);
        }

        fn from_fields(fields: &ExtFields) -> Result<Self, ProtocolError> {
            Ok(Self {
                topic: required(fields, "topic")?,
            })
        }
    }

    #[test]
    fn test_request_defaults() {
        let cmd = Command::request(10);
        assert_eq!(cmd.code, 10);
        assert_eq!(cmd.version, remoting_version());
        assert_eq!(cmd.command_type(), CommandType::Request);
        assert!(!cmd.is_oneway());
        assert!(cmd.remark.is_none());
        assert!(cmd.body.is_empty());
    }

    #[test]
    fn test_response_flag() {
        let cmd = Command::response(ResponseCode::SystemBusy, "busy");
        assert!(cmd.is_response());
        assert_eq!(cmd.command_type(), CommandType::Response);
        assert_eq!(cmd.response_code(), Some(ResponseCode::SystemBusy));
        assert_eq!(cmd.remark.as_deref(), Some("busy"));
    }

    #[test]
    fn test_oneway_flag_independent_of_response() {
        let mut cmd = Command::request(1);
        cmd.mark_oneway();
        assert!(cmd.is_oneway());
        assert!(!cmd.is_response());
        assert_eq!(cmd.flag, 0b10);
    }

    #[test]
    fn test_empty_remark_is_absent() {
        let cmd = Command::request(1).with_remark("");
        assert!(cmd.remark.is_none());

        let mut cmd = Command::request(1);
        cmd.remark = Some(String::new());
        let decoded = Command::decode(&cmd.encode().unwrap()).unwrap();
        assert!(decoded.remark.is_none());
    }

    #[test]
    fn test_typed_header_through_wire() {
        let cmd = Command::request_with_header(
            10,
            &TopicHeader {
                topic: "orders".to_string(),
            },
        )
        .with_body(&b"payload"[..])
        .with_opaque(99);

        let decoded = Command::decode(&cmd.encode().unwrap()).unwrap();
        assert_eq!(decoded, cmd);
        let header: TopicHeader = decoded.decode_header().unwrap();
        assert_eq!(header.topic, "orders");
    }

    #[test]
    fn test_decode_missing_header_field() {
        let cmd = Command::request(10);
        let result = cmd.decode_header::<TopicHeader>();
        assert!(matches!(result, Err(ProtocolError::MissingField(_))));
    }

    #[test]
    fn test_decode_incomplete_bytes() {
        let encoded = Command::request(1).encode().unwrap();
        let result = Command::decode(&encoded[..encoded.len() - 1]);
        assert!(matches!(
            result,
            Err(ProtocolError::Truncated {
                section: "frame",
                ..
            })
        ));
    }

    #[test]
    fn test_display() {
        let cmd = Command::request(7).with_opaque(3);
        let text = cmd.to_string();
        assert!(text.contains("code=7"));
        assert!(text.contains("opaque=3"));
        assert!(text.contains("Request"));
    }

    fn arb_command() -> impl Strategy<Value = Command> {
        (
            any::<i16>(),
            any::<i16>(),
            any::<i32>(),
            any::<i32>(),
            proptest::option::of("[a-zA-Z0-9 ]{1,40}"),
            hash_map("[a-zA-Z]{1,12}", "[ -~]{0,24}", 0..6),
            proptest::collection::vec(any::<u8>(), 0..256),
        )
            .prop_map(
                |(code, version, opaque, flag, remark, ext_fields, body)| Command {
                    code,
                    version,
                    opaque,
                    flag,
                    remark,
                    ext_fields,
                    body: Bytes::from(body),
                },
            )
    }

    proptest! {
        #[test]
        fn prop_command_roundtrip(cmd in arb_command()) {
            let encoded = cmd.encode().unwrap();
            let decoded = Command::decode(&encoded).unwrap();
            prop_assert_eq!(decoded, cmd);
        }
    }
}
