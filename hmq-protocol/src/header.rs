//! Compact binary (HMQ) header codec.
//!
//! ```text
//! code(2) version(2) opaque(4) flag(4) remark_len(4) remark ext_len(4) ext
//! ext entry: key_len(2) key value_len(4) value
//! ```
//!
//! An absent remark or extension map is written as a zero-length section.

use crate::custom_header::ExtFields;
use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the fixed part of the header (code, version, opaque, flag).
pub const FIXED_HEADER_SIZE: usize = 2 + 2 + 4 + 4;

/// Decoded header fields of a command.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HeaderFields {
    pub code: i16,
    pub version: i16,
    pub opaque: i32,
    pub flag: i32,
    pub remark: Option<String>,
    pub ext_fields: ExtFields,
}

/// Encodes header fields into `buf`.
pub fn encode_header(
    code: i16,
    version: i16,
    opaque: i32,
    flag: i32,
    remark: Option<&str>,
    ext_fields: &ExtFields,
    buf: &mut BytesMut,
) -> Result<(), ProtocolError> {
    let ext = encode_ext_fields(ext_fields)?;
    let remark = remark.unwrap_or("").as_bytes();

    buf.reserve(FIXED_HEADER_SIZE + 4 + remark.len() + 4 + ext.len());
    buf.put_i16(code);
    buf.put_i16(version);
    buf.put_i32(opaque);
    buf.put_i32(flag);

    buf.put_u32(remark.len() as u32);
    buf.put_slice(remark);

    buf.put_u32(ext.len() as u32);
    buf.put_slice(&ext);
    Ok(())
}

/// Decodes header fields from a complete header section.
pub fn decode_header(mut buf: Bytes) -> Result<HeaderFields, ProtocolError> {
    ensure(&buf, FIXED_HEADER_SIZE, "fixed header")?;
    let code = buf.get_i16();
    let version = buf.get_i16();
    let opaque = buf.get_i32();
    let flag = buf.get_i32();

    let remark = read_sized(&mut buf, "remark")?;
    let remark = if remark.is_empty() {
        None
    } else {
        Some(into_string(remark, "remark")?)
    };

    let ext = read_sized(&mut buf, "ext fields")?;
    let ext_fields = decode_ext_fields(ext)?;

    Ok(HeaderFields {
        code,
        version,
        opaque,
        flag,
        remark,
        ext_fields,
    })
}

/// Serializes the extension map. Entry order is unspecified.
pub fn encode_ext_fields(fields: &ExtFields) -> Result<BytesMut, ProtocolError> {
    let size: usize = fields.iter().map(|(k, v)| 2 + k.len() + 4 + v.len()).sum();
    let mut buf = BytesMut::with_capacity(size);
    for (key, value) in fields {
        if key.len() > u16::MAX as usize {
            return Err(ProtocolError::KeyTooLong(key.len()));
        }
        buf.put_u16(key.len() as u16);
        buf.put_slice(key.as_bytes());
        buf.put_u32(value.len() as u32);
        buf.put_slice(value.as_bytes());
    }
    Ok(buf)
}

/// Parses an extension map section.
pub fn decode_ext_fields(mut buf: Bytes) -> Result<ExtFields, ProtocolError> {
    let mut fields = ExtFields::new();
    while buf.has_remaining() {
        ensure(&buf, 2, "ext key length")?;
        let key_len = buf.get_u16() as usize;
        ensure(&buf, key_len, "ext key")?;
        let key = into_string(buf.split_to(key_len), "ext key")?;

        ensure(&buf, 4, "ext value length")?;
        let value_len = buf.get_u32() as usize;
        ensure(&buf, value_len, "ext value")?;
        let value = into_string(buf.split_to(value_len), "ext value")?;

        fields.insert(key, value);
    }
    Ok(fields)
}

fn ensure(buf: &Bytes, needed: usize, section: &'static str) -> Result<(), ProtocolError> {
    if buf.remaining() < needed {
        return Err(ProtocolError::Truncated {
            section,
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

fn read_sized(buf: &mut Bytes, section: &'static str) -> Result<Bytes, ProtocolError> {
    ensure(buf, 4, section)?;
    let len = buf.get_u32() as usize;
    ensure(buf, len, section)?;
    Ok(buf.split_to(len))
}

fn into_string(bytes: Bytes, section: &'static str) -> Result<String, ProtocolError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(section))
}
