//! Length-prefixed frame format.
//!
//! Frame layout (all integers big-endian):
//!
//! ```text
//! +--------------+-----------------+--------------+-------------+
//! | total_length | header_marker   | header       | body        |
//! |   4 bytes    |    4 bytes      | header_len   | remaining   |
//! +--------------+-----------------+--------------+-------------+
//! ```
//!
//! `total_length` counts everything after itself (`4 + header_len + body_len`).
//! The marker packs the serialization type in its high byte and the header
//! length in its low 24 bits.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the leading length field.
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Size of the header marker.
pub const MARKER_SIZE: usize = 4;

/// Largest header length expressible in the marker.
pub const MAX_HEADER_LENGTH: usize = 0x00FF_FFFF;

/// Header serialization scheme, stored in the high byte of the marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SerializeType {
    Json = 0,
    Hmq = 1,
}

impl SerializeType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SerializeType::Json),
            1 => Some(SerializeType::Hmq),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Packs a serialization type and header length into a marker word.
pub fn mark_header(serialize_type: SerializeType, header_len: usize) -> Result<u32, ProtocolError> {
    if header_len > MAX_HEADER_LENGTH {
        return Err(ProtocolError::HeaderTooLarge(header_len));
    }
    Ok(((serialize_type.as_u8() as u32) << 24) | header_len as u32)
}

/// Splits a marker word into its raw serialization tag and header length.
pub fn unmark_header(marker: u32) -> (u8, usize) {
    ((marker >> 24) as u8, (marker & 0x00FF_FFFF) as usize)
}

/// A raw frame: serialized header bytes plus an opaque body.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub serialize_type: SerializeType,
    pub header: Bytes,
    pub body: Bytes,
}

impl Frame {
    pub fn new(header: Bytes, body: Bytes) -> Self {
        Self {
            serialize_type: SerializeType::Hmq,
            header,
            body,
        }
    }

    /// Size of the encoded frame including the length field.
    pub fn encoded_len(&self) -> usize {
        LENGTH_FIELD_SIZE + MARKER_SIZE + self.header.len() + self.body.len()
    }

    /// Encodes the frame, rejecting frames larger than `max_frame_size`.
    pub fn encode(&self, max_frame_size: u32) -> Result<BytesMut, ProtocolError> {
        let size = self.encoded_len();
        if size as u64 > max_frame_size as u64 {
            return Err(ProtocolError::FrameTooLarge {
                size: size as u64,
                max: max_frame_size,
            });
        }
        let marker = mark_header(self.serialize_type, self.header.len())?;

        let mut buf = BytesMut::with_capacity(size);
        buf.put_u32((size - LENGTH_FIELD_SIZE) as u32);
        buf.put_u32(marker);
        buf.put_slice(&self.header);
        buf.put_slice(&self.body);
        Ok(buf)
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was consumed,
    /// `Ok(None)` if more data is needed, or `Err` on protocol errors.
    pub fn decode(buf: &mut BytesMut, max_frame_size: u32) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < LENGTH_FIELD_SIZE {
            return Ok(None);
        }

        // Peek at the length without consuming
        let total_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if (total_len as usize) < MARKER_SIZE {
            return Err(ProtocolError::InvalidFrameLength(total_len));
        }
        let frame_len = LENGTH_FIELD_SIZE as u64 + total_len as u64;
        if frame_len > max_frame_size as u64 {
            return Err(ProtocolError::FrameTooLarge {
                size: frame_len,
                max: max_frame_size,
            });
        }
        if (buf.len() as u64) < frame_len {
            return Ok(None);
        }

        buf.advance(LENGTH_FIELD_SIZE);
        let mut frame = buf.split_to(total_len as usize);

        let (tag, header_len) = unmark_header(frame.get_u32());
        let serialize_type = match SerializeType::from_u8(tag) {
            Some(SerializeType::Hmq) => SerializeType::Hmq,
            _ => return Err(ProtocolError::UnsupportedSerializeType(tag)),
        };
        if header_len > frame.len() {
            return Err(ProtocolError::Truncated {
                section: "header",
                needed: header_len,
                available: frame.len(),
            });
        }

        let header = frame.split_to(header_len).freeze();
        let body = frame.freeze();

        Ok(Some(Self {
            serialize_type,
            header,
            body,
        }))
    }
}
