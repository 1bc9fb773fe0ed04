//! Stored messages and their on-disk record format.
//!
//! Each record has the following layout (all integers big-endian):
//!
//! ```text
//! +----------+-------------+----------+
//! | magic    | payload_len | crc32c   |
//! | 4 bytes  | 4 bytes     | 4 bytes  |
//! +----------+-------------+----------+
//! | queue_offset | born_ts | store_ts |
//! | 8 bytes      | 8 bytes | 8 bytes  |
//! +--------------+---------+----------+
//! | topic_len u8 + topic | host_len u8 + born_host |
//! | props_len u16 + properties | body_len u32 + body |
//! +---------------------------------------------------+
//! ```
//!
//! The checksum covers the payload, i.e. everything after the 12-byte header.

use crate::error::StoreError;
use crate::RECORD_HEADER_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes for message records: "HMQM"
pub const RECORD_MAGIC: [u8; 4] = *b"HMQM";

/// Longest topic name accepted.
pub const MAX_TOPIC_LENGTH: usize = 127;

/// Longest encoded properties string accepted.
pub const MAX_PROPERTIES_LENGTH: usize = i16::MAX as usize;

/// Largest record payload the decoder accepts (16 MiB).
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// Fixed part of the payload: offsets, timestamps and length prefixes.
const PAYLOAD_FIXED_SIZE: usize = 8 + 8 + 8 + 1 + 1 + 2 + 4;

/// A message as handed to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub topic: String,
    /// Encoded user and system properties.
    pub properties: String,
    pub body: Bytes,
    /// Producer-side creation time, milliseconds since the epoch.
    pub born_timestamp: i64,
    /// Producer address as seen by the broker.
    pub born_host: String,
}

impl StoredMessage {
    pub fn new(topic: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            properties: String::new(),
            body: body.into(),
            born_timestamp: 0,
            born_host: String::new(),
        }
    }

    pub fn with_properties(mut self, properties: impl Into<String>) -> Self {
        self.properties = properties.into();
        self
    }

    pub fn with_born_timestamp(mut self, timestamp: i64) -> Self {
        self.born_timestamp = timestamp;
        self
    }

    pub fn with_born_host(mut self, host: impl Into<String>) -> Self {
        self.born_host = host.into();
        self
    }

    /// Size of the record this message encodes to.
    pub fn encoded_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload_len()
    }

    fn payload_len(&self) -> usize {
        PAYLOAD_FIXED_SIZE
            + self.topic.len()
            + self.born_host.len().min(u8::MAX as usize)
            + self.properties.len()
            + self.body.len()
    }
}

/// A message read back from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    /// Position of the record in the commit log.
    pub physical_offset: u64,
    /// Position of the message within its topic.
    pub queue_offset: u64,
    /// Broker-side append time, milliseconds since the epoch.
    pub store_timestamp: i64,
    pub message: StoredMessage,
    disk_size: usize,
}

impl MessageRecord {
    pub fn msg_id(&self) -> String {
        msg_id(self.physical_offset)
    }

    /// Bytes the record occupies on disk.
    pub fn disk_size(&self) -> usize {
        self.disk_size
    }

    /// Decodes one record from the front of `buf`.
    ///
    /// Returns `Ok(None)` if `buf` holds less than a full record.
    pub fn decode(buf: &mut BytesMut, physical_offset: u64) -> Result<Option<Self>, StoreError> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &buf[..RECORD_HEADER_SIZE];
        let mut magic = [0u8; 4];
        header.copy_to_slice(&mut magic);
        if magic != RECORD_MAGIC {
            // Zeroed tail from a preallocated or torn write
            if magic == [0, 0, 0, 0] {
                return Ok(None);
            }
            return Err(StoreError::InvalidHeader {
                offset: physical_offset,
                reason: format!("invalid magic: {:?}", magic),
            });
        }
        let payload_len = header.get_u32() as usize;
        let crc_expected = header.get_u32();

        if payload_len > MAX_RECORD_SIZE {
            return Err(StoreError::RecordTooLarge {
                size: payload_len,
                max: MAX_RECORD_SIZE,
            });
        }
        if payload_len < PAYLOAD_FIXED_SIZE {
            return Err(StoreError::InvalidHeader {
                offset: physical_offset,
                reason: format!("payload length {} below minimum", payload_len),
            });
        }

        let total_len = RECORD_HEADER_SIZE + payload_len;
        if buf.len() < total_len {
            return Ok(None);
        }

        buf.advance(RECORD_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        let crc_actual = crc32c::crc32c(&payload);
        if crc_actual != crc_expected {
            return Err(StoreError::CorruptedRecord {
                offset: physical_offset,
                expected: crc_expected,
                actual: crc_actual,
            });
        }

        let (queue_offset, store_timestamp, message) =
            decode_payload(payload).ok_or_else(|| StoreError::InvalidHeader {
                offset: physical_offset,
                reason: "payload fields exceed payload length".to_string(),
            })?;

        Ok(Some(Self {
            physical_offset,
            queue_offset,
            store_timestamp,
            message,
            disk_size: total_len,
        }))
    }
}

/// Encodes a validated message into a record.
pub(crate) fn encode(message: &StoredMessage, queue_offset: u64, store_timestamp: i64) -> BytesMut {
    let host = truncate_utf8(&message.born_host, u8::MAX as usize);

    let mut payload = BytesMut::with_capacity(message.payload_len());
    payload.put_u64(queue_offset);
    payload.put_i64(message.born_timestamp);
    payload.put_i64(store_timestamp);
    payload.put_u8(message.topic.len() as u8);
    payload.put_slice(message.topic.as_bytes());
    payload.put_u8(host.len() as u8);
    payload.put_slice(host.as_bytes());
    payload.put_u16(message.properties.len() as u16);
    payload.put_slice(message.properties.as_bytes());
    payload.put_u32(message.body.len() as u32);
    payload.put_slice(&message.body);

    let mut buf = BytesMut::with_capacity(RECORD_HEADER_SIZE + payload.len());
    buf.put_slice(&RECORD_MAGIC);
    buf.put_u32(payload.len() as u32);
    buf.put_u32(crc32c::crc32c(&payload));
    buf.put_slice(&payload);
    buf
}

fn decode_payload(mut payload: Bytes) -> Option<(u64, i64, StoredMessage)> {
    let queue_offset = payload.get_u64();
    let born_timestamp = payload.get_i64();
    let store_timestamp = payload.get_i64();

    let topic_len = payload.get_u8() as usize;
    let topic = take_string(&mut payload, topic_len)?;
    if payload.remaining() < 1 {
        return None;
    }
    let host_len = payload.get_u8() as usize;
    let born_host = take_string(&mut payload, host_len)?;
    if payload.remaining() < 2 {
        return None;
    }
    let props_len = payload.get_u16() as usize;
    let properties = take_string(&mut payload, props_len)?;
    if payload.remaining() < 4 {
        return None;
    }
    let body_len = payload.get_u32() as usize;
    if payload.remaining() != body_len {
        return None;
    }

    Some((
        queue_offset,
        store_timestamp,
        StoredMessage {
            topic,
            properties,
            body: payload,
            born_timestamp,
            born_host,
        },
    ))
}

fn take_string(buf: &mut Bytes, len: usize) -> Option<String> {
    if buf.remaining() < len {
        return None;
    }
    let bytes = buf.split_to(len);
    String::from_utf8(bytes.to_vec()).ok()
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Message id for a physical offset: the offset as 16 uppercase hex digits.
pub fn msg_id(physical_offset: u64) -> String {
    hex::encode_upper(physical_offset.to_be_bytes())
}

/// Recovers the physical offset from a message id.
pub fn parse_msg_id(id: &str) -> Option<u64> {
    let bytes = hex::decode(id).ok()?;
    let bytes: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> StoredMessage {
        StoredMessage::new("orders", "hello")
            .with_properties("KEYS\u{1}k1\u{2}")
            .with_born_timestamp(1_700_000_000_000)
            .with_born_host("10.0.0.1:50000")
    }

    #[test]
    fn test_record_decode() {
        let message = sample();
        let encoded = encode(&message, 7, 1_700_000_000_123);
        assert_eq!(encoded.len(), message.encoded_len());

        let mut buf = encoded.clone();
        let record = MessageRecord::decode(&mut buf, 4096).unwrap().unwrap();
        assert!(buf.is_empty());
        assert_eq!(record.message, message);
        assert_eq!(record.queue_offset, 7);
        assert_eq!(record.store_timestamp, 1_700_000_000_123);
        assert_eq!(record.physical_offset, 4096);
        assert_eq!(record.disk_size(), encoded.len());
    }

    #[test]
    fn test_partial_record() {
        let encoded = encode(&sample(), 0, 0);
        for cut in [0, 5, RECORD_HEADER_SIZE, encoded.len() - 1] {
            let mut buf = BytesMut::from(&encoded[..cut]);
            assert!(MessageRecord::decode(&mut buf, 0).unwrap().is_none());
            assert_eq!(buf.len(), cut);
        }
    }

    #[test]
    fn test_zero_tail_is_not_a_record() {
        let mut buf = BytesMut::from(&[0u8; 64][..]);
        assert!(MessageRecord::decode(&mut buf, 0).unwrap().is_none());
    }

    #[test]
    fn test_bad_magic() {
        let mut encoded = encode(&sample(), 0, 0);
        encoded[0] = b'X';
        let err = MessageRecord::decode(&mut encoded, 12).unwrap_err();
        assert!(matches!(err, StoreError::InvalidHeader { offset: 12, .. }));
    }

    #[test]
    fn test_msg_id() {
        assert_eq!(msg_id(0), "0000000000000000");
        assert_eq!(msg_id(0xDEAD_BEEF), "00000000DEADBEEF");
        assert_eq!(parse_msg_id("00000000DEADBEEF"), Some(0xDEAD_BEEF));
        assert_eq!(parse_msg_id("DEADBEEF"), None);
        assert_eq!(parse_msg_id("zz"), None);
    }

    #[test]
    fn test_long_host_truncated() {
        let message = sample().with_born_host("h".repeat(300));
        let mut buf = encode(&message, 0, 0);
        assert_eq!(buf.len(), message.encoded_len());
        let record = MessageRecord::decode(&mut buf, 0).unwrap().unwrap();
        assert_eq!(record.message.born_host.len(), 255);
    }

    proptest! {
        #[test]
        fn prop_any_payload_flip_is_detected(index in 0usize..64, bit in 0u8..8) {
            let mut encoded = encode(&sample(), 3, 9);
            let payload_len = encoded.len() - RECORD_HEADER_SIZE;
            let position = RECORD_HEADER_SIZE + index % payload_len;
            encoded[position] ^= 1 << bit;
            let result = MessageRecord::decode(&mut encoded, 0);
            let is_corrupted = matches!(result, Err(StoreError::CorruptedRecord { .. }));
            prop_assert!(is_corrupted);
        }
    }
}
