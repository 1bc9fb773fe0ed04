//! Typed headers of the send-message exchange.

use hmq_protocol::custom_header::{optional, put, put_optional, required};
use hmq_protocol::{CustomHeader, ExtFields, ProtocolError};

/// Header of a `SEND_MESSAGE` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMessageRequestHeader {
    pub topic: String,
    /// Encoded message properties.
    pub properties: Option<String>,
    /// Producer-side creation time, milliseconds since the epoch.
    pub born_timestamp: i64,
}

impl CustomHeader for SendMessageRequestHeader {
    fn to_fields(&self, fields: &mut ExtFields) {
        put(fields, "topic", &self.topic);
        put_optional(fields, "properties", &self.properties);
        put(fields, "bornTimestamp", &self.born_timestamp);
    }

    fn from_fields(fields: &ExtFields) -> Result<Self, ProtocolError> {
        Ok(Self {
            topic: required(fields, "topic")?,
            properties: optional(fields, "properties")?,
            born_timestamp: required(fields, "bornTimestamp")?,
        })
    }
}

/// Header of a successful `SEND_MESSAGE` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMessageResponseHeader {
    pub msg_id: String,
    pub queue_offset: Option<i64>,
}

impl CustomHeader for SendMessageResponseHeader {
    fn to_fields(&self, fields: &mut ExtFields) {
        put(fields, "msgId", &self.msg_id);
        put_optional(fields, "queueOffset", &self.queue_offset);
    }

    fn from_fields(fields: &ExtFields) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_id: required(fields, "msgId")?,
            queue_offset: optional(fields, "queueOffset")?,
        })
    }
}
