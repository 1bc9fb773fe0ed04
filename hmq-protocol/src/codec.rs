//! Stream encoder and decoder for commands.

use crate::command::Command;
use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::MAX_FRAME_SIZE;
use bytes::BytesMut;

/// Encodes commands into frames.
#[derive(Debug, Clone, Copy)]
pub struct Encoder {
    max_frame_size: u32,
}

impl Encoder {
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self { max_frame_size }
    }

    /// Encodes a command into a frame.
    pub fn encode(&self, command: &Command) -> Result<BytesMut, ProtocolError> {
        command.to_frame()?.encode(self.max_frame_size)
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Reassembles frames from a byte stream and decodes them into commands.
pub struct Decoder {
    buffer: BytesMut,
    max_frame_size: u32,
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            max_frame_size,
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Gives direct access to the buffer for socket reads.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer, self.max_frame_size)
    }

    /// Attempts to decode the next command from the buffer.
    pub fn decode_command(&mut self) -> Result<Option<Command>, ProtocolError> {
        match self.decode_frame()? {
            Some(frame) => Command::from_frame(frame).map(Some),
            None => Ok(None),
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
