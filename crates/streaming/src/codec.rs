//! Length-prefixed frame codec.
//!
//! Layout on the wire (Big Endian):
//!
//! ```text
//! ┌──────┬─────────────┬─────────────┬─────────┬─────────┐
//! │ kind │ channel_len │ payload_len │ channel │ payload │
//! │  u8  │     u16     │     u32     │  bytes  │  bytes  │
//! └──────┴─────────────┴─────────────┴─────────┴─────────┘
//! ```
//!
//! Lengths are validated before any payload is buffered, so a hostile
//! length prefix cannot make the receiver allocate more than the limit.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, StreamingError};
use crate::protocol::{Message, MessageType, MAX_CONTROL_PAYLOAD};

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 1 + 2 + 4;

/// Encoder/decoder for [`Message`] frames with a bounded data payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    /// Create a codec that accepts data payloads of at most `max_payload`
    /// bytes (inclusive).
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    fn limit_for(&self, kind: MessageType) -> usize {
        if kind.is_control() {
            MAX_CONTROL_PAYLOAD
        } else {
            self.max_payload
        }
    }

    /// Check a payload length against the limit for `kind`.
    pub fn check_payload(&self, kind: MessageType, size: usize) -> Result<()> {
        let max = self.limit_for(kind);
        if size > max {
            return Err(StreamingError::PayloadTooLarge { size, max });
        }
        Ok(())
    }

    /// Append one encoded frame to `dst`.
    ///
    /// Nothing is written when validation fails.
    pub fn encode(&self, message: &Message, dst: &mut BytesMut) -> Result<()> {
        let channel = message.channel().as_bytes();
        let payload = message.payload();

        if channel.len() > u16::MAX as usize {
            return Err(StreamingError::ChannelTooLong(channel.len()));
        }
        self.check_payload(message.kind(), payload.len())?;

        dst.reserve(HEADER_LEN + channel.len() + payload.len());
        dst.put_u8(message.kind() as u8);
        dst.put_u16(channel.len() as u16);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(channel);
        dst.put_slice(payload);
        Ok(())
    }

    /// Decode one frame from the front of `src`.
    ///
    /// Returns `Ok(None)` if `src` does not yet hold a complete frame; in
    /// that case `src` is left untouched.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let kind = MessageType::try_from(src[0])?;
        let channel_len = u16::from_be_bytes([src[1], src[2]]) as usize;
        let payload_len = u32::from_be_bytes([src[3], src[4], src[5], src[6]]) as usize;
        self.check_payload(kind, payload_len)?;

        let total = HEADER_LEN + channel_len + payload_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let channel = src.split_to(channel_len);
        let payload = src.split_to(payload_len).freeze();
        let channel = String::from_utf8(channel.to_vec())
            .map_err(|_| StreamingError::InvalidUtf8("channel"))?;

        Ok(Some(Message::new(kind, channel, payload)))
    }
}
