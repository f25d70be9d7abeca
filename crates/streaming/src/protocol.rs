//! Protocol messages exchanged over a hub link.
//!
//! Every frame carries a kind, a channel name and a payload. Only `Data`
//! frames use the channel; the control kinds drive the link lifecycle:
//!
//! ```text
//! initiator                         acceptor
//!     │ ── Hello(limit, name) ───────▶ │  register under `name`
//!     │ ◀────────────── Welcome(limit) │
//!     │ ══ Data(channel, payload) ════ │
//!     │ ── Closing(reason) ──────────▶ │  cascade to stopped
//! ```
//!
//! `limit` is the largest data payload the announcing side accepts, as a
//! big-endian `u32` at the start of the payload. Each side writes at most
//! the smaller of its own limit and the peer's.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, StreamingError};

/// Upper bound for the payload of control frames (`Hello`, `Welcome`,
/// `Closing`). Data frames use the codec's configured limit instead.
pub const MAX_CONTROL_PAYLOAD: usize = 1024;

/// Length of the limit prefix in `Hello` and `Welcome` payloads.
const LIMIT_LEN: usize = 4;

/// Kind byte at the start of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Application message on a channel
    Data = 0,
    /// Initiator announces the name it registered the link under
    Hello = 1,
    /// Acceptor confirms registration
    Welcome = 2,
    /// Sender is shutting the link down
    Closing = 3,
}

impl MessageType {
    /// True for the lifecycle kinds that never reach channel buffers.
    pub fn is_control(self) -> bool {
        !matches!(self, MessageType::Data)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = StreamingError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageType::Data),
            1 => Ok(MessageType::Hello),
            2 => Ok(MessageType::Welcome),
            3 => Ok(MessageType::Closing),
            other => Err(StreamingError::UnknownKind(other)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Data => "data",
            MessageType::Hello => "hello",
            MessageType::Welcome => "welcome",
            MessageType::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageType,
    channel: String,
    payload: Bytes,
}

impl Message {
    /// Build a message of any kind. Prefer the typed constructors below.
    pub fn new(kind: MessageType, channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            channel: channel.into(),
            payload: payload.into(),
        }
    }

    /// Application data on `channel`.
    pub fn data(channel: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::new(MessageType::Data, channel, data)
    }

    /// Handshake opener carrying the initiator's data limit and the
    /// registration name.
    pub fn hello(name: &str, max_payload: usize) -> Self {
        let mut payload = BytesMut::with_capacity(LIMIT_LEN + name.len());
        payload.put_u32(wire_limit(max_payload));
        payload.put_slice(name.as_bytes());
        Self::new(MessageType::Hello, String::new(), payload.freeze())
    }

    /// Registration confirmed; carries the acceptor's data limit.
    pub fn welcome(max_payload: usize) -> Self {
        let limit = wire_limit(max_payload).to_be_bytes();
        Self::new(MessageType::Welcome, String::new(), Bytes::copy_from_slice(&limit))
    }

    /// Close notification; `reason` may be empty.
    pub fn closing(reason: &str) -> Self {
        Self::new(MessageType::Closing, String::new(), Bytes::copy_from_slice(reason.as_bytes()))
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Data limit announced by a `Hello` or `Welcome`.
    pub fn peer_limit(&self) -> Result<usize> {
        if !matches!(self.kind, MessageType::Hello | MessageType::Welcome) {
            return Err(StreamingError::MalformedControl(self.kind));
        }
        let prefix: [u8; LIMIT_LEN] = self
            .payload
            .get(..LIMIT_LEN)
            .and_then(|prefix| prefix.try_into().ok())
            .ok_or(StreamingError::MalformedControl(self.kind))?;
        Ok(usize::try_from(u32::from_be_bytes(prefix)).unwrap_or(usize::MAX))
    }

    /// Split a `Hello` into the announced limit and the registration name.
    pub fn hello_parts(&self) -> Result<(usize, &str)> {
        if self.kind != MessageType::Hello {
            return Err(StreamingError::MalformedControl(self.kind));
        }
        let limit = self.peer_limit()?;
        let name = std::str::from_utf8(&self.payload[LIMIT_LEN..])
            .map_err(|_| StreamingError::InvalidUtf8("name"))?;
        Ok((limit, name))
    }

    /// Interpret the payload as UTF-8 text.
    pub fn text(&self) -> Result<&str> {
        std::str::from_utf8(&self.payload).map_err(|_| StreamingError::InvalidUtf8("payload"))
    }

    /// Consume the message and return its payload as an owned string.
    pub fn into_text(self) -> Result<String> {
        String::from_utf8(self.payload.to_vec()).map_err(|_| StreamingError::InvalidUtf8("payload"))
    }
}

/// Limits above `u32::MAX` are announced as `u32::MAX`.
fn wire_limit(max_payload: usize) -> u32 {
    u32::try_from(max_payload).unwrap_or(u32::MAX)
}
