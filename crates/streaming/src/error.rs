//! Error types for the wire protocol.

use std::io;

use crate::protocol::MessageType;

/// Result type alias for the streaming crate.
pub type Result<T> = std::result::Result<T, StreamingError>;

/// Errors that can occur while encoding, decoding or moving frames.
#[derive(Debug, thiserror::Error)]
pub enum StreamingError {
    /// Underlying transport failure
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Payload exceeds the frame size limit
    #[error("payload too large: {size} bytes exceeds limit of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    /// Channel name does not fit in the 16-bit length prefix
    #[error("channel name too long: {0} bytes")]
    ChannelTooLong(usize),

    /// Frame kind byte is not one we know
    #[error("unknown message kind: {0:#04x}")]
    UnknownKind(u8),

    /// Channel or text payload is not valid UTF-8
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    /// Handshake frame without the expected fields
    #[error("malformed {0} frame")]
    MalformedControl(MessageType),

    /// Stream ended in the middle of a frame
    #[error("unexpected end of stream with {buffered} bytes buffered")]
    UnexpectedEof { buffered: usize },
}

impl StreamingError {
    /// True if the peer sent something this side refuses to parse.
    ///
    /// Protocol violations are never recoverable on the same link.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            StreamingError::PayloadTooLarge { .. }
                | StreamingError::UnknownKind(_)
                | StreamingError::InvalidUtf8(_)
                | StreamingError::MalformedControl(_)
        )
    }
}
