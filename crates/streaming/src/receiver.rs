//! Read half of a framed link.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use crate::codec::FrameCodec;
use crate::error::{Result, StreamingError};
use crate::protocol::Message;

const READ_CHUNK: usize = 4 * 1024;

/// Reads bytes from a stream until whole frames can be decoded.
#[derive(Debug)]
pub struct StreamReceiver<R> {
    reader: R,
    codec: FrameCodec,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> StreamReceiver<R> {
    pub fn new(reader: R, codec: FrameCodec) -> Self {
        Self {
            reader,
            codec,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Receive the next message.
    ///
    /// Returns `Ok(None)` when the peer closed the stream cleanly between
    /// frames, and [`StreamingError::UnexpectedEof`] when it closed
    /// mid-frame.
    ///
    /// Cancel safe: a partially read frame stays buffered and the next call
    /// resumes from it.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        loop {
            if let Some(message) = self.codec.decode(&mut self.buf)? {
                trace!(kind = %message.kind(), channel = message.channel(), "frame received");
                return Ok(Some(message));
            }

            self.buf.reserve(READ_CHUNK);
            if self.reader.read_buf(&mut self.buf).await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(StreamingError::UnexpectedEof {
                    buffered: self.buf.len(),
                });
            }
        }
    }
}
