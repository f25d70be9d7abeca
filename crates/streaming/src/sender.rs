//! Write half of a framed link.

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::codec::FrameCodec;
use crate::error::Result;
use crate::protocol::Message;

/// Encodes messages and writes them as whole frames.
///
/// A frame is written with a single `write_all` followed by a flush, so two
/// sends never interleave as long as the caller serializes access.
#[derive(Debug)]
pub struct StreamSender<W> {
    writer: W,
    codec: FrameCodec,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> StreamSender<W> {
    pub fn new(writer: W, codec: FrameCodec) -> Self {
        Self {
            writer,
            codec,
            buf: BytesMut::new(),
        }
    }

    /// Encode and send one message.
    pub async fn send(&mut self, message: &Message) -> Result<()> {
        self.buf.clear();
        self.codec.encode(message, &mut self.buf)?;
        self.writer.write_all(&self.buf).await?;
        self.writer.flush().await?;
        trace!(kind = %message.kind(), channel = message.channel(), bytes = self.buf.len(), "frame sent");
        Ok(())
    }

    /// Flush and close the underlying writer.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
