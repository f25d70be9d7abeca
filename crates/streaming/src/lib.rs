//! Wire protocol for hub connections.
//!
//! This crate provides the protocol and codecs for:
//! - Channel-tagged data frames between peers
//! - The name handshake performed when a link is opened
//! - Graceful close notification

pub mod codec;
pub mod error;
pub mod protocol;
pub mod receiver;
pub mod sender;

pub use codec::FrameCodec;
pub use error::StreamingError;
pub use protocol::{Message, MessageType};
pub use receiver::StreamReceiver;
pub use sender::StreamSender;
