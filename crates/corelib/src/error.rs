//! Error types for the core library.
//!
//! Errors are split by the layer that raises them:
//! - [`ConnectionError`]: a link could not be established or was lost
//! - [`WriteError`]: a frame could not be written to an established link
//! - [`Error`]: everything a hub operation can report, including name lookups

use std::{io, time::Duration};

use streaming::StreamingError;

use crate::connection::ConnectionState;

/// Result type alias for the core library.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the core library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Link could not be established or was dropped
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Write attempted on a link that cannot take it
    #[error("write error: {0}")]
    Write(#[from] WriteError),

    /// Payload exceeds the connection's frame size
    #[error("frame too large: {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Another live connection already uses this name
    #[error("a connection named {0:?} is already registered")]
    DuplicateName(String),

    /// No connection is registered under this name
    #[error("no connection named {0:?} is registered")]
    UnknownName(String),

    /// Hub was closed
    #[error("hub is stopped")]
    HubStopped,

    /// Listening socket could not be bound
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
}

/// Errors raised while opening a link or when an open link fails.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// TCP connect failed
    #[error("{peer} is unreachable: {source}")]
    Unreachable {
        peer: String,
        #[source]
        source: io::Error,
    },

    /// `connect` called on an instance that already left `Created`
    #[error("connection {name:?} already has a link (state {state:?})")]
    AlreadyConnected { name: String, state: ConnectionState },

    /// Connect or handshake did not finish in time
    #[error("{peer} did not respond within {elapsed:?}")]
    TimedOut { peer: String, elapsed: Duration },

    /// Peer answered the handshake with something unexpected
    #[error("handshake with {peer} failed: {reason}")]
    Handshake { peer: String, reason: String },

    /// Peer refused the registration
    #[error("{peer} rejected the connection: {reason}")]
    Rejected { peer: String, reason: String },

    /// Peer violated the wire protocol
    #[error("protocol error: {0}")]
    Protocol(#[from] StreamingError),

    /// Established link went away
    #[error("link dropped: {0}")]
    Dropped(String),
}

/// Errors raised by a write on a single connection.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    /// Connection is not opened, or is stopped
    #[error("connection {name:?} is not writable (state {state:?})")]
    NotWritable { name: String, state: ConnectionState },

    /// Frame could not be handed to the transport in time
    #[error("write to {name:?} timed out after {elapsed:?}")]
    TimedOut { name: String, elapsed: Duration },

    /// Transport or encoding failure while writing
    #[error("write to {name:?} failed: {source}")]
    Transport {
        name: String,
        #[source]
        source: StreamingError,
    },

    /// Task performing the write ended before reporting back
    #[error("write to {name:?} was aborted: {reason}")]
    Aborted { name: String, reason: String },
}

impl Error {
    /// True for errors that are specific to one connection and can be
    /// reported alongside the results for other connections.
    pub fn is_per_connection(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Write(_) | Error::FrameTooLarge { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_peer() {
        let err = Error::from(WriteError::NotWritable {
            name: "peerA".to_string(),
            state: ConnectionState::Stopped,
        });
        let text = err.to_string();
        assert!(text.contains("peerA"), "{text}");
        assert!(text.contains("Stopped"), "{text}");

        assert_eq!(
            Error::UnknownName("ghost".into()).to_string(),
            "no connection named \"ghost\" is registered"
        );
    }

    #[test]
    fn lookup_errors_are_not_per_connection() {
        assert!(!Error::DuplicateName("a".into()).is_per_connection());
        assert!(!Error::UnknownName("a".into()).is_per_connection());
        assert!(!Error::HubStopped.is_per_connection());
        assert!(Error::FrameTooLarge { size: 2, max: 1 }.is_per_connection());
    }

    #[test]
    fn protocol_errors_convert_into_connection_errors() {
        let err: ConnectionError = StreamingError::UnknownKind(7).into();
        assert!(matches!(err, ConnectionError::Protocol(StreamingError::UnknownKind(7))));
    }
}
