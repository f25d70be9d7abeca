//! Peer identity.
//!
//! A connection is known by three things: the name it is registered under,
//! a process-unique [`ConnectionId`], and the [`PeerAddress`] it talks to.
//! Names can be reused once a connection is gone; ids never are.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Compact identifier for a connection instance.
///
/// Eviction is keyed by id rather than name so a late eviction cannot remove
/// a newer connection that reused the same name.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which side opened the link.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Direction {
    /// We connected out to the peer.
    Outbound,
    /// The peer connected to our listener.
    Inbound,
}

/// Where a peer lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerAddress {
    /// Host as declared by the caller (or the textual IP for inbound links).
    pub host: String,
    /// Port as declared by the caller (or the peer's source port).
    pub port: u16,
    /// Socket address the link actually reached.
    pub resolved: SocketAddr,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16, resolved: SocketAddr) -> Self {
        Self {
            host: host.into(),
            port,
            resolved,
        }
    }

    /// Address of an accepted link, where nothing was declared.
    pub fn from_socket(resolved: SocketAddr) -> Self {
        Self::new(resolved.ip().to_string(), resolved.port(), resolved)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host == self.resolved.ip().to_string() && self.port == self.resolved.port() {
            write!(f, "{}", self.resolved)
        } else {
            write!(f, "{}:{} ({})", self.host, self.port, self.resolved)
        }
    }
}
