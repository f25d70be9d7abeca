//! Core library for the socket hub.
//!
//! This crate provides the connection multiplexer:
//! - Hub configuration and per-connection settings
//! - Peer identity and local/remote classification
//! - `Connection`: one managed link with channel-scoped get/write
//! - `Hub`: a named set of connections with aggregate routing

mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod network;
pub mod peer;

pub use config::{ConnectionSettings, HubConfig};
pub use connection::{Connection, ConnectionState};
pub use error::{ConnectionError, Error, Result, WriteError};
pub use hub::{Hub, HubState, PeerMessage, WriteFailure, WriteReport, IMAGE_CHANNEL};
pub use network::{AddressClassifier, Locality, PrivateNetworkClassifier};
pub use peer::{ConnectionId, Direction, PeerAddress};
