//! A managed link to one named peer.
//!
//! # State Machine
//!
//! ```text
//! ┌─────────┐ connect ┌────────────┐ handshake ┌────────┐
//! │ Created │────────>│ Connecting │──────────>│ Opened │
//! └─────────┘         └────────────┘           └────────┘
//!                           │                       │
//!                           │ failure               │ close / cascade
//!                           ↓                       ↓
//!                      ┌─────────┐             ┌─────────┐
//!                      │ Stopped │             │ Stopped │
//!                      └─────────┘             └─────────┘
//! ```
//!
//! No transition leaves `Stopped`.
//!
//! # Tasks
//!
//! Once opened, a connection owns one spawned receive task that drains
//! frames off the read half into per-channel buffers. Writers share the
//! write half behind an async mutex, so frames never interleave while reads
//! carry on independently.
//!
//! # Frame Limits
//!
//! Both sides announce their data limit during the handshake. A write is
//! bounded by the smaller of the two, so a frame the peer would refuse is
//! rejected locally with [`Error::FrameTooLarge`] and never reaches the
//! wire.
//!
//! A failure seen by the receive task (reset, EOF, protocol violation, or a
//! `Closing` frame from the peer) cascades: the connection stops, wakes any
//! pending `get`, releases the link and reports its id to the owning hub for
//! eviction.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use streaming::{FrameCodec, Message, MessageType, StreamReceiver, StreamSender, StreamingError};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{ChannelBuffers, Pushed};
use crate::config::ConnectionSettings;
use crate::error::{ConnectionError, Error, Result, WriteError};
use crate::peer::{ConnectionId, Direction, PeerAddress};

type Sender = StreamSender<OwnedWriteHalf>;
type Receiver = StreamReceiver<OwnedReadHalf>;

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed, no link yet
    Created,
    /// TCP connect or handshake in progress
    Connecting,
    /// Handshake done, receive task running
    Opened,
    /// Closed locally or cascaded; terminal
    Stopped,
}

/// One bidirectional, channel-multiplexed link to a named peer.
pub struct Connection {
    id: ConnectionId,
    name: String,
    settings: ConnectionSettings,
    codec: FrameCodec,
    state: Mutex<ConnectionState>,
    can_write: AtomicBool,
    direction: OnceLock<Direction>,
    peer: OnceLock<PeerAddress>,
    peer_size: OnceLock<usize>,
    sender: tokio::sync::Mutex<Option<Sender>>,
    channels: ChannelBuffers,
    shutdown: watch::Sender<bool>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    evictions: Option<mpsc::UnboundedSender<ConnectionId>>,
}

impl Connection {
    /// Create a connection in [`ConnectionState::Created`].
    pub fn new(name: impl Into<String>, settings: ConnectionSettings) -> Arc<Self> {
        Self::build(name.into(), settings, None)
    }

    /// Create a connection that reports cascades to a hub.
    pub(crate) fn with_evictions(
        name: impl Into<String>,
        settings: ConnectionSettings,
        evictions: mpsc::UnboundedSender<ConnectionId>,
    ) -> Arc<Self> {
        Self::build(name.into(), settings, Some(evictions))
    }

    fn build(
        name: String,
        settings: ConnectionSettings,
        evictions: Option<mpsc::UnboundedSender<ConnectionId>>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            id: ConnectionId::next(),
            name,
            settings,
            codec: FrameCodec::new(settings.size),
            state: Mutex::new(ConnectionState::Created),
            can_write: AtomicBool::new(false),
            direction: OnceLock::new(),
            peer: OnceLock::new(),
            peer_size: OnceLock::new(),
            sender: tokio::sync::Mutex::new(None),
            channels: ChannelBuffers::new(settings.queue_capacity, settings.max_channels),
            shutdown,
            receive_task: Mutex::new(None),
            evictions,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Address of the peer, once a link exists.
    pub fn peer(&self) -> Option<&PeerAddress> {
        self.peer.get()
    }

    pub fn direction(&self) -> Option<Direction> {
        self.direction.get().copied()
    }

    pub fn timeout(&self) -> Duration {
        self.settings.timeout
    }

    /// Maximum data payload in bytes this side accepts.
    pub fn size(&self) -> usize {
        self.codec.max_payload()
    }

    /// Maximum data payload the peer announced, once a link exists.
    pub fn peer_size(&self) -> Option<usize> {
        self.peer_size.get().copied()
    }

    /// Largest payload a write may carry: the smaller of both limits.
    pub fn write_limit(&self) -> usize {
        let local = self.size();
        self.peer_size().map_or(local, |peer| peer.min(local))
    }

    /// True while opened and not stopped.
    pub fn can_write(&self) -> bool {
        self.can_write.load(Ordering::Acquire) && self.state() == ConnectionState::Opened
    }

    /// Messages currently buffered on `channel`.
    pub fn pending(&self, channel: &str) -> usize {
        self.channels.pending(channel)
    }

    // ------------------------------------------------------------------
    // Public contract
    // ------------------------------------------------------------------

    /// Open an outbound link to `address:port` and perform the handshake.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::AlreadyConnected`] if this instance is not in
    ///   `Created`
    /// - [`ConnectionError::Unreachable`] / [`ConnectionError::TimedOut`] if
    ///   the TCP connect fails
    /// - [`ConnectionError::Rejected`] / [`ConnectionError::Handshake`] if
    ///   the peer does not welcome us
    ///
    /// Any failure leaves the connection `Stopped`.
    pub async fn connect(self: &Arc<Self>, address: &str, port: u16) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Created {
                return Err(ConnectionError::AlreadyConnected {
                    name: self.name.clone(),
                    state: *state,
                }
                .into());
            }
            *state = ConnectionState::Connecting;
        }
        debug!(peer = %self.name, address, port, "connecting");

        let established = match self.establish(address, port).await {
            Ok(established) => established,
            Err(err) => {
                self.stop();
                warn!(peer = %self.name, address, port, error = %err, "connect failed");
                return Err(err.into());
            }
        };

        let (receiver, sender, peer, peer_size) = established;
        if let Err(err) = self
            .start(receiver, sender, peer, peer_size, Direction::Outbound)
            .await
        {
            self.stop();
            return Err(err.into());
        }
        Ok(())
    }

    /// Next buffered message on `channel`, waiting at most [`Self::timeout`].
    ///
    /// Returns `None` if nothing arrived in time. A stopped connection still
    /// hands out what it had buffered, but never waits. Payloads that are
    /// not UTF-8 are decoded lossily; use [`Self::get_bytes`] for binary
    /// channels.
    pub async fn get(&self, channel: &str) -> Option<String> {
        self.get_bytes(channel).await.map(into_text)
    }

    /// Next buffered message on `channel`, without waiting.
    pub fn try_get(&self, channel: &str) -> Option<String> {
        self.try_get_bytes(channel).map(into_text)
    }

    /// Like [`Self::get`], returning the raw payload.
    pub async fn get_bytes(&self, channel: &str) -> Option<Bytes> {
        self.channels
            .pop_within(channel, self.settings.timeout, self.shutdown.subscribe())
            .await
    }

    /// Like [`Self::try_get`], returning the raw payload.
    pub fn try_get_bytes(&self, channel: &str) -> Option<Bytes> {
        self.channels.try_pop(channel)
    }

    /// Number of channels currently holding buffered messages.
    pub fn channel_count(&self) -> usize {
        self.channels.channel_count()
    }

    /// Send `data` on `channel`.
    ///
    /// # Errors
    ///
    /// - [`WriteError::NotWritable`] unless the connection is opened
    /// - [`Error::FrameTooLarge`] if `data` exceeds [`Self::write_limit`]
    /// - [`WriteError::TimedOut`] / [`WriteError::Transport`] if the link
    ///   fails mid-write; the connection cascades in that case
    pub async fn write(&self, channel: &str, data: &str) -> Result<()> {
        self.write_bytes(channel, Bytes::copy_from_slice(data.as_bytes()))
            .await
    }

    /// Send a binary payload on `channel`. Same contract as [`Self::write`].
    pub async fn write_bytes(&self, channel: &str, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        if !self.can_write() {
            return Err(self.not_writable());
        }
        let limit = self.write_limit();
        if data.len() > limit {
            return Err(Error::FrameTooLarge {
                size: data.len(),
                max: limit,
            });
        }

        let message = Message::data(channel, data);
        let mut slot = self.sender.lock().await;
        let sender = match slot.as_mut() {
            Some(sender) if self.can_write() => sender,
            _ => return Err(self.not_writable()),
        };

        let outcome = tokio::time::timeout(self.settings.timeout, sender.send(&message)).await;
        drop(slot);

        match outcome {
            Ok(Ok(())) => {
                metrics::counter!("hub.frames.sent").increment(1);
                Ok(())
            }
            // Rejected by the encoder; nothing reached the wire.
            Ok(Err(source @ StreamingError::ChannelTooLong(_))) => Err(WriteError::Transport {
                name: self.name.clone(),
                source,
            }
            .into()),
            Ok(Err(source)) => {
                self.cascade(&format!("write failed: {source}")).await;
                Err(WriteError::Transport {
                    name: self.name.clone(),
                    source,
                }
                .into())
            }
            Err(_) => {
                // A partial frame may be on the wire; the link is unusable.
                self.cascade("write timed out").await;
                Err(WriteError::TimedOut {
                    name: self.name.clone(),
                    elapsed: self.settings.timeout,
                }
                .into())
            }
        }
    }

    /// Stop the connection and release the link.
    ///
    /// Tells the peer we are closing if the link was open. Idempotent.
    pub async fn close(&self) {
        let previous = self.stop();
        if previous == ConnectionState::Stopped {
            return;
        }
        info!(peer = %self.name, id = %self.id, "closing connection");

        if previous == ConnectionState::Opened {
            self.send_control(&Message::closing("")).await;
        }
        self.release().await;

        let task = self.receive_task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(peer = %self.name, error = %err, "receive task ended abnormally");
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound side
    // ------------------------------------------------------------------

    /// Run the acceptor half of the handshake on a fresh inbound stream.
    ///
    /// Reads `Hello`, names the connection after it, records the peer's
    /// data limit and starts it. The
    /// caller registers the connection and then calls [`Self::welcome`] or
    /// [`Self::reject`].
    pub(crate) async fn accept(
        stream: TcpStream,
        settings: ConnectionSettings,
        evictions: mpsc::UnboundedSender<ConnectionId>,
    ) -> std::result::Result<Arc<Self>, ConnectionError> {
        let remote = stream
            .peer_addr()
            .map_err(|err| ConnectionError::Dropped(err.to_string()))?;
        let label = remote.to_string();
        if let Err(err) = stream.set_nodelay(true) {
            debug!(addr = %remote, error = %err, "could not set TCP_NODELAY");
        }

        let codec = FrameCodec::new(settings.size);
        let (read, write) = stream.into_split();
        let mut receiver = StreamReceiver::new(read, codec);

        let hello = await_frame(&mut receiver, settings.timeout, &label).await?;
        if hello.kind() != MessageType::Hello {
            return Err(ConnectionError::Handshake {
                peer: label,
                reason: format!("expected hello, got {}", hello.kind()),
            });
        }
        let (peer_size, name) = hello.hello_parts()?;
        if name.is_empty() {
            return Err(ConnectionError::Handshake {
                peer: label,
                reason: "empty name".to_string(),
            });
        }

        let connection = Self::build(name.to_string(), settings, Some(evictions));
        *connection.state.lock() = ConnectionState::Connecting;
        connection
            .start(
                receiver,
                StreamSender::new(write, codec),
                PeerAddress::from_socket(remote),
                peer_size,
                Direction::Inbound,
            )
            .await?;
        Ok(connection)
    }

    /// Confirm registration to the initiator, announcing our data limit.
    pub(crate) async fn welcome(&self) -> std::result::Result<(), ConnectionError> {
        let mut slot = self.sender.lock().await;
        let sender = slot
            .as_mut()
            .ok_or_else(|| ConnectionError::Dropped("link released before welcome".to_string()))?;
        let welcome = Message::welcome(self.size());
        match tokio::time::timeout(self.settings.timeout, sender.send(&welcome)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(ConnectionError::Dropped(err.to_string())),
            Err(_) => Err(ConnectionError::TimedOut {
                peer: self.name.clone(),
                elapsed: self.settings.timeout,
            }),
        }
    }

    /// Refuse the registration and drop the link.
    ///
    /// The hub never knew about this connection, so nothing is evicted.
    pub(crate) async fn reject(&self, reason: &str) {
        if self.stop() == ConnectionState::Stopped {
            return;
        }
        self.send_control(&Message::closing(reason)).await;
        self.release().await;
    }

    /// Stop without talking to the peer. Used where nothing can be awaited;
    /// the link is released when the last handle drops.
    pub(crate) fn abort(&self) {
        self.stop();
    }

    // ------------------------------------------------------------------
    // Internal lifecycle
    // ------------------------------------------------------------------

    /// TCP connect plus the initiator half of the handshake.
    async fn establish(
        &self,
        address: &str,
        port: u16,
    ) -> std::result::Result<(Receiver, Sender, PeerAddress, usize), ConnectionError> {
        let label = format!("{address}:{port}");
        let timeout = self.settings.timeout;

        let stream = match tokio::time::timeout(timeout, TcpStream::connect((address, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(ConnectionError::Unreachable { peer: label, source }),
            Err(_) => {
                return Err(ConnectionError::TimedOut {
                    peer: label,
                    elapsed: timeout,
                })
            }
        };
        let resolved = stream
            .peer_addr()
            .map_err(|err| ConnectionError::Dropped(err.to_string()))?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(addr = %resolved, error = %err, "could not set TCP_NODELAY");
        }

        let (read, write) = stream.into_split();
        let mut sender = StreamSender::new(write, self.codec);
        let mut receiver = StreamReceiver::new(read, self.codec);

        sender
            .send(&Message::hello(&self.name, self.size()))
            .await
            .map_err(|err| ConnectionError::Handshake {
                peer: label.clone(),
                reason: err.to_string(),
            })?;

        let reply = await_frame(&mut receiver, timeout, &label).await?;
        match reply.kind() {
            MessageType::Welcome => {
                let peer_size = reply.peer_limit().map_err(|err| ConnectionError::Handshake {
                    peer: label.clone(),
                    reason: err.to_string(),
                })?;
                Ok((receiver, sender, PeerAddress::new(address, port, resolved), peer_size))
            }
            MessageType::Closing => Err(ConnectionError::Rejected {
                peer: label,
                reason: reply.text().unwrap_or("<invalid utf-8>").to_string(),
            }),
            other => Err(ConnectionError::Handshake {
                peer: label,
                reason: format!("expected welcome, got {other}"),
            }),
        }
    }

    /// `Connecting -> Opened`: install the link and spawn the receive task.
    async fn start(
        self: &Arc<Self>,
        receiver: Receiver,
        sender: Sender,
        peer: PeerAddress,
        peer_size: usize,
        direction: Direction,
    ) -> std::result::Result<(), ConnectionError> {
        // Hold the write slot across the transition so a concurrent close
        // cannot release before the sender is installed.
        let mut slot = self.sender.lock().await;
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Connecting {
                return Err(ConnectionError::Dropped(
                    "connection closed during handshake".to_string(),
                ));
            }
            *state = ConnectionState::Opened;
        }
        *slot = Some(sender);
        drop(slot);

        let _ = self.peer.set(peer);
        let _ = self.peer_size.set(peer_size);
        let _ = self.direction.set(direction);
        self.can_write.store(true, Ordering::Release);

        let task = tokio::spawn(Arc::clone(self).run(receiver));
        *self.receive_task.lock() = Some(task);

        info!(
            peer = %self.name,
            id = %self.id,
            addr = %self.peer.get().map(ToString::to_string).unwrap_or_default(),
            ?direction,
            peer_size,
            "connection opened"
        );
        Ok(())
    }

    /// Receive loop: drain frames until stopped or the link fails.
    async fn run(self: Arc<Self>, mut receiver: Receiver) {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                received = receiver.recv() => match received {
                    Ok(Some(message)) => {
                        if let Err(reason) = self.dispatch(message) {
                            self.cascade(&reason).await;
                            break;
                        }
                    }
                    Ok(None) => {
                        self.cascade("peer closed the link").await;
                        break;
                    }
                    Err(err) => {
                        let reason = if err.is_protocol_violation() {
                            format!("peer violated the protocol: {err}")
                        } else {
                            format!("link failed: {err}")
                        };
                        self.cascade(&reason).await;
                        break;
                    }
                },
            }
        }
        debug!(peer = %self.name, id = %self.id, "receive loop finished");
    }

    /// Route one inbound frame; `Err` carries the cascade reason.
    fn dispatch(&self, message: Message) -> std::result::Result<(), String> {
        match message.kind() {
            MessageType::Data => {
                metrics::counter!("hub.frames.received").increment(1);
                match self.channels.push(message.channel(), message.payload().clone()) {
                    Pushed::Queued => {}
                    Pushed::DroppedOldest => {
                        metrics::counter!("hub.frames.dropped").increment(1);
                    }
                    Pushed::TooManyChannels => {
                        metrics::counter!("hub.frames.dropped").increment(1);
                        warn!(
                            peer = %self.name,
                            channel = message.channel(),
                            limit = self.settings.max_channels,
                            "too many buffered channels, dropped frame"
                        );
                    }
                }
                Ok(())
            }
            MessageType::Closing => {
                let reason = message.text().unwrap_or_default();
                if reason.is_empty() {
                    Err("peer is closing".to_string())
                } else {
                    Err(format!("peer is closing: {reason}"))
                }
            }
            kind @ (MessageType::Hello | MessageType::Welcome) => {
                Err(format!("unexpected {kind} frame on an open link"))
            }
        }
    }

    /// Move to `Stopped` and wake everything waiting on this connection.
    ///
    /// Returns the state we left.
    fn stop(&self) -> ConnectionState {
        let previous = {
            let mut state = self.state.lock();
            std::mem::replace(&mut *state, ConnectionState::Stopped)
        };
        if previous != ConnectionState::Stopped {
            self.can_write.store(false, Ordering::Release);
            self.shutdown.send_replace(true);
            self.channels.wake_all();
        }
        previous
    }

    /// Propagate a link failure: stop, notify the hub, release the link.
    async fn cascade(&self, reason: &str) {
        if self.stop() == ConnectionState::Stopped {
            return;
        }
        warn!(peer = %self.name, id = %self.id, reason, "connection cascaded to stopped");
        metrics::counter!("hub.connections.cascaded").increment(1);

        if let Some(evictions) = &self.evictions {
            if evictions.send(self.id).is_err() {
                debug!(peer = %self.name, "owning hub is gone, nothing to evict from");
            }
        }
        self.release().await;
    }

    /// Best-effort control frame, bounded by the timeout.
    async fn send_control(&self, message: &Message) {
        let mut slot = self.sender.lock().await;
        if let Some(sender) = slot.as_mut() {
            match tokio::time::timeout(self.settings.timeout, sender.send(message)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(peer = %self.name, kind = %message.kind(), error = %err, "control frame not sent"),
                Err(_) => debug!(peer = %self.name, kind = %message.kind(), "control frame timed out"),
            }
        }
    }

    /// Release transport resources; safe to call more than once.
    async fn release(&self) {
        let sender = self.sender.lock().await.take();
        if let Some(mut sender) = sender {
            match tokio::time::timeout(self.settings.timeout, sender.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(peer = %self.name, error = %err, "shutdown of write half failed"),
                Err(_) => debug!(peer = %self.name, "shutdown of write half timed out"),
            }
        }
    }

    fn not_writable(&self) -> Error {
        WriteError::NotWritable {
            name: self.name.clone(),
            state: self.state(),
        }
        .into()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("peer", &self.peer.get())
            .field("timeout", &self.settings.timeout)
            .field("size", &self.settings.size)
            .field("peer_size", &self.peer_size.get())
            .finish()
    }
}

fn into_text(payload: Bytes) -> String {
    String::from_utf8_lossy(&payload).into_owned()
}

/// Read one handshake frame, bounded by `timeout`.
async fn await_frame(
    receiver: &mut Receiver,
    timeout: Duration,
    peer: &str,
) -> std::result::Result<Message, ConnectionError> {
    match tokio::time::timeout(timeout, receiver.recv()).await {
        Ok(Ok(Some(message))) => Ok(message),
        Ok(Ok(None)) => Err(ConnectionError::Handshake {
            peer: peer.to_string(),
            reason: "link closed during handshake".to_string(),
        }),
        Ok(Err(err)) => Err(ConnectionError::Protocol(err)),
        Err(_) => Err(ConnectionError::TimedOut {
            peer: peer.to_string(),
            elapsed: timeout,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            timeout: Duration::from_millis(500),
            size: 16,
            queue_capacity: 8,
            max_channels: 2,
        }
    }

    #[tokio::test]
    async fn new_connection_is_created_and_not_writable() {
        let conn = Connection::new("peerA", settings());
        assert_eq!(conn.state(), ConnectionState::Created);
        assert!(!conn.can_write());
        assert!(conn.peer().is_none());

        let err = conn.write("chat", "hi").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Write(WriteError::NotWritable { state: ConnectionState::Created, .. })
        ));
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails_and_stops() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let conn = Connection::new("peerA", settings());
        let err = conn.connect("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionError::Unreachable { .. } | ConnectionError::TimedOut { .. })
        ));
        assert_eq!(conn.state(), ConnectionState::Stopped);

        let again = conn.connect("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(
            again,
            Error::Connection(ConnectionError::AlreadyConnected { .. })
        ));
    }

    #[tokio::test]
    async fn silent_peer_times_out_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let holder = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(stream);
        });

        let conn = Connection::new("peerA", settings());
        let err = conn.connect("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, Error::Connection(ConnectionError::TimedOut { .. })));
        assert_eq!(conn.state(), ConnectionState::Stopped);
        holder.abort();
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let conn = Connection::new("peerA", settings());
        conn.close().await;
        conn.close().await;
        assert_eq!(conn.state(), ConnectionState::Stopped);
        assert_eq!(conn.get("chat").await, None);
    }

    #[test]
    fn closing_frame_from_peer_is_a_cascade() {
        let conn = Connection::new("peerA", settings());
        let reason = conn.dispatch(Message::closing("bye")).unwrap_err();
        assert_eq!(reason, "peer is closing: bye");
    }

    #[test]
    fn data_frames_land_in_their_channel() {
        let conn = Connection::new("peerA", settings());
        conn.dispatch(Message::data("chat", "hi")).unwrap();
        conn.dispatch(Message::data("log", "x")).unwrap();
        assert_eq!(conn.pending("chat"), 1);
        assert_eq!(conn.try_get("chat").as_deref(), Some("hi"));
        assert_eq!(conn.try_get("chat"), None);
        assert_eq!(conn.try_get("log").as_deref(), Some("x"));
    }

    #[test]
    fn stray_handshake_frame_is_a_violation() {
        let conn = Connection::new("peerA", settings());
        assert!(conn.dispatch(Message::hello("again", 16)).is_err());
    }

    #[test]
    fn frames_past_the_channel_limit_are_dropped_not_fatal() {
        let conn = Connection::new("peerA", settings());
        conn.dispatch(Message::data("a", "1")).unwrap();
        conn.dispatch(Message::data("b", "1")).unwrap();
        conn.dispatch(Message::data("c", "1")).unwrap();
        assert_eq!(conn.channel_count(), 2);
        assert_eq!(conn.pending("c"), 0);

        assert!(conn.try_get("a").is_some());
        conn.dispatch(Message::data("c", "2")).unwrap();
        assert_eq!(conn.try_get("c").as_deref(), Some("2"));
    }

    #[test]
    fn binary_payloads_survive_and_text_reads_are_lossy() {
        let conn = Connection::new("peerA", settings());
        conn.dispatch(Message::data("img", vec![0xff, 0x00, 0x7f])).unwrap();
        assert_eq!(conn.try_get_bytes("img").as_deref(), Some(&[0xff, 0x00, 0x7f][..]));

        conn.dispatch(Message::data("img", vec![b'o', 0xff, b'k'])).unwrap();
        assert_eq!(conn.try_get("img").as_deref(), Some("o\u{fffd}k"));
    }

    #[test]
    fn write_limit_without_peer_is_local_size() {
        let conn = Connection::new("peerA", settings());
        assert_eq!(conn.size(), 16);
        assert_eq!(conn.peer_size(), None);
        assert_eq!(conn.write_limit(), 16);
    }
}
