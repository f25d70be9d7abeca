//! The hub: owner of a set of named connections.
//!
//! # Lifecycle
//!
//! ```text
//! ┌─────────┐  open  ┌────────┐  close  ┌─────────┐
//! │ Created │───────>│ Opened │────────>│ Stopped │
//! └─────────┘        └────────┘         └─────────┘
//!      │                                     ↑
//!      └──────────────── close ──────────────┘
//! ```
//!
//! Outbound `connect` works in `Created` and `Opened`; inbound links are
//! only accepted once opened. A stopped hub refuses connects and writes but
//! still hands out messages that were already buffered.
//!
//! # Bookkeeping
//!
//! Connections that cascade report their id on an eviction channel. Every
//! public operation, and the accept loop after each accept, drains that
//! channel and removes the reported connections before doing anything else.

mod registry;
mod report;

pub use report::{PeerMessage, WriteFailure, WriteReport};

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ConnectionSettings, HubConfig, DEFAULT_PORT};
use crate::connection::Connection;
use crate::error::{Error, Result, WriteError};
use crate::network::{AddressClassifier, Locality, PrivateNetworkClassifier};
use crate::peer::ConnectionId;
use registry::{Member, Registry};

/// Pause after a failed `accept` so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Poll interval while waiting for every connection to become writable.
const READY_POLL: Duration = Duration::from_millis(10);

/// Channel that carries binary image payloads.
pub const IMAGE_CHANNEL: &str = "__image";

/// Lifecycle state of a [`Hub`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    Created,
    /// Listening for inbound links
    Opened,
    Stopped,
}

/// Which registered connections an aggregate call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    All,
    Only(Locality),
}

struct HubInner {
    config: RwLock<HubConfig>,
    state: Mutex<HubState>,
    registry: Registry,
    classifier: RwLock<Arc<dyn AddressClassifier>>,
    local_addr: OnceLock<SocketAddr>,
    shutdown: watch::Sender<bool>,
    evict_tx: mpsc::UnboundedSender<ConnectionId>,
    evict_rx: Mutex<mpsc::UnboundedReceiver<ConnectionId>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

/// Manages named connections and routes channel reads and writes across
/// all of them, one of them, or the local/remote partitions.
///
/// Cheap to clone; clones share the same hub.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Create a hub that will listen on `port` once opened.
    ///
    /// Defaults: timeout 1s, frame size 256 bytes.
    pub fn new(port: u16) -> Self {
        Self::with_config(HubConfig::with_port(port))
    }

    pub fn with_config(config: HubConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (evict_tx, evict_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(HubInner {
                config: RwLock::new(config),
                state: Mutex::new(HubState::Created),
                registry: Registry::new(),
                classifier: RwLock::new(Arc::new(PrivateNetworkClassifier)),
                local_addr: OnceLock::new(),
                shutdown,
                evict_tx,
                evict_rx: Mutex::new(evict_rx),
                accept_task: Mutex::new(None),
            }),
        }
    }

    /// Create a hub on `port` and open it.
    pub async fn bind(port: u16) -> Result<Self> {
        let hub = Self::new(port);
        hub.open().await?;
        Ok(hub)
    }

    /// Replace the local/remote predicate.
    pub fn with_classifier(self, classifier: impl AddressClassifier) -> Self {
        *self.inner.classifier.write() = Arc::new(classifier);
        self
    }

    // ------------------------------------------------------------------
    // Accessors & defaults
    // ------------------------------------------------------------------

    pub fn state(&self) -> HubState {
        *self.inner.state.lock()
    }

    /// Address the listener is bound to, once opened.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.get().copied()
    }

    /// Bound port once opened, otherwise the configured one.
    pub fn port(&self) -> u16 {
        match self.local_addr() {
            Some(addr) => addr.port(),
            None => self.inner.config.read().port.unwrap_or(DEFAULT_PORT),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.inner.config.read().timeout()
    }

    pub fn size(&self) -> usize {
        self.inner.config.read().size
    }

    /// Default timeout for connections created from now on.
    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.config.write().set_timeout(timeout);
    }

    /// Default frame size for connections created from now on.
    pub fn set_size(&self, size: usize) {
        self.inner.config.write().size = size;
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Bind the listener and start accepting inbound links.
    ///
    /// A pinned port must bind on the first try. Without one, ports are
    /// tried upward from [`DEFAULT_PORT`] while they are in use. Opening an
    /// already opened hub returns the bound address.
    pub async fn open(&self) -> Result<SocketAddr> {
        match self.state() {
            HubState::Stopped => return Err(Error::HubStopped),
            HubState::Opened => {
                if let Some(addr) = self.local_addr() {
                    return Ok(addr);
                }
            }
            HubState::Created => {}
        }

        let listener = self.listen().await?;
        let local_addr = listener.local_addr().map_err(|source| Error::Bind {
            port: self.port(),
            source,
        })?;

        {
            let mut state = self.inner.state.lock();
            match *state {
                HubState::Created => *state = HubState::Opened,
                // Lost a race with a concurrent open or close.
                HubState::Opened => return self.local_addr().ok_or(Error::HubStopped),
                HubState::Stopped => return Err(Error::HubStopped),
            }
        }
        let _ = self.inner.local_addr.set(local_addr);

        let task = tokio::spawn(accept_loop(
            Arc::downgrade(&self.inner),
            listener,
            self.inner.shutdown.subscribe(),
        ));
        *self.inner.accept_task.lock() = Some(task);

        info!(addr = %local_addr, "hub opened");
        Ok(local_addr)
    }

    async fn listen(&self) -> Result<TcpListener> {
        let (bind_address, candidates, pinned) = {
            let config = self.inner.config.read();
            (config.bind_address, config.candidate_ports(), config.port.is_some())
        };

        let mut last_error = None;
        for port in candidates {
            match TcpListener::bind((bind_address, port)).await {
                Ok(listener) => return Ok(listener),
                Err(source) if !pinned && source.kind() == io::ErrorKind::AddrInUse => {
                    debug!(port, "port in use, trying next");
                    last_error = Some((port, source));
                }
                Err(source) => return Err(Error::Bind { port, source }),
            }
        }

        let (port, source) = last_error.unwrap_or_else(|| {
            (
                DEFAULT_PORT,
                io::Error::new(io::ErrorKind::AddrNotAvailable, "no candidate ports"),
            )
        });
        Err(Error::Bind { port, source })
    }

    /// Stop accepting links and close every connection. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == HubState::Stopped {
                return;
            }
            *state = HubState::Stopped;
        }
        self.inner.shutdown.send_replace(true);

        let closing: Vec<_> = self
            .inner
            .registry
            .snapshot()
            .into_iter()
            .map(|member| {
                let connection = member.connection;
                tokio::spawn(async move { connection.close().await })
            })
            .collect();
        for handle in closing {
            if let Err(err) = handle.await {
                warn!(error = %err, "connection close task ended abnormally");
            }
        }

        let task = self.inner.accept_task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = %err, "accept task ended abnormally");
            }
        }
        info!(port = self.port(), "hub closed");
    }

    /// Open an outbound connection and register it under `name`.
    ///
    /// The peer registers the link under the same name during the
    /// handshake. Nothing is registered if connecting fails.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateName`] if `name` is taken; the existing
    ///   connection is untouched
    /// - [`Error::Connection`] if the link could not be established
    /// - [`Error::HubStopped`] after [`Hub::close`]
    pub async fn connect(&self, name: &str, address: &str, port: u16) -> Result<Arc<Connection>> {
        self.inner.ensure_running()?;
        self.inner.sweep();
        if self.inner.registry.contains(name) {
            return Err(Error::DuplicateName(name.to_string()));
        }

        let connection =
            Connection::with_evictions(name, self.inner.settings(), self.inner.evict_tx.clone());
        connection.connect(address, port).await?;

        if let Err(err) = self.inner.registry.register(Arc::clone(&connection)) {
            connection.close().await;
            return Err(err);
        }
        if self.inner.is_stopped() {
            self.inner.registry.remove_id(connection.id());
            connection.close().await;
            return Err(Error::HubStopped);
        }
        Ok(connection)
    }

    /// Deregister and close the connection named `name`.
    pub async fn disconnect(&self, name: &str) -> Result<()> {
        self.inner.sweep();
        let connection = self
            .inner
            .registry
            .remove_name(name)
            .ok_or_else(|| Error::UnknownName(name.to_string()))?;
        connection.close().await;
        info!(peer = name, "connection removed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn connection(&self, name: &str) -> Option<Arc<Connection>> {
        self.inner.sweep();
        self.inner.registry.get(name)
    }

    /// Registered connections in registration order.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.sweep();
        self.inner
            .registry
            .snapshot()
            .into_iter()
            .map(|member| member.connection)
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.connections()
            .iter()
            .map(|connection| connection.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.sweep();
        self.inner.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if every registered connection currently accepts writes.
    pub fn can_write_all(&self) -> bool {
        self.connections().iter().all(|connection| connection.can_write())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Next buffered message on `channel` from every connection that has
    /// one, in registration order. Does not wait.
    pub fn get_all(&self, channel: &str) -> Vec<PeerMessage> {
        self.collect(Scope::All, channel)
    }

    /// Next message on `channel` from the connection named `name`, waiting
    /// at most that connection's timeout.
    pub async fn get_by_name(&self, name: &str, channel: &str) -> Result<Option<String>> {
        self.inner.sweep();
        let connection = self
            .inner
            .registry
            .get(name)
            .ok_or_else(|| Error::UnknownName(name.to_string()))?;
        if self.inner.is_stopped() {
            return Ok(connection.try_get(channel));
        }
        Ok(connection.get(channel).await)
    }

    /// Like [`Hub::get_by_name`], returning the raw payload.
    pub async fn get_bytes_by_name(&self, name: &str, channel: &str) -> Result<Option<Bytes>> {
        self.inner.sweep();
        let connection = self
            .inner
            .registry
            .get(name)
            .ok_or_else(|| Error::UnknownName(name.to_string()))?;
        if self.inner.is_stopped() {
            return Ok(connection.try_get_bytes(channel));
        }
        Ok(connection.get_bytes(channel).await)
    }

    /// Next image sent by the connection named `name`.
    pub async fn get_image_by_name(&self, name: &str) -> Result<Option<Bytes>> {
        self.get_bytes_by_name(name, IMAGE_CHANNEL).await
    }

    /// Like [`Hub::get_all`], limited to connections classified local.
    pub fn get_local(&self, channel: &str) -> Vec<PeerMessage> {
        self.collect(Scope::Only(Locality::Local), channel)
    }

    /// Like [`Hub::get_all`], limited to connections classified remote.
    pub fn get_remote(&self, channel: &str) -> Vec<PeerMessage> {
        self.collect(Scope::Only(Locality::Remote), channel)
    }

    fn collect(&self, scope: Scope, channel: &str) -> Vec<PeerMessage> {
        self.inner.sweep();
        self.inner
            .members(scope)
            .into_iter()
            .filter_map(|member| {
                let connection = member.connection;
                connection.try_get(channel).map(|data| PeerMessage {
                    peer: connection.name().to_string(),
                    data,
                })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Send `data` on `channel` to every registered connection.
    pub async fn write_all(&self, channel: &str, data: &str) -> Result<WriteReport> {
        self.fan_out(Scope::All, channel, text_payload(data)).await
    }

    /// Like [`Hub::write_all`], after waiting up to the hub timeout for
    /// every connection to be writable.
    ///
    /// Connections still not writable when the wait ends show up as
    /// failures in the report.
    pub async fn write_all_when_ready(&self, channel: &str, data: &str) -> Result<WriteReport> {
        self.inner.ensure_running()?;
        self.wait_until_writable().await;
        self.write_all(channel, data).await
    }

    /// Send `data` on `channel` to the connection named `name`.
    pub async fn write_to_name(&self, name: &str, channel: &str, data: &str) -> Result<()> {
        self.inner.ensure_running()?;
        self.inner.sweep();
        let connection = self
            .inner
            .registry
            .get(name)
            .ok_or_else(|| Error::UnknownName(name.to_string()))?;
        connection.write(channel, data).await
    }

    /// Like [`Hub::write_to_name`], after waiting up to the hub timeout for
    /// every connection to be writable.
    pub async fn write_to_name_when_ready(
        &self,
        name: &str,
        channel: &str,
        data: &str,
    ) -> Result<()> {
        self.inner.ensure_running()?;
        self.wait_until_writable().await;
        self.write_to_name(name, channel, data).await
    }

    pub async fn write_to_local(&self, channel: &str, data: &str) -> Result<WriteReport> {
        self.fan_out(Scope::Only(Locality::Local), channel, text_payload(data))
            .await
    }

    pub async fn write_to_remote(&self, channel: &str, data: &str) -> Result<WriteReport> {
        self.fan_out(Scope::Only(Locality::Remote), channel, text_payload(data))
            .await
    }

    /// Send an image to every registered connection on [`IMAGE_CHANNEL`].
    pub async fn write_image_all(&self, data: impl Into<Bytes>) -> Result<WriteReport> {
        self.fan_out(Scope::All, IMAGE_CHANNEL, data.into()).await
    }

    pub async fn write_image_to_name(&self, name: &str, data: impl Into<Bytes>) -> Result<()> {
        self.inner.ensure_running()?;
        self.inner.sweep();
        let connection = self
            .inner
            .registry
            .get(name)
            .ok_or_else(|| Error::UnknownName(name.to_string()))?;
        connection.write_bytes(IMAGE_CHANNEL, data).await
    }

    pub async fn write_image_to_local(&self, data: impl Into<Bytes>) -> Result<WriteReport> {
        self.fan_out(Scope::Only(Locality::Local), IMAGE_CHANNEL, data.into())
            .await
    }

    pub async fn write_image_to_remote(&self, data: impl Into<Bytes>) -> Result<WriteReport> {
        self.fan_out(Scope::Only(Locality::Remote), IMAGE_CHANNEL, data.into())
            .await
    }

    /// Wait until every registered connection accepts writes or the hub
    /// timeout passes. Returns whether they all became writable.
    async fn wait_until_writable(&self) -> bool {
        let deadline = tokio::time::Instant::now().checked_add(self.timeout());
        loop {
            if self.can_write_all() {
                return true;
            }
            if deadline.is_some_and(|deadline| tokio::time::Instant::now() >= deadline) {
                debug!(
                    pending = self.connections().iter().filter(|c| !c.can_write()).count(),
                    "connections still not writable, writing anyway"
                );
                return false;
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    /// Write to every member of `scope` concurrently and collect the
    /// outcomes in registration order.
    async fn fan_out(&self, scope: Scope, channel: &str, payload: Bytes) -> Result<WriteReport> {
        self.inner.ensure_running()?;
        self.inner.sweep();

        let writes: Vec<_> = self
            .inner
            .members(scope)
            .into_iter()
            .map(|member| {
                let connection = member.connection;
                let peer = connection.name().to_string();
                let channel = channel.to_owned();
                let payload = payload.clone();
                let handle =
                    tokio::spawn(async move { connection.write_bytes(&channel, payload).await });
                (peer, handle)
            })
            .collect();

        let mut report = WriteReport::default();
        for (peer, handle) in writes {
            match handle.await {
                Ok(Ok(())) => report.delivered.push(peer),
                Ok(Err(error)) if error.is_per_connection() => {
                    report.failures.push(WriteFailure { peer, error })
                }
                Ok(Err(error)) => return Err(error),
                Err(join) => {
                    let error = WriteError::Aborted {
                        name: peer.clone(),
                        reason: join.to_string(),
                    }
                    .into();
                    report.failures.push(WriteFailure { peer, error });
                }
            }
        }

        if !report.is_complete() {
            debug!(
                channel,
                delivered = report.delivered.len(),
                failed = ?report.failed_peers().collect::<Vec<_>>(),
                "fan-out write had failures"
            );
        }
        Ok(report)
    }
}

fn text_payload(data: &str) -> Bytes {
    Bytes::copy_from_slice(data.as_bytes())
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .field("connections", &self.inner.registry.len())
            .finish()
    }
}

impl HubInner {
    fn settings(&self) -> ConnectionSettings {
        self.config.read().connection_settings()
    }

    fn is_stopped(&self) -> bool {
        *self.state.lock() == HubState::Stopped
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::HubStopped);
        }
        Ok(())
    }

    /// Bookkeeping pass: evict every connection that cascaded since the
    /// last pass.
    fn sweep(&self) {
        let mut evictions = self.evict_rx.lock();
        while let Ok(id) = evictions.try_recv() {
            if let Some(connection) = self.registry.remove_id(id) {
                info!(peer = connection.name(), %id, "evicted stopped connection");
            }
        }
    }

    fn members(&self, scope: Scope) -> Vec<Member> {
        let members = self.registry.snapshot();
        let Scope::Only(wanted) = scope else {
            return members;
        };
        let classifier = Arc::clone(&*self.classifier.read());
        members
            .into_iter()
            .filter(|member| {
                member
                    .address
                    .as_ref()
                    .is_some_and(|address| classifier.classify(&address.resolved.ip()) == wanted)
            })
            .collect()
    }
}

impl Drop for HubInner {
    fn drop(&mut self) {
        // Unclosed hub: stop background tasks so they do not outlive it.
        self.shutdown.send_replace(true);
        for member in self.registry.snapshot() {
            member.connection.abort();
        }
    }
}

/// Accept inbound links until the hub stops or is dropped.
async fn accept_loop(
    hub: Weak<HubInner>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }

        let accepted = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            accepted = listener.accept() => accepted,
        };

        let Some(inner) = hub.upgrade() else {
            break;
        };
        inner.sweep();

        match accepted {
            Ok((stream, remote)) => {
                debug!(addr = %remote, "accepted inbound link");
                tokio::spawn(register_inbound(
                    Weak::clone(&hub),
                    stream,
                    remote,
                    inner.settings(),
                    inner.evict_tx.clone(),
                ));
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
                drop(inner);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    debug!("accept loop finished");
}

/// Handshake an inbound link and register it under the announced name.
async fn register_inbound(
    hub: Weak<HubInner>,
    stream: TcpStream,
    remote: SocketAddr,
    settings: ConnectionSettings,
    evictions: mpsc::UnboundedSender<ConnectionId>,
) {
    let connection = match Connection::accept(stream, settings, evictions).await {
        Ok(connection) => connection,
        Err(err) => {
            warn!(addr = %remote, error = %err, "inbound handshake failed");
            return;
        }
    };

    let Some(inner) = hub.upgrade() else {
        connection.reject("hub is gone").await;
        return;
    };
    if inner.is_stopped() {
        connection.reject("hub is stopped").await;
        return;
    }

    inner.sweep();
    if let Err(err) = inner.registry.register(Arc::clone(&connection)) {
        warn!(peer = connection.name(), addr = %remote, error = %err, "rejecting inbound link");
        connection.reject(&err.to_string()).await;
        return;
    }
    if inner.is_stopped() {
        inner.registry.remove_id(connection.id());
        connection.reject("hub is stopped").await;
        return;
    }

    if let Err(err) = connection.welcome().await {
        warn!(peer = connection.name(), error = %err, "welcome not delivered");
        inner.registry.remove_id(connection.id());
        connection.close().await;
    }
}
