//! Per-channel message buffers.
//!
//! The receive task of a connection is the only producer; any number of
//! callers may consume through `get`. Memory stays bounded on both axes:
//! - at most `capacity` messages per channel; the oldest is dropped on
//!   overflow
//! - at most `max_channels` channels; frames for further channels are
//!   refused until an existing channel drains
//!
//! Only `push` creates a channel entry, and a channel is removed as soon as
//! it is drained, so asking for unknown channels costs nothing.

use std::time::Duration;

use bytes::Bytes;
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::debug;

/// Outcome of buffering one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pushed {
    Queued,
    /// Queued after dropping the oldest message on the channel
    DroppedOldest,
    /// Refused: the channel is new and the channel limit is reached
    TooManyChannels,
}

/// Buffered inbound messages keyed by channel name.
#[derive(Debug)]
pub(crate) struct ChannelBuffers {
    queues: DashMap<String, SegQueue<Bytes>>,
    /// Signalled on every push and on shutdown; waiters re-check their
    /// own channel.
    ready: Notify,
    capacity: usize,
    max_channels: usize,
}

impl ChannelBuffers {
    pub(crate) fn new(capacity: usize, max_channels: usize) -> Self {
        Self {
            queues: DashMap::new(),
            ready: Notify::new(),
            capacity: capacity.max(1),
            max_channels: max_channels.max(1),
        }
    }

    /// Buffer a message and wake anyone waiting.
    pub(crate) fn push(&self, channel: &str, message: Bytes) -> Pushed {
        let outcome = if let Some(queue) = self.queues.get(channel) {
            self.push_bounded(&queue, message)
        } else {
            if self.queues.len() >= self.max_channels {
                return Pushed::TooManyChannels;
            }
            // The entry guard holds the shard lock, so a concurrent drain
            // cannot remove the queue between insert and push.
            let queue = self.queues.entry(channel.to_string()).or_default();
            self.push_bounded(&queue, message)
        };
        if outcome == Pushed::DroppedOldest {
            debug!(channel, capacity = self.capacity, "channel buffer full, dropped oldest message");
        }
        self.ready.notify_waiters();
        outcome
    }

    fn push_bounded(&self, queue: &SegQueue<Bytes>, message: Bytes) -> Pushed {
        queue.push(message);
        if queue.len() > self.capacity && queue.pop().is_some() {
            return Pushed::DroppedOldest;
        }
        Pushed::Queued
    }

    /// Pop the oldest buffered message without waiting.
    pub(crate) fn try_pop(&self, channel: &str) -> Option<Bytes> {
        let message = self.queues.get(channel).and_then(|queue| queue.pop());
        if message.is_some() {
            self.queues.remove_if(channel, |_, queue| queue.is_empty());
        }
        message
    }

    /// Pop the oldest message, waiting up to `timeout` for one to arrive.
    ///
    /// Returns early with whatever is buffered once `shutdown` flips to
    /// `true` (or its sender goes away).
    pub(crate) async fn pop_within(
        &self,
        channel: &str,
        timeout: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Option<Bytes> {
        // A timeout too large to represent means wait until woken.
        let deadline = Instant::now().checked_add(timeout);

        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            // Register before checking so a push between the check and the
            // await is not missed.
            notified.as_mut().enable();

            if let Some(message) = self.try_pop(channel) {
                return Some(message);
            }
            if *shutdown.borrow_and_update() {
                return None;
            }

            let expired = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = &mut notified => continue,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return self.try_pop(channel);
                    }
                }
                _ = expired => return self.try_pop(channel),
            }
        }
    }

    /// Wake every waiter, e.g. after the connection stopped.
    pub(crate) fn wake_all(&self) {
        self.ready.notify_waiters();
    }

    /// Number of messages buffered on `channel`.
    pub(crate) fn pending(&self, channel: &str) -> usize {
        self.queues.get(channel).map_or(0, |queue| queue.len())
    }

    /// Number of channels currently holding messages.
    pub(crate) fn channel_count(&self) -> usize {
        self.queues.len()
    }
}
