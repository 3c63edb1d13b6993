//! Virtual per-peer channel
//!
//! One logical, bidirectional channel per remote peer, multiplexed with its
//! siblings over the parent endpoint's single physical transport. The
//! channel owns a bounded inbound queue; queued messages are not visible to
//! the logical reader until the parent signals read completion, and read
//! completion never overtakes a write submitted earlier on the same channel.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;
use weft_core::PeerAddress;

/// Channel lifecycle; `Closed` is terminal
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// Created, not yet registered with the parent
    Open,
    /// Registered and usable for traffic
    Connected,
    Closed,
}

/// Why a channel was closed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Either side requested the close
    Requested,
    /// Parent endpoint is shutting down
    Shutdown,
}

/// Per-operation channel errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// Channel exists but registration has not completed
    #[error("channel not yet connected")]
    NotYetConnected,
    /// Channel is closed; permanent for this channel instance
    #[error("channel closed")]
    ClosedChannel,
    /// No path to the peer and no super-peer fallback
    #[error("no path to peer {0}")]
    PathNotFound(PeerAddress),
    /// Outbound payload could not be encoded for the wire
    #[error("message encoding failed: {0}")]
    Encode(String),
}

/// Outcome of queueing one inbound message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueOutcome {
    Queued,
    /// High watermark reached; the caller must drop or back off
    Full,
    Closed,
}

/// Seam to the owning multiplexer
///
/// The channel holds only a weak reference here; the multiplexer is the
/// sole owner of its channels, so no reference cycle forms.
#[async_trait]
pub(crate) trait ChannelParent: Send + Sync {
    /// Hand an outbound application payload to the parent for delivery
    async fn send_app(&self, remote: PeerAddress, payload: Bytes) -> Result<(), ChannelError>;

    /// Notify the parent that the channel for `remote` has closed
    fn channel_closed(&self, remote: PeerAddress);
}

#[derive(Default)]
struct Flags {
    /// Number of writes currently in flight on this channel
    writes_in_flight: usize,
    /// A read completion arrived while a write was in flight
    read_deferred: bool,
    /// Messages are queued but not yet delivered to the reader
    read_pending: bool,
    /// High watermark was hit; refuse input until the queue drains low
    inbound_suspended: bool,
}

struct ChannelInner {
    local: PeerAddress,
    remote: PeerAddress,
    state: Mutex<ChannelState>,
    queue: Mutex<VecDeque<Bytes>>,
    flags: Mutex<Flags>,
    high_watermark: usize,
    low_watermark: usize,
    delivery_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    delivery_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    parent: Weak<dyn ChannelParent>,
}

/// A virtual channel to one remote peer, cheap to clone
#[derive(Clone)]
pub struct VirtualChannel {
    inner: Arc<ChannelInner>,
}

impl VirtualChannel {
    pub(crate) fn new(
        local: PeerAddress,
        remote: PeerAddress,
        parent: Weak<dyn ChannelParent>,
        high_watermark: usize,
        low_watermark: usize,
    ) -> Self {
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ChannelInner {
                local,
                remote,
                state: Mutex::new(ChannelState::Open),
                queue: Mutex::new(VecDeque::new()),
                flags: Mutex::new(Flags::default()),
                high_watermark,
                low_watermark,
                delivery_tx: Mutex::new(Some(delivery_tx)),
                delivery_rx: tokio::sync::Mutex::new(delivery_rx),
                parent,
            }),
        }
    }

    /// Registration completed; the channel may now carry traffic
    pub(crate) fn activate(&self) {
        let mut state = self.inner.state.lock();
        if *state == ChannelState::Open {
            *state = ChannelState::Connected;
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    pub fn local_address(&self) -> PeerAddress {
        self.inner.local
    }

    pub fn remote_address(&self) -> PeerAddress {
        self.inner.remote
    }

    /// Queue one inbound message; it stays invisible to the reader until
    /// [`finish_read`](Self::finish_read) runs
    pub fn try_queue_inbound(&self, payload: Bytes) -> QueueOutcome {
        if self.is_closed() {
            return QueueOutcome::Closed;
        }

        // lock order: flags before queue, everywhere
        let mut flags = self.inner.flags.lock();
        let mut queue = self.inner.queue.lock();

        if flags.inbound_suspended {
            if queue.len() <= self.inner.low_watermark {
                flags.inbound_suspended = false;
            } else {
                return QueueOutcome::Full;
            }
        }
        if queue.len() >= self.inner.high_watermark {
            flags.inbound_suspended = true;
            return QueueOutcome::Full;
        }

        queue.push_back(payload);
        flags.read_pending = true;
        QueueOutcome::Queued
    }

    /// Deliver queued inbound messages to the logical reader
    ///
    /// If a write is in flight the delivery is deferred until that write
    /// settles, never dropped: a peer observing a completed write must also
    /// observe its effects before later reads.
    pub fn finish_read(&self) {
        let mut flags = self.inner.flags.lock();
        if flags.writes_in_flight > 0 {
            flags.read_deferred = true;
            return;
        }
        self.deliver(&mut flags);
    }

    fn deliver(&self, flags: &mut Flags) {
        if !flags.read_pending {
            return;
        }
        flags.read_pending = false;

        let mut queue = self.inner.queue.lock();
        let tx = self.inner.delivery_tx.lock();
        while let Some(message) = queue.pop_front() {
            if let Some(tx) = tx.as_ref() {
                let _ = tx.send(message);
            }
        }
        if queue.len() <= self.inner.low_watermark {
            flags.inbound_suspended = false;
        }
    }

    /// Write an application payload to the remote peer
    ///
    /// Tries the intra-process shortcut first (via the parent), then the
    /// physical transport. Fails fast when the channel is not connected.
    pub async fn write(&self, payload: Bytes) -> Result<(), ChannelError> {
        match self.state() {
            ChannelState::Open => return Err(ChannelError::NotYetConnected),
            ChannelState::Closed => return Err(ChannelError::ClosedChannel),
            ChannelState::Connected => {}
        }

        let parent = self
            .inner
            .parent
            .upgrade()
            .ok_or(ChannelError::ClosedChannel)?;

        self.inner.flags.lock().writes_in_flight += 1;
        let result = parent.send_app(self.inner.remote, payload).await;

        let mut flags = self.inner.flags.lock();
        flags.writes_in_flight -= 1;
        if flags.writes_in_flight == 0 && flags.read_deferred {
            flags.read_deferred = false;
            self.deliver(&mut flags);
        }
        drop(flags);

        result
    }

    /// Receive the next delivered inbound message
    ///
    /// Returns `None` once the channel is closed and drained.
    pub async fn recv(&self) -> Option<Bytes> {
        self.inner.delivery_rx.lock().await.recv().await
    }

    /// Close the channel; idempotent, first caller wins
    pub fn close(&self, reason: CloseReason) -> bool {
        {
            let mut state = self.inner.state.lock();
            if *state == ChannelState::Closed {
                return false;
            }
            *state = ChannelState::Closed;
        }
        trace!("channel {} -> {} closed: {:?}", self.inner.local, self.inner.remote, reason);

        self.inner.queue.lock().clear();
        {
            let mut flags = self.inner.flags.lock();
            flags.read_pending = false;
            flags.read_deferred = false;
            flags.inbound_suspended = false;
        }
        // dropping the sender ends the reader with None once drained
        self.inner.delivery_tx.lock().take();

        if let Some(parent) = self.inner.parent.upgrade() {
            parent.channel_closed(self.inner.remote);
        }
        true
    }

    /// Number of queued-but-undelivered inbound messages
    pub fn queued_len(&self) -> usize {
        self.inner.queue.lock().len()
    }
}

impl std::fmt::Debug for VirtualChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualChannel")
            .field("remote", &self.inner.remote)
            .field("state", &self.state())
            .field("queued", &self.queued_len())
            .finish()
    }
}
