//! Connection registry
//!
//! Thread-safe map from peer address to the known paths for that peer. A
//! path is anything capable of asynchronously accepting a message: a direct
//! UDP endpoint, an intra-process delivery hook, or a relay via super peer.
//! Lookups select at most one best path per call using a fixed ranking over
//! path kinds; the designated super peer serves as fallback when a peer has
//! no entry of its own.

use crate::event::{emit, EventSink, NodeEvent};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use weft_core::PeerAddress;

/// Kind of path to a peer, ordered best-first by [`PathKind::rank`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PathKind {
    /// Peer lives in the same process
    Loopback,
    /// Established direct session (UDP endpoint)
    DirectSession,
    /// Reachable via the designated super peer
    SuperPeerRelayed,
    /// Catch-all for externally installed relays
    Generic,
}

impl PathKind {
    /// Ranking table; lower is better
    pub fn rank(self) -> u8 {
        match self {
            PathKind::Loopback => 0,
            PathKind::DirectSession => 1,
            PathKind::SuperPeerRelayed => 2,
            PathKind::Generic => 3,
        }
    }
}

/// Why a path was closed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathCloseReason {
    /// Replaced by a newer session of the same kind
    Superseded,
    /// Parent endpoint is shutting down
    Shutdown,
}

/// Unique identity of an installed path
///
/// Removal matches on this id, so a stale handle can never remove a path
/// installed afterwards for the same peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PathId(u64);

static NEXT_PATH_ID: AtomicU64 = AtomicU64::new(1);

/// Message acceptor for paths without a socket endpoint
pub trait PathSender: Send + Sync {
    /// Hand a message to this path; returns false if the path cannot take it
    fn deliver(&self, payload: Bytes) -> bool;
}

type CloseCallback = Box<dyn FnOnce(PathCloseReason) + Send>;

/// Close state of a path; a callback registered after the close fires
/// immediately instead of being lost
enum CloseSlot {
    Armed(Option<CloseCallback>),
    Closed(PathCloseReason),
}

struct PathInner {
    id: PathId,
    kind: PathKind,
    endpoint: Option<SocketAddr>,
    sender: Option<Arc<dyn PathSender>>,
    on_close: Mutex<CloseSlot>,
}

/// A path to a peer, cheap to clone
#[derive(Clone)]
pub struct PathHandle {
    inner: Arc<PathInner>,
}

impl PathHandle {
    /// Create a path backed by a socket endpoint
    pub fn direct(kind: PathKind, endpoint: SocketAddr) -> Self {
        Self::build(kind, Some(endpoint), None)
    }

    /// Create a path backed by a message acceptor
    pub fn local(kind: PathKind, sender: Arc<dyn PathSender>) -> Self {
        Self::build(kind, None, Some(sender))
    }

    fn build(
        kind: PathKind,
        endpoint: Option<SocketAddr>,
        sender: Option<Arc<dyn PathSender>>,
    ) -> Self {
        Self {
            inner: Arc::new(PathInner {
                id: PathId(NEXT_PATH_ID.fetch_add(1, Ordering::Relaxed)),
                kind,
                endpoint,
                sender,
                on_close: Mutex::new(CloseSlot::Armed(None)),
            }),
        }
    }

    /// Register a cleanup callback fired exactly once on close
    ///
    /// If the path is already closed the callback runs immediately
    /// (register-then-check-already-closed), so cleanup is never lost.
    pub fn on_close(self, callback: impl FnOnce(PathCloseReason) + Send + 'static) -> Self {
        let run_now = {
            let mut slot = self.inner.on_close.lock();
            match &mut *slot {
                CloseSlot::Armed(cb) => {
                    *cb = Some(Box::new(callback));
                    None
                }
                CloseSlot::Closed(reason) => Some((*reason, Box::new(callback) as CloseCallback)),
            }
        };
        if let Some((reason, callback)) = run_now {
            callback(reason);
        }
        self
    }

    /// Fire the close callback; later calls are no-ops
    pub fn close(&self, reason: PathCloseReason) {
        let callback = {
            let mut slot = self.inner.on_close.lock();
            match &mut *slot {
                CloseSlot::Armed(cb) => {
                    let cb = cb.take();
                    *slot = CloseSlot::Closed(reason);
                    cb
                }
                CloseSlot::Closed(_) => None,
            }
        };
        if let Some(callback) = callback {
            callback(reason);
        }
    }

    /// Whether close has been observed
    pub fn is_closed(&self) -> bool {
        matches!(&*self.inner.on_close.lock(), CloseSlot::Closed(_))
    }

    pub fn id(&self) -> PathId {
        self.inner.id
    }

    pub fn kind(&self) -> PathKind {
        self.inner.kind
    }

    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.inner.endpoint
    }

    pub fn sender(&self) -> Option<Arc<dyn PathSender>> {
        self.inner.sender.clone()
    }
}

impl std::fmt::Debug for PathHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathHandle")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("endpoint", &self.inner.endpoint)
            .finish()
    }
}

struct RegistryInner {
    /// Paths per peer, kept sorted best-first by kind rank
    peers: HashMap<PeerAddress, Vec<PathHandle>>,
    super_peer: Option<PeerAddress>,
}

/// Registry of the best-known paths per peer
///
/// One reader/writer lock guards the whole map: writes are serialized, reads
/// run concurrently with each other, and every read reflects the most
/// recently committed write.
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
    events: EventSink,
}

impl ConnectionRegistry {
    pub fn new(events: EventSink) -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                peers: HashMap::new(),
                super_peer: None,
            }),
            events,
        }
    }

    /// Best path for a peer: loopback > direct session > super-peer fallback
    pub fn best_path(&self, peer: &PeerAddress) -> Option<PathHandle> {
        let inner = self.inner.read();
        if let Some(paths) = inner.peers.get(peer) {
            if let Some(best) = paths.first() {
                return Some(best.clone());
            }
        }
        // no direct entry: relay via the designated super peer, if any
        match inner.super_peer {
            Some(sp) if sp != *peer => inner.peers.get(&sp).and_then(|p| p.first()).cloned(),
            _ => None,
        }
    }

    /// Best explicitly installed path for a peer, never the super-peer
    /// fallback; used when forwarding on behalf of others must not loop
    pub fn known_path(&self, peer: &PeerAddress) -> Option<PathHandle> {
        self.inner
            .read()
            .peers
            .get(peer)
            .and_then(|paths| paths.first())
            .cloned()
    }

    /// Install a path for a peer
    ///
    /// Replace-on-conflict: an existing path of the same kind is closed with
    /// `Superseded` before the new one is committed, so at most one session
    /// of each kind exists per peer, stale sockets cannot leak across
    /// reconnects, and no reader ever sees old and new at once.
    pub fn add_path(&self, peer: PeerAddress, path: PathHandle) {
        let superseded = {
            let mut inner = self.inner.write();
            let paths = inner.peers.entry(peer).or_default();
            paths
                .iter()
                .position(|p| p.kind() == path.kind())
                .map(|i| paths.remove(i))
        };
        if let Some(old) = superseded {
            debug!("path for {} superseded by new session", peer);
            // close outside the lock and before committing the replacement:
            // the callback may re-enter the registry (remove_path), and no
            // reader may observe old and new at once
            old.close(PathCloseReason::Superseded);
        }

        let mut inner = self.inner.write();
        let paths = inner.peers.entry(peer).or_default();
        let at = paths
            .iter()
            .position(|p| p.kind().rank() > path.kind().rank())
            .unwrap_or(paths.len());
        paths.insert(at, path);
    }

    /// Remove a path, but only if it is identity-equal to the stored one
    ///
    /// Returns true if a path was removed. Dropping the last path for a peer
    /// emits `PeerUnreachable`.
    pub fn remove_path(&self, peer: &PeerAddress, id: PathId) -> bool {
        let (removed, unreachable) = {
            let mut inner = self.inner.write();
            let Some(paths) = inner.peers.get_mut(peer) else {
                return false;
            };
            let removed = paths
                .iter()
                .position(|p| p.id() == id)
                .map(|i| paths.remove(i))
                .is_some();
            let unreachable = removed && paths.is_empty();
            if unreachable {
                inner.peers.remove(peer);
            }
            (removed, unreachable)
        };
        if unreachable {
            emit(&self.events, NodeEvent::PeerUnreachable { peer: *peer });
        }
        removed
    }

    /// Close and remove every path, used on node shutdown
    pub fn close_all(&self) {
        let drained: Vec<(PeerAddress, Vec<PathHandle>)> =
            self.inner.write().peers.drain().collect();
        for (peer, paths) in drained {
            for path in paths {
                path.close(PathCloseReason::Shutdown);
            }
            emit(&self.events, NodeEvent::PeerUnreachable { peer });
        }
    }

    /// Designate the super peer used as relay fallback
    pub fn set_super_peer(&self, peer: PeerAddress) {
        self.inner.write().super_peer = Some(peer);
    }

    pub fn clear_super_peer(&self) {
        self.inner.write().super_peer = None;
    }

    pub fn super_peer(&self) -> Option<PeerAddress> {
        self.inner.read().super_peer
    }

    /// Number of peers with at least one path
    pub fn peer_count(&self) -> usize {
        self.inner.read().peers.len()
    }
}
