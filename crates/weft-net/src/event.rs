//! Node-level events
//!
//! Reachability and lifecycle notifications are fire-and-forget: producers
//! never block on a slow consumer.

use tokio::sync::mpsc;
use weft_core::PeerAddress;

/// Events emitted by the node core
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeEvent {
    /// The local endpoint is bound and active
    NodeUp { address: PeerAddress },
    /// The local endpoint has closed
    NodeDown { address: PeerAddress },
    /// A session with a peer was established
    PeerOnline { peer: PeerAddress },
    /// The last known path to a peer was removed
    PeerUnreachable { peer: PeerAddress },
    /// An inbound message was dropped due to backpressure
    MessageDropped { peer: PeerAddress },
}

/// Fire-and-forget event sink
pub type EventSink = mpsc::UnboundedSender<NodeEvent>;

/// Create an event channel
pub fn event_channel() -> (EventSink, mpsc::UnboundedReceiver<NodeEvent>) {
    mpsc::unbounded_channel()
}

/// Emit an event, ignoring a disconnected sink
pub fn emit(sink: &EventSink, event: NodeEvent) {
    let _ = sink.send(event);
}
