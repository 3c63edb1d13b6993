//! Networking primitives for the weft overlay
//!
//! This crate provides:
//! - The physical transport binding (UDP or a native engine)
//! - The connection registry mapping peers to their best path
//! - Per-peer virtual channels multiplexed over one endpoint
//! - The join/welcome/confirm session handshake
//! - The probe measurement codec

pub mod channel;
#[cfg(feature = "native-engine")]
pub mod engine;
pub mod event;
pub mod handshake;
pub mod mux;
pub mod probe;
pub mod registry;
pub mod transport;

pub use channel::{ChannelError, ChannelState, VirtualChannel};
#[cfg(feature = "native-engine")]
pub use engine::{Engine, EngineError, EngineOptions};
pub use event::NodeEvent;
pub use handshake::{HandshakeError, HandshakeService, RetrySchedule};
pub use mux::{LoopbackRegistry, Multiplexer, MuxConfig, MuxError};
pub use probe::{Probe, ProbeCodec};
pub use registry::{ConnectionRegistry, PathHandle, PathKind};
pub use transport::{TransportBinding, TransportError, UdpBinding};
