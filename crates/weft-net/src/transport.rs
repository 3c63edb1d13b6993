//! Physical transport binding
//!
//! Owns the single datagram socket for one node. All logical channels of a
//! multiplexer share this one binding; it is created once on bind and
//! released exactly once on close.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::debug;

/// Default UDP payload budget (1500 ethernet MTU minus IP/UDP headers)
pub const DEFAULT_MTU: usize = 1472;

/// Default receive buffer capacity, in messages
pub const DEFAULT_RECV_BUFFER_MSGS: usize = 64;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bind failed for {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("transport not writable")]
    NotWritable,
    #[error("transport closed")]
    Closed,
    #[error("message of {len} bytes exceeds mtu of {mtu}")]
    MessageTooLarge { len: usize, mtu: usize },
}

/// Counters kept by a transport binding
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub send_errors: u64,
}

/// The physical send/receive primitive shared by all virtual channels
///
/// `try_recv_from` and `try_send_to` never block; readiness is awaited
/// separately so the caller controls its own drain loop.
#[async_trait]
pub trait TransportBinding: Send + Sync {
    /// Non-blocking receive; `Ok(None)` means the socket is drained
    fn try_recv_from(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, TransportError>;

    /// Non-blocking fire-and-forget send; `NotWritable` signals backpressure
    fn try_send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<(), TransportError>;

    /// Wait until a receive may succeed
    async fn readable(&self) -> Result<(), TransportError>;

    /// Wait until a send may succeed (the writability-changed signal)
    async fn writable(&self) -> Result<(), TransportError>;

    /// Bound local address
    fn local_addr(&self) -> Result<SocketAddr, TransportError>;

    /// Maximum outbound message size callers must respect
    fn mtu(&self) -> usize;

    /// Release the underlying resource; only the first call has an effect
    fn close(&self);

    /// Whether the binding has been closed
    fn is_closed(&self) -> bool;

    /// Current counters
    fn stats(&self) -> TransportStats;
}

/// UDP-backed transport binding
#[derive(Debug)]
pub struct UdpBinding {
    /// Taken out exactly once on close; `None` means closed
    socket: Mutex<Option<Arc<UdpSocket>>>,
    local_addr: SocketAddr,
    mtu: usize,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    send_errors: AtomicU64,
}

impl UdpBinding {
    /// Bind to the given address
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| TransportError::BindFailed { addr, source })?;
        let local_addr = socket.local_addr()?;
        debug!("udp transport bound to {}", local_addr);

        Ok(Self {
            socket: Mutex::new(Some(Arc::new(socket))),
            local_addr,
            mtu: DEFAULT_MTU,
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
        })
    }

    fn socket(&self) -> Result<Arc<UdpSocket>, TransportError> {
        self.socket.lock().clone().ok_or(TransportError::Closed)
    }
}

#[async_trait]
impl TransportBinding for UdpBinding {
    fn try_recv_from(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, TransportError> {
        let socket = self.socket()?;
        match socket.try_recv_from(buf) {
            Ok((len, addr)) => {
                self.packets_received.fetch_add(1, Ordering::Relaxed);
                Ok(Some((len, addr)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn try_send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<(), TransportError> {
        if buf.len() > self.mtu {
            return Err(TransportError::MessageTooLarge {
                len: buf.len(),
                mtu: self.mtu,
            });
        }
        let socket = self.socket()?;
        match socket.try_send_to(buf, addr) {
            Ok(_) => {
                self.packets_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                Err(TransportError::NotWritable)
            }
            Err(e) => {
                self.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }

    async fn readable(&self) -> Result<(), TransportError> {
        let socket = self.socket()?;
        socket.readable().await?;
        Ok(())
    }

    async fn writable(&self) -> Result<(), TransportError> {
        let socket = self.socket()?;
        socket.writable().await?;
        Ok(())
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(self.local_addr)
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn close(&self) {
        if self.socket.lock().take().is_some() {
            debug!("udp transport {} closed", self.local_addr);
        }
    }

    fn is_closed(&self) -> bool {
        self.socket.lock().is_none()
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_and_local_addr() {
        let binding = UdpBinding::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = binding.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_failure_carries_cause() {
        // a non-local address cannot be bound
        let err = UdpBinding::bind("192.0.2.1:9".parse().unwrap())
            .await
            .unwrap_err();
        // the underlying os error survives for diagnostics
        assert!(std::error::Error::source(&err).is_some());
        let TransportError::BindFailed { addr, .. } = err else {
            panic!("expected BindFailed, got {err}");
        };
        assert_eq!(addr, "192.0.2.1:9".parse().unwrap());
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let a = UdpBinding::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = UdpBinding::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        // try_send_to may report NotWritable until readiness is registered
        a.writable().await.unwrap();
        a.try_send_to(b"hello", b.local_addr().unwrap()).unwrap();

        b.readable().await.unwrap();
        let mut buf = [0u8; 64];
        let (len, from) = b.try_recv_from(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(from, a.local_addr().unwrap());

        assert_eq!(a.stats().packets_sent, 1);
        assert_eq!(b.stats().packets_received, 1);
    }

    #[tokio::test]
    async fn test_recv_empty_when_drained() {
        let binding = UdpBinding::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut buf = [0u8; 64];
        assert!(binding.try_recv_from(&mut buf).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mtu_enforced() {
        let binding = UdpBinding::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let oversized = vec![0u8; DEFAULT_MTU + 1];
        let err = binding
            .try_send_to(&oversized, "127.0.0.1:9".parse().unwrap())
            .unwrap_err();
        assert!(matches!(err, TransportError::MessageTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_close_guards_further_use() {
        let binding = UdpBinding::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        binding.close();
        assert!(binding.is_closed());

        let mut buf = [0u8; 16];
        assert!(matches!(
            binding.try_recv_from(&mut buf),
            Err(TransportError::Closed)
        ));
        assert!(matches!(
            binding.try_send_to(b"x", "127.0.0.1:9".parse().unwrap()),
            Err(TransportError::Closed)
        ));

        // second close is a no-op
        binding.close();
        assert!(binding.is_closed());
    }
}
