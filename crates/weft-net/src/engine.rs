//! Native engine binding
//!
//! Optional C ABI binding to an embedded overlay engine, for hosts that ship
//! the engine as a shared library instead of running the UDP stack in
//! process. The engine addresses traffic by peer, not socket: receives yield
//! `(sender, payload)` pairs that are fed into the multiplexer through
//! [`Multiplexer::inject_inbound`](crate::mux::Multiplexer::inject_inbound).
//!
//! Any negative result code from the engine is unrecoverable for that
//! handle; the handle is freed exactly once, on close or drop, whichever
//! comes first.

use bytes::Bytes;
use parking_lot::Mutex;
use std::ffi::c_void;
use thiserror::Error;
use tracing::{debug, warn};
use weft_core::PeerAddress;

/// Engine errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The engine reported a negative result code; the handle is unusable
    #[error("engine call {op} failed with code {code}")]
    UnexpectedResultCode { op: &'static str, code: i64 },
    #[error("engine closed")]
    Closed,
}

mod ffi {
    use std::ffi::c_void;
    use std::os::raw::c_int;

    extern "C" {
        /// Returns a handle, or null on failure
        pub fn weft_engine_create(
            network_id: i32,
            secret_key: *const u8,
            proof_of_work: i64,
            bind_addr: *const u8,
            bind_addr_len: usize,
        ) -> *mut c_void;

        /// Returns 0 on success, negative on failure
        pub fn weft_engine_send(
            handle: *mut c_void,
            recipient: *const u8,
            payload: *const u8,
            payload_len: usize,
        ) -> c_int;

        /// Returns the payload length, 0 when nothing is pending, negative
        /// on failure; fills `sender` with the 32-byte origin address
        pub fn weft_engine_recv(
            handle: *mut c_void,
            sender: *mut u8,
            buf: *mut u8,
            buf_len: usize,
        ) -> isize;

        /// Returns the number of known peers, negative on failure
        pub fn weft_engine_peer_count(handle: *mut c_void) -> c_int;

        /// Returns 0 on success, negative on failure
        pub fn weft_engine_free(handle: *mut c_void) -> c_int;
    }
}

/// Interpret an engine result code; negative is always fatal
fn check(op: &'static str, code: i64) -> Result<i64, EngineError> {
    if code < 0 {
        return Err(EngineError::UnexpectedResultCode { op, code });
    }
    Ok(code)
}

/// Sole owner of one engine handle
///
/// The raw pointer never leaves this struct. The guard frees it exactly
/// once: explicitly via [`Engine::close`] or implicitly on drop.
struct EngineHandle(*mut c_void);

// the engine is documented thread-safe per handle
unsafe impl Send for EngineHandle {}

/// Settings for creating an engine
#[derive(Clone, Debug)]
pub struct EngineOptions {
    pub network_id: i32,
    pub secret_key: [u8; 32],
    pub proof_of_work: i64,
    pub bind_addr: String,
    /// Receive buffer size per call
    pub recv_buf_len: usize,
}

/// Safe wrapper around a native engine instance
pub struct Engine {
    handle: Mutex<Option<EngineHandle>>,
    recv_buf_len: usize,
}

impl Engine {
    /// Create and bind an engine instance
    pub fn create(options: &EngineOptions) -> Result<Self, EngineError> {
        let handle = unsafe {
            ffi::weft_engine_create(
                options.network_id,
                options.secret_key.as_ptr(),
                options.proof_of_work,
                options.bind_addr.as_ptr(),
                options.bind_addr.len(),
            )
        };
        if handle.is_null() {
            return Err(EngineError::UnexpectedResultCode {
                op: "create",
                code: -1,
            });
        }
        debug!("native engine bound to {}", options.bind_addr);
        Ok(Self {
            handle: Mutex::new(Some(EngineHandle(handle))),
            recv_buf_len: options.recv_buf_len,
        })
    }

    fn with_handle<T>(
        &self,
        f: impl FnOnce(*mut c_void) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let guard = self.handle.lock();
        let handle = guard.as_ref().ok_or(EngineError::Closed)?;
        f(handle.0)
    }

    /// Send a payload to a peer
    pub fn send_to(&self, recipient: &PeerAddress, payload: &[u8]) -> Result<(), EngineError> {
        self.with_handle(|handle| {
            let code = unsafe {
                ffi::weft_engine_send(
                    handle,
                    recipient.as_bytes().as_ptr(),
                    payload.as_ptr(),
                    payload.len(),
                )
            };
            check("send", code as i64).map(|_| ())
        })
    }

    /// Receive one pending message, already attributed to its sender
    ///
    /// `Ok(None)` means nothing is pending right now.
    pub fn recv(&self) -> Result<Option<(PeerAddress, Bytes)>, EngineError> {
        self.with_handle(|handle| {
            let mut sender = [0u8; 32];
            let mut buf = vec![0u8; self.recv_buf_len];
            let code = unsafe {
                ffi::weft_engine_recv(handle, sender.as_mut_ptr(), buf.as_mut_ptr(), buf.len())
            };
            let len = check("recv", code as i64)? as usize;
            if len == 0 {
                return Ok(None);
            }
            buf.truncate(len);
            Ok(Some((PeerAddress(sender), Bytes::from(buf))))
        })
    }

    /// Number of peers the engine currently knows
    pub fn peer_count(&self) -> Result<usize, EngineError> {
        self.with_handle(|handle| {
            let code = unsafe { ffi::weft_engine_peer_count(handle) };
            check("peer_count", code as i64).map(|n| n as usize)
        })
    }

    /// Whether the handle has been released
    pub fn is_closed(&self) -> bool {
        self.handle.lock().is_none()
    }

    /// Release the engine handle; later calls fail with `Closed`
    pub fn close(&self) -> Result<(), EngineError> {
        let Some(handle) = self.handle.lock().take() else {
            return Ok(());
        };
        let code = unsafe { ffi::weft_engine_free(handle.0) };
        // the handle is gone either way, surface the code for diagnostics
        check("free", code as i64).map(|_| ())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("engine free on drop failed: {}", e);
        }
    }
}
