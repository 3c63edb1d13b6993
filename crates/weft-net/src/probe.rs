//! Liveness probe codec
//!
//! Probes measure whether a path still answers. A probe frame is a fixed
//! magic prefix, a big-endian sequence number, and padding bytes that exist
//! only to exercise the path; the padding is discarded on decode. Anything
//! that does not start with the magic passes through untouched so probes
//! can share a stream with regular traffic.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Marker prefix distinguishing probe frames from passenger traffic
pub const PROBE_MAGIC: [u8; 8] = [20, 21, 1, 23, 0, 1, 38, 16];

/// Length of magic plus sequence number
const PROBE_HEADER_LEN: usize = PROBE_MAGIC.len() + 8;

/// Codec errors
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One liveness probe
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Probe {
    pub sequence: u64,
}

/// Decoded item: a probe or a frame that is not ours
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeItem {
    Probe(Probe),
    /// Not a probe; forwarded unchanged
    PassThrough(Bytes),
}

/// Encoder/decoder for probe frames over a datagram stream
///
/// `payload_len` padding bytes are appended to each encoded probe and
/// stripped on decode.
#[derive(Clone, Copy, Debug)]
pub struct ProbeCodec {
    payload_len: usize,
}

impl ProbeCodec {
    pub fn new(payload_len: usize) -> Self {
        Self { payload_len }
    }
}

impl Default for ProbeCodec {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Decoder for ProbeCodec {
    type Item = ProbeItem;
    type Error = ProbeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        // a buffer too short to carry the magic, or carrying something
        // else, is passenger traffic and is forwarded unmodified
        if src.len() < PROBE_MAGIC.len() || src[..PROBE_MAGIC.len()] != PROBE_MAGIC {
            return Ok(Some(ProbeItem::PassThrough(src.split().freeze())));
        }
        // magic seen but the sequence number is still in flight
        if src.len() < PROBE_HEADER_LEN {
            return Ok(None);
        }

        src.advance(PROBE_MAGIC.len());
        let sequence = src.get_u64();
        // the padding carried no information
        src.clear();
        Ok(Some(ProbeItem::Probe(Probe { sequence })))
    }
}

impl Encoder<Probe> for ProbeCodec {
    type Error = ProbeError;

    fn encode(&mut self, probe: Probe, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(PROBE_HEADER_LEN + self.payload_len);
        dst.put_slice(&PROBE_MAGIC);
        dst.put_u64(probe.sequence);
        dst.put_bytes(0, self.payload_len);
        Ok(())
    }
}
