//! The shared decoding contract and checksum primitives.
//!
//! Each protocol exposes a `decode_frame(&mut BytesMut)` that performs one
//! decoding step against the connection's receive buffer:
//!
//! - `Frame(f)`: a complete frame was extracted; its bytes (and any
//!   garbage preceding it that the protocol discards) have been consumed.
//! - `NeedMore(n)`: nothing was consumed; at least `n` further bytes are
//!   required before another attempt is useful.
//! - `Resync`: the byte at the head of the buffer cannot start a valid
//!   frame (bad marker, bad length, bad checksum); exactly one byte has
//!   been consumed and the caller should retry.
//! - `Fatal(e)`: the stream is beyond single-byte recovery (e.g. the
//!   buffer cap was exceeded); the connection should be dropped.
//!
//! TCP gives no message boundaries: a single read may carry a partial
//! frame, several frames, or noise between frames. The contract above
//! lets the pool drive every protocol with the same loop.

use bytes::BytesMut;
use passgate_core::Error;

/// Result of one decoding step. See the module docs.
#[derive(Debug)]
pub enum DecodeOutcome<F> {
    Frame(F),
    NeedMore(usize),
    Resync,
    Fatal(Error),
}

/// CRC-8 with polynomial `0x31`, as used by POCKET frames.
#[must_use]
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0;
    for &b in data {
        crc ^= b;
        for _ in 0..8 {
            if crc & 0x80 != 0 {
                crc = (crc << 1) ^ 0x31;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Longitudinal redundancy check: XOR of all bytes, as used by GAT frames.
#[must_use]
pub fn lrc(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, &b| acc ^ b)
}

/// Tag-length-value helpers for POCKET interactive payloads.
pub mod tlv {
    /// Encode one TLV field. A tag with an empty value is emitted bare.
    #[must_use]
    pub fn encode(tag: u8, value: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        if !value.is_empty() {
            out.push(value.len() as u8);
            out.extend_from_slice(value);
        }
        out
    }

    /// Decode the TLV field at the head of `data`.
    /// Returns `(tag, value, consumed)`; `consumed` is 0 when the field
    /// is incomplete.
    #[must_use]
    pub fn decode(data: &[u8]) -> (u8, &[u8], usize) {
        if data.len() < 2 {
            return (data.first().copied().unwrap_or(0), &[], 0);
        }
        let tag = data[0];
        let len = data[1] as usize;
        if data.len() < 2 + len {
            return (tag, &[], 0);
        }
        (tag, &data[2..2 + len], 2 + len)
    }
}

/// Skip one byte at the head of the buffer (resync step).
pub(crate) fn skip_one(buf: &mut BytesMut) {
    if !buf.is_empty() {
        let _ = buf.split_to(1);
    }
}
