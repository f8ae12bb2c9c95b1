//! Wire-protocol codecs for the four terminal families.
//!
//! All four decoders share one contract over an append-only receive
//! buffer: see [`DecodeOutcome`]. Encoders emit ready-to-write byte
//! vectors.

pub mod decode;
pub mod gat;
pub mod jsp;
pub mod pocket;
pub mod sphinx;

pub use decode::{DecodeOutcome, crc8, lrc, tlv};
