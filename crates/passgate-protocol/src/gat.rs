//! GAT protocol: binary, length-prefixed, LRC checked.
//!
//! Frame layout:
//!
//! ```text
//! +-----+-----+-----+----------+---------+-----+
//! | len | adr | cmd | [status] | payload | lrc |
//! +-----+-----+-----+----------+---------+-----+
//! ```
//!
//! `len` is a single byte counting itself through the payload (the LRC is
//! excluded). The status byte is present only when `cmd & 0x10 != 0`.
//! `lrc` is the XOR of every preceding byte. There is no start marker:
//! framing is validated through the length byte and the LRC, and a
//! mismatch resynchronises by one byte.

use crate::decode::{DecodeOutcome, lrc, skip_one};
use bytes::{Bytes, BytesMut};
use passgate_core::{Error, Result, Uid};

pub const CMD_REQ_MASTER: u8 = 0xE5;
pub const CMD_CARD_IDENT: u8 = 0x80;
pub const CMD_ACTION_STARTED: u8 = 0xA1;
pub const CMD_CANCEL: u8 = 0xC0;
pub const CMD_HOST_CONTROL: u8 = 0xCA;

/// UID field width in CARD_IDENT / ACTION_STARTED payloads.
const UID_FIELD_LEN: usize = 10;
/// Minimum value of the length byte: itself, address, command.
const MIN_PKT_LEN: usize = 3;

/// Terminal kind reported in REQ_MASTER and identification payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatTerminalKind {
    Info,
    Access,
    Time,
    Return,
    Cash,
    Unknown(u8),
}

impl GatTerminalKind {
    #[must_use]
    pub fn from_u8(v: u8) -> Self {
        match v {
            0x00 => GatTerminalKind::Info,
            0x01 => GatTerminalKind::Access,
            0x02 => GatTerminalKind::Time,
            0x03 => GatTerminalKind::Return,
            0x04 => GatTerminalKind::Cash,
            other => GatTerminalKind::Unknown(other),
        }
    }

    #[must_use]
    pub fn to_u8(self) -> u8 {
        match self {
            GatTerminalKind::Info => 0x00,
            GatTerminalKind::Access => 0x01,
            GatTerminalKind::Time => 0x02,
            GatTerminalKind::Return => 0x03,
            GatTerminalKind::Cash => 0x04,
            GatTerminalKind::Unknown(v) => v,
        }
    }
}

impl std::fmt::Display for GatTerminalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GatTerminalKind::Info => "INFO",
            GatTerminalKind::Access => "ACCESS",
            GatTerminalKind::Time => "TIME",
            GatTerminalKind::Return => "RETURN",
            GatTerminalKind::Cash => "CASH",
            GatTerminalKind::Unknown(v) => return write!(f, "UNKNOWN({v:#04X})"),
        };
        write!(f, "{s}")
    }
}

/// One decoded GAT frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatFrame {
    pub address: u8,
    pub cmd: u8,
    pub status: Option<u8>,
    pub payload: Bytes,
}

/// Commands the gateway understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatCommand {
    /// Ping; the payload names the terminal kind.
    ReqMaster { kind: GatTerminalKind },
    CardIdent {
        kind: GatTerminalKind,
        reader_type: u8,
        data_valid: bool,
        uid: Uid,
        /// TIME-kind terminals report a session time...
        time: Option<u16>,
        /// ...and a price
        price: Option<u32>,
    },
    ActionStarted {
        kind: GatTerminalKind,
        reader_type: u8,
        data_valid: bool,
        uid: Uid,
        access_result: Option<u8>,
        vendor: Option<u32>,
        price: Option<u32>,
        time: Option<u16>,
    },
    HostControl { control: u16 },
    Cancel,
    Other { cmd: u8, payload: Bytes },
}

/// One decoding step against the receive buffer.
pub fn decode_frame(buf: &mut BytesMut) -> DecodeOutcome<GatFrame> {
    if buf.len() < MIN_PKT_LEN + 1 {
        return DecodeOutcome::NeedMore(MIN_PKT_LEN + 1 - buf.len());
    }

    let pkt_len = buf[0] as usize;
    if pkt_len < MIN_PKT_LEN {
        skip_one(buf);
        return DecodeOutcome::Resync;
    }

    let total = pkt_len + 1; // + LRC
    if buf.len() < total {
        return DecodeOutcome::NeedMore(total - buf.len());
    }

    if lrc(&buf[..pkt_len]) != buf[pkt_len] {
        skip_one(buf);
        return DecodeOutcome::Resync;
    }

    let frame = buf.split_to(total);
    let cmd = frame[2];
    let has_status = cmd & 0x10 != 0;
    let payload_start = if has_status { 4 } else { 3 };
    if payload_start > pkt_len {
        // length byte too small to carry the status the command demands
        return DecodeOutcome::Resync;
    }

    DecodeOutcome::Frame(GatFrame {
        address: frame[1],
        cmd,
        status: has_status.then(|| frame[3]),
        payload: Bytes::copy_from_slice(&frame[payload_start..pkt_len]),
    })
}

/// Encode a frame with the given command, address and payload. The status
/// byte is emitted only for commands that carry one.
#[must_use]
pub fn encode_frame(cmd: u8, address: u8, status: u8, payload: &[u8]) -> Vec<u8> {
    let mut body = vec![address, cmd];
    if cmd & 0x10 != 0 {
        body.push(status);
    }
    body.extend_from_slice(payload);

    let pkt_len = (body.len() + 1) as u8;
    let mut out = Vec::with_capacity(body.len() + 2);
    out.push(pkt_len);
    out.extend_from_slice(&body);
    out.push(lrc(&out));
    out
}

/// REQ_MASTER (ping) frame.
#[must_use]
pub fn req_master_packet(address: u8, kind: GatTerminalKind) -> Vec<u8> {
    encode_frame(CMD_REQ_MASTER, address, 0, &[kind.to_u8()])
}

/// HOST_CONTROL frame with a little-endian control word.
#[must_use]
pub fn host_control_packet(address: u8, control: u16) -> Vec<u8> {
    encode_frame(CMD_HOST_CONTROL, address, 0, &control.to_le_bytes())
}

impl GatFrame {
    /// Interpret the frame's payload according to its command code.
    ///
    /// # Errors
    /// Returns a frame-kind error for payloads too short to carry the
    /// command's fields.
    pub fn command(&self) -> Result<GatCommand> {
        let p = &self.payload;
        match self.cmd {
            CMD_REQ_MASTER => Ok(GatCommand::ReqMaster {
                kind: GatTerminalKind::from_u8(p.first().copied().unwrap_or(0x01)),
            }),

            CMD_CARD_IDENT => {
                let (kind, reader_type, data_valid, uid, mut rest) = Self::parse_ident_head(p)?;
                let mut time = None;
                let mut price = None;
                if kind == GatTerminalKind::Time && rest.len() >= 6 {
                    time = Some(u16::from_le_bytes([rest[0], rest[1]]));
                    price = Some(u32::from_le_bytes([rest[2], rest[3], rest[4], rest[5]]));
                    rest = &rest[6..];
                }
                let _ = rest;
                Ok(GatCommand::CardIdent {
                    kind,
                    reader_type,
                    data_valid,
                    uid,
                    time,
                    price,
                })
            }

            CMD_ACTION_STARTED => {
                let (kind, reader_type, data_valid, uid, rest) = Self::parse_ident_head(p)?;
                let mut access_result = None;
                let mut vendor = None;
                let mut price = None;
                let mut time = None;
                match kind {
                    GatTerminalKind::Access if !rest.is_empty() => {
                        access_result = Some(rest[0]);
                    }
                    GatTerminalKind::Time if rest.len() >= 10 => {
                        vendor = Some(u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]));
                        price = Some(u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]));
                        time = Some(u16::from_le_bytes([rest[8], rest[9]]));
                    }
                    _ => {}
                }
                Ok(GatCommand::ActionStarted {
                    kind,
                    reader_type,
                    data_valid,
                    uid,
                    access_result,
                    vendor,
                    price,
                    time,
                })
            }

            CMD_HOST_CONTROL => {
                if p.len() < 2 {
                    return Err(Error::MalformedFrame("HostControl too short".into()));
                }
                Ok(GatCommand::HostControl {
                    control: u16::from_le_bytes([p[0], p[1]]),
                })
            }

            CMD_CANCEL => Ok(GatCommand::Cancel),

            other => Ok(GatCommand::Other {
                cmd: other,
                payload: self.payload.clone(),
            }),
        }
    }

    /// Common head of CARD_IDENT / ACTION_STARTED: kind, reader type,
    /// validity flag and a 10-byte zero-padded UID with trailing zeros
    /// trimmed.
    fn parse_ident_head(p: &[u8]) -> Result<(GatTerminalKind, u8, bool, Uid, &[u8])> {
        if p.len() < 3 + UID_FIELD_LEN {
            return Err(Error::MalformedFrame("identification payload too short".into()));
        }
        let kind = GatTerminalKind::from_u8(p[0]);
        let reader_type = p[1];
        let data_valid = p[2] != 0;

        let uid_field = &p[3..3 + UID_FIELD_LEN];
        let trimmed_len = uid_field
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |pos| pos + 1);
        if trimmed_len == 0 {
            return Err(Error::MalformedFrame("identification UID empty".into()));
        }

        Ok((
            kind,
            reader_type,
            data_valid,
            Uid::from_bytes(&uid_field[..trimmed_len])?,
            &p[3 + UID_FIELD_LEN..],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<GatFrame> {
        let mut buf = BytesMut::from(bytes);
        let mut frames = Vec::new();
        loop {
            match decode_frame(&mut buf) {
                DecodeOutcome::Frame(f) => frames.push(f),
                DecodeOutcome::NeedMore(_) => break,
                DecodeOutcome::Resync => continue,
                DecodeOutcome::Fatal(e) => panic!("fatal: {e}"),
            }
        }
        frames
    }

    #[test]
    fn test_req_master_roundtrip() {
        let wire = req_master_packet(0x7A, GatTerminalKind::Access);
        // len=4 (len+adr+cmd+payload), then LRC
        assert_eq!(wire[0], 4);
        assert_eq!(wire.len(), 5);

        let frames = decode_all(&wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].address, 0x7A);
        match frames[0].command().unwrap() {
            GatCommand::ReqMaster { kind } => assert_eq!(kind, GatTerminalKind::Access),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_resync_on_leading_garbage() {
        // a zero length byte cannot start a frame; the decoder skips it
        // and recovers the REQ_MASTER that follows
        let mut stream = vec![0x00];
        stream.extend(req_master_packet(0x7A, GatTerminalKind::Access));
        let frames = decode_all(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].cmd, CMD_REQ_MASTER);
    }

    #[test]
    fn test_resync_on_corruption() {
        let wire = req_master_packet(0x01, GatTerminalKind::Time);
        for i in 0..wire.len() {
            let mut corrupted = wire.clone();
            corrupted[i] ^= 0xFF;
            let mut buf = BytesMut::from(corrupted.as_slice());
            match decode_frame(&mut buf) {
                DecodeOutcome::Frame(f) => panic!("byte {i}: decoded {f:?} from corrupt frame"),
                DecodeOutcome::Resync => assert_eq!(buf.len(), corrupted.len() - 1),
                DecodeOutcome::NeedMore(_) => {} // corrupted length asks for more
                DecodeOutcome::Fatal(e) => panic!("fatal: {e}"),
            }
        }
    }

    #[test]
    fn test_card_ident_trims_uid_zeros() {
        let mut payload = vec![0x01, 0x01, 0x01]; // ACCESS, card reader, valid
        payload.extend_from_slice(&[0x04, 0xAE, 0xEC, 0xFA, 0x9B, 0, 0, 0, 0, 0]);
        let wire = encode_frame(CMD_CARD_IDENT, 0x15, 0, &payload);

        let frames = decode_all(&wire);
        match frames[0].command().unwrap() {
            GatCommand::CardIdent {
                kind, uid, time, ..
            } => {
                assert_eq!(kind, GatTerminalKind::Access);
                assert_eq!(uid.as_str(), "04AEECFA9B");
                assert_eq!(time, None);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_card_ident_time_kind_extras() {
        let mut payload = vec![0x02, 0x01, 0x01]; // TIME kind
        payload.extend_from_slice(&[0xAA, 0xBB, 0, 0, 0, 0, 0, 0, 0, 0]);
        payload.extend_from_slice(&30u16.to_le_bytes());
        payload.extend_from_slice(&15000u32.to_le_bytes());
        let wire = encode_frame(CMD_CARD_IDENT, 0x15, 0, &payload);

        let frames = decode_all(&wire);
        match frames[0].command().unwrap() {
            GatCommand::CardIdent {
                kind, time, price, ..
            } => {
                assert_eq!(kind, GatTerminalKind::Time);
                assert_eq!(time, Some(30));
                assert_eq!(price, Some(15000));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_status_byte_presence() {
        // 0xCA has bit 0x10 clear, 0xDA set
        let no_status = encode_frame(0xCA, 0x01, 0xEE, &[0x01, 0x00]);
        let frames = decode_all(&no_status);
        assert_eq!(frames[0].status, None);

        let with_status = encode_frame(0xDA, 0x01, 0xEE, &[0x01, 0x00]);
        let frames = decode_all(&with_status);
        assert_eq!(frames[0].status, Some(0xEE));
        assert_eq!(frames[0].payload.as_ref(), &[0x01, 0x00]);
    }

    #[test]
    fn test_partial_frame_needs_more() {
        let wire = req_master_packet(0x01, GatTerminalKind::Access);
        let mut buf = BytesMut::from(&wire[..2]);
        assert!(matches!(
            decode_frame(&mut buf),
            DecodeOutcome::NeedMore(_)
        ));
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_host_control_roundtrip() {
        let wire = host_control_packet(0x05, 0x0001);
        let frames = decode_all(&wire);
        match frames[0].command().unwrap() {
            GatCommand::HostControl { control } => assert_eq!(control, 1),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
