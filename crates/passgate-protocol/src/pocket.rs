//! POCKET protocol: binary, length-prefixed, CRC-8 checked.
//!
//! Frame layout:
//!
//! ```text
//! +--------+-------+-----+-----------+-----------+---------+
//! | 0x2A   | flags | cmd | len (LE)  | crc (LE)  | payload |
//! | 1 byte | 1     | 1   | 2         | 2         | len     |
//! +--------+-------+-----+-----------+-----------+---------+
//! ```
//!
//! Only the low checksum byte carries a CRC-8 (polynomial 0x31) over the
//! first five header bytes concatenated with the payload. Any marker,
//! bounds or checksum mismatch resynchronises the stream by one byte.

use crate::decode::{DecodeOutcome, crc8, skip_one, tlv};
use bytes::{Bytes, BytesMut};
use passgate_core::{Error, LockerInfo, Result, Uid, constants::MAX_FRAME_SIZE};

pub const MARKER: u8 = 0x2A;
pub const HEADER_LEN: usize = 7;

// Command codes handled by the gateway
pub const CMD_READ_TAG: u8 = 0x02;
pub const CMD_READ_TAG_EXT: u8 = 0x03;
pub const CMD_ENQUIRE: u8 = 0x06;
pub const CMD_SIGNAL: u8 = 0x08;
pub const CMD_INTERACTIVE: u8 = 0x0A;
pub const CMD_RELAY_CONTROL_EX: u8 = 0x15;
pub const CMD_INPUT_CHANGED: u8 = 0x16;
pub const CMD_ENQUIRE_RESPONSE: u8 = 0x86;

// Interactive TLV tags
pub const TAG_DELAY: u8 = 0x00;
pub const TAG_SOUND: u8 = 0x01;
pub const TAG_TEXT: u8 = 0x03;
pub const TAG_WAITING: u8 = 0x04;

// Sound types
pub const SOUND_BEEP: u8 = 0x00;
pub const SOUND_QUACK: u8 = 0x01;

// Relay flags
pub const RELAY_FLAG_DOWNCOUNT: u8 = 0x01;
pub const RELAY_FLAG_ZSECOND: u8 = 0x02;
pub const RELAY_FLAG_TAKE_CARD: u8 = 0x04;
pub const RELAY_FLAG_GATE_TRANSFER: u8 = 0x08;

// Signal subcodes
pub const SIGNAL_LOCKED: u8 = 0x01;
pub const SIGNAL_UNLOCKED: u8 = 0x02;

// Frame flag for the main reader
pub const FLAGS_RT_MAIN: u8 = 0x10;
pub const FLAGS_RT_USART: u8 = 0x01;

pub const RELAY_UID_MAX_LEN: usize = 32;
const CAPTION_MAX: usize = 96;
const CAPTION_MAX_DOWNCOUNT: usize = 16;

/// One decoded POCKET frame, command not yet interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PocketFrame {
    pub flags: u8,
    pub cmd: u8,
    pub payload: Bytes,
}

/// Commands the gateway understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PocketCommand {
    ReadTag {
        reader_type: u8,
        reader_flags: u8,
        uid: Uid,
    },
    ReadTagExtended {
        uid: Uid,
        finger_score: Option<i16>,
        lockers: Vec<LockerInfo>,
        auth: bool,
        last_sector_auth: bool,
        passtech_auth: bool,
        temp_card: bool,
        fast_react: bool,
    },
    RelayControlEx {
        on_time_ms: u32,
        flags: u8,
        uid: String,
        caption: String,
    },
    Enquire,
    EnquireResponse,
    Interactive(Bytes),
    InputChanged {
        input_state: u16,
        passed: bool,
    },
    Other {
        cmd: u8,
        payload: Bytes,
    },
}

/// One decoding step against the receive buffer.
pub fn decode_frame(buf: &mut BytesMut) -> DecodeOutcome<PocketFrame> {
    if buf.len() < HEADER_LEN {
        return DecodeOutcome::NeedMore(HEADER_LEN - buf.len());
    }

    if buf[0] != MARKER {
        skip_one(buf);
        return DecodeOutcome::Resync;
    }

    let payload_len = u16::from_le_bytes([buf[3], buf[4]]) as usize;
    let total = HEADER_LEN + payload_len;
    if total > MAX_FRAME_SIZE {
        skip_one(buf);
        return DecodeOutcome::Resync;
    }
    if buf.len() < total {
        return DecodeOutcome::NeedMore(total - buf.len());
    }

    let mut check = Vec::with_capacity(5 + payload_len);
    check.extend_from_slice(&buf[..5]);
    check.extend_from_slice(&buf[HEADER_LEN..total]);
    if crc8(&check) != buf[5] {
        skip_one(buf);
        return DecodeOutcome::Resync;
    }

    let frame = buf.split_to(total);
    DecodeOutcome::Frame(PocketFrame {
        flags: frame[1],
        cmd: frame[2],
        payload: Bytes::copy_from_slice(&frame[HEADER_LEN..]),
    })
}

/// Encode a frame with the given command, flags and payload.
#[must_use]
pub fn encode_frame(cmd: u8, flags: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u16;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(MARKER);
    out.push(flags);
    out.push(cmd);
    out.extend_from_slice(&len.to_le_bytes());
    out.push(0); // crc lo placeholder
    out.push(0); // crc hi, unused
    out.extend_from_slice(payload);

    let mut check = Vec::with_capacity(5 + payload.len());
    check.extend_from_slice(&out[..5]);
    check.extend_from_slice(payload);
    out[5] = crc8(&check);
    out
}

impl PocketFrame {
    /// Interpret the frame's payload according to its command code.
    ///
    /// # Errors
    /// Returns a frame-kind error for payloads too short to carry the
    /// command's fields.
    pub fn command(&self) -> Result<PocketCommand> {
        let p = &self.payload;
        match self.cmd {
            CMD_READ_TAG => {
                if p.len() < 3 {
                    return Err(Error::MalformedFrame("ReadTag payload too short".into()));
                }
                let uid_len = p[2] as usize;
                if p.len() < 3 + uid_len || uid_len == 0 {
                    return Err(Error::MalformedFrame("ReadTag UID truncated".into()));
                }
                Ok(PocketCommand::ReadTag {
                    reader_type: p[0],
                    reader_flags: p[1],
                    uid: Uid::from_bytes(&p[3..3 + uid_len])?,
                })
            }

            CMD_READ_TAG_EXT => self.parse_read_tag_extended(),

            CMD_RELAY_CONTROL_EX => {
                if p.len() < 6 {
                    return Err(Error::MalformedFrame("RelayControlEx too short".into()));
                }
                let on_time_ms = u32::from_le_bytes([p[0], p[1], p[2], p[3]]);
                let flags = p[4];
                let uid_len = (p[5] as usize).min(p.len() - 6);
                let uid = String::from_utf8_lossy(&p[6..6 + uid_len]).into_owned();
                let caption = String::from_utf8_lossy(&p[6 + uid_len..]).into_owned();
                Ok(PocketCommand::RelayControlEx {
                    on_time_ms,
                    flags,
                    uid,
                    caption,
                })
            }

            CMD_ENQUIRE => Ok(PocketCommand::Enquire),
            CMD_ENQUIRE_RESPONSE => Ok(PocketCommand::EnquireResponse),
            CMD_INTERACTIVE => Ok(PocketCommand::Interactive(self.payload.clone())),

            CMD_INPUT_CHANGED => {
                if p.len() < 2 {
                    return Err(Error::MalformedFrame("InputChanged too short".into()));
                }
                let input_state = u16::from_le_bytes([p[0], p[1]]);
                Ok(PocketCommand::InputChanged {
                    input_state,
                    passed: input_state & 0x01 != 0,
                })
            }

            other => Ok(PocketCommand::Other {
                cmd: other,
                payload: self.payload.clone(),
            }),
        }
    }

    fn parse_read_tag_extended(&self) -> Result<PocketCommand> {
        let p = &self.payload;
        if p.len() < 5 {
            return Err(Error::MalformedFrame("ReadTagExtended too short".into()));
        }

        let mut offset = 0usize;
        let uid_len = p[offset] as usize;
        offset += 1;
        if uid_len == 0 || offset + uid_len > p.len() {
            return Err(Error::MalformedFrame("ReadTagExtended UID truncated".into()));
        }
        let uid = Uid::from_bytes(&p[offset..offset + uid_len])?;
        offset += uid_len;

        let finger_score = if offset + 2 <= p.len() {
            let raw = u16::from_le_bytes([p[offset], p[offset + 1]]);
            offset += 2;
            Some(raw as i16)
        } else {
            None
        };

        let mut lockers = Vec::new();
        while offset + 4 <= p.len() {
            let err = p[offset];
            let bno = p[offset + 1];
            let cab = u16::from_le_bytes([p[offset + 2], p[offset + 3]]);
            offset += 4;

            let is_passtech = bno & 0x80 != 0;
            let block_no = if is_passtech { bno & 0x7F } else { bno };
            lockers.push(LockerInfo {
                auth_err: (err >> 4) & 0x0F,
                read_err: err & 0x0F,
                is_passtech,
                block_no,
                litera: if is_passtech {
                    LockerInfo::block_letter(block_no)
                } else {
                    '-'
                },
                locked: cab & 0x8000 != 0,
                cab_no: cab & 0x7FFF,
            });
        }

        let auth = lockers
            .first()
            .map(|l| l.auth_err == 0 && l.read_err == 0)
            .unwrap_or(false);

        Ok(PocketCommand::ReadTagExtended {
            uid,
            finger_score,
            lockers,
            auth,
            last_sector_auth: self.cmd & 0x01 != 0,
            passtech_auth: self.cmd & 0x02 != 0,
            temp_card: self.cmd & 0x04 != 0,
            fast_react: self.cmd & 0x08 != 0,
        })
    }
}

/// Display sound pattern for interactive messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundPattern {
    None,
    Beep,
    Quack,
    BeepBeep,
    QuackQuack,
}

/// Text field TLV.
#[must_use]
pub fn interactive_text(text: &str) -> Vec<u8> {
    tlv::encode(TAG_TEXT, text.as_bytes())
}

/// Delay field TLV, milliseconds.
#[must_use]
pub fn interactive_delay(ms: u16) -> Vec<u8> {
    tlv::encode(TAG_DELAY, &ms.to_le_bytes())
}

/// Waiting field TLV. The hourglass byte is followed by the
/// wait-till-removed byte only when either is set.
#[must_use]
pub fn interactive_waiting(delay_ms: u16, hourglass: bool, wait_till_removed: bool) -> Vec<u8> {
    let mut val = delay_ms.to_le_bytes().to_vec();
    let dhg = u8::from(hourglass);
    val.push(dhg);
    if dhg > 0 || wait_till_removed {
        val.push(u8::from(wait_till_removed));
    }
    tlv::encode(TAG_WAITING, &val)
}

/// Sound field TLV with an optional trailing delay.
#[must_use]
pub fn interactive_sound(
    sound_type: u8,
    freq: u16,
    mut length_ms: u16,
    volume: u8,
    mut end_delay: u16,
) -> Vec<u8> {
    if end_delay > length_ms {
        end_delay = 0;
    }
    if end_delay > 0 {
        length_ms -= end_delay;
    }

    let val = [
        sound_type,
        (freq & 0xFF) as u8,
        (freq >> 8) as u8,
        (length_ms & 0xFF) as u8,
        (length_ms >> 8) as u8,
        volume,
    ];
    let mut out = tlv::encode(TAG_SOUND, &val);
    if end_delay > 0 {
        out.extend_from_slice(&interactive_delay(end_delay));
    }
    out
}

/// Full interactive payload: text, sound pattern, optional waiting.
#[must_use]
pub fn interactive(text: &str, display_ms: u16, sound: SoundPattern, till_removed: bool) -> Vec<u8> {
    let mut out = interactive_text(text);
    let volume = 0xFF;

    match sound {
        SoundPattern::None => {}
        SoundPattern::Beep => out.extend(interactive_sound(SOUND_BEEP, 4000, 150, volume, 50)),
        SoundPattern::Quack => out.extend(interactive_sound(SOUND_QUACK, 4000, 150, volume, 50)),
        SoundPattern::BeepBeep => {
            out.extend(interactive_sound(SOUND_BEEP, 4000, 100, volume, 50));
            out.extend(interactive_sound(SOUND_BEEP, 4000, 100, volume, 50));
        }
        SoundPattern::QuackQuack => {
            out.extend(interactive_sound(SOUND_QUACK, 4000, 100, volume, 50));
            out.extend(interactive_sound(SOUND_QUACK, 4000, 150, volume, 50));
        }
    }

    if display_ms > 0 || till_removed {
        out.extend(interactive_waiting(display_ms, false, till_removed));
    }

    out
}

/// Complete interactive frame ready for the wire.
#[must_use]
pub fn interactive_packet(
    text: &str,
    display_ms: u16,
    sound: SoundPattern,
    till_removed: bool,
    flags: u8,
) -> Vec<u8> {
    encode_frame(
        CMD_INTERACTIVE,
        flags,
        &interactive(text, display_ms, sound, till_removed),
    )
}

/// Lock the terminal: waiting hourglass with optional text.
#[must_use]
pub fn lock_packet(text: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    if !text.is_empty() {
        payload.extend(interactive_text(text));
    }
    payload.extend(interactive_waiting(1500, true, false));
    encode_frame(CMD_INTERACTIVE, FLAGS_RT_MAIN, &payload)
}

/// Clear the waiting display.
#[must_use]
pub fn unlock_packet() -> Vec<u8> {
    encode_frame(
        CMD_INTERACTIVE,
        FLAGS_RT_MAIN,
        &interactive_waiting(0, false, false),
    )
}

/// Enquire (ping) frame, empty payload.
#[must_use]
pub fn enquire_packet() -> Vec<u8> {
    encode_frame(CMD_ENQUIRE, 0x00, &[])
}

/// RelayControlEx frame opening (or, with `on_time_ms == 0`, closing)
/// the relay. Captions are truncated to 96 bytes, 16 when counting down.
#[must_use]
pub fn relay_packet(on_time_ms: u32, relay_flags: u8, uid: &str, caption: &str) -> Vec<u8> {
    let mut payload = Vec::new();

    if on_time_ms > 0x0FFF_FFFF {
        payload.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
    } else {
        payload.extend_from_slice(&on_time_ms.to_le_bytes());
    }
    payload.push(relay_flags);

    let uid_bytes = &uid.as_bytes()[..uid.len().min(RELAY_UID_MAX_LEN)];
    payload.push(uid_bytes.len() as u8);
    payload.extend_from_slice(uid_bytes);

    if !caption.is_empty() {
        let max = if relay_flags & RELAY_FLAG_DOWNCOUNT != 0 {
            CAPTION_MAX_DOWNCOUNT
        } else {
            CAPTION_MAX
        };
        payload.extend_from_slice(truncate_utf8(caption, max).as_bytes());
    }

    encode_frame(CMD_RELAY_CONTROL_EX, 0x00, &payload)
}

/// Close the relay.
#[must_use]
pub fn relay_close_packet() -> Vec<u8> {
    relay_packet(0, 0, "", "")
}

/// Signal frame (card-capture and lock indications): subcode plus a
/// little-endian millisecond timeout.
#[must_use]
pub fn signal_packet(subcode: u8, timeout_ms: u32) -> Vec<u8> {
    let mut payload = vec![subcode, 0x00];
    payload.extend_from_slice(&timeout_ms.to_le_bytes());
    encode_frame(CMD_SIGNAL, FLAGS_RT_USART, &payload)
}

/// Truncate to at most `max` bytes without splitting a UTF-8 sequence.
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<PocketFrame> {
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
    fn test_read_tag_roundtrip() {
        // reader_type=1, flags=0, 5-byte UID
        let payload = [0x01, 0x00, 0x05, 0x04, 0xAE, 0xEC, 0xFA, 0x9B];
        let wire = encode_frame(CMD_READ_TAG, 0x00, &payload);

        let frames = decode_all(&wire);
        assert_eq!(frames.len(), 1);
        match frames[0].command().unwrap() {
            PocketCommand::ReadTag {
                reader_type, uid, ..
            } => {
                assert_eq!(reader_type, 1);
                assert_eq!(uid.as_str(), "04AEECFA9B");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_corrupted_byte_resyncs() {
        let payload = [0x01, 0x00, 0x05, 0x04, 0xAE, 0xEC, 0xFA, 0x9B];
        let wire = encode_frame(CMD_READ_TAG, 0x00, &payload);

        for i in 0..wire.len() {
            if i == 6 {
                continue; // the high checksum byte is not covered by the CRC
            }
            let mut corrupted = wire.clone();
            corrupted[i] ^= 0xFF;
            let mut buf = BytesMut::from(corrupted.as_slice());
            // first decoding attempt must not yield a frame
            match decode_frame(&mut buf) {
                DecodeOutcome::Frame(f) => panic!("byte {i}: decoded {f:?} from corrupt frame"),
                DecodeOutcome::Resync => assert_eq!(buf.len(), corrupted.len() - 1),
                DecodeOutcome::NeedMore(_) => {} // corrupted length field asks for more
                DecodeOutcome::Fatal(e) => panic!("fatal: {e}"),
            }
        }
    }

    #[test]
    fn test_frame_embedded_in_garbage() {
        let payload = [0x01, 0x00, 0x05, 0x04, 0xAE, 0xEC, 0xFA, 0x9B];
        let wire = encode_frame(CMD_READ_TAG, 0x00, &payload);

        let mut stream = vec![0x00, 0x13, 0x37];
        stream.extend_from_slice(&wire);
        let frames = decode_all(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].cmd, CMD_READ_TAG);
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let mut stream = enquire_packet();
        stream.extend(enquire_packet());
        let frames = decode_all(&stream);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.cmd == CMD_ENQUIRE));
    }

    #[test]
    fn test_partial_frame_needs_more() {
        let wire = enquire_packet();
        let mut buf = BytesMut::from(&wire[..4]);
        match decode_frame(&mut buf) {
            DecodeOutcome::NeedMore(n) => assert_eq!(n, 3),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(buf.len(), 4); // nothing consumed
    }

    #[test]
    fn test_read_tag_extended_lockers() {
        // uid_len=4, uid, finger=-120, one passtech locker A:27 locked,
        // one numeric locker 62:180 locked
        let mut payload = vec![0x04, 0xDE, 0xAD, 0xBE, 0xEF];
        payload.extend_from_slice(&(-120i16).to_le_bytes());
        payload.extend_from_slice(&[0x00, 0x81]); // clean, passtech block 1
        payload.extend_from_slice(&(27u16 | 0x8000).to_le_bytes());
        payload.extend_from_slice(&[0x00, 62]); // clean, numeric block 62
        payload.extend_from_slice(&(180u16 | 0x8000).to_le_bytes());

        let wire = encode_frame(CMD_READ_TAG_EXT, 0x00, &payload);
        let frames = decode_all(&wire);
        match frames[0].command().unwrap() {
            PocketCommand::ReadTagExtended {
                uid,
                finger_score,
                lockers,
                auth,
                temp_card,
                last_sector_auth,
                ..
            } => {
                assert_eq!(uid.as_str(), "DEADBEEF");
                assert_eq!(finger_score, Some(-120));
                assert!(auth);
                assert_eq!(lockers.len(), 2);
                assert!(lockers[0].is_passtech);
                assert_eq!(lockers[0].litera, 'A');
                assert_eq!(lockers[0].cab_no, 27);
                assert!(lockers[0].locked);
                assert!(!lockers[1].is_passtech);
                assert_eq!(lockers[1].block_no, 62);
                assert_eq!(lockers[1].cab_no, 180);
                // bits of the command byte 0x03
                assert!(last_sector_auth);
                assert!(!temp_card);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_relay_roundtrip() {
        let wire = relay_packet(3000, RELAY_FLAG_TAKE_CARD, "04AEECFA9B", "Проходите");
        let frames = decode_all(&wire);
        match frames[0].command().unwrap() {
            PocketCommand::RelayControlEx {
                on_time_ms,
                flags,
                uid,
                caption,
            } => {
                assert_eq!(on_time_ms, 3000);
                assert_eq!(flags, RELAY_FLAG_TAKE_CARD);
                assert_eq!(uid, "04AEECFA9B");
                assert_eq!(caption, "Проходите");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_relay_caption_truncation() {
        let long = "X".repeat(200);
        let wire = relay_packet(1000, 0, "AB", &long);
        let frames = decode_all(&wire);
        match frames[0].command().unwrap() {
            PocketCommand::RelayControlEx { caption, .. } => assert_eq!(caption.len(), 96),
            other => panic!("unexpected: {other:?}"),
        }

        // downcount caps the caption at 16 bytes
        let wire = relay_packet(1000, RELAY_FLAG_DOWNCOUNT, "AB", &long);
        let frames = decode_all(&wire);
        match frames[0].command().unwrap() {
            PocketCommand::RelayControlEx { caption, .. } => assert_eq!(caption.len(), 16),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_caption_truncation_respects_utf8() {
        // Cyrillic characters are 2 bytes in UTF-8; make sure a boundary
        // in the middle of a character is not produced
        let caption = "П".repeat(60); // 120 bytes
        let wire = relay_packet(1000, 0, "AB", &caption);
        let frames = decode_all(&wire);
        match frames[0].command().unwrap() {
            PocketCommand::RelayControlEx { caption, .. } => {
                assert!(caption.len() <= 96);
                assert!(caption.chars().all(|c| c == 'П'));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_input_changed() {
        let wire = encode_frame(CMD_INPUT_CHANGED, 0x00, &1u16.to_le_bytes());
        let frames = decode_all(&wire);
        match frames[0].command().unwrap() {
            PocketCommand::InputChanged {
                input_state,
                passed,
            } => {
                assert_eq!(input_state, 1);
                assert!(passed);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_signal_packet_timeout_encoding() {
        let wire = signal_packet(SIGNAL_LOCKED, 1500);
        let frames = decode_all(&wire);
        let payload = &frames[0].payload;
        assert_eq!(payload[0], SIGNAL_LOCKED);
        // 1500 ms little-endian
        assert_eq!(&payload[2..6], &[0xDC, 0x05, 0x00, 0x00]);
    }

    #[test]
    fn test_lock_unlock_payload_shape() {
        let lock = lock_packet("Ожидание...");
        let frames = decode_all(&lock);
        assert_eq!(frames[0].cmd, CMD_INTERACTIVE);
        // waiting TLV carries the hourglass flag
        let payload = &frames[0].payload;
        let text_len = 2 + "Ожидание...".len();
        assert_eq!(payload[text_len], TAG_WAITING);
        assert_eq!(&payload[text_len + 2..text_len + 4], &1500u16.to_le_bytes());
        assert_eq!(payload[text_len + 4], 1); // hourglass

        let unlock = unlock_packet();
        let frames = decode_all(&unlock);
        let payload = &frames[0].payload;
        assert_eq!(payload[0], TAG_WAITING);
        assert_eq!(&payload[2..4], &0u16.to_le_bytes());
    }

    #[test]
    fn test_sound_end_delay_clamped() {
        // end_delay longer than the sound is dropped
        let field = interactive_sound(SOUND_BEEP, 4000, 100, 0xFF, 500);
        assert_eq!(field[0], TAG_SOUND);
        assert_eq!(field.len(), 2 + 6); // no trailing delay TLV
    }
}
