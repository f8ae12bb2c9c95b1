//! JSP protocol: JSON payloads in a binary frame.
//!
//! Frame layout:
//!
//! ```text
//! +------+------------------+-----------+------+
//! | 0x03 | 4 hex digits     | JSON body | 0x02 |
//! | SOF  | body length (BE) |           | EOF  |
//! +------+------------------+-----------+------+
//! ```
//!
//! The length is four upper-case ASCII hex digits; values outside
//! `0x0002..=0xFFFF` are rejected. Object keys are case-folded to lower
//! case, recursively, after parsing. Every outbound request carries a
//! monotonically increasing id `RID000000..RIDFFFFFF` so answers can be
//! correlated against the connection's outstanding-request map.

use crate::decode::{DecodeOutcome, skip_one};
use bytes::BytesMut;
use passgate_core::lockers;
use serde_json::{Map, Value, json};

pub const SOF: u8 = 0x03;
pub const EOF: u8 = 0x02;
const LEN_DIGITS: usize = 4;
const HEADER_LEN: usize = 1 + LEN_DIGITS;
const MIN_BODY: usize = 0x02;
const MAX_BODY: usize = 0xFFFF;

/// A decoded JSP packet: a JSON object with lower-cased keys.
pub type JspPacket = Map<String, Value>;

/// One decoding step against the receive buffer.
///
/// Garbage before the SOF is discarded in one step; an invalid length
/// field, missing EOF or unparseable JSON resynchronises by one byte.
pub fn decode_frame(buf: &mut BytesMut) -> DecodeOutcome<JspPacket> {
    let Some(sof) = buf.iter().position(|&b| b == SOF) else {
        buf.clear();
        return DecodeOutcome::NeedMore(HEADER_LEN);
    };
    if sof > 0 {
        let _ = buf.split_to(sof);
    }

    if buf.len() < HEADER_LEN {
        return DecodeOutcome::NeedMore(HEADER_LEN - buf.len());
    }

    let Some(body_len) = decode_hex_len(&buf[1..HEADER_LEN]) else {
        skip_one(buf);
        return DecodeOutcome::Resync;
    };

    let total = HEADER_LEN + body_len + 1;
    if buf.len() < total {
        return DecodeOutcome::NeedMore(total - buf.len());
    }

    if buf[HEADER_LEN + body_len] != EOF {
        skip_one(buf);
        return DecodeOutcome::Resync;
    }

    let frame = buf.split_to(total);
    let body = &frame[HEADER_LEN..HEADER_LEN + body_len];
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => match lower_keys(Value::Object(map)) {
            Value::Object(lowered) => DecodeOutcome::Frame(lowered),
            _ => unreachable!(),
        },
        _ => {
            // bad JSON inside a well-delimited frame: drop the frame
            tracing::debug!(len = body_len, "dropping JSP frame with invalid JSON");
            DecodeOutcome::Resync
        }
    }
}

/// Length field: exactly four upper-case hex digits, big-endian value.
fn decode_hex_len(digits: &[u8]) -> Option<usize> {
    if digits.len() != LEN_DIGITS {
        return None;
    }
    let mut value = 0usize;
    for &d in digits {
        let nibble = match d {
            b'0'..=b'9' => d - b'0',
            b'A'..=b'F' => d - b'A' + 10,
            _ => return None,
        };
        value = (value << 4) | nibble as usize;
    }
    (MIN_BODY..=MAX_BODY).contains(&value).then_some(value)
}

/// Encode a JSON value into a JSP frame.
///
/// Returns `None` for bodies that do not fit the length field.
#[must_use]
pub fn encode_packet(value: &Value) -> Option<Vec<u8>> {
    let body = serde_json::to_vec(value).ok()?;
    if !(MIN_BODY..=MAX_BODY).contains(&body.len()) {
        return None;
    }

    let mut out = Vec::with_capacity(HEADER_LEN + body.len() + 1);
    out.push(SOF);
    out.extend_from_slice(format!("{:04X}", body.len()).as_bytes());
    out.extend_from_slice(&body);
    out.push(EOF);
    Some(out)
}

/// Case-fold all object keys to lower case, recursively.
#[must_use]
pub fn lower_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k.to_lowercase(), lower_keys(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(lower_keys).collect()),
        other => other,
    }
}

/// Monotonically increasing request-id source, `RID000000..RIDFFFFFF`.
#[derive(Debug, Default, Clone)]
pub struct RidCounter(u32);

impl RidCounter {
    #[must_use]
    pub fn new() -> Self {
        RidCounter(0)
    }

    pub fn next(&mut self) -> String {
        if self.0 > 0x00FF_FFFF {
            self.0 = 0;
        }
        let rid = format!("RID{:06X}", self.0);
        self.0 += 1;
        rid
    }
}

/// Kind of packet, determined by the presence of `cmd` vs a bare `rid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Command,
    Answer,
    Unknown,
}

#[must_use]
pub fn packet_kind(packet: &JspPacket) -> PacketKind {
    if packet.get("cmd").and_then(Value::as_str).is_some() {
        PacketKind::Command
    } else if packet.get("rid").and_then(Value::as_str).is_some() {
        PacketKind::Answer
    } else {
        PacketKind::Unknown
    }
}

/// Normalise a flat-string `lockers_data` field into the structured array
/// form before dispatch. Returns `true` when a rewrite happened; the
/// original string is preserved under `_lockers_data`.
pub fn normalize_lockers(packet: &mut JspPacket) -> bool {
    let Some(Value::String(raw)) = packet.get("lockers_data") else {
        return false;
    };
    let raw = raw.clone();
    if raw.is_empty() {
        return false;
    }

    let parsed = lockers::parse_list(&raw);
    if parsed.is_empty() {
        return false;
    }

    let structured: Vec<Value> = parsed
        .iter()
        .map(|l| {
            json!({
                "auth_err": l.auth_err,
                "read_err": l.read_err,
                "is_passtech": l.is_passtech,
                "block_no": l.block_no,
                "litera": l.litera.to_string(),
                "locked": l.locked,
                "cab_no": l.cab_no,
            })
        })
        .collect();

    packet.insert("_lockers_data".to_string(), Value::String(raw));
    packet.insert("lockers_data".to_string(), Value::Array(structured));
    true
}

/// Extract structured lockers from a (normalised) packet.
#[must_use]
pub fn packet_lockers(packet: &JspPacket) -> Vec<passgate_core::LockerInfo> {
    let Some(Value::Array(items)) = packet.get("lockers_data") else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            Some(passgate_core::LockerInfo {
                auth_err: obj.get("auth_err")?.as_u64()? as u8,
                read_err: obj.get("read_err")?.as_u64()? as u8,
                is_passtech: obj.get("is_passtech")?.as_bool()?,
                block_no: obj.get("block_no")?.as_u64()? as u8,
                litera: obj
                    .get("litera")
                    .and_then(Value::as_str)
                    .and_then(|s| s.chars().next())
                    .unwrap_or('-'),
                locked: obj.get("locked")?.as_bool()?,
                cab_no: obj.get("cab_no")?.as_u64()? as u16,
            })
        })
        .collect()
}

/// `relay_open` request; omitted fields are not serialised.
#[must_use]
pub fn relay_open_packet(
    rid: &str,
    uid: &str,
    caption: &str,
    time_ms: u32,
    cid: Option<&str>,
) -> Option<Vec<u8>> {
    let mut data = Map::new();
    data.insert("cmd".into(), json!("relay_open"));
    data.insert("rid".into(), json!(rid));
    if !uid.is_empty() {
        data.insert("uid".into(), json!(uid));
    }
    if !caption.is_empty() {
        data.insert("caption".into(), json!(caption));
    }
    if time_ms > 0 {
        data.insert("time".into(), json!(time_ms));
    }
    if let Some(cid) = cid.filter(|c| !c.is_empty()) {
        data.insert("cid".into(), json!(cid));
    }
    encode_packet(&Value::Object(data))
}

/// `relay_close` request.
#[must_use]
pub fn relay_close_packet(rid: &str) -> Option<Vec<u8>> {
    encode_packet(&json!({ "cmd": "relay_close", "rid": rid }))
}

/// Display message. `time_ms == 0` keeps the text up until cleared, which
/// is how JSP terminals are locked.
#[must_use]
pub fn message_packet(text: &str, time_ms: u32) -> Option<Vec<u8>> {
    encode_packet(&json!({ "cmd": "message", "text": text, "time": time_ms }))
}

/// Correlatable display message.
#[must_use]
pub fn message_packet_with_rid(rid: &str, text: &str, time_ms: u32) -> Option<Vec<u8>> {
    encode_packet(&json!({ "cmd": "message", "text": text, "time": time_ms, "rid": rid }))
}

/// Liveness probe.
#[must_use]
pub fn ping_packet(rid: &str) -> Option<Vec<u8>> {
    encode_packet(&json!({ "cmd": "ping", "rid": rid }))
}

/// Answer to a terminal request: echoes the rid, never a `cmd`.
#[must_use]
pub fn answer_packet(rid: &str, params: &Map<String, Value>) -> Option<Vec<u8>> {
    let mut data = Map::new();
    data.insert("rid".to_string(), json!(rid));
    for (k, v) in params {
        if k != "cmd" {
            data.insert(k.clone(), v.clone());
        }
    }
    encode_packet(&Value::Object(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<JspPacket> {
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
    fn test_roundtrip() {
        let wire =
            encode_packet(&json!({"cmd": "tag_read", "uid": "04AEECFA9B", "rid": "RID000001"}))
                .unwrap();
        assert_eq!(wire[0], SOF);
        assert_eq!(*wire.last().unwrap(), EOF);

        let packets = decode_all(&wire);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0]["cmd"], "tag_read");
        assert_eq!(packets[0]["uid"], "04AEECFA9B");
    }

    #[test]
    fn test_keys_lowercased_recursively() {
        let wire = encode_packet(&json!({
            "CMD": "tag_read",
            "Nested": { "UID": "AB", "List": [{"Inner": 1}] }
        }))
        .unwrap();
        let packets = decode_all(&wire);
        let nested = packets[0]["nested"].as_object().unwrap();
        assert_eq!(nested["uid"], "AB");
        assert_eq!(nested["list"][0]["inner"], 1);
    }

    #[test]
    fn test_garbage_before_sof_skipped() {
        let mut stream = b"junk".to_vec();
        stream.extend(encode_packet(&json!({"cmd": "pong", "rid": "RID000000"})).unwrap());
        let packets = decode_all(&stream);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0]["cmd"], "pong");
    }

    #[test]
    fn test_invalid_hex_length_resyncs() {
        // lower-case hex digits are rejected by the length field
        let mut stream = vec![SOF, b'0', b'0', b'1', b'a'];
        stream.extend(encode_packet(&json!({"cmd": "ping", "rid": "RID000000"})).unwrap());
        let packets = decode_all(&stream);
        assert_eq!(packets.len(), 1);
    }

    #[test]
    fn test_missing_eof_resyncs() {
        let mut wire = encode_packet(&json!({"cmd": "ping", "rid": "RID000000"})).unwrap();
        let last = wire.len() - 1;
        wire[last] = 0xFF;
        // corrupting EOF loses this frame but must not wedge the stream
        wire.extend(encode_packet(&json!({"cmd": "pong", "rid": "RID000000"})).unwrap());
        let packets = decode_all(&wire);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0]["cmd"], "pong");
    }

    #[test]
    fn test_length_bounds() {
        assert_eq!(decode_hex_len(b"0001"), None); // below 0x02
        assert_eq!(decode_hex_len(b"0002"), Some(2));
        assert_eq!(decode_hex_len(b"FFFF"), Some(0xFFFF));
        assert_eq!(decode_hex_len(b"00G0"), None);
    }

    #[test]
    fn test_partial_needs_more() {
        let wire = encode_packet(&json!({"cmd": "ping", "rid": "RID000000"})).unwrap();
        let mut buf = BytesMut::from(&wire[..8]);
        match decode_frame(&mut buf) {
            DecodeOutcome::NeedMore(n) => assert_eq!(n, wire.len() - 8),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_rid_counter_wraps() {
        let mut c = RidCounter::new();
        assert_eq!(c.next(), "RID000000");
        assert_eq!(c.next(), "RID000001");

        let mut c = RidCounter(0x00FF_FFFF);
        assert_eq!(c.next(), "RIDFFFFFF");
        assert_eq!(c.next(), "RID000000");
    }

    #[test]
    fn test_packet_kind() {
        let cmd = decode_all(&encode_packet(&json!({"cmd": "ping", "rid": "RID000000"})).unwrap());
        assert_eq!(packet_kind(&cmd[0]), PacketKind::Command);

        let ans = decode_all(&encode_packet(&json!({"rid": "RID000001", "result": true})).unwrap());
        assert_eq!(packet_kind(&ans[0]), PacketKind::Answer);

        let unk = decode_all(&encode_packet(&json!({"x": 1})).unwrap());
        assert_eq!(packet_kind(&unk[0]), PacketKind::Unknown);
    }

    #[test]
    fn test_normalize_lockers_string_form() {
        let wire = encode_packet(&json!({
            "cmd": "tag_read", "uid": "AB", "rid": "RID000001",
            "lockers_data": "62:180,A:27"
        }))
        .unwrap();
        let mut packets = decode_all(&wire);
        assert!(normalize_lockers(&mut packets[0]));

        let lockers = packet_lockers(&packets[0]);
        assert_eq!(lockers.len(), 2);
        assert!(!lockers[0].is_passtech);
        assert_eq!(lockers[0].cab_no, 180);
        assert!(lockers[1].is_passtech);
        assert_eq!(lockers[1].litera, 'A');
        assert_eq!(packets[0]["_lockers_data"], "62:180,A:27");

        // already structured: second pass is a no-op
        assert!(!normalize_lockers(&mut packets[0]));
    }

    #[test]
    fn test_relay_open_omits_empty_fields() {
        let wire = relay_open_packet("RID000005", "AB", "", 3000, None).unwrap();
        let packets = decode_all(&wire);
        assert_eq!(packets[0]["cmd"], "relay_open");
        assert_eq!(packets[0]["time"], 3000);
        assert!(!packets[0].contains_key("caption"));
        assert!(!packets[0].contains_key("cid"));
    }

    #[test]
    fn test_answer_strips_cmd() {
        let mut params = Map::new();
        params.insert("cmd".into(), json!("tag_read"));
        params.insert("result".into(), json!(true));
        let wire = answer_packet("RID000002", &params).unwrap();
        let packets = decode_all(&wire);
        assert_eq!(packets[0]["rid"], "RID000002");
        assert_eq!(packets[0]["result"], true);
        assert!(!packets[0].contains_key("cmd"));
    }
}
