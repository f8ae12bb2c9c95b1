//! Codec properties shared by every protocol: encode/decode identity,
//! exact consumption, and single-byte resynchronisation.

use bytes::BytesMut;
use passgate_protocol::{DecodeOutcome, gat, jsp, pocket};
use proptest::prelude::*;

fn uid_bytes() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 1..=10)
}

proptest! {
    /// A POCKET frame embedded at any offset in noise decodes intact and
    /// consumes exactly up to its end.
    #[test]
    fn pocket_frame_survives_leading_noise(
        uid in uid_bytes(),
        reader_type in 0u8..8,
        noise in proptest::collection::vec(any::<u8>(), 0..32),
    ) {
        let mut payload = vec![reader_type, 0x00, uid.len() as u8];
        payload.extend_from_slice(&uid);
        let wire = pocket::encode_frame(pocket::CMD_READ_TAG, 0x00, &payload);

        let mut stream = noise.clone();
        stream.extend_from_slice(&wire);
        let tail = [0xAAu8, 0xBB];
        stream.extend_from_slice(&tail);

        let mut buf = BytesMut::from(stream.as_slice());
        let mut decoded = None;
        loop {
            match pocket::decode_frame(&mut buf) {
                DecodeOutcome::Frame(f) => { decoded = Some(f); break; }
                DecodeOutcome::Resync => continue,
                DecodeOutcome::NeedMore(_) => break,
                DecodeOutcome::Fatal(e) => panic!("fatal: {e}"),
            }
        }

        // noise may accidentally contain a frame-like prefix; when the
        // real frame is found it must be ours and the tail untouched
        if let Some(frame) = decoded {
            if frame.cmd == pocket::CMD_READ_TAG && frame.payload.len() == payload.len() {
                prop_assert_eq!(frame.payload.as_ref(), payload.as_slice());
                prop_assert!(buf.len() >= tail.len());
            }
        }
    }

    /// Flipping any CRC-covered byte of a POCKET frame never yields a
    /// frame on the first attempt, and resync consumes exactly one byte.
    #[test]
    fn pocket_corruption_never_decodes_first_try(
        uid in uid_bytes(),
        flip in any::<usize>(),
    ) {
        let mut payload = vec![0x01, 0x00, uid.len() as u8];
        payload.extend_from_slice(&uid);
        let wire = pocket::encode_frame(pocket::CMD_READ_TAG, 0x00, &payload);

        let at = flip % wire.len();
        prop_assume!(at != 6); // the high checksum byte is not covered
        let mut corrupted = wire.clone();
        corrupted[at] ^= 0xFF;

        let mut buf = BytesMut::from(corrupted.as_slice());
        match pocket::decode_frame(&mut buf) {
            DecodeOutcome::Frame(f) => prop_assert!(false, "decoded {f:?} from corrupt frame"),
            DecodeOutcome::Resync => prop_assert_eq!(buf.len(), corrupted.len() - 1),
            DecodeOutcome::NeedMore(_) => prop_assert_eq!(buf.len(), corrupted.len()),
            DecodeOutcome::Fatal(e) => prop_assert!(false, "fatal: {e}"),
        }
    }

    /// GAT frames round-trip for arbitrary payloads and addresses.
    #[test]
    fn gat_roundtrip(
        address in any::<u8>(),
        cmd in proptest::sample::select(vec![0xE5u8, 0x80, 0xA1, 0xC0, 0xCA]),
        status in any::<u8>(),
        payload in proptest::collection::vec(any::<u8>(), 0..64),
    ) {
        let wire = gat::encode_frame(cmd, address, status, &payload);
        let mut buf = BytesMut::from(wire.as_slice());

        match gat::decode_frame(&mut buf) {
            DecodeOutcome::Frame(frame) => {
                prop_assert_eq!(frame.address, address);
                prop_assert_eq!(frame.cmd, cmd);
                prop_assert_eq!(frame.payload.as_ref(), payload.as_slice());
                if cmd & 0x10 != 0 {
                    prop_assert_eq!(frame.status, Some(status));
                } else {
                    prop_assert_eq!(frame.status, None);
                }
                prop_assert!(buf.is_empty());
            }
            other => prop_assert!(false, "expected frame, got {other:?}"),
        }
    }

    /// Flipping any byte of a GAT frame breaks the LRC or the length.
    #[test]
    fn gat_corruption_never_decodes_first_try(
        payload in proptest::collection::vec(any::<u8>(), 0..16),
        flip in any::<usize>(),
    ) {
        let wire = gat::encode_frame(gat::CMD_CARD_IDENT, 0x15, 0, &payload);
        let at = flip % wire.len();
        let mut corrupted = wire.clone();
        corrupted[at] ^= 0xFF;

        let mut buf = BytesMut::from(corrupted.as_slice());
        match gat::decode_frame(&mut buf) {
            DecodeOutcome::Frame(f) => prop_assert!(false, "decoded {f:?} from corrupt frame"),
            DecodeOutcome::Resync => prop_assert_eq!(buf.len(), corrupted.len() - 1),
            DecodeOutcome::NeedMore(_) => prop_assert_eq!(buf.len(), corrupted.len()),
            DecodeOutcome::Fatal(e) => prop_assert!(false, "fatal: {e}"),
        }
    }

    /// JSP packets round-trip with lower-cased keys.
    #[test]
    fn jsp_roundtrip(
        uid in "[0-9A-F]{4,16}",
        rid in 0u32..0xFFFFFF,
        time in 0u32..600_000,
    ) {
        let rid = format!("RID{rid:06X}");
        let wire = jsp::encode_packet(&serde_json::json!({
            "CMD": "relay_open", "UID": uid, "RID": rid, "TIME": time,
        })).unwrap();

        let mut buf = BytesMut::from(wire.as_slice());
        match jsp::decode_frame(&mut buf) {
            DecodeOutcome::Frame(packet) => {
                prop_assert_eq!(packet["cmd"].as_str(), Some("relay_open"));
                prop_assert_eq!(packet["uid"].as_str(), Some(uid.as_str()));
                prop_assert_eq!(packet["rid"].as_str(), Some(rid.as_str()));
                prop_assert_eq!(packet["time"].as_u64(), Some(u64::from(time)));
                prop_assert!(buf.is_empty());
            }
            other => prop_assert!(false, "expected packet, got {other:?}"),
        }
    }

    /// Splitting any stream at any point never loses frames: feeding the
    /// two halves sequentially decodes the same frames as one feed.
    #[test]
    fn pocket_split_feed_equivalence(
        uids in proptest::collection::vec(uid_bytes(), 1..4),
        split in any::<usize>(),
    ) {
        let mut stream = Vec::new();
        for uid in &uids {
            let mut payload = vec![0x01, 0x00, uid.len() as u8];
            payload.extend_from_slice(uid);
            stream.extend(pocket::encode_frame(pocket::CMD_READ_TAG, 0x00, &payload));
        }

        let drain = |buf: &mut BytesMut| {
            let mut frames = Vec::new();
            loop {
                match pocket::decode_frame(buf) {
                    DecodeOutcome::Frame(f) => frames.push(f),
                    DecodeOutcome::Resync => continue,
                    DecodeOutcome::NeedMore(_) => break,
                    DecodeOutcome::Fatal(e) => panic!("fatal: {e}"),
                }
            }
            frames
        };

        let mut whole = BytesMut::from(stream.as_slice());
        let expected = drain(&mut whole);

        let at = split % (stream.len() + 1);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&stream[..at]);
        let mut got = drain(&mut buf);
        buf.extend_from_slice(&stream[at..]);
        got.extend(drain(&mut buf));

        prop_assert_eq!(got.len(), expected.len());
        for (g, e) in got.iter().zip(expected.iter()) {
            prop_assert_eq!(g, e);
        }
    }
}
