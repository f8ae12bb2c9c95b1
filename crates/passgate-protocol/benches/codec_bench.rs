//! Decode throughput for the binary codecs.

use bytes::BytesMut;
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use passgate_protocol::{DecodeOutcome, gat, jsp, pocket};

fn pocket_stream(frames: usize) -> Vec<u8> {
    let payload = [0x01, 0x00, 0x05, 0x04, 0xAE, 0xEC, 0xFA, 0x9B];
    let wire = pocket::encode_frame(pocket::CMD_READ_TAG, 0x00, &payload);
    wire.iter().copied().cycle().take(wire.len() * frames).collect()
}

fn bench_pocket_decode(c: &mut Criterion) {
    let stream = pocket_stream(64);
    c.bench_function("pocket_decode_64_frames", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(stream.as_slice());
            let mut n = 0usize;
            loop {
                match pocket::decode_frame(&mut buf) {
                    DecodeOutcome::Frame(f) => {
                        black_box(&f);
                        n += 1;
                    }
                    DecodeOutcome::NeedMore(_) => break,
                    DecodeOutcome::Resync => continue,
                    DecodeOutcome::Fatal(_) => break,
                }
            }
            assert_eq!(n, 64);
        });
    });
}

fn bench_gat_decode(c: &mut Criterion) {
    let frame = gat::req_master_packet(0x7A, gat::GatTerminalKind::Access);
    let stream: Vec<u8> = frame.iter().copied().cycle().take(frame.len() * 64).collect();
    c.bench_function("gat_decode_64_frames", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(stream.as_slice());
            let mut n = 0usize;
            loop {
                match gat::decode_frame(&mut buf) {
                    DecodeOutcome::Frame(f) => {
                        black_box(&f);
                        n += 1;
                    }
                    DecodeOutcome::NeedMore(_) => break,
                    DecodeOutcome::Resync => continue,
                    DecodeOutcome::Fatal(_) => break,
                }
            }
            assert_eq!(n, 64);
        });
    });
}

fn bench_jsp_decode(c: &mut Criterion) {
    let wire = jsp::encode_packet(&serde_json::json!({
        "cmd": "tag_read", "uid": "04AEECFA9B", "rid": "RID000001",
        "lockers_data": "62:180,A:27"
    }))
    .unwrap();
    let stream: Vec<u8> = wire.iter().copied().cycle().take(wire.len() * 64).collect();
    c.bench_function("jsp_decode_64_packets", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(stream.as_slice());
            let mut n = 0usize;
            loop {
                match jsp::decode_frame(&mut buf) {
                    DecodeOutcome::Frame(p) => {
                        black_box(&p);
                        n += 1;
                    }
                    DecodeOutcome::NeedMore(_) => break,
                    DecodeOutcome::Resync => continue,
                    DecodeOutcome::Fatal(_) => break,
                }
            }
            assert_eq!(n, 64);
        });
    });
}

criterion_group!(benches, bench_pocket_decode, bench_gat_decode, bench_jsp_decode);
criterion_main!(benches);
