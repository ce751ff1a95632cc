//! Criterion benchmarks for the ExpandScreen wire codec.
//!
//! Header encode/decode sits on the path of every message, and video frame
//! payloads dominate the byte volume, so both are measured here.
//!
//! Run with:
//! ```bash
//! cargo bench --package expand-core --bench codec_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use expand_core::protocol::payloads::{HeartbeatMessage, VideoFrameMessage};
use expand_core::{
    decode_header, decode_message, encode_header, encode_message, Message, MessageHeader,
    MessageType, WirePayload,
};

// ── Fixtures ──────────────────────────────────────────────────────────────────

fn make_video_frame(len: usize) -> Message {
    let frame = VideoFrameMessage {
        frame_number: 1,
        presentation_ts_ms: 16,
        width: 1920,
        height: 1080,
        is_key_frame: false,
        data: vec![0x5A; len],
    };
    let payload = frame.to_message_payload().expect("video payload");
    Message::new(MessageType::VideoFrame, 1, 0, payload)
}

fn make_heartbeat() -> Message {
    let payload = HeartbeatMessage { timestamp: 123_456 }
        .to_message_payload()
        .expect("heartbeat payload");
    Message::new(MessageType::Heartbeat, 1, 0, payload)
}

// ── Benchmark groups ──────────────────────────────────────────────────────────

fn bench_header(c: &mut Criterion) {
    let header = MessageHeader::new(MessageType::VideoFrame, 1_000, 65_536, 42);
    let bytes = encode_header(&header);

    let mut group = c.benchmark_group("header");
    group.bench_function("encode", |b| b.iter(|| encode_header(black_box(&header))));
    group.bench_function("decode", |b| {
        b.iter(|| decode_header(black_box(&bytes)).expect("decode must succeed"))
    });
    group.finish();
}

/// Full message framing for a control message and several frame sizes.
fn bench_message(c: &mut Criterion) {
    let messages: Vec<(String, Message)> = vec![
        ("Heartbeat".to_string(), make_heartbeat()),
        ("VideoFrame_1KiB".to_string(), make_video_frame(1024)),
        ("VideoFrame_64KiB".to_string(), make_video_frame(64 * 1024)),
        ("VideoFrame_1MiB".to_string(), make_video_frame(1024 * 1024)),
    ];

    let mut group = c.benchmark_group("encode_message");
    for (name, msg) in &messages {
        group.bench_with_input(BenchmarkId::new("msg", name), msg, |b, msg| {
            b.iter(|| encode_message(black_box(msg)))
        });
    }
    group.finish();

    let mut group = c.benchmark_group("decode_message");
    for (name, msg) in &messages {
        let bytes = encode_message(msg);
        group.bench_with_input(BenchmarkId::new("msg", name), &bytes, |b, bytes| {
            b.iter(|| decode_message(black_box(bytes), usize::MAX).expect("decode must succeed"))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_header, bench_message);
criterion_main!(benches);
