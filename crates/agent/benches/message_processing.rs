//! Performance benchmarks for message processing.
//!
//! These benchmarks measure the hot paths of a shell session:
//! - Protocol message encoding/decoding
//! - Recording frame encoding/decoding
//! - Output fanout to live and recording subscribers

use agent::recording::{decode_log, encode_chunk, RecordedChunk};
use agent::session::{EchoMode, OutputChunk, OutputFanout};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use protocol::messages::{proto, typ};
use protocol::{FrameCodec, ProtocolMessage, Status};

fn output_message(size: usize) -> ProtocolMessage {
    ProtocolMessage::new(proto::SHELL, typ::SHELL_COMMAND)
        .with_status(Status::Normal)
        .with_session_id("6f1c2a9e-0d4b-4f7a-9a51-3c2e8b7d1f00")
        .with_body(vec![b'x'; size])
}

/// Benchmark protocol message encode and decode for typical payload sizes.
fn bench_message_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_codec");

    // keystroke, terminal output chunk, full-screen redraw
    for size in [1usize, 4096, 65536] {
        let message = output_message(size);
        let encoded = message.encode().unwrap();
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &message, |b, msg| {
            b.iter(|| black_box(msg).encode().unwrap());
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, bytes| {
            b.iter(|| ProtocolMessage::decode(black_box(bytes)).unwrap());
        });
    }

    group.finish();
}

/// Benchmark recording frames, with and without compression.
fn bench_recording_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("recording_frames");

    // shell output compresses well; random bytes do not
    let text: Vec<u8> = b"drwxr-xr-x  2 root root 4096 Jan  1 00:00 bin\r\n"
        .iter()
        .copied()
        .cycle()
        .take(16 * 1024)
        .collect();
    let noise: Vec<u8> = (0..16 * 1024u32)
        .map(|i| (i.wrapping_mul(2_654_435_761) >> 24) as u8)
        .collect();

    for (name, data) in [("text_16KB", text), ("noise_16KB", noise)] {
        let chunk = RecordedChunk {
            seq: 0,
            at_ms: 0,
            echo: EchoMode::Enabled,
            data,
        };
        group.throughput(Throughput::Bytes(chunk.data.len() as u64));

        for (codec_name, codec) in [
            ("lz4", FrameCodec::new()),
            ("plain", FrameCodec::without_compression()),
        ] {
            let encoded = encode_chunk(&codec, &chunk).unwrap();
            group.bench_function(format!("encode_{codec_name}_{name}"), |b| {
                b.iter(|| encode_chunk(&codec, black_box(&chunk)).unwrap());
            });
            group.bench_function(format!("decode_{codec_name}_{name}"), |b| {
                b.iter(|| decode_log(&codec, "bench", black_box(&encoded)).unwrap());
            });
        }
    }

    group.finish();
}

/// Benchmark publishing output to one live and one recording subscriber.
fn bench_output_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("output_fanout");
    let chunk = OutputChunk::new(vec![b'x'; 4096], EchoMode::Enabled);
    group.throughput(Throughput::Bytes(4096));

    group.bench_function("publish_4KB", |b| {
        let fanout = OutputFanout::new();
        let (_, mut live) = fanout.subscribe_bounded(1024);
        let (_, mut recorder) = fanout.subscribe_lossless();
        b.iter(|| {
            fanout.publish(black_box(chunk.clone()));
            let _ = live.try_recv();
            let _ = recorder.try_recv();
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_message_codec,
    bench_recording_frames,
    bench_output_fanout,
);

criterion_main!(benches);
