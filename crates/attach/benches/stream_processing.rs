//! Performance benchmarks for stream processing.
//!
//! These benchmarks measure the per-chunk hot paths of a session:
//! - Detach filtering of keyboard input
//! - Demultiplexing of framed engine output

use attach::stream::DetachFilter;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use protocol::{encode_frame, FrameDecoder, StreamKind, DEFAULT_DETACH_KEYS};

/// Benchmark detach filtering of input chunks.
fn bench_detach_filter(c: &mut Criterion) {
    let mut group = c.benchmark_group("detach_filter");

    // Typical keystroke
    let keystroke = vec![b'a'];
    group.throughput(Throughput::Bytes(keystroke.len() as u64));
    group.bench_function("keystroke_1B", |b| {
        let mut filter = DetachFilter::new(DEFAULT_DETACH_KEYS);
        let mut out = Vec::with_capacity(16);
        b.iter(|| {
            out.clear();
            filter.filter(black_box(&keystroke), &mut out)
        });
    });

    // Pasted text
    let paste: Vec<u8> = (0..4096).map(|i| b'a' + (i % 26) as u8).collect();
    group.throughput(Throughput::Bytes(paste.len() as u64));
    group.bench_function("paste_4KB", |b| {
        let mut filter = DetachFilter::new(DEFAULT_DETACH_KEYS);
        let mut out = Vec::with_capacity(paste.len());
        b.iter(|| {
            out.clear();
            filter.filter(black_box(&paste), &mut out)
        });
    });

    // Worst case: every other byte starts the sequence
    let near_misses: Vec<u8> = (0..4096)
        .map(|i| if i % 2 == 0 { 0x10 } else { b'x' })
        .collect();
    group.throughput(Throughput::Bytes(near_misses.len() as u64));
    group.bench_function("near_misses_4KB", |b| {
        let mut filter = DetachFilter::new(DEFAULT_DETACH_KEYS);
        let mut out = Vec::with_capacity(near_misses.len());
        b.iter(|| {
            out.clear();
            filter.filter(black_box(&near_misses), &mut out)
        });
    });

    group.finish();
}

/// Benchmark frame decoding of engine output.
fn bench_frame_decoder(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decoder");

    for (name, size) in [("small_16B", 16usize), ("medium_4KB", 4096), ("large_64KB", 65536)] {
        let payload = vec![b'o'; size];
        let mut wire = encode_frame(StreamKind::Stdout, &payload);
        wire.extend(encode_frame(StreamKind::Stderr, &payload));

        group.throughput(Throughput::Bytes(wire.len() as u64));
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut decoder = FrameDecoder::new();
                decoder.push(black_box(&wire));
                let mut total = 0;
                while let Ok(Some(frame)) = decoder.next_frame() {
                    total += frame.payload.len();
                }
                total
            });
        });
    }

    // Output arriving in small reads that split headers
    let payload = vec![b'o'; 1024];
    let wire: Vec<u8> = (0..16)
        .flat_map(|_| encode_frame(StreamKind::Stdout, &payload))
        .collect();
    group.throughput(Throughput::Bytes(wire.len() as u64));
    group.bench_function("split_reads_16KB", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new();
            let mut total = 0;
            for chunk in wire.chunks(5) {
                decoder.push(black_box(chunk));
                while let Ok(Some(frame)) = decoder.next_frame() {
                    total += frame.payload.len();
                }
            }
            total
        });
    });

    group.finish();
}

criterion_group!(benches, bench_detach_filter, bench_frame_decoder);
criterion_main!(benches);
