//! Criterion benchmarks for frame ring hot paths.
//!
//! The dispatcher performs two pushes and one borrow per source frame; at
//! 5,000 frames per second the whole budget for that is well under the
//! 200 µs per-frame processing window. These benchmarks establish baselines
//! for push, offset reads and sequence-validated copies at typical line-scan
//! frame sizes.
//!
//! Run with: cargo bench --bench frame_ring

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use cyto_daq::ring::FrameRing;

/// Benchmark pushing frames of various line-scan geometries.
fn frame_ring_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_ring_push");

    let sizes = vec![
        ("512x96", 512 * 96),
        ("1024x96", 1024 * 96),
        ("512x256", 512 * 256),
        ("1920x1080", 1920 * 1080),
    ];

    for (name, size) in sizes {
        let ring = FrameRing::new(256, size);
        let frame = vec![0u8; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("push", name), &size, |b, _| {
            b.iter(|| {
                ring.push(black_box(&frame)).unwrap();
            });
        });
    }

    group.finish();
}

/// Benchmark offset-addressed copies, the display/navigation read path.
fn frame_ring_get(c: &mut Criterion) {
    let size = 512 * 96;
    let ring = FrameRing::new(256, size);
    let frame = vec![0xAAu8; size];
    for _ in 0..256 {
        ring.push(&frame).unwrap();
    }

    c.bench_function("frame_ring_get_newest", |b| {
        b.iter(|| {
            let copy = ring.get(black_box(0)).unwrap();
            black_box(copy);
        });
    });

    let mut dst = vec![0u8; size];
    c.bench_function("frame_ring_copy_into_oldest", |b| {
        b.iter(|| {
            ring.copy_into(black_box(255), &mut dst).unwrap();
            black_box(&dst);
        });
    });
}

/// Benchmark the processor's sequence-validated copy.
fn frame_ring_read_seq(c: &mut Criterion) {
    let size = 512 * 96;
    let ring = FrameRing::new(256, size);
    let frame = vec![0x55u8; size];
    for _ in 0..256 {
        ring.push(&frame).unwrap();
    }
    let newest = ring.pushes() - 1;

    let mut dst = vec![0u8; size];
    c.bench_function("frame_ring_read_seq", |b| {
        b.iter(|| {
            ring.read_seq(black_box(newest), &mut dst).unwrap();
            black_box(&dst);
        });
    });
}

/// Benchmark the dispatcher's borrow-then-double-push pattern.
fn frame_ring_dispatch_pattern(c: &mut Criterion) {
    let size = 512 * 96;
    let camera = FrameRing::new(256, size);
    let display = FrameRing::new(256, size);
    let processing = FrameRing::new(256, size);
    let frame = vec![0x33u8; size];
    let seq = camera.push(&frame).unwrap();

    c.bench_function("frame_ring_dispatch", |b| {
        b.iter(|| {
            let bytes = camera.slot_for_seq(black_box(seq)).unwrap();
            display.push(bytes).unwrap();
            processing.push(bytes).unwrap();
        });
    });
}

criterion_group!(
    benches,
    frame_ring_push,
    frame_ring_get,
    frame_ring_read_seq,
    frame_ring_dispatch_pattern
);
criterion_main!(benches);
