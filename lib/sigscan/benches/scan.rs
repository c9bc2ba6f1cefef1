//! Benchmarks comparing the scalar and vectorized scanning backends.

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use sigscan::Pattern;
use std::hint::black_box;

/// Builds a deterministic haystack with the needle planted near the end.
fn haystack(
    size: usize,
    needle: &[u8]
) -> Vec<u8> {
    let mut buf = vec![0u8; size];
    let mut x: u32 = 0xdeadbeef;
    for b in buf.iter_mut() {
        x = x.wrapping_mul(1664525).wrapping_add(1013904223);
        *b = (x >> 24) as u8;
    }

    let at = size - needle.len() - 64;
    buf[at..at + needle.len()].copy_from_slice(needle);
    buf
}

fn bench_scan(
    c: &mut Criterion
) {
    let pattern: Pattern = "48 8b 05 ?? ?? ?? ?? ff e0".parse().unwrap();
    let buf = haystack(1 << 20, &[0x48, 0x8b, 0x05, 0x11, 0x22, 0x33, 0x44, 0xff, 0xe0]);

    let mut group = c.benchmark_group("scan");
    group.throughput(Throughput::Bytes(buf.len() as u64));
    group.bench_function("auto", |b| {
        b.iter(|| black_box(pattern.find(black_box(&buf))))
    });
    group.bench_function("scalar", |b| {
        b.iter(|| black_box(pattern.find_scalar(black_box(&buf))))
    });
    group.finish();
}

criterion_group!(benches, bench_scan);
criterion_main!(benches);
