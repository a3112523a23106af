// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Allocation benchmarks.
//
// Run with:
//   cargo bench --bench alloc
//
// Groups:
//   global_alloc     - Vec<u8> via the global allocator (baseline)
//   pool_alloc_free  - buddy pool alloc + free of a warm chunk
//   pool_split_merge - drain a block into smallest-class chunks and free
//                      them all back, forcing the full split/merge chain
//
// Each sized group exercises three request sizes:
//   small  - 56 bytes   (fills the smallest chunk exactly)
//   medium - 1008 bytes (mid-class, one split level warm)
//   large  - 64 KiB     (high class, long split chain when cold)

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use shmpool::ShmPool;

const SIZES: &[(&str, usize)] = &[
    ("small_56", 56),
    ("medium_1008", 1008),
    ("large_64k", 64 * 1024),
];

const POOL_BYTES: usize = 64 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Baseline: global allocator (Vec<u8>)
// ---------------------------------------------------------------------------

fn bench_global_alloc(c: &mut Criterion) {
    let mut group = c.benchmark_group("global_alloc");

    for &(label, size) in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            b.iter(|| {
                let v: Vec<u8> = vec![0xABu8; sz];
                black_box(v)
            });
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Buddy pool: alloc, touch, free; LIFO reuse keeps the chunk warm
// ---------------------------------------------------------------------------

fn bench_pool_alloc_free(c: &mut Criterion) {
    let pool = ShmPool::bootstrap(POOL_BYTES, false).expect("bootstrap bench pool");
    let mut group = c.benchmark_group("pool_alloc_free");

    for &(label, size) in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            b.iter(|| {
                let addr = pool.alloc(sz).expect("pool alloc");
                unsafe {
                    std::ptr::write_bytes(addr, 0xAB, sz);
                    black_box(*addr);
                    pool.free(addr);
                }
            });
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Buddy pool: worst-case split and merge churn
// ---------------------------------------------------------------------------

fn bench_pool_split_merge(c: &mut Criterion) {
    let pool = ShmPool::bootstrap(1024 * 1024, false).expect("bootstrap churn pool");
    let mut group = c.benchmark_group("pool_split_merge");
    group.throughput(Throughput::Elements(64));

    // 64 smallest-class chunks span one 4 KiB block; freeing them all merges
    // the block back together, so every iteration re-runs the whole chain.
    group.bench_function("drain_64_smallest", |b| {
        let mut held = Vec::with_capacity(64);
        b.iter(|| {
            for _ in 0..64 {
                held.push(pool.alloc(56).expect("pool alloc"));
            }
            while let Some(addr) = held.pop() {
                unsafe { pool.free(addr) };
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_global_alloc,
    bench_pool_alloc_free,
    bench_pool_split_merge,
);
criterion_main!(benches);
