//! Basic benchmarks for the `lease_pool` package.

#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::cell::Cell;
use std::hint::black_box;
use std::thread;

use criterion::{Criterion, criterion_group, criterion_main};
use lease_pool::{ObjectPool, SlotPool, ThreadLocal};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool");

    group.bench_function("lease_release", |b| {
        let pool = ObjectPool::<u64>::new();
        // Warm up one block so the loop measures the hot path.
        drop(pool.lease());

        b.iter(|| {
            *black_box(pool.lease()) += 1;
        });
    });

    group.bench_function("lease_release_contended", |b| {
        let pool = ObjectPool::<u64>::new();

        b.iter_custom(|iterations| {
            let start = std::time::Instant::now();
            thread::scope(|s| {
                for _ in 0..4 {
                    let pool = &pool;
                    s.spawn(move || {
                        for _ in 0..iterations {
                            *black_box(pool.lease()) += 1;
                        }
                    });
                }
            });
            start.elapsed()
        });
    });

    group.finish();

    let mut group = c.benchmark_group("slot_pool");

    group.bench_function("get_release", |b| {
        let pool = SlotPool::<u64>::new();
        drop(pool.get());

        b.iter(|| {
            let mut slot = black_box(pool.get());
            match slot.get_mut() {
                Some(total) => *total += 1,
                None => {
                    slot.emplace(1);
                }
            }
        });
    });

    group.finish();

    let mut group = c.benchmark_group("thread_local");

    group.bench_function("local_hit", |b| {
        let map = ThreadLocal::<Cell<u64>>::new();
        // First call allocates; the loop measures the lookup.
        _ = map.local();

        b.iter(|| {
            let (cell, _) = black_box(map.local());
            cell.set(cell.get() + 1);
        });
    });

    group.finish();
}
