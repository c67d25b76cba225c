//! Per-thread counters collected after the parallel phase.
//!
//! Each worker bumps its own counter through `ThreadLocal` - no sharing, no
//! contention - and the main thread reads all of them once the workers are
//! done.

use std::cell::Cell;
use std::thread;

use lease_pool::ThreadLocal;

fn main() {
    const WORKERS: usize = 4;
    const EVENTS_PER_WORKER: usize = 100_000;

    let mut counters = ThreadLocal::<Cell<usize>>::new();

    thread::scope(|s| {
        for _ in 0..WORKERS {
            let counters = &counters;
            s.spawn(move || {
                for _ in 0..EVENTS_PER_WORKER {
                    let (count, _created) = counters.local();
                    count.set(count.get() + 1);
                }
            });
        }
    });

    let per_thread: Vec<_> = counters.iter_mut().map(|cell| cell.get()).collect();
    let total: usize = per_thread.iter().sum();

    println!("threads observed: {}", per_thread.len());
    println!("events per thread: {per_thread:?}");
    println!("events total: {total}");

    assert_eq!(total, WORKERS * EVENTS_PER_WORKER);
}
