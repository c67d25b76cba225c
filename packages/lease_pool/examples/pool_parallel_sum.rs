//! Summing a large range in parallel through leased scratch accumulators.
//!
//! Each worker leases a value per element, folds into it, and hands it back;
//! nobody ever waits on a lock and nobody shares an accumulator while
//! writing. At the end, a snapshot of the pool yields every partial sum.

use std::thread;

use lease_pool::ObjectPool;

fn main() {
    const WORKERS: u64 = 4;
    const VALUES: u64 = 1_000_000;

    let pool = ObjectPool::<u64>::new();

    thread::scope(|s| {
        for worker in 0..WORKERS {
            let pool = &pool;
            s.spawn(move || {
                let per_worker = VALUES / WORKERS;
                for value in worker * per_worker..(worker + 1) * per_worker {
                    *pool.lease() += value;
                }
            });
        }
    });

    let snapshot = pool.lease_all();
    let total: u64 = snapshot.iter().sum();

    println!("sum over 0..{VALUES} = {total}");
    println!("blocks allocated: {}", pool.block_count());
    println!("partial accumulators: {}", snapshot.iter().count());

    assert_eq!(total, (VALUES - 1) * VALUES / 2);
}
