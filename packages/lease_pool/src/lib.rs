//! Lock-free lease-and-return pools and a scoped thread-local map for
//! coordinating per-worker state across many parallel tasks without
//! per-access locking.
//!
//! This crate provides three related primitives:
//!
//! - [`ThreadLocal<T>`] - one value per accessing thread, keyed by thread
//!   identity, iterable as a collection and dropped with the map.
//! - [`ObjectPool<T>`] - anonymous reusable values: [`lease()`][1] borrows
//!   one, dropping the [`Lease`] returns it for any thread to reuse (in its
//!   current, possibly mutated state), and [`lease_all()`][2] detaches every
//!   free value into an iterable [`Snapshot`].
//! - [`SlotPool<T>`] - pre-created optional slots handed out whole:
//!   [`get()`][3] borrows a slot, empty or occupied, and the holder fills,
//!   updates, or clears it through the [`SlotLease`].
//!
//! # Key properties
//!
//! - **Lock-free hot paths**: leasing and returning are single double-width
//!   compare-and-swaps on an ABA-safe tagged-pointer free list; the
//!   thread-local lookup is a short scan of one lock-free bucket. The one
//!   internal mutex only serializes growth - constructing a fresh block of
//!   nodes - and is never held across user code.
//! - **Stable addresses**: a value never moves once created. Storage grows
//!   by fixed-capacity blocks chained together, never by relocation.
//! - **Scoped borrowing**: leases, snapshots, and iterators borrow their
//!   container, so use-after-drop and iterate-while-leased are compile
//!   errors, not documented hazards.
//! - **Panic safety**: a panicking value initializer unwinds out before
//!   anything is linked; the container is left exactly as it was.
//!
//! # Choosing a primitive
//!
//! | You want | Use |
//! |----------|-----|
//! | per-thread accumulators, iterated after the parallel phase | [`ThreadLocal`] |
//! | reusable scratch values, cheapest possible handout | [`ObjectPool`] |
//! | fold-into-any-slot accumulation without thread keying | [`SlotPool`] |
//!
//! # Example
//!
//! ```rust
//! use lease_pool::ObjectPool;
//!
//! let pool = ObjectPool::<u64>::new();
//!
//! std::thread::scope(|s| {
//!     for chunk in 0..4_u64 {
//!         let pool = &pool;
//!         s.spawn(move || {
//!             for value in chunk * 250..(chunk + 1) * 250 {
//!                 // Lease a scratch accumulator, fold into it, hand it back.
//!                 *pool.lease() += value;
//!             }
//!         });
//!     }
//! });
//!
//! let total: u64 = pool.lease_all().iter().sum();
//! assert_eq!(total, (0..1000).sum());
//! ```
//!
//! [1]: ObjectPool::lease
//! [2]: ObjectPool::lease_all
//! [3]: SlotPool::get

#[cfg(not(target_pointer_width = "64"))]
compile_error!(
    "this crate requires a 64-bit target: the free list packs a (pointer, tag) pair into one 128-bit atomic word"
);

mod block;
mod free_stack;
mod lease_core;
mod pool;
mod slot_pool;
mod tagged_ptr;
mod thread_local;

pub use pool::{Iter as PoolIter, Lease, ObjectPool, Snapshot, SnapshotIter};
pub use slot_pool::{OccupiedIter, SlotLease, SlotPool};
pub use thread_local::{Iter as ThreadLocalIter, IterMut as ThreadLocalIterMut, ThreadLocal};
