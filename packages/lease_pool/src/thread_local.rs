use std::fmt;
use std::hash::BuildHasher;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::thread::{self, ThreadId};

use foldhash::fast::FixedState;
use new_zealand::nz;

/// A scoped thread-local map: one `T` per accessing thread, iterable as a
/// collection.
///
/// Unlike `std`'s `thread_local!`, the storage belongs to this value rather
/// than to the threads: it can be created at runtime, many instances can
/// coexist, every thread's value is reachable through
/// [`iter()`][Self::iter] / [`iter_mut()`][Self::iter_mut], and everything is
/// dropped (or [`clear()`][Self::clear]ed) with the map itself - the scoped
/// shape that parallel reductions want.
///
/// [`local()`][Self::local] finds the calling thread's value by scanning one
/// bucket of an array sized to the machine's parallelism at construction, or
/// inserts a freshly initialized value with two publish compare-and-swaps.
/// No locks anywhere, and the initializer runs before anything is linked, so
/// a panicking initializer leaves the map untouched.
///
/// # Example
///
/// ```rust
/// use std::cell::Cell;
///
/// use lease_pool::ThreadLocal;
///
/// let mut acc = ThreadLocal::<Cell<u64>>::new();
///
/// std::thread::scope(|s| {
///     for chunk in 0..4_u64 {
///         let acc = &acc;
///         s.spawn(move || {
///             for value in chunk * 100..(chunk + 1) * 100 {
///                 let (cell, _) = acc.local();
///                 cell.set(cell.get() + value);
///             }
///         });
///     }
/// });
///
/// let total: u64 = acc.iter_mut().map(|cell| cell.get()).sum();
/// assert_eq!(total, (0..400).sum());
/// ```
pub struct ThreadLocal<T> {
    /// One lock-free singly-linked list head per bucket; fixed count, chosen
    /// at construction.
    buckets: Box<[AtomicPtr<TlsNode<T>>]>,

    /// Head of the container-wide iteration list, maintained with one extra
    /// compare-and-swap per insertion.
    list_head: AtomicPtr<TlsNode<T>>,

    /// Invoked to produce each thread's initial value; may run on any thread,
    /// repeatedly.
    init: Box<dyn Fn() -> T + Send + Sync>,

    hash_builder: FixedState,
}

// SAFETY: Values move to whichever thread drops or drains the map, so `T`
// must be `Send`; nothing else crosses threads in a non-atomic way.
unsafe impl<T: Send> Send for ThreadLocal<T> {}
// SAFETY: Each value is only ever accessed (a) through `local()` by the one
// thread that owns it, (b) through `iter()`, which additionally requires
// `T: Sync`, or (c) under an exclusive borrow.
unsafe impl<T: Send> Sync for ThreadLocal<T> {}

struct TlsNode<T> {
    value: T,
    owner: ThreadId,

    /// Next node in this bucket. Written only before the bucket publish,
    /// frozen afterwards.
    bucket_next: *mut TlsNode<T>,

    /// Next node in the iteration list. Written only before the list
    /// publish, frozen afterwards.
    list_next: *mut TlsNode<T>,
}

impl<T> ThreadLocal<T> {
    /// Creates a map whose values start as `T::default()`.
    #[must_use]
    pub fn new() -> Self
    where
        T: Default + Send + 'static,
    {
        Self::with_initializer(T::default)
    }

    /// Creates a map whose values are produced by `init`.
    ///
    /// The initializer is invoked on the first [`local()`][Self::local] of
    /// each thread - potentially many times, potentially concurrently.
    #[must_use]
    pub fn with_initializer<F>(init: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let bucket_count = thread::available_parallelism().unwrap_or(nz!(1)).get();

        Self {
            buckets: (0..bucket_count)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect(),
            list_head: AtomicPtr::new(ptr::null_mut()),
            init: Box::new(init),
            hash_builder: FixedState::default(),
        }
    }

    /// Creates a map whose values start as clones of `seed`.
    #[must_use]
    pub fn with_value(seed: T) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        Self::with_initializer(move || seed.clone())
    }

    #[inline]
    fn bucket_of(&self, thread: ThreadId) -> &AtomicPtr<TlsNode<T>> {
        let index = self.hash_builder.hash_one(thread) as usize % self.buckets.len();

        &self.buckets[index]
    }

    /// Returns the calling thread's value, plus `true` iff this call created
    /// it.
    ///
    /// The first call from each thread invokes the initializer and links the
    /// new value into the map; later calls find it with a short scan of one
    /// bucket. Distinct threads contend only when they hash to the same
    /// bucket, and then only on the insertion compare-and-swap.
    ///
    /// The returned reference is shared because the same thread may call
    /// `local()` again while holding it; put a `Cell` (or similar) inside
    /// `T` for mutation.
    ///
    /// # Panics
    ///
    /// Panics if the initializer panics, in which case nothing was linked
    /// and the next call behaves like the first. Allocation failure for the
    /// node also panics.
    #[must_use]
    pub fn local(&self) -> (&T, bool) {
        let owner = thread::current().id();
        let bucket = self.bucket_of(owner);

        let mut cursor = bucket.load(Ordering::Acquire);
        // SAFETY: Bucket nodes are live until `clear()`/drop, which require
        // an exclusive borrow and thus cannot overlap this call.
        while let Some(node) = unsafe { cursor.as_ref() } {
            if node.owner == owner {
                return (&node.value, false);
            }
            cursor = node.bucket_next;
        }

        // Only the owning thread inserts for its own id, so the scan cannot
        // have missed a concurrent insertion of `owner` - a miss means we
        // create. The initializer runs before any linking: if it panics, the
        // map is untouched.
        let value = (self.init)();

        let node = Box::into_raw(Box::new(TlsNode {
            value,
            owner,
            bucket_next: ptr::null_mut(),
            list_next: ptr::null_mut(),
        }));

        let mut head = bucket.load(Ordering::Acquire);
        loop {
            // SAFETY: The node is unpublished; we are its only user.
            unsafe { (*node).bucket_next = head };

            match bucket.compare_exchange_weak(head, node, Ordering::Release, Ordering::Acquire) {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }

        let mut head = self.list_head.load(Ordering::Acquire);
        loop {
            // SAFETY: `list_next` is unpublished until the exchange below
            // succeeds; the bucket publish does not expose it to readers.
            unsafe { (*node).list_next = head };

            match self
                .list_head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }

        // SAFETY: The node lives until `clear()`/drop, which require an
        // exclusive borrow and thus a point where this shared borrow ended.
        (unsafe { &(*node).value }, true)
    }

    /// Drops every stored value and resets the map.
    ///
    /// The exclusive borrow makes clearing concurrently with
    /// [`local()`][Self::local] or iteration a compile error. After clearing,
    /// the next `local()` of every thread reports `true` again.
    pub fn clear(&mut self) {
        let mut cursor = *self.list_head.get_mut();

        while !cursor.is_null() {
            // SAFETY: Nodes were leaked into the list via `Box::into_raw`
            // and are reclaimed exactly once, here or in `drop`.
            let node = unsafe { Box::from_raw(cursor) };
            cursor = node.list_next;
        }

        *self.list_head.get_mut() = ptr::null_mut();
        for bucket in &mut self.buckets {
            *bucket.get_mut() = ptr::null_mut();
        }
    }

    /// Iterates over every thread's value.
    ///
    /// Safe concurrently with [`local()`][Self::local] on other threads -
    /// hence `T: Sync` - but non-atomic: values inserted while the iteration
    /// runs may or may not appear. Order is implementation-defined.
    pub fn iter(&self) -> Iter<'_, T>
    where
        T: Sync,
    {
        Iter {
            cursor: self.list_head.load(Ordering::Acquire),
            _map: PhantomData,
        }
    }

    /// Iterates over every thread's value with exclusive access.
    pub fn iter_mut(&mut self) -> IterMut<'_, T> {
        IterMut {
            cursor: *self.list_head.get_mut(),
            _map: PhantomData,
        }
    }

    /// Number of values currently stored (one per thread that has called
    /// [`local()`][Self::local] since the last clear).
    ///
    /// Walks the iteration list; immediately stale under concurrent first
    /// calls.
    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Mutating a diagnostic count proves nothing.
    pub fn len(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.list_head.load(Ordering::Acquire);

        // SAFETY: List nodes are live until `clear()`/drop, which cannot
        // overlap this shared borrow.
        while let Some(node) = unsafe { cursor.as_ref() } {
            count += 1;
            cursor = node.list_next;
        }

        count
    }

    /// Whether no thread has stored a value yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.list_head.load(Ordering::Acquire).is_null()
    }
}

impl<T: Default + Send + 'static> Default for ThreadLocal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for ThreadLocal<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<T: fmt::Debug> fmt::Debug for ThreadLocal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadLocal")
            .field("buckets", &self.buckets.len())
            .field("len", &self.len())
            .finish()
    }
}

impl<'map, T: Sync> IntoIterator for &'map ThreadLocal<T> {
    type Item = &'map T;
    type IntoIter = Iter<'map, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'map, T> IntoIterator for &'map mut ThreadLocal<T> {
    type Item = &'map mut T;
    type IntoIter = IterMut<'map, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter_mut()
    }
}

/// Shared iterator over a [`ThreadLocal`]'s values; see
/// [`ThreadLocal::iter()`].
pub struct Iter<'map, T> {
    cursor: *mut TlsNode<T>,
    _map: PhantomData<&'map ThreadLocal<T>>,
}

impl<'map, T> Iterator for Iter<'map, T> {
    type Item = &'map T;

    fn next(&mut self) -> Option<Self::Item> {
        // SAFETY: Nodes stay live for 'map (clearing needs `&mut`), and
        // `T: Sync` on construction licenses sharing values across threads.
        let node = unsafe { self.cursor.as_ref() }?;
        self.cursor = node.list_next;

        Some(&node.value)
    }
}

/// Exclusive iterator over a [`ThreadLocal`]'s values; see
/// [`ThreadLocal::iter_mut()`].
pub struct IterMut<'map, T> {
    cursor: *mut TlsNode<T>,
    _map: PhantomData<&'map mut ThreadLocal<T>>,
}

impl<'map, T> Iterator for IterMut<'map, T> {
    type Item = &'map mut T;

    fn next(&mut self) -> Option<Self::Item> {
        // SAFETY: The map is exclusively borrowed for 'map and each node is
        // visited exactly once, so the yielded borrows never alias.
        let node = unsafe { self.cursor.as_mut() }?;
        self.cursor = node.list_next;

        Some(&mut node.value)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Barrier, Mutex};

    use super::*;

    #[test]
    fn first_local_creates_later_locals_find() {
        let map = ThreadLocal::<u64>::with_initializer(|| 10);

        let (value, created) = map.local();
        assert_eq!(*value, 10);
        assert!(created);

        let (value, created) = map.local();
        assert_eq!(*value, 10);
        assert!(!created);
    }

    #[test]
    fn new_uses_default() {
        let map = ThreadLocal::<u64>::new();

        assert_eq!(*map.local().0, 0);
    }

    #[test]
    fn with_value_clones_the_seed() {
        let map = ThreadLocal::with_value("seed".to_string());

        assert_eq!(map.local().0, "seed");
    }

    #[test]
    fn each_thread_gets_its_own_value() {
        const THREADS: usize = 8;

        let map = ThreadLocal::<Cell<usize>>::new();
        let barrier = Barrier::new(THREADS);

        thread::scope(|s| {
            for index in 0..THREADS {
                let map = &map;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    let (cell, created) = map.local();
                    assert!(created);
                    cell.set(index);

                    let (cell, created) = map.local();
                    assert!(!created);
                    assert_eq!(cell.get(), index);
                });
            }
        });

        let mut map = map;
        let seen: HashSet<_> = map.iter_mut().map(|cell| cell.get()).collect();
        assert_eq!(seen, (0..THREADS).collect::<HashSet<_>>());
    }

    #[test]
    fn iter_is_safe_concurrently_with_local() {
        let map = ThreadLocal::<u64>::with_initializer(|| 1);
        _ = map.local();

        thread::scope(|s| {
            let map = &map;
            s.spawn(move || {
                _ = map.local();
            });

            // Whatever subset of insertions this observes must be
            // self-consistent.
            for value in map.iter() {
                assert_eq!(*value, 1);
            }
        });

        assert_eq!(map.len(), 2);
    }

    #[test]
    fn clear_resets_creation_tracking() {
        let mut map = ThreadLocal::<u64>::new();

        assert!(map.local().1);
        assert!(!map.local().1);
        assert!(!map.is_empty());

        map.clear();

        assert!(map.is_empty());
        assert!(map.local().1);
    }

    #[test]
    fn clear_drops_values() {
        static DROPPED: AtomicUsize = AtomicUsize::new(0);

        #[derive(Default)]
        struct Tracked;

        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPPED.fetch_add(1, Ordering::Relaxed);
            }
        }

        DROPPED.store(0, Ordering::Relaxed);

        let mut map = ThreadLocal::<Tracked>::new();
        _ = map.local();
        map.clear();

        assert_eq!(DROPPED.load(Ordering::Relaxed), 1);

        // Idempotent.
        map.clear();
        assert_eq!(DROPPED.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn drop_drops_values() {
        static DROPPED: AtomicUsize = AtomicUsize::new(0);

        #[derive(Default)]
        struct Tracked;

        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPPED.fetch_add(1, Ordering::Relaxed);
            }
        }

        DROPPED.store(0, Ordering::Relaxed);

        {
            let map = ThreadLocal::<Tracked>::new();
            _ = map.local();
        }

        assert_eq!(DROPPED.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn panicking_initializer_links_nothing() {
        let map = ThreadLocal::<u64>::with_initializer({
            let counter = AtomicUsize::new(0);
            move || {
                if counter.fetch_add(1, Ordering::Relaxed) == 0 {
                    panic!("first initialization fails");
                }
                7
            }
        });

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| map.local()));
        assert!(outcome.is_err());
        assert!(map.is_empty());

        // The failure left no trace: the retry is a first call again.
        let (value, created) = map.local();
        assert_eq!(*value, 7);
        assert!(created);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn initializer_runs_outside_any_lock() {
        // A reentrant initializer would deadlock or corrupt a lock-based
        // design; here it must simply observe the map without this thread's
        // value.
        let map = ThreadLocal::<u64>::with_initializer(|| 3);
        let observed_len = Mutex::new(None);

        thread::scope(|s| {
            let map = &map;
            let observed_len = &observed_len;
            s.spawn(move || {
                _ = map.local();
                *observed_len.lock().unwrap() = Some(map.len());
            });
        });

        assert_eq!(*observed_len.lock().unwrap(), Some(1));
    }
}
