use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::tagged_ptr::{AtomicTaggedPtr, TaggedPtr};

/// One unit of pool storage: a payload plus the intrusive free-list link.
///
/// A node never moves once constructed (its block owns the storage until the
/// container is dropped), so a pointer to it may be held for the lifetime of
/// the container.
///
/// The link is atomic rather than plain: a thread that observed this node as
/// the stack top may load `next` while the node's current holder, having won
/// an intervening pop, is already rewriting it for a push. The stale reader's
/// value is harmless - its compare-and-swap fails on the advanced tag - but
/// the load and store must still be free of data races.
pub(crate) struct Node<P> {
    value: UnsafeCell<P>,
    next: AtomicPtr<Node<P>>,
}

impl<P> Node<P> {
    pub(crate) fn new(value: P) -> Self {
        Self {
            value: UnsafeCell::new(value),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Pointer to the payload.
    ///
    /// The caller is responsible for ensuring that dereferencing the pointer
    /// honors the node's current ownership (exclusively leased, exclusively
    /// iterated, or quiescent).
    #[inline]
    pub(crate) fn value_ptr(&self) -> *mut P {
        self.value.get()
    }

    #[inline]
    pub(crate) fn next(&self) -> *mut Node<P> {
        self.next.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_next(&self, next: *mut Node<P>) {
        self.next.store(next, Ordering::Relaxed);
    }
}

/// A lock-free LIFO of [`Node`]s, protected against ABA by the tag half of
/// the double-width head.
///
/// The stack does not own its nodes; it merely threads them through their
/// intrusive links. Every successful compare-and-swap on the head increments
/// the tag, so an interleaving that restores a previously observed head
/// pointer still fails the stale caller's exchange and forces a retry.
///
/// Popping reads `head.next` before the exchange. That read is safe because
/// nodes are only ever freed by their container's destructor, and any thread
/// in a position to pop holds the container alive.
pub(crate) struct FreeStack<P> {
    top: AtomicTaggedPtr,
    _nodes: PhantomData<*mut Node<P>>,
}

// SAFETY: Pushing hands a node (and the `P` inside it) to whichever thread
// pops it next, so thread-mobility of the payload is all that is required.
unsafe impl<P: Send> Send for FreeStack<P> {}
// SAFETY: All shared-reference operations are atomic; node payloads are only
// reachable through exclusively owned pops.
unsafe impl<P: Send> Sync for FreeStack<P> {}

impl<P> FreeStack<P> {
    pub(crate) const fn new() -> Self {
        Self {
            top: AtomicTaggedPtr::new(),
            _nodes: PhantomData,
        }
    }

    /// Pushes one node onto the stack, making it available to any thread.
    pub(crate) fn push(&self, node: NonNull<Node<P>>) {
        let mut observed = self.top.load();

        loop {
            // SAFETY: The caller hands us exclusive ownership of a live node;
            // the container keeps its storage valid.
            unsafe { node.as_ref() }.set_next(observed.ptr().cast());

            match self.top.compare_exchange(
                observed,
                TaggedPtr::new(node.as_ptr().cast(), observed.tag().wrapping_add(1)),
            ) {
                Ok(()) => return,
                Err(actual) => observed = actual,
            }
        }
    }

    /// Pops the most recently pushed node, or `None` if the stack is empty.
    ///
    /// Ownership of the returned node transfers to the caller.
    pub(crate) fn pop(&self) -> Option<NonNull<Node<P>>> {
        let mut observed = self.top.load();

        loop {
            let head = NonNull::new(observed.ptr().cast::<Node<P>>())?;

            // SAFETY: Node storage stays valid for the container's lifetime,
            // so the head we observed can be read even if another thread pops
            // it concurrently; the link load is atomic and a stale value is
            // discarded when our exchange fails on the advanced tag.
            let next = unsafe { head.as_ref() }.next();

            match self.top.compare_exchange(
                observed,
                TaggedPtr::new(next.cast(), observed.tag().wrapping_add(1)),
            ) {
                Ok(()) => return Some(head),
                Err(actual) => observed = actual,
            }
        }
    }

    /// Atomically detaches the entire stack, returning the head of the chain
    /// (linked through the nodes' `next` pointers), or `None` if it was
    /// already empty.
    ///
    /// Ownership of every node in the chain transfers to the caller.
    pub(crate) fn detach_all(&self) -> Option<NonNull<Node<P>>> {
        let mut observed = self.top.load();

        loop {
            let head = NonNull::new(observed.ptr().cast::<Node<P>>())?;

            match self.top.compare_exchange(
                observed,
                TaggedPtr::new(ptr::null_mut(), observed.tag().wrapping_add(1)),
            ) {
                Ok(()) => return Some(head),
                Err(actual) => observed = actual,
            }
        }
    }

    /// Pushes a whole chain in one exchange. `tail` must be the last node
    /// reachable from `head`; only the tail's link is rewritten on retry.
    pub(crate) fn push_chain(&self, head: NonNull<Node<P>>, tail: NonNull<Node<P>>) {
        let mut observed = self.top.load();

        loop {
            // SAFETY: The caller owns the whole chain exclusively; see `push`
            // for why the storage is valid.
            unsafe { tail.as_ref() }.set_next(observed.ptr().cast());

            match self.top.compare_exchange(
                observed,
                TaggedPtr::new(head.as_ptr().cast(), observed.tag().wrapping_add(1)),
            ) {
                Ok(()) => return,
                Err(actual) => observed = actual,
            }
        }
    }

    /// Number of nodes currently on the stack.
    ///
    /// Walks the chain without synchronization beyond the atomic link loads,
    /// so the result is immediately stale under concurrent pushes and pops.
    /// Debug use only.
    #[cfg_attr(test, mutants::skip)] // Mutating a diagnostic count proves nothing.
    pub(crate) fn count(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.top.load().ptr().cast::<Node<P>>();

        while let Some(node) = NonNull::new(cursor) {
            count += 1;

            // SAFETY: Node storage outlives the container; the link load is
            // atomic, so a concurrent rewrite cannot produce a torn read.
            cursor = unsafe { node.as_ref() }.next();
        }

        count
    }
}
