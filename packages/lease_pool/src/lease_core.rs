use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};

use parking_lot::Mutex;

use crate::block::Block;
use crate::free_stack::{FreeStack, Node};

/// The substrate shared by both pools: a lock-free free list of nodes plus
/// the chain of blocks that backs them.
///
/// The mutex linearizes block allocation only - the fast path never touches
/// it. It is held for one allocation plus a capacity's worth of pointer
/// writes, is never held across user code, and never nests with any other
/// lock, so it cannot deadlock.
pub(crate) struct LeaseCore<P> {
    free: FreeStack<P>,

    /// Head of the block chain. Blocks are pushed under `alloc_lock` and
    /// never removed until drop, so a reader that loads the head sees a
    /// frozen, fully constructed prefix of the chain.
    blocks: AtomicPtr<Block<P>>,

    alloc_lock: Mutex<()>,
}

impl<P> LeaseCore<P> {
    pub(crate) const fn new() -> Self {
        Self {
            free: FreeStack::new(),
            blocks: AtomicPtr::new(std::ptr::null_mut()),
            alloc_lock: Mutex::new(()),
        }
    }

    #[inline]
    pub(crate) fn free_stack(&self) -> &FreeStack<P> {
        &self.free
    }

    /// Takes one node off the free list, growing the pool by one block if no
    /// node is available.
    ///
    /// The returned node is owned exclusively by the caller until it is
    /// pushed back.
    pub(crate) fn acquire(&self) -> NonNull<Node<P>>
    where
        P: Default,
    {
        if let Some(node) = self.free.pop() {
            return node;
        }

        self.acquire_slow()
    }

    #[cold]
    fn acquire_slow(&self) -> NonNull<Node<P>>
    where
        P: Default,
    {
        let _guard = self.alloc_lock.lock();

        // Another thread may have refilled the free list while we waited for
        // the lock; allocating a block then would be pure waste.
        if let Some(node) = self.free.pop() {
            return node;
        }

        // A panicking payload constructor unwinds out of here before any
        // linking: the caller observes no structural change.
        let block = Box::into_raw(Block::new());

        // SAFETY: The block is not yet published; we are its only user.
        unsafe { (*block).next = self.blocks.load(Ordering::Relaxed) };
        self.blocks.store(block, Ordering::Release);

        // SAFETY: Published blocks are immutable; `node` only does bounds
        // checks.
        let block = unsafe { &*block };

        // Node [0] is reserved for the caller; [1..N) go onto the free list
        // as one pre-linked chain.
        for index in 1..Block::<P>::CAPACITY - 1 {
            // SAFETY: Nodes are not yet visible to any other thread.
            unsafe { block.node(index).as_ref() }.set_next(block.node(index + 1).as_ptr());
        }
        self.free
            .push_chain(block.node(1), block.node(Block::<P>::CAPACITY - 1));

        block.node(0)
    }

    /// Returns a node to the free list, making it available to any thread.
    #[inline]
    pub(crate) fn release(&self, node: NonNull<Node<P>>) {
        self.free.push(node);
    }

    /// Head of the block chain, for the facades' block-walking iteration.
    #[inline]
    pub(crate) fn blocks_head(&self) -> *mut Block<P> {
        self.blocks.load(Ordering::Acquire)
    }

    /// Number of blocks allocated so far. Stale immediately under concurrent
    /// growth; debug use only.
    #[cfg_attr(test, mutants::skip)] // Mutating a diagnostic count proves nothing.
    pub(crate) fn block_count(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.blocks_head();

        while !cursor.is_null() {
            count += 1;

            // SAFETY: Published blocks are never unlinked or freed before the
            // container is dropped, and `next` is frozen at publish time.
            cursor = unsafe { (*cursor).next };
        }

        count
    }
}

impl<P> Drop for LeaseCore<P> {
    fn drop(&mut self) {
        let mut cursor = *self.blocks.get_mut();

        while !cursor.is_null() {
            // SAFETY: Blocks were leaked into the chain via `Box::into_raw`
            // and are reclaimed exactly once, here.
            let block = unsafe { Box::from_raw(cursor) };
            cursor = block.next;
        }
    }
}

/// Exclusive borrow of one node, returned to the free list on drop.
///
/// The lifetime ties the lease to its pool, so a lease outliving its
/// container is a compile error rather than a documented precondition.
pub(crate) struct RawLease<'pool, P> {
    stack: &'pool FreeStack<P>,
    node: NonNull<Node<P>>,
}

// SAFETY: The lease is an exclusive owner of the node's payload; sending it
// to another thread just moves that exclusive access along with the `P`.
unsafe impl<P: Send> Send for RawLease<'_, P> {}
// SAFETY: A shared lease only hands out `&P`.
unsafe impl<P: Sync> Sync for RawLease<'_, P> {}

impl<'pool, P> RawLease<'pool, P> {
    pub(crate) fn new(stack: &'pool FreeStack<P>, node: NonNull<Node<P>>) -> Self {
        Self { stack, node }
    }

    /// Address of the leased node, for identity comparisons.
    #[inline]
    pub(crate) fn node_addr(&self) -> usize {
        self.node.as_ptr() as usize
    }

    #[inline]
    pub(crate) fn value(&self) -> &P {
        // SAFETY: The lease owns the node exclusively; no other reference to
        // the payload can exist while it is held.
        unsafe { &*self.node.as_ref().value_ptr() }
    }

    #[inline]
    pub(crate) fn value_mut(&mut self) -> &mut P {
        // SAFETY: As above, plus `&mut self` excludes aliasing through this
        // lease itself.
        unsafe { &mut *self.node.as_ref().value_ptr() }
    }
}

impl<P> Drop for RawLease<'_, P> {
    fn drop(&mut self) {
        self.stack.push(self.node);
    }
}
