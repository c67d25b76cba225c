use std::fmt;
use std::sync::atomic::Ordering;

use portable_atomic::AtomicU128;
use static_assertions::const_assert_eq;

/// A `(pointer, tag)` pair packed into a single `u128` so the two can be
/// updated with one double-width compare-and-swap:
///
/// ```text
///   bits [127:64]  tag      (64 bits, incremented on every successful CAS)
///   bits [63:0]    pointer  (64 bits, full virtual address)
/// ```
///
/// The tag defeats the ABA problem: even if a node is popped, leased, returned
/// and pushed back at the same address between two observations, the tag will
/// have advanced and a compare-and-swap against the stale observation fails.
///
/// Using the full 64-bit address avoids any assumptions about virtual address
/// width (48-bit with 4-level paging vs 57-bit with LA57 on `x86_64`, varying
/// widths on `ARM64`). No pointer tagging, no stolen bits.
#[derive(Clone, Copy, Eq, PartialEq)]
#[repr(transparent)]
pub(crate) struct TaggedPtr(u128);

const_assert_eq!(size_of::<TaggedPtr>(), 16);

impl TaggedPtr {
    pub(crate) const NULL: Self = Self(0);

    #[inline]
    pub(crate) fn new(ptr: *mut (), tag: u64) -> Self {
        Self(u128::from(tag) << 64 | (ptr as usize as u128))
    }

    #[inline]
    pub(crate) fn ptr(self) -> *mut () {
        (self.0 as usize) as *mut ()
    }

    #[inline]
    pub(crate) fn tag(self) -> u64 {
        (self.0 >> 64) as u64
    }

    #[inline]
    pub(crate) fn is_null(self) -> bool {
        self.ptr().is_null()
    }
}

impl fmt::Debug for TaggedPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaggedPtr({:p}, tag={})", self.ptr(), self.tag())
    }
}

/// A 16-byte atomic cell holding a [`TaggedPtr`].
///
/// Both operations are sequentially consistent over the full 16 bytes.
/// `portable-atomic` supplies the per-target instruction (`cmpxchg16b` on
/// `x86_64`, `casp`/LL-SC pairs on `ARM64`), including a coherent 16-byte
/// load on targets whose only wide primitive is the compare-and-swap itself.
#[derive(Debug)]
pub(crate) struct AtomicTaggedPtr(AtomicU128);

impl AtomicTaggedPtr {
    pub(crate) const fn new() -> Self {
        Self(AtomicU128::new(0))
    }

    #[inline]
    pub(crate) fn load(&self) -> TaggedPtr {
        TaggedPtr(self.0.load(Ordering::SeqCst))
    }

    /// Atomically replaces the stored value with `desired` if it currently
    /// equals `expected`, returning the observed value on failure so the
    /// caller can retry without a separate reload.
    #[inline]
    pub(crate) fn compare_exchange(
        &self,
        expected: TaggedPtr,
        desired: TaggedPtr,
    ) -> Result<(), TaggedPtr> {
        match self
            .0
            .compare_exchange(expected.0, desired.0, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => Ok(()),
            Err(observed) => Err(TaggedPtr(observed)),
        }
    }
}
