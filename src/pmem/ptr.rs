//! Relative pointers: persistent addresses as offsets from a pool base.
//!
//! Storing absolute addresses in persistent memory is unsafe across
//! restarts, since the OS is not guaranteed to map the backing file at the
//! same virtual address twice. [`RelPtr<T>`] instead stores a 48-bit offset
//! from its [`PoolHandle`]'s mmap base, leaving the high bits of a 64-bit
//! word free for the tag bits in [`crate::tag`].

use std::cmp::Ordering as CmpOrdering;
use std::marker::PhantomData;

use crate::pmem::pool::PoolHandle;
use crate::tag::ADDR_MASK;

/// Sentinel offset meaning "no pointer", analogous to a null pointer. Chosen
/// as the maximum representable 48-bit offset so `0` (the pool base itself,
/// always the pool header, never a valid target) remains a usable address.
const NIL: u64 = ADDR_MASK;

/// A 48-bit offset from a [`PoolHandle`]'s base, typed by what it points to.
///
/// `RelPtr` carries no tag bits of its own — ordering, equality, and
/// dereferencing all operate on the bare offset. Tag bits are only ever
/// attached when a `RelPtr` is turned into a value stored in a
/// PMwCAS-managed word (see [`crate::tag::with_tag`]).
pub struct RelPtr<T> {
    offset: u64,
    _marker: PhantomData<*const T>,
}

// `RelPtr` is a plain offset; it is `Send`/`Sync` independent of `T`'s own
// auto traits, the same way a raw byte offset would be.
unsafe impl<T> Send for RelPtr<T> {}
unsafe impl<T> Sync for RelPtr<T> {}

impl<T> Clone for RelPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for RelPtr<T> {}

impl<T> std::fmt::Debug for RelPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_dangling() {
            write!(f, "RelPtr(nil)")
        } else {
            write!(f, "RelPtr(0x{:x})", self.offset)
        }
    }
}

impl<T> PartialEq for RelPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset
    }
}
impl<T> Eq for RelPtr<T> {}

impl<T> PartialOrd for RelPtr<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for RelPtr<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.offset.cmp(&other.offset)
    }
}

impl<T> RelPtr<T> {
    /// A `RelPtr` pointing nowhere.
    #[inline]
    pub const fn dangling() -> Self {
        Self {
            offset: NIL,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn is_dangling(&self) -> bool {
        self.offset == NIL
    }

    /// Constructs a `RelPtr` from a raw offset. `offset` must have come from
    /// [`RelPtr::into_offset`] or from [`PoolHandle::rel_of`] for this same
    /// pool; it is masked to 48 bits defensively but otherwise trusted.
    #[inline]
    pub fn from_offset(offset: u64) -> Self {
        Self {
            offset: offset & ADDR_MASK,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn into_offset(self) -> u64 {
        self.offset
    }

    /// Dereferences this pointer against `pool`.
    ///
    /// # Safety
    /// `self` must have been produced from (or for) `pool`, and the
    /// `PoolHandle` must be alive and its backing mapping valid for the
    /// returned reference's lifetime.
    #[inline]
    pub unsafe fn deref<'a>(&self, pool: &'a PoolHandle) -> &'a T {
        &*(pool.base().add(self.offset as usize) as *const T)
    }
}

impl PoolHandle {
    /// Computes the [`RelPtr`] for a reference known to live inside this
    /// pool's backing mapping.
    pub fn rel_of<T>(&self, r: &T) -> RelPtr<T> {
        let base = self.base() as usize;
        let addr = r as *const T as usize;
        debug_assert!(addr >= base && addr < base + self.len(), "pointer outside pool");
        RelPtr::from_offset((addr - base) as u64)
    }
}
