//! Word and multi-word descriptors: the data PMwCAS operates over.
//!
//! Grounded on `add_entry`/`reserve_entry` in the original `PMwCAS.cpp`: a
//! multi-descriptor (`Mdesc`) owns up to [`crate::WORD_DESCRIPTOR_SIZE`]
//! word descriptors (`Wdesc`), sorted strictly ascending by target address,
//! built up one `add`/`reserve` call at a time by the single thread that
//! allocated the `Mdesc`.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::PMwCasError;
use crate::pmem::ll::persist_val;
use crate::pmem::ptr::RelPtr;
use crate::pmem::pool::PoolHandle;
use crate::tag::{self, DIRTY_BIT};
use crate::WORD_DESCRIPTOR_SIZE;

/// What happens to a word descriptor's side-allocated value once the owning
/// PMwCAS decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecyclePolicy {
    /// Nothing to recycle.
    None = 0,
    /// On `Failed`, the caller's `new_val` was a side allocation that must
    /// be freed (the commit never installed it).
    FreeNewOnFail = 1,
    /// On `Success`, the caller's `expect` was a side allocation that is now
    /// superseded and must be freed.
    FreeExpectOnSuccess = 2,
    /// Hand the outcome to an out-of-band callback slot instead of freeing
    /// directly (used by [`reserve`] callers who own their own allocator).
    CallbackSlot = 3,
}

impl RecyclePolicy {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::FreeNewOnFail,
            2 => Self::FreeExpectOnSuccess,
            3 => Self::CallbackSlot,
            _ => Self::None,
        }
    }
}

/// Raw status codes, OR-able with [`tag::DIRTY_BIT`]. Matches `PMwCAS.cpp`'s
/// `ST_UNDECIDED`/`ST_SUCCESS`/`ST_FAILED`/`ST_FREE`.
pub mod status {
    pub const UNDECIDED: u64 = 0;
    pub const SUCCESS: u64 = 1;
    pub const FAILED: u64 = 2;
    pub const FREE: u64 = 3;
    pub const MASK: u64 = 0b11;
}

/// The decided/undecided state of a multi-descriptor, with the tag-bit
/// distinction it is physically OR'd with stripped off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Undecided,
    Success,
    Failed,
    Free,
}

impl Status {
    pub fn from_raw(raw: u64) -> Self {
        match raw & status::MASK {
            status::SUCCESS => Self::Success,
            status::FAILED => Self::Failed,
            status::FREE => Self::Free,
            _ => Self::Undecided,
        }
    }

    pub fn to_raw(self) -> u64 {
        match self {
            Self::Undecided => status::UNDECIDED,
            Self::Success => status::SUCCESS,
            Self::Failed => status::FAILED,
            Self::Free => status::FREE,
        }
    }

    pub fn is_dirty(raw: u64) -> bool {
        tag::is_dirty(raw)
    }
}

/// One target word within a multi-descriptor.
#[repr(C)]
pub struct Wdesc {
    pub(crate) addr: RelPtr<AtomicU64>,
    pub(crate) expect: u64,
    pub(crate) new_val: AtomicU64,
    pub(crate) mdesc: RelPtr<Mdesc>,
    pub(crate) recycle: AtomicU64,
}

impl Default for Wdesc {
    fn default() -> Self {
        Self {
            addr: RelPtr::dangling(),
            expect: 0,
            new_val: AtomicU64::new(0),
            mdesc: RelPtr::dangling(),
            recycle: AtomicU64::new(RecyclePolicy::None as u64),
        }
    }
}

impl Wdesc {
    pub fn addr(&self) -> RelPtr<AtomicU64> {
        self.addr
    }

    pub fn expect(&self) -> u64 {
        self.expect
    }

    pub fn new_val(&self) -> u64 {
        self.new_val.load(Ordering::SeqCst)
    }

    pub fn mdesc(&self) -> RelPtr<Mdesc> {
        self.mdesc
    }

    pub fn recycle_policy(&self) -> RecyclePolicy {
        RecyclePolicy::from_u8(self.recycle.load(Ordering::SeqCst) as u8)
    }

    /// Shallow copy used only to snapshot into the redo log — not a `Clone`
    /// impl, since sharing an `AtomicU64` by value would be misleading.
    fn snapshot(&self) -> WdescSnapshot {
        WdescSnapshot {
            addr: self.addr,
            expect: self.expect,
            new_val: self.new_val.load(Ordering::SeqCst),
            mdesc: self.mdesc,
            recycle: self.recycle.load(Ordering::SeqCst),
        }
    }
}

#[derive(Clone, Copy, Default)]
struct WdescSnapshot {
    addr: RelPtr<AtomicU64>,
    expect: u64,
    new_val: u64,
    mdesc: RelPtr<Mdesc>,
    recycle: u64,
}

impl Default for RelPtr<Mdesc> {
    fn default() -> Self {
        RelPtr::dangling()
    }
}
impl Default for RelPtr<AtomicU64> {
    fn default() -> Self {
        RelPtr::dangling()
    }
}

/// The redo log `add`/`reserve` use to make their tail-shift-and-increment
/// atomic across a crash — this crate's concrete instance of the
/// "transactional allocator" the specification assumes as an external
/// collaborator. See `SPEC_FULL.md` §11.
#[repr(C)]
struct AddLog {
    valid: AtomicU64,
    insert_point: u64,
    new_count: u64,
    tail: [WdescSnapshot; WORD_DESCRIPTOR_SIZE],
}

impl Default for AddLog {
    fn default() -> Self {
        Self {
            valid: AtomicU64::new(0),
            insert_point: 0,
            new_count: 0,
            tail: [WdescSnapshot::default(); WORD_DESCRIPTOR_SIZE],
        }
    }
}

/// A multi-word descriptor: one PMwCAS invocation's worth of state.
#[repr(C)]
pub struct Mdesc {
    pub(crate) status: AtomicU64,
    pub(crate) count: AtomicU64,
    pub(crate) callback: AtomicU64,
    pub(crate) wdescs: [Wdesc; WORD_DESCRIPTOR_SIZE],
    /// Intrusive next-pointer for the EBR retire list this descriptor is
    /// parked on between `free` and reclamation. `RelPtr::dangling()` means
    /// "not on any list" / "end of list".
    pub(crate) gc_entry: AtomicU64,
    add_log: AddLog,
}

impl Default for Mdesc {
    fn default() -> Self {
        Self {
            status: AtomicU64::new(status::FREE),
            count: AtomicU64::new(0),
            callback: AtomicU64::new(RecyclePolicy::None as u64),
            wdescs: std::array::from_fn(|_| Wdesc::default()),
            gc_entry: AtomicU64::new(RelPtr::<Mdesc>::dangling().into_offset()),
            add_log: AddLog::default(),
        }
    }
}

impl Mdesc {
    pub fn status(&self) -> u64 {
        self.status.load(Ordering::SeqCst)
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst) as usize
    }

    pub fn wdesc(&self, i: usize) -> &Wdesc {
        &self.wdescs[i]
    }

    fn wdescs_mut(&self) -> *mut Wdesc {
        self.wdescs.as_ptr() as *mut Wdesc
    }

    /// The recycle policy recorded at `alloc` time, used by `add`/`reserve`
    /// callers that pass `None` rather than overriding it per word.
    pub fn default_recycle(&self) -> RecyclePolicy {
        RecyclePolicy::from_u8(self.callback.load(Ordering::SeqCst) as u8)
    }

    /// Overwrites `status` directly, bypassing the decide CAS in
    /// [`crate::commit::help_commit`]. Not part of the supported API: it
    /// exists so crash-recovery integration tests can force a descriptor
    /// into a decided-but-not-finalized state without reaching into
    /// crate-private fields.
    #[doc(hidden)]
    pub fn force_status(&self, raw: u64) {
        self.status.store(raw, Ordering::SeqCst);
    }
}

fn effective_recycle(mdesc: &Mdesc, recycle: Option<RecyclePolicy>) -> RecyclePolicy {
    recycle.unwrap_or_else(|| mdesc.default_recycle())
}

/// Adds a target word to `mdesc`. Returns [`PMwCasError::Capacity`] if the
/// descriptor is already full, [`PMwCasError::DuplicateTarget`] if `addr`
/// was already added. `recycle` overrides the descriptor's default recycle
/// policy (set at [`crate::pool::alloc`] time) for this word alone; `None`
/// uses that default.
///
/// `add` is single-threaded per `mdesc`: the caller must not call `add` or
/// `commit` on the same `mdesc` from more than one thread, and must not call
/// `add` concurrently with itself on the same `mdesc`.
pub fn add(
    pool: &PoolHandle,
    mdesc: RelPtr<Mdesc>,
    addr: RelPtr<AtomicU64>,
    expect: u64,
    new_val: u64,
    recycle: Option<RecyclePolicy>,
) -> Result<(), PMwCasError> {
    debug_assert!(tag::is_untagged_value(expect), "expect must not carry tag bits");
    debug_assert!(tag::is_untagged_value(new_val), "new_val must not carry tag bits");
    let mdesc = unsafe { mdesc.deref(pool) };

    let insert_point = prepare_insert(mdesc, addr)?;
    let snapshot = WdescSnapshot {
        addr,
        expect,
        new_val,
        mdesc: pool.rel_of(mdesc),
        recycle: effective_recycle(mdesc, recycle) as u64,
    };
    apply_insert(mdesc, insert_point, snapshot);
    Ok(())
}

/// Like [`add`], but reserves the `new_val` slot for an external allocator
/// to write into (inside its own transaction) before `commit`. The returned
/// pointer always starts out holding `0`.
pub fn reserve(
    pool: &PoolHandle,
    mdesc: RelPtr<Mdesc>,
    addr: RelPtr<AtomicU64>,
    expect: u64,
    recycle: Option<RecyclePolicy>,
) -> Result<RelPtr<AtomicU64>, PMwCasError> {
    debug_assert!(tag::is_untagged_value(expect), "expect must not carry tag bits");
    let mdesc = unsafe { mdesc.deref(pool) };

    let insert_point = prepare_insert(mdesc, addr)?;
    let snapshot = WdescSnapshot {
        addr,
        expect,
        new_val: 0,
        mdesc: pool.rel_of(mdesc),
        recycle: effective_recycle(mdesc, recycle) as u64,
    };
    apply_insert(mdesc, insert_point, snapshot);
    Ok(pool.rel_of(&mdesc.wdescs[insert_point].new_val))
}

/// Scans `mdesc`'s populated word descriptors and returns the index the new
/// entry should be inserted at, or an error if the descriptor is full or
/// `addr` is a duplicate.
fn prepare_insert(mdesc: &Mdesc, addr: RelPtr<AtomicU64>) -> Result<usize, PMwCasError> {
    let count = mdesc.count();
    if count == WORD_DESCRIPTOR_SIZE {
        return Err(PMwCasError::Capacity);
    }
    let mut insert_point = count;
    for i in 0..count {
        let existing = mdesc.wdesc(i).addr();
        if existing == addr {
            return Err(PMwCasError::DuplicateTarget);
        }
        if existing > addr && insert_point > i {
            insert_point = i;
        }
    }
    Ok(insert_point)
}

/// Shifts `mdesc.wdescs[insert_point..count]` one slot right, writes `entry`
/// into the freed slot, and increments `count` — all through the redo log so
/// a crash mid-shift is recoverable. Grounded on `add_entry`'s
/// `TX_BEGIN`/`pmemobj_tx_add_range_direct`/`memmove`/`TX_END` sequence.
fn apply_insert(mdesc: &Mdesc, insert_point: usize, entry: WdescSnapshot) {
    let count = mdesc.count();
    let new_count = count + 1;
    let tail_len = new_count - insert_point;

    // Stage the post-shift tail (existing entries shifted right, plus the
    // new entry at the front) into the log before touching `wdescs` itself.
    let mut tail = [WdescSnapshot::default(); WORD_DESCRIPTOR_SIZE];
    tail[0] = entry;
    for i in insert_point..count {
        tail[1 + (i - insert_point)] = mdesc.wdesc(i).snapshot();
    }

    let log = &mdesc.add_log;
    // SAFETY: `add` is documented single-threaded per `mdesc`; no other
    // thread observes `add_log` until it is replayed by single-threaded
    // recovery.
    unsafe {
        let log_ptr = log as *const AddLog as *mut AddLog;
        (*log_ptr).insert_point = insert_point as u64;
        (*log_ptr).new_count = new_count as u64;
        (*log_ptr).tail[..tail_len].copy_from_slice(&tail[..tail_len]);
    }
    persist_val(log);
    log.valid.store(1, Ordering::SeqCst);
    persist_val(&log.valid);

    replay_add_log(mdesc);
}

/// Applies a valid redo log to `mdesc.wdescs`/`count`, then clears the log.
/// Idempotent: safe to call on a pool that crashed mid-apply, and a no-op if
/// the log isn't marked valid.
pub(crate) fn replay_add_log(mdesc: &Mdesc) {
    let log = &mdesc.add_log;
    if log.valid.load(Ordering::SeqCst) == 0 {
        return;
    }
    let insert_point = log.insert_point as usize;
    let new_count = log.new_count as usize;
    let tail_len = new_count - insert_point;

    let wdescs = mdesc.wdescs_mut();
    for i in 0..tail_len {
        let snap = log.tail[i];
        unsafe {
            let w = &mut *wdescs.add(insert_point + i);
            w.addr = snap.addr;
            w.expect = snap.expect;
            w.new_val.store(snap.new_val, Ordering::SeqCst);
            w.mdesc = snap.mdesc;
            w.recycle.store(snap.recycle, Ordering::SeqCst);
        }
    }
    mdesc.count.store(new_count as u64, Ordering::SeqCst);
    persist_val(&mdesc.count);
    for i in 0..tail_len {
        persist_val(mdesc.wdesc(insert_point + i));
    }

    log.valid.store(0, Ordering::SeqCst);
    persist_val(&log.valid);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmem::pool::{pool_init, PoolConfig};

    fn test_pool() -> PoolHandle {
        pool_init(PoolConfig {
            path: None,
            capacity_bytes: 4 * 1024 * 1024,
        })
        .unwrap()
    }

    #[test]
    fn add_keeps_sorted_and_rejects_duplicates() {
        let pool = test_pool();
        let mdesc = crate::pool::alloc(&pool, RecyclePolicy::None, 0).unwrap();
        let mdesc_ref = unsafe { mdesc.deref(&pool) };
        let words = pool.alloc_words(3);
        let a = RelPtr::<AtomicU64>::from_offset(words.into_offset());
        let b = RelPtr::<AtomicU64>::from_offset(words.into_offset() + 8);
        let c = RelPtr::<AtomicU64>::from_offset(words.into_offset() + 16);

        // Insert out of order; `add` must keep wdescs sorted ascending.
        add(&pool, mdesc, b, 2, 22, None).unwrap();
        add(&pool, mdesc, a, 1, 11, None).unwrap();
        add(&pool, mdesc, c, 3, 33, None).unwrap();

        assert_eq!(mdesc_ref.count(), 3);
        assert_eq!(mdesc_ref.wdesc(0).addr(), a);
        assert_eq!(mdesc_ref.wdesc(1).addr(), b);
        assert_eq!(mdesc_ref.wdesc(2).addr(), c);

        assert_eq!(add(&pool, mdesc, a, 1, 111, None), Err(PMwCasError::DuplicateTarget));
    }

    #[test]
    fn add_rejects_past_capacity() {
        let pool = test_pool();
        let mdesc = crate::pool::alloc(&pool, RecyclePolicy::None, 0).unwrap();
        let words = pool.alloc_words(WORD_DESCRIPTOR_SIZE + 1);
        for i in 0..WORD_DESCRIPTOR_SIZE {
            let addr = RelPtr::<AtomicU64>::from_offset(words.into_offset() + (i as u64) * 8);
            add(&pool, mdesc, addr, 0, 1, None).unwrap();
        }
        let overflow = RelPtr::<AtomicU64>::from_offset(words.into_offset() + (WORD_DESCRIPTOR_SIZE as u64) * 8);
        assert_eq!(add(&pool, mdesc, overflow, 0, 1, None), Err(PMwCasError::Capacity));
    }

    #[test]
    fn reserve_returns_zeroed_writable_slot() {
        let pool = test_pool();
        let mdesc = crate::pool::alloc(&pool, RecyclePolicy::None, 0).unwrap();
        let mdesc_ref = unsafe { mdesc.deref(&pool) };
        let words = pool.alloc_words(1);
        let addr = RelPtr::<AtomicU64>::from_offset(words.into_offset());
        let slot = reserve(&pool, mdesc, addr, 0, Some(RecyclePolicy::CallbackSlot)).unwrap();
        assert_eq!(mdesc_ref.wdesc(0).new_val(), 0);
        unsafe {
            slot.deref(&pool).store(99, Ordering::SeqCst);
        }
        assert_eq!(mdesc_ref.wdesc(0).new_val(), 99);
    }
}
