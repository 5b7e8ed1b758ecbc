//! The descriptor pool: allocation and lifecycle of [`Mdesc`] slots.
//!
//! Grounded on `init_pool`/`alloc_PMwCAS`/`free_PMwCAS`/`recovery_PMwCAS` in
//! the original `PMwCAS.cpp`. The pool itself is the fixed-size `Mdesc`
//! array embedded in [`PoolHandle`]'s mapped region
//! ([`PoolHandle::mdescs`]); this module only adds the scan/CAS allocation
//! discipline and the epoch-reclaimed free path on top of it.

use std::sync::atomic::Ordering;

use crate::descriptor::{replay_add_log, status, Mdesc, RecyclePolicy};
use crate::pmem::ll::{persist_clear_bit, persist_val};
use crate::pmem::pool::PoolHandle;
use crate::pmem::ptr::RelPtr;
use crate::tag::DIRTY_BIT;
use crate::DESCRIPTOR_POOL_SIZE;

/// Initializes a freshly-mapped pool's descriptor array to all-`FREE`.
/// Called once by [`crate::pmem::pool::pool_init`] the first time a backing
/// file is created (or reused without a valid magic number).
pub(crate) fn first_use(pool: &PoolHandle) {
    for mdesc in pool.mdescs().iter() {
        mdesc.status.store(status::FREE, Ordering::SeqCst);
        persist_val(&mdesc.status);
    }
    log::info!("pmwcas descriptor pool initialized: {DESCRIPTOR_POOL_SIZE} slots");
}

/// Finds a `FREE` descriptor, claims it via CAS, and returns a pointer to
/// it. Scans starting at `hint % DESCRIPTOR_POOL_SIZE` (round-robin across
/// callers reduces contention on any one slot) and wraps once around the
/// array before giving up.
///
/// Returns `None` if every slot is currently in use — the pool has a fixed
/// capacity ([`DESCRIPTOR_POOL_SIZE`]); unlike target-word memory, growing
/// it is out of scope.
pub fn alloc(pool: &PoolHandle, recycle: RecyclePolicy, hint: usize) -> Option<RelPtr<Mdesc>> {
    let mdescs = pool.mdescs();
    let start = hint % DESCRIPTOR_POOL_SIZE;

    for offset in 0..DESCRIPTOR_POOL_SIZE {
        let i = (start + offset) % DESCRIPTOR_POOL_SIZE;
        let mdesc = &mdescs[i];
        let observed = mdesc.status.load(Ordering::SeqCst);
        if observed & !DIRTY_BIT != status::FREE {
            continue;
        }
        if mdesc
            .status
            .compare_exchange(
                observed,
                status::UNDECIDED | DIRTY_BIT,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            continue;
        }

        mdesc.count.store(0, Ordering::SeqCst);
        mdesc.callback.store(recycle as u64, Ordering::SeqCst);
        persist_val(&mdesc.count);
        persist_val(&mdesc.callback);
        persist_clear_bit(&mdesc.status, DIRTY_BIT);

        return Some(pool.mdesc_rel(i));
    }
    None
}

/// Retires `mdesc` through epoch-based reclamation rather than freeing it
/// immediately: a concurrent helper (see [`crate::commit`]) may still hold
/// a reference to it via a target word's tagged pointer, so the slot is
/// only reset to `FREE` once [`crate::ebr::Ebr::sync`] confirms no such
/// reader remains.
pub fn free(pool: &PoolHandle, mdesc: RelPtr<Mdesc>) {
    pool.ebr.retire_slot(mdesc);
}

/// Advances the pool's epoch clock, reclaiming anything staged for free two
/// epochs ago. Callers drive this periodically (e.g. after a batch of
/// commits) rather than the pool doing it implicitly — matching `ebr.cpp`,
/// where `ebr_sync` is the caller's responsibility, not automatic.
pub fn quiesce(pool: &PoolHandle) {
    pool.ebr.sync(pool);
}

/// Single-threaded recovery entry point. Must run before any concurrent
/// access to `pool` resumes after a restart. Replays each descriptor's
/// pending add-log (undoing a crash mid `add`/`reserve`), then hands off to
/// [`crate::recovery::recover`] for the status-driven word rollback/roll-
/// forward pass.
pub fn pool_recovery(pool: &PoolHandle) {
    for mdesc in pool.mdescs().iter() {
        replay_add_log(mdesc);
    }
    crate::recovery::recover(pool);
}
