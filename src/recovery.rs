//! Crash recovery: the single-threaded pass that restores every descriptor
//! and target word to a consistent state after a restart.
//!
//! Grounded on `recovery_PMwCAS()` in the original `PMwCAS.cpp`. Must run
//! to completion before any concurrent access resumes — unlike every other
//! operation in this crate, recovery assumes it has the pool to itself.
//! [`crate::pool::pool_recovery`] calls this after replaying each
//! descriptor's add-log; by the time `recover` runs, every `Mdesc`'s
//! `wdescs`/`count` already reflect their pre-crash state in full.

use std::sync::atomic::Ordering;

use crate::descriptor::{status, Mdesc, Status, Wdesc};
use crate::pmem::ll::persist_val;
use crate::pmem::pool::PoolHandle;
use crate::pmem::ptr::RelPtr;
use crate::tag;

/// Walks every descriptor slot, clears any stray dirty bit left on its
/// status, decides any descriptor recovery finds still `Undecided` (no
/// record exists that it ever succeeded, so it is rolled back as if
/// failed), rolls every word it touched forward or backward to match, and
/// finally frees the slot — after `recover` returns, every `Mdesc` in the
/// pool is `Free` and available to `pool::alloc` again.
pub fn recover(pool: &PoolHandle) {
    for mdesc in pool.mdescs().iter() {
        let mut raw_status = mdesc.status.load(Ordering::SeqCst);
        if tag::is_dirty(raw_status) {
            raw_status &= !tag::DIRTY_BIT;
            mdesc.status.store(raw_status, Ordering::SeqCst);
            persist_val(&mdesc.status);
        }

        let decided = match Status::from_raw(raw_status) {
            Status::Free => continue,
            Status::Undecided => {
                log::warn!("recovering undecided pmwcas descriptor: treating as failed");
                mdesc.status.store(status::FAILED, Ordering::SeqCst);
                persist_val(&mdesc.status);
                Status::Failed
            }
            decided => decided,
        };

        let mdesc_rel = pool.rel_of(mdesc);
        for i in 0..mdesc.count() {
            roll_word(pool, mdesc.wdesc(i), mdesc_rel, decided);
        }

        mdesc.status.store(status::FREE, Ordering::SeqCst);
        persist_val(&mdesc.status);
    }
}

/// Restores a single target word to `decided`'s outcome, if it still shows
/// any sign of having been claimed by `mdesc_rel` (an RDCSS half-install
/// pointing at this word descriptor, or a live MWCAS pointer at the
/// descriptor itself). A plain value means the word was already finalized
/// before the crash; left untouched.
fn roll_word(pool: &PoolHandle, wdesc: &Wdesc, mdesc_rel: RelPtr<Mdesc>, decided: Status) {
    let target = unsafe { wdesc.addr().deref(pool) };
    let raw = tag::untagged(target.load(Ordering::SeqCst));
    let current = target.load(Ordering::SeqCst);

    let points_here = if tag::is_mwcas(current) {
        raw == mdesc_rel.into_offset()
    } else if tag::is_rdcss(current) {
        let half_rel = RelPtr::<Wdesc>::from_offset(raw);
        let half = unsafe { half_rel.deref(pool) };
        half.mdesc() == mdesc_rel
    } else {
        false
    };

    if !points_here {
        return;
    }

    let final_val = match decided {
        Status::Success => wdesc.new_val(),
        _ => wdesc.expect(),
    };
    target.store(final_val, Ordering::SeqCst);
    persist_val(target);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{add, RecyclePolicy};
    use crate::pmem::pool::{pool_init, PoolConfig};
    use crate::tag::{DIRTY_BIT, MWCAS_BIT};

    fn test_pool() -> PoolHandle {
        pool_init(PoolConfig {
            path: None,
            capacity_bytes: 4 * 1024 * 1024,
        })
        .unwrap()
    }

    #[test]
    fn rolls_forward_an_undecided_descriptor_the_original_would_have_succeeded() {
        let pool = test_pool();
        let words = pool.alloc_words(1);
        let mdesc = crate::pool::alloc(&pool, RecyclePolicy::None, 0).unwrap();
        let mdesc_ref = unsafe { mdesc.deref(&pool) };
        add(&pool, mdesc, words, 0, 77, None).unwrap();

        // Simulate a crash right after phase 1 installed the word but
        // before phase 3 decided the descriptor's status.
        let target = unsafe { words.deref(&pool) };
        target.store(MWCAS_BIT | mdesc.into_offset(), Ordering::SeqCst);

        recover(&pool);

        // No evidence of success was ever recorded, so recovery treats the
        // descriptor as failed and restores `expect`, not `new_val`. The
        // slot itself must come back `Free` — otherwise every crash leaks
        // a descriptor permanently.
        assert_eq!(mdesc_ref.status(), status::FREE);
        assert_eq!(crate::read::read(&pool, words), 0);
    }

    #[test]
    fn clears_stray_dirty_bit_on_a_decided_descriptor() {
        let pool = test_pool();
        let mdesc = crate::pool::alloc(&pool, RecyclePolicy::None, 0).unwrap();
        let mdesc_ref = unsafe { mdesc.deref(&pool) };
        mdesc_ref
            .status
            .store(status::SUCCESS | DIRTY_BIT, Ordering::SeqCst);

        recover(&pool);

        // A decided-and-dirty descriptor with no words to roll forward
        // still must end up `Free`, same as any other slot recovery walks.
        assert_eq!(mdesc_ref.status(), status::FREE);
    }
}
