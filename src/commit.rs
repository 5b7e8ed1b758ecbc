//! The PMwCAS commit protocol.
//!
//! Grounded on the four-phase `PMwCAS()` routine in the original
//! `PMwCAS.cpp` and on the Rust RDCSS/MwCAS sketch in
//! `evaluation/cas/src/pcas.rs` (`install_mwcas_descriptor`,
//! `complete_install`, `pmwcas_inner`): install every target word behind an
//! RDCSS half-install pointing at its [`Wdesc`], flip each half-install to
//! an MWCAS pointer at the owning [`Mdesc`] once installed, decide the
//! descriptor's status once every word is claimed (or one isn't), then
//! finalize every word to its decided value.
//!
//! A reader or helper that lands on any of these intermediate states (see
//! [`crate::read::resolve`]) drives it forward itself rather than waiting,
//! which is what makes the protocol lock-free.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::Backoff;

use crate::descriptor::{status, Mdesc, Status, Wdesc};
use crate::pmem::ll::persist_clear_bit;
use crate::pmem::pool::PoolHandle;
use crate::pmem::ptr::RelPtr;
use crate::tag;

/// Attempts to commit `mdesc`: installs every word it describes, decides
/// success or failure, and finalizes every word either way. Returns `true`
/// iff the PMwCAS succeeded.
///
/// Like [`crate::descriptor::add`], `commit` must not be called
/// concurrently by more than one thread for the same `mdesc` — concurrent
/// *helpers* reaching the same `mdesc` through [`crate::read::read`] are
/// fine and expected.
pub fn commit(pool: &PoolHandle, mdesc: RelPtr<Mdesc>) -> bool {
    let _pin = crate::ebr::pin(pool);
    help_commit(pool, mdesc, 0) == Status::Success
}

/// The recursive engine behind [`commit`] and [`crate::read::resolve`]'s
/// helping path. `depth` bounds how many descriptors deep a single call
/// will recurse into helping before backing off instead (see
/// `crate::MAX_HELP_DEPTH`).
pub(crate) fn help_commit(pool: &PoolHandle, mdesc_rel: RelPtr<Mdesc>, depth: usize) -> Status {
    let mdesc = unsafe { mdesc_rel.deref(pool) };

    if Status::from_raw(mdesc.status()) == Status::Undecided {
        let count = mdesc.count();
        let mut all_installed = true;
        for i in 0..count {
            // Another helper may have already decided this descriptor
            // while we were installing earlier words; no point continuing
            // to install once that happens.
            if Status::from_raw(mdesc.status()) != Status::Undecided {
                break;
            }
            if !install_word(pool, mdesc_rel, i, depth) {
                all_installed = false;
                break;
            }
        }

        let desired = if all_installed { status::SUCCESS } else { status::FAILED };
        let _ = mdesc.status.compare_exchange(
            status::UNDECIDED,
            desired | tag::DIRTY_BIT,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        // Whether the CAS above won or a helper beat us to it, `status` now
        // carries a decided value (possibly still dirty); make it durable.
        if tag::is_dirty(mdesc.status()) {
            persist_clear_bit(&mdesc.status, tag::DIRTY_BIT);
        }
    }

    let status = Status::from_raw(mdesc.status());
    for i in 0..mdesc.count() {
        let wdesc = mdesc.wdesc(i);
        let target = unsafe { wdesc.addr().deref(pool) };
        finalize_word(target, mdesc_rel, wdesc, status);
    }
    status
}

/// Phase 1 for a single word: RDCSS-install a pointer to `mdesc.wdescs[idx]`
/// over the target, provided it still holds `expect` once any in-progress
/// install/commit it's blocking on has been helped to completion. Returns
/// `false` if the word's true value can never match `expect` (a genuine
/// compare-and-swap mismatch).
///
/// Crate-internal, except that it's also reachable from integration tests
/// (`#[doc(hidden)]`, not part of the supported API) — the only way to
/// drive a descriptor into an installed-but-undecided state from outside
/// this crate, which crash-recovery tests need to set up the scenario
/// [`crate::recovery::recover`] is supposed to roll forward or back.
#[doc(hidden)]
pub fn install_word(
    pool: &PoolHandle,
    mdesc_rel: RelPtr<Mdesc>,
    idx: usize,
    depth: usize,
) -> bool {
    let mdesc = unsafe { mdesc_rel.deref(pool) };
    let wdesc = mdesc.wdesc(idx);
    let target = unsafe { wdesc.addr().deref(pool) };
    let wdesc_rel = pool.rel_of(wdesc);
    let backoff = Backoff::new();

    loop {
        // A concurrent helper of this same `mdesc` may have already
        // claimed this word (fully, or half-way through RDCSS) before we
        // got here. Recognize our own descriptor rather than falling into
        // `resolve()`, which would otherwise try to help-commit `mdesc`
        // from inside its own install phase and recurse forever.
        let raw = target.load(Ordering::SeqCst);
        if tag::is_mwcas(raw) && tag::untagged(raw) == mdesc_rel.into_offset() {
            return true;
        }
        if tag::is_rdcss(raw) {
            let half_rel = RelPtr::<Wdesc>::from_offset(tag::untagged(raw));
            let half = unsafe { half_rel.deref(pool) };
            if half.mdesc() == mdesc_rel {
                complete_install(pool, target, mdesc_rel, half, half_rel);
                return true;
            }
        }

        let current = crate::read::resolve(pool, target, depth);
        if current != wdesc.expect() {
            return false;
        }

        let rdcss_val = tag::with_tag(wdesc_rel.into_offset(), tag::RDCSS_BIT | tag::DIRTY_BIT);
        match target.compare_exchange(wdesc.expect(), rdcss_val, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => {
                persist_clear_bit(target, tag::DIRTY_BIT);
                complete_install(pool, target, mdesc_rel, wdesc, wdesc_rel);
                return true;
            }
            Err(_) => {
                // Someone else changed the word between our resolve() and
                // our CAS; loop back to resolve() to find out what it is
                // now (helping it along if it's another half-install).
                backoff.spin();
                continue;
            }
        }
    }
}

/// Phase 1's second half (the "DCSS" in RDCSS): flips a word still holding
/// the RDCSS half-install pointer for `wdesc` to either the owning
/// descriptor's MWCAS pointer (if still undecided) or straight to the
/// decided final value. Idempotent — safe to call from a helper that didn't
/// win the initial install CAS.
fn complete_install(
    pool: &PoolHandle,
    target: &AtomicU64,
    mdesc_rel: RelPtr<Mdesc>,
    wdesc: &Wdesc,
    wdesc_rel: RelPtr<Wdesc>,
) {
    let mdesc = unsafe { mdesc_rel.deref(pool) };
    let rdcss_val = tag::with_tag(wdesc_rel.into_offset(), tag::RDCSS_BIT);

    loop {
        let status = Status::from_raw(mdesc.status());
        let new_word = match status {
            Status::Undecided => {
                tag::with_tag(mdesc_rel.into_offset(), tag::MWCAS_BIT | tag::DIRTY_BIT)
            }
            Status::Success => wdesc.new_val() | tag::DIRTY_BIT,
            Status::Failed | Status::Free => wdesc.expect() | tag::DIRTY_BIT,
        };

        match target.compare_exchange(rdcss_val, new_word, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => {
                persist_clear_bit(target, tag::DIRTY_BIT);
                return;
            }
            Err(observed) => {
                if observed == rdcss_val {
                    // Spurious failure report; the word hasn't actually
                    // moved. Retry with the (possibly now-decided) status.
                    continue;
                }
                return; // a helper already completed this install.
            }
        }
    }
}

/// Helps complete an RDCSS half-install a reader or another installer
/// landed on, reconstructing the owning descriptor from the tagged
/// pointer. Entry point used by [`crate::read::resolve`].
pub(crate) fn help_complete_rdcss(pool: &PoolHandle, target: &AtomicU64, raw: u64) {
    let wdesc_rel = RelPtr::<Wdesc>::from_offset(tag::untagged(raw));
    let wdesc = unsafe { wdesc_rel.deref(pool) };
    let mdesc_rel = wdesc.mdesc();
    complete_install(pool, target, mdesc_rel, wdesc, wdesc_rel);
}

/// Phase 4 for a single word, given the `Wdesc` that targets it directly.
/// Replaces a still-live MWCAS pointer to `mdesc` with the decided plain
/// value. A no-op if the word was already finalized (by this call or a
/// helper) or never reached the install phase.
fn finalize_word(target: &AtomicU64, mdesc_rel: RelPtr<Mdesc>, wdesc: &Wdesc, status: Status) {
    loop {
        let current = target.load(Ordering::SeqCst);
        if tag::is_dirty(current) {
            persist_clear_bit(target, tag::DIRTY_BIT);
            continue;
        }
        if !tag::is_mwcas(current) || tag::untagged(current) != mdesc_rel.into_offset() {
            return;
        }
        let final_val = (if status == Status::Success {
            wdesc.new_val()
        } else {
            wdesc.expect()
        }) | tag::DIRTY_BIT;
        match target.compare_exchange(current, final_val, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => {
                persist_clear_bit(target, tag::DIRTY_BIT);
                return;
            }
            Err(_) => continue,
        }
    }
}

/// Finalizes whichever of `mdesc`'s words matches `target`'s address,
/// without the caller having an index in hand. Used by
/// [`crate::read::resolve`], which only has the target word, not the
/// `Wdesc` that claimed it.
pub(crate) fn finalize_by_addr(pool: &PoolHandle, target: &AtomicU64, mdesc_rel: RelPtr<Mdesc>) {
    let mdesc = unsafe { mdesc_rel.deref(pool) };
    let status = Status::from_raw(mdesc.status());
    let target_rel = pool.rel_of(target);
    for i in 0..mdesc.count() {
        let wdesc = mdesc.wdesc(i);
        if wdesc.addr() == target_rel {
            finalize_word(target, mdesc_rel, wdesc, status);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{add, RecyclePolicy};
    use crate::pmem::pool::{pool_init, PoolConfig};

    fn test_pool() -> PoolHandle {
        pool_init(PoolConfig {
            path: None,
            capacity_bytes: 4 * 1024 * 1024,
        })
        .unwrap()
    }

    #[test]
    fn single_word_success() {
        let pool = test_pool();
        let words = pool.alloc_words(1);
        let mdesc = crate::pool::alloc(&pool, RecyclePolicy::None, 0).unwrap();
        let mdesc_ref = unsafe { mdesc.deref(&pool) };
        add(&pool, mdesc, words, 0, 7, None).unwrap();

        assert!(commit(&pool, mdesc));
        assert_eq!(crate::read::read(&pool, words), 7);
        assert_eq!(mdesc_ref.status(), status::SUCCESS);
    }

    #[test]
    fn single_word_mismatch_fails_and_rolls_back() {
        let pool = test_pool();
        let words = pool.alloc_words(1);
        unsafe {
            words.deref(&pool).store(5, Ordering::SeqCst);
        }
        let mdesc = crate::pool::alloc(&pool, RecyclePolicy::None, 0).unwrap();
        let mdesc_ref = unsafe { mdesc.deref(&pool) };
        // Expect 0, but the word actually holds 5.
        add(&pool, mdesc, words, 0, 99, None).unwrap();

        assert!(!commit(&pool, mdesc));
        assert_eq!(crate::read::read(&pool, words), 5);
        assert_eq!(mdesc_ref.status(), status::FAILED);
    }

    #[test]
    fn two_word_success_updates_both() {
        let pool = test_pool();
        let words = pool.alloc_words(2);
        let a = words;
        let b = RelPtr::<AtomicU64>::from_offset(words.into_offset() + 8);

        let mdesc = crate::pool::alloc(&pool, RecyclePolicy::None, 0).unwrap();
        let mdesc_ref = unsafe { mdesc.deref(&pool) };
        add(&pool, mdesc, a, 0, 10, None).unwrap();
        add(&pool, mdesc, b, 0, 20, None).unwrap();

        assert!(commit(&pool, mdesc));
        assert_eq!(crate::read::read(&pool, a), 10);
        assert_eq!(crate::read::read(&pool, b), 20);
    }

    #[test]
    fn two_word_partial_mismatch_rolls_both_back() {
        let pool = test_pool();
        let words = pool.alloc_words(2);
        let a = words;
        let b = RelPtr::<AtomicU64>::from_offset(words.into_offset() + 8);
        unsafe {
            b.deref(&pool).store(1, Ordering::SeqCst);
        }

        let mdesc = crate::pool::alloc(&pool, RecyclePolicy::None, 0).unwrap();
        let mdesc_ref = unsafe { mdesc.deref(&pool) };
        add(&pool, mdesc, a, 0, 10, None).unwrap();
        add(&pool, mdesc, b, 0, 20, None).unwrap(); // expect 0, actual 1

        assert!(!commit(&pool, mdesc));
        assert_eq!(crate::read::read(&pool, a), 0);
        assert_eq!(crate::read::read(&pool, b), 1);
    }

    #[test]
    fn a_helper_can_read_through_an_undecided_commit() {
        // Simulates helping by driving the commit through `read` alone,
        // without ever calling `commit` directly on this thread.
        let pool = test_pool();
        let words = pool.alloc_words(1);
        let mdesc = crate::pool::alloc(&pool, RecyclePolicy::None, 0).unwrap();
        let mdesc_ref = unsafe { mdesc.deref(&pool) };
        add(&pool, mdesc, words, 0, 55, None).unwrap();

        // Install phase only, leaving the descriptor undecided, as if a
        // committing thread crashed or stalled right after RDCSS install.
        assert!(install_word(&pool, mdesc, 0, 0));

        assert_eq!(crate::read::read(&pool, words), 55);
        assert_eq!(mdesc_ref.status(), status::SUCCESS);
    }
}
