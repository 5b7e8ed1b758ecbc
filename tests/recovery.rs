//! Crash-recovery scenarios: leave a pool in an intermediate state, reopen
//! it as `pool_recovery` would after a restart, and check the outcome.
//!
//! Each scenario runs in a forked child process (`rusty_fork_test!`), the
//! same isolation the teacher crate uses for tests that touch a shared mmap
//! region — two scenarios in the same process would otherwise race on the
//! backing file if run in parallel.

use std::sync::atomic::Ordering;

use rusty_fork::rusty_fork_test;

use pmwcas::pmem::pool::{pool_finish, pool_init, PoolConfig};
use pmwcas::tag::MWCAS_BIT;
use pmwcas::{descriptor, pool, read, RecyclePolicy};

fn config_at(path: &std::path::Path) -> PoolConfig {
    PoolConfig {
        path: Some(path.to_path_buf()),
        capacity_bytes: 4 * 1024 * 1024,
    }
}

rusty_fork_test! {
    #[test]
    fn recovers_a_committed_swap_left_undecided() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pmwcas.pool");
        let word_offset;

        // First "process": install a word under a descriptor that would
        // have succeeded, then stop before deciding its status — as if the
        // process crashed between phase 1 (install) and phase 3 (decide).
        {
            let pmem = pool_init(config_at(&path)).unwrap();
            let word = pmem.alloc_words(1);
            word_offset = word.into_offset();
            let mdesc = pool::alloc(&pmem, RecyclePolicy::None, 0).unwrap();
            descriptor::add(&pmem, mdesc, word, 0, 123, None).unwrap();
            assert!(pmwcas::commit::install_word(&pmem, mdesc, 0, 0));
            assert!(tag_is_mwcas(unsafe { word.deref(&pmem) }.load(Ordering::SeqCst)));
            // status is still Undecided; word holds an MWCAS pointer at
            // `mdesc`. Skip pool_finish — a crash doesn't call it either.
            std::mem::forget(pmem);
        }

        // "Restart": reopen the same backing file and recover it.
        {
            let pmem = pool_init(config_at(&path)).unwrap();
            pool::pool_recovery(&pmem);
            let word = pmwcas::RelPtr::<std::sync::atomic::AtomicU64>::from_offset(word_offset);
            // Recovery has no record this descriptor ever succeeded (the
            // status CAS in phase 3 never ran), so it rolls the word back
            // to its pre-PMwCAS value rather than installing `new_val`.
            assert_eq!(read::read(&pmem, word), 0);
            // The slot itself must come back `Free`, or this descriptor is
            // permanently un-allocatable after the "crash" — `alloc` only
            // ever claims a slot whose status reads `Free`.
            pool::alloc(&pmem, RecyclePolicy::None, 0).expect("slot reclaimed by recovery");
            pool_finish(pmem);
        }
    }
}

fn tag_is_mwcas(raw: u64) -> bool {
    raw & MWCAS_BIT != 0
}

rusty_fork_test! {
    #[test]
    fn recovers_a_fully_decided_success_by_finishing_the_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pmwcas-decided.pool");
        let word_offset;

        {
            let pmem = pool_init(config_at(&path)).unwrap();
            let word = pmem.alloc_words(1);
            word_offset = word.into_offset();
            let mdesc = pool::alloc(&pmem, RecyclePolicy::None, 0).unwrap();
            descriptor::add(&pmem, mdesc, word, 0, 55, None).unwrap();
            assert!(pmwcas::commit::install_word(&pmem, mdesc, 0, 0));
            // Force the descriptor to a decided state without finalizing
            // the word, simulating a crash between phase 3 and phase 4.
            let mdesc_ref = unsafe { mdesc.deref(&pmem) };
            mdesc_ref.force_status(pmwcas::descriptor::status::SUCCESS);
            std::mem::forget(pmem);
        }

        {
            let pmem = pool_init(config_at(&path)).unwrap();
            pool::pool_recovery(&pmem);
            let word = pmwcas::RelPtr::<std::sync::atomic::AtomicU64>::from_offset(word_offset);
            assert_eq!(read::read(&pmem, word), 55);
            // Same requirement as the undecided-descriptor scenario above:
            // a decided descriptor recovery finishes finalizing must still
            // come back `Free`, not stay permanently claimed.
            pool::alloc(&pmem, RecyclePolicy::None, 0).expect("slot reclaimed by recovery");
            pool_finish(pmem);
        }
    }
}
