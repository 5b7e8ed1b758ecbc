//! End-to-end PMwCAS scenarios driven purely through the public API.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Barrier};
use std::thread;

use pmwcas::pmem::pool::{pool_init, PoolConfig};
use pmwcas::{descriptor, pool, read, PMwCasError, RecyclePolicy};

fn fresh_pool() -> pmwcas::PoolHandle {
    pool_init(PoolConfig {
        path: None,
        capacity_bytes: 4 * 1024 * 1024,
    })
    .expect("pool_init")
}

#[test]
fn single_word_success_and_mismatch() {
    let pmem = fresh_pool();
    let word = pmem.alloc_words(1);

    let mdesc = pool::alloc(&pmem, RecyclePolicy::None, 0).unwrap();
    descriptor::add(&pmem, mdesc, word, 0, 1, None).unwrap();
    assert!(pmwcas::commit::commit(&pmem, mdesc));
    assert_eq!(read::read(&pmem, word), 1);

    // Same starting value is now 1, not 0: a second attempt expecting 0
    // must fail and leave the word untouched.
    let mdesc2 = pool::alloc(&pmem, RecyclePolicy::None, 0).unwrap();
    descriptor::add(&pmem, mdesc2, word, 0, 2, None).unwrap();
    assert!(!pmwcas::commit::commit(&pmem, mdesc2));
    assert_eq!(read::read(&pmem, word), 1);
}

#[test]
fn two_word_swap_succeeds_atomically() {
    let pmem = fresh_pool();
    let base = pmem.alloc_words(2);
    let a = base;
    let b = pmwcas::RelPtr::<std::sync::atomic::AtomicU64>::from_offset(base.into_offset() + 8);
    unsafe {
        a.deref(&pmem).store(10, Ordering::SeqCst);
        b.deref(&pmem).store(20, Ordering::SeqCst);
    }

    let mdesc = pool::alloc(&pmem, RecyclePolicy::None, 0).unwrap();
    descriptor::add(&pmem, mdesc, a, 10, 20, None).unwrap();
    descriptor::add(&pmem, mdesc, b, 20, 10, None).unwrap();

    assert!(pmwcas::commit::commit(&pmem, mdesc));
    assert_eq!(read::read(&pmem, a), 20);
    assert_eq!(read::read(&pmem, b), 10);
}

#[test]
fn duplicate_target_is_rejected() {
    let pmem = fresh_pool();
    let word = pmem.alloc_words(1);
    let mdesc = pool::alloc(&pmem, RecyclePolicy::None, 0).unwrap();
    descriptor::add(&pmem, mdesc, word, 0, 1, None).unwrap();
    let err = descriptor::add(&pmem, mdesc, word, 0, 2, None).unwrap_err();
    assert_eq!(err, PMwCasError::DuplicateTarget);
}

#[test]
fn capacity_is_enforced() {
    let pmem = fresh_pool();
    let words = pmem.alloc_words(pmwcas::WORD_DESCRIPTOR_SIZE + 1);
    let mdesc = pool::alloc(&pmem, RecyclePolicy::None, 0).unwrap();
    for i in 0..pmwcas::WORD_DESCRIPTOR_SIZE {
        let addr = pmwcas::RelPtr::<std::sync::atomic::AtomicU64>::from_offset(
            words.into_offset() + (i as u64) * 8,
        );
        descriptor::add(&pmem, mdesc, addr, 0, 1, None).unwrap();
    }
    let overflow = pmwcas::RelPtr::<std::sync::atomic::AtomicU64>::from_offset(
        words.into_offset() + (pmwcas::WORD_DESCRIPTOR_SIZE as u64) * 8,
    );
    let err = descriptor::add(&pmem, mdesc, overflow, 0, 1, None).unwrap_err();
    assert_eq!(err, PMwCasError::Capacity);
}

#[test]
fn concurrent_committers_on_overlapping_words_agree() {
    // Two threads race the identical two-word swap; only the first to
    // install can succeed, and every reader (including the losing
    // committer) must agree on the outcome.
    let pmem = Arc::new(fresh_pool());
    let base = pmem.alloc_words(2);
    let a = base;
    let b = pmwcas::RelPtr::<std::sync::atomic::AtomicU64>::from_offset(base.into_offset() + 8);
    unsafe {
        a.deref(&pmem).store(1, Ordering::SeqCst);
        b.deref(&pmem).store(2, Ordering::SeqCst);
    }

    let barrier = Arc::new(Barrier::new(2));
    let mut handles = Vec::new();
    for _ in 0..2 {
        let pmem = Arc::clone(&pmem);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            let mdesc = pool::alloc(&pmem, RecyclePolicy::None, 0).unwrap();
            descriptor::add(&pmem, mdesc, a, 1, 2, None).unwrap();
            descriptor::add(&pmem, mdesc, b, 2, 1, None).unwrap();
            barrier.wait();
            pmwcas::commit::commit(&pmem, mdesc)
        }));
    }
    let results: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    // Exactly one of the two racing, mutually-exclusive swaps can commit.
    assert_eq!(results.iter().filter(|&&r| r).count(), 1);
    let (a_val, b_val) = (read::read(&pmem, a), read::read(&pmem, b));
    assert!((a_val, b_val) == (2, 1) || (a_val, b_val) == (1, 2));
}
