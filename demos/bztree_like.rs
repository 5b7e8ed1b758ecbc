//! Minimal illustration of the four calls a B-tree (or any other persistent
//! data structure) would make against this crate: [`pool::alloc`],
//! [`descriptor::add`], [`commit::commit`], [`read::read`]. This is not a
//! B-tree — no node layout, no search, no split/merge — just the PMwCAS
//! traffic a `bztree`-style consumer generates when it swaps a child
//! pointer slot and bumps the parent's version word in one atomic step.

use std::sync::atomic::Ordering;

use pmwcas::pmem::pool::{pool_init, PoolConfig};
use pmwcas::{commit, descriptor, pool, read, RecyclePolicy};

fn main() {
    let pmem = pool_init(PoolConfig {
        path: None,
        capacity_bytes: 4 * 1024 * 1024,
    })
    .expect("pool_init");

    // Stand in for a parent node's child-pointer slot and its version
    // counter, the two words a real bztree split would update together: the
    // new child pointer only becomes visible alongside the version bump
    // that invalidates readers' cached search paths.
    let words = pmem.alloc_words(2);
    let child_slot = words;
    let version = pmwcas::RelPtr::<std::sync::atomic::AtomicU64>::from_offset(
        words.into_offset() + 8,
    );
    unsafe {
        child_slot.deref(&pmem).store(0, Ordering::SeqCst);
        version.deref(&pmem).store(1, Ordering::SeqCst);
    }

    let new_child_ptr = 0xBEEF_0000u64;

    let mdesc = pool::alloc(&pmem, RecyclePolicy::None, 0).expect("descriptor pool exhausted");
    descriptor::add(&pmem, mdesc, child_slot, 0, new_child_ptr, None).expect("add child slot");
    descriptor::add(&pmem, mdesc, version, 1, 2, None).expect("add version bump");

    let ok = commit::commit(&pmem, mdesc);
    assert!(ok, "uncontended swap must succeed");

    assert_eq!(read::read(&pmem, child_slot), new_child_ptr);
    assert_eq!(read::read(&pmem, version), 2);

    pool::free(&pmem, mdesc);
    pool::quiesce(&pmem);
    pool::quiesce(&pmem);

    println!(
        "child slot -> 0x{:x}, version -> {}",
        read::read(&pmem, child_slot),
        read::read(&pmem, version)
    );
}
