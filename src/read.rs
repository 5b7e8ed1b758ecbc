//! Persistent read: the protocol every load of a PMwCAS-managed word must
//! go through.
//!
//! Grounded on `pread()` in the original `PMwCAS.cpp`: a plain atomic load
//! is not enough, since the word might be mid-install (RDCSS-tagged),
//! claimed by an undecided PMwCAS (MWCAS-tagged and that descriptor still
//! racing), claimed by a decided one not yet finalized, or simply dirty. A
//! reader helps each of those along until it reaches a plain, durable
//! value.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::Backoff;

use crate::descriptor::{Mdesc, Status};
use crate::pmem::ll::persist_clear_bit;
use crate::pmem::pool::PoolHandle;
use crate::pmem::ptr::RelPtr;
use crate::tag;

/// Reads the current, durable value at `addr`, helping along any in-flight
/// install or commit this read happens to land on.
pub fn read(pool: &PoolHandle, addr: RelPtr<AtomicU64>) -> u64 {
    let _pin = crate::ebr::pin(pool);
    let target = unsafe { addr.deref(pool) };
    resolve(pool, target, 0)
}

/// The shared helping loop behind [`read`] and [`crate::commit::install_word`]:
/// loops until `target` holds a plain, untagged value, persisting/clearing
/// dirty bits and helping in-flight installs or commits along the way.
pub(crate) fn resolve(pool: &PoolHandle, target: &AtomicU64, depth: usize) -> u64 {
    let backoff = Backoff::new();
    loop {
        let raw = target.load(Ordering::SeqCst);

        if tag::is_dirty(raw) {
            persist_clear_bit(target, tag::DIRTY_BIT);
            continue;
        }

        if tag::is_rdcss(raw) {
            crate::commit::help_complete_rdcss(pool, target, raw);
            backoff.spin();
            continue;
        }

        if tag::is_mwcas(raw) {
            let mdesc_rel = RelPtr::<Mdesc>::from_offset(tag::untagged(raw));
            let mdesc = unsafe { mdesc_rel.deref(pool) };
            if Status::from_raw(mdesc.status()) == Status::Undecided {
                if depth < crate::MAX_HELP_DEPTH {
                    crate::commit::help_commit(pool, mdesc_rel, depth + 1);
                } else {
                    // Depth-bounded: rather than recurse further into a
                    // long chain of mutually-helping descriptors, back off
                    // and let whichever thread is actually making progress
                    // finish, then re-read.
                    backoff.spin();
                }
                continue;
            }
            crate::commit::finalize_by_addr(pool, target, mdesc_rel);
            continue;
        }

        return raw;
    }
}
