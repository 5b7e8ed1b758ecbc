//! Low-level cache-line flush + fence primitive.
//!
//! The backend is chosen at compile time via Cargo features, mirroring the
//! teacher crate's own feature set (`use_clwb`, `use_clflushopt`,
//! `use_msync`, `no_persist`). `use_clwb` is the default, matching upstream.

use std::sync::atomic::{fence, Ordering};

/// Cache line size assumed by the flush loop below. Every architecture this
/// crate targets in practice uses 64-byte lines.
const CACHE_LINE_SIZE: usize = 64;

/// Crash injection for recovery testing, gated behind the `tcrash` feature.
///
/// Every call to [`persist`] ticks an armed countdown; reaching zero aborts
/// the process immediately, before the flush it was about to perform, the
/// same way a real power failure would leave a write unpersisted. This is
/// what lets integration tests exercise [`crate::pool::pool_recovery`]
/// against a pool that crashed mid-PMwCAS without reaching into any
/// crate-internal state.
#[cfg(feature = "tcrash")]
pub mod crash {
    use std::sync::atomic::{AtomicIsize, Ordering};

    static COUNTDOWN: AtomicIsize = AtomicIsize::new(-1);

    /// Arms the injector: the `n`th [`super::persist`] call from now aborts
    /// the process before it runs. `n == 0` aborts on the very next one.
    /// Disarmed (the default) by a negative countdown, which never fires.
    pub fn arm(n: usize) {
        COUNTDOWN.store(n as isize, Ordering::SeqCst);
    }

    pub(super) fn tick() {
        if COUNTDOWN.load(Ordering::SeqCst) < 0 {
            return;
        }
        if COUNTDOWN.fetch_sub(1, Ordering::SeqCst) == 0 {
            std::process::abort();
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "no_persist")] {
        /// Flushes `len` bytes starting at `addr` to the durability domain
        /// and fences, making the write observable after a crash.
        ///
        /// Compiled out entirely under `no_persist`, which trades crash
        /// safety for throughput in benchmarking and in tests that don't
        /// exercise recovery.
        pub fn persist(_addr: usize, _len: usize) {}
    } else if #[cfg(all(feature = "use_msync", unix))] {
        pub fn persist(addr: usize, len: usize) {
            #[cfg(feature = "tcrash")]
            crash::tick();
            flush_cache_lines(addr, len);
            let page = page_align(addr, len);
            let ret = unsafe {
                libc::msync(page.0 as *mut libc::c_void, page.1, libc::MS_SYNC)
            };
            debug_assert_eq!(ret, 0, "msync failed");
        }

        fn page_align(addr: usize, len: usize) -> (usize, usize) {
            let page_size = 4096usize;
            let start = addr & !(page_size - 1);
            let end = (addr + len + page_size - 1) & !(page_size - 1);
            (start, end - start)
        }
    } else if #[cfg(all(feature = "use_clflushopt", target_arch = "x86_64"))] {
        pub fn persist(addr: usize, len: usize) {
            #[cfg(feature = "tcrash")]
            crash::tick();
            flush_cache_lines(addr, len);
        }

        #[inline]
        fn flush_one(addr: usize) {
            unsafe {
                core::arch::x86_64::_mm_clflushopt(addr as *const u8 as *mut u8);
            }
        }
    } else if #[cfg(target_arch = "x86_64")] {
        pub fn persist(addr: usize, len: usize) {
            #[cfg(feature = "tcrash")]
            crash::tick();
            flush_cache_lines(addr, len);
        }

        #[inline]
        fn flush_one(addr: usize) {
            unsafe {
                core::arch::x86_64::_mm_clwb(addr as *const u8 as *mut u8);
            }
        }
    } else {
        pub fn persist(addr: usize, len: usize) {
            #[cfg(feature = "tcrash")]
            crash::tick();
            flush_cache_lines(addr, len);
        }

        #[inline]
        fn flush_one(_addr: usize) {
            // Non-x86_64 targets without an `msync` backend have no portable
            // cache-line flush; the sequentially-consistent fence below is
            // the best this crate can offer them.
        }
    }
}

#[cfg(not(feature = "no_persist"))]
fn flush_cache_lines(addr: usize, len: usize) {
    let start = addr & !(CACHE_LINE_SIZE - 1);
    let end = addr + len;
    let mut line = start;
    while line < end {
        flush_one(line);
        line += CACHE_LINE_SIZE;
    }
    fence(Ordering::SeqCst);
}

/// Persists the memory backing `val`, a convenience wrapper over the raw
/// `persist(addr, len)` primitive for a single typed value.
pub fn persist_val<T>(val: &T) {
    persist(val as *const T as usize, std::mem::size_of::<T>());
}

/// Persists `word`'s current value, then clears `bit` from it and persists
/// again — the two-step discipline every DIRTY-bit transition in this
/// crate follows: a reader must never observe a cleared DIRTY bit before
/// the value it qualifies is durable. Grounded on `persist_clear_dirty_bit`
/// in the original `PMwCAS.cpp`.
pub fn persist_clear_bit(word: &std::sync::atomic::AtomicU64, bit: u64) {
    persist_val(word);
    word.fetch_and(!bit, Ordering::SeqCst);
    persist_val(word);
}
