//! The backing store: a memory-mapped file PMwCAS's descriptor pool and
//! managed target words live in.
//!
//! This is deliberately minimal. General persistent-memory pool/heap
//! management (arbitrary-size application allocation, garbage collection of
//! application objects) is out of scope for this crate; `PoolHandle` only
//! owns the fixed-size arena the descriptor pool needs, plus a small bump
//! allocator ([`PoolHandle::alloc_words`]) tests and the demo consumer use
//! to create target words to PMwCAS over.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::descriptor::Mdesc;
use crate::ebr::Ebr;
use crate::pmem::ptr::RelPtr;
use crate::DESCRIPTOR_POOL_SIZE;

const MAGIC: u64 = 0x504d_7743_4153_3031; // "PMwCAS01"

/// How to open (or create) a [`PoolHandle`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Backing file path. `None` creates an anonymous temp-backed file via
    /// `tempfile`, useful for tests and the demo consumer — the pool itself
    /// is still durable for the lifetime of the process, just not named.
    pub path: Option<PathBuf>,
    /// Total mapped size in bytes. Must be large enough for the descriptor
    /// array plus whatever scratch words a consumer bump-allocates.
    pub capacity_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            path: None,
            capacity_bytes: 64 * 1024 * 1024,
        }
    }
}

#[repr(C)]
struct PoolHeader {
    magic: AtomicU64,
    mdescs: [Mdesc; DESCRIPTOR_POOL_SIZE],
    bump_next: AtomicU64,
}

/// A handle to a live mmap'd PMwCAS pool.
///
/// Every [`RelPtr`] the crate hands out or accepts is an offset from
/// `self.base()`. Dropping a `PoolHandle` unmaps the region; use
/// [`crate::pool::pool_finish`] for the documented shutdown path.
pub struct PoolHandle {
    base: *mut u8,
    len: usize,
    // Keeps the backing file (and, for anonymous pools, the tempfile) alive
    // for as long as the mapping is.
    _file: std::fs::File,
    /// Runtime-only epoch reclamation state. Deliberately not part of the
    /// mapped region: the global epoch clock and worker registry are
    /// ordinary DRAM bookkeeping, rebuilt fresh every time a process opens
    /// the pool, not data the pool's durability guarantees cover.
    pub(crate) ebr: Ebr,
}

impl std::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}

unsafe impl Send for PoolHandle {}
unsafe impl Sync for PoolHandle {}

impl PoolHandle {
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn header(&self) -> &PoolHeader {
        unsafe { &*(self.base as *const PoolHeader) }
    }

    /// Slice over the fixed-size multi-descriptor array.
    pub(crate) fn mdescs(&self) -> &[Mdesc; DESCRIPTOR_POOL_SIZE] {
        &self.header().mdescs
    }

    pub(crate) fn mdesc_rel(&self, index: usize) -> RelPtr<Mdesc> {
        self.rel_of(&self.header().mdescs[index])
    }

    /// Bump-allocates `count` contiguous, zero-initialized [`AtomicU64`]
    /// words from the pool's scratch arena (the space after the descriptor
    /// array) and returns a pointer to the first one. Intended for tests and
    /// demo consumers that need target words to run PMwCAS over; not a
    /// general persistent allocator.
    pub fn alloc_words(&self, count: usize) -> RelPtr<AtomicU64> {
        let header = self.header();
        let size = (count * std::mem::size_of::<AtomicU64>()) as u64;
        let header_end = std::mem::size_of::<PoolHeader>() as u64;
        let mut cur = header.bump_next.load(Ordering::SeqCst);
        loop {
            let start = cur.max(header_end);
            let aligned = (start + 7) & !7;
            let end = aligned + size;
            assert!(
                end as usize <= self.len,
                "pool scratch arena exhausted: requested {size} bytes, {} available",
                self.len as u64 - aligned
            );
            match header.bump_next.compare_exchange(
                cur,
                end,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    let base = self.base as usize + aligned as usize;
                    for i in 0..count {
                        unsafe {
                            let slot = (base + i * 8) as *const AtomicU64;
                            (*slot).store(0, Ordering::SeqCst);
                        }
                    }
                    return RelPtr::from_offset(aligned);
                }
                Err(observed) => cur = observed,
            }
        }
    }
}

/// Opens (creating if necessary) a PMwCAS pool. Always followed by
/// [`crate::pool::pool_recovery`] — matching `bz_tree::init`'s
/// `pmwcas_init` + `pmwcas_recovery` pairing — which is a no-op on a
/// freshly-initialized pool.
pub fn pool_init(config: PoolConfig) -> Result<PoolHandle, crate::error::PMwCasError> {
    let len = config.capacity_bytes;
    assert!(
        len >= std::mem::size_of::<PoolHeader>(),
        "pool capacity too small for the descriptor array"
    );

    let (file, created) = open_backing_file(config.path.as_deref(), len)?;

    let base = unsafe {
        let ptr = libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            std::os::unix::io::AsRawFd::as_raw_fd(&file),
            0,
        );
        if ptr == libc::MAP_FAILED {
            return Err(crate::error::PMwCasError::PoolIo(io::Error::last_os_error()));
        }
        ptr as *mut u8
    };

    let handle = PoolHandle {
        base,
        len,
        _file: file,
        ebr: Ebr::new(),
    };

    let magic = handle.header().magic.load(Ordering::SeqCst);
    if created || magic != MAGIC {
        log::debug!("initializing fresh pmwcas pool ({len} bytes)");
        crate::pool::first_use(&handle);
        handle.header().bump_next.store(
            std::mem::size_of::<PoolHeader>() as u64,
            Ordering::SeqCst,
        );
        handle.header().magic.store(MAGIC, Ordering::SeqCst);
        crate::pmem::ll::persist_val(&handle.header().magic);
    }

    Ok(handle)
}

fn open_backing_file(path: Option<&Path>, len: usize) -> io::Result<(std::fs::File, bool)> {
    match path {
        Some(p) => {
            let created = !p.exists();
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(p)?;
            file.set_len(len as u64)?;
            Ok((file, created))
        }
        None => {
            let file = tempfile::tempfile()?;
            file.set_len(len as u64)?;
            Ok((file, true))
        }
    }
}

/// Unmaps the pool. The backing file (if named) retains its contents for a
/// later [`pool_init`] to recover.
///
/// Just drops `pool`: [`Drop for PoolHandle`](#impl-Drop-for-PoolHandle)
/// already unmaps and closes everything a `PoolHandle` owns. This function
/// exists only to give the documented shutdown path its own name — a
/// `PoolHandle` dropped any other way (an early return, a panic unwind)
/// must be cleaned up identically, so the cleanup itself lives in `Drop`,
/// not here, and must not use `mem::forget`, which would skip closing
/// `_file` and tearing down `ebr`'s worker/limbo bookkeeping.
pub fn pool_finish(pool: PoolHandle) {
    drop(pool);
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}
