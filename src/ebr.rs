//! Epoch-based reclamation for descriptor pool slots.
//!
//! Grounded on `ebr.cpp` (Mindaugas Rasiukevicius): a 3-value epoch clock
//! (`global_epoch` cycles 0, 1, 2), per-thread registration producing a
//! [`Worker`] each thread `enter`s/`exit`s around a read-side critical
//! section, and a serialized [`Ebr::sync`] that advances the clock and
//! reclaims whatever was retired two epochs ago.
//!
//! Scoped to this crate's one reclaimable type — [`Mdesc`] slots in the
//! fixed descriptor array — rather than a generic object collector; general
//! PM object reclamation is out of scope.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::descriptor::{status, Mdesc};
use crate::pmem::ll::persist_clear_bit;
use crate::pmem::pool::PoolHandle;
use crate::pmem::ptr::RelPtr;

const ACTIVE_FLAG: usize = 1 << 31;
const EPOCHS: usize = 3;

/// One thread's registration with an [`Ebr`] instance.
struct Worker {
    local_epoch: AtomicUsize,
    retired: AtomicBool,
}

impl Worker {
    fn new() -> Self {
        Self {
            local_epoch: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
        }
    }
}

/// A handle to a registered [`Worker`], held by the thread that registered
/// it — typically cached in a `thread_local!` alongside the `PoolHandle` it
/// was registered with.
#[derive(Clone)]
pub struct WorkerHandle(Arc<Worker>);

impl WorkerHandle {
    /// Marks this worker retired: it stops counting toward [`Ebr::sync`]'s
    /// quiescence check, without attempting to unlink it from `Ebr`'s
    /// worker list. Intended to run from the `thread_local!` destructor
    /// that fires when the owning thread exits.
    ///
    /// This resolves the deregistration question the original algorithm
    /// left open: physically unlinking a worker from a lock-free list
    /// would need hazard-pointer-grade protection of its own, while simply
    /// marking it retired is enough to stop a dead thread's stale epoch
    /// from blocking reclamation forever. The `Worker` allocation itself is
    /// not reclaimed, but it is bounded — one per (pool, thread) pair for
    /// the life of the process.
    pub fn mark_retired(&self) {
        self.0.retired.store(true, Ordering::SeqCst);
    }
}

/// The epoch clock plus the limbo lists staged for reclamation.
pub struct Ebr {
    global_epoch: AtomicUsize,
    workers: Mutex<Vec<Arc<Worker>>>,
    sync_lock: Mutex<()>,
    limbo: [Mutex<Vec<RelPtr<Mdesc>>>; EPOCHS],
}

impl Default for Ebr {
    fn default() -> Self {
        Self::new()
    }
}

impl Ebr {
    pub fn new() -> Self {
        Self {
            global_epoch: AtomicUsize::new(0),
            workers: Mutex::new(Vec::new()),
            sync_lock: Mutex::new(()),
            limbo: [
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
            ],
        }
    }

    /// Registers the calling thread, returning a handle it should keep for
    /// the rest of its lifetime (see [`WorkerHandle::mark_retired`]).
    pub fn register(&self) -> WorkerHandle {
        let worker = Arc::new(Worker::new());
        self.workers.lock().unwrap().push(Arc::clone(&worker));
        WorkerHandle(worker)
    }

    /// Enters a read-side critical section: publishes the current global
    /// epoch into `handle`'s local epoch with the active flag set.
    pub fn enter(&self, handle: &WorkerHandle) {
        let epoch = self.global_epoch.load(Ordering::SeqCst);
        handle
            .0
            .local_epoch
            .store(epoch | ACTIVE_FLAG, Ordering::SeqCst);
    }

    /// Leaves the critical section entered with [`Ebr::enter`].
    pub fn exit(&self, handle: &WorkerHandle) {
        handle.0.local_epoch.store(0, Ordering::SeqCst);
    }

    /// Advances the epoch clock and reclaims everything retired two epochs
    /// ago, once every live, non-retired worker is observed quiescent or
    /// already in the new epoch. Serialized: concurrent callers block on
    /// `sync_lock` rather than racing the epoch advance.
    pub fn sync(&self, pool: &PoolHandle) {
        let _guard = self.sync_lock.lock().unwrap();
        let global = self.global_epoch.load(Ordering::SeqCst);

        let workers = self.workers.lock().unwrap();
        for w in workers.iter() {
            if w.retired.load(Ordering::SeqCst) {
                continue;
            }
            loop {
                let local = w.local_epoch.load(Ordering::SeqCst);
                let active = local & ACTIVE_FLAG != 0;
                let epoch = local & !ACTIVE_FLAG;
                if !active || epoch == global {
                    break;
                }
                std::hint::spin_loop();
            }
        }
        drop(workers);

        let next = (global + 1) % EPOCHS;
        self.global_epoch.store(next, Ordering::SeqCst);

        // Two full epochs behind `next`: every worker that could have been
        // reading a slot retired while `global_epoch` held this value has
        // since been observed quiescent or advanced past it.
        let gc_epoch = (next + 1) % EPOCHS;
        let pending: Vec<RelPtr<Mdesc>> = self.limbo[gc_epoch].lock().unwrap().drain(..).collect();
        for mdesc in pending {
            reclaim(pool, mdesc);
        }
    }

    /// Stages `mdesc` for reclamation once it is safe to reuse — i.e. once
    /// [`Ebr::sync`] has confirmed no worker could still be reading through
    /// a reference obtained before this call.
    pub fn retire_slot(&self, mdesc: RelPtr<Mdesc>) {
        let epoch = self.global_epoch.load(Ordering::SeqCst);
        self.limbo[epoch].lock().unwrap().push(mdesc);
    }
}

/// Wraps the thread-local registration table so its `Drop` — which runs as
/// a TLS destructor at thread exit — can mark every registration retired.
/// This is the deregistration path `spec.md`'s Design Notes call out as
/// unimplemented in the original source.
#[derive(Default)]
struct RegisteredWorkers(Vec<(usize, WorkerHandle)>);

impl Drop for RegisteredWorkers {
    fn drop(&mut self) {
        for (_, worker) in self.0.drain(..) {
            worker.mark_retired();
        }
    }
}

thread_local! {
    // One `WorkerHandle` per `(pool, thread)` pair this thread has pinned
    // against, keyed by the pool's mmap base — the same per-process
    // lookup-table shape `crossbeam_epoch`'s thread-local guard cache uses,
    // scoped here to possibly-multiple pools in one process.
    static WORKERS: RefCell<RegisteredWorkers> = RefCell::new(RegisteredWorkers::default());
}

/// A held critical section: while alive, no descriptor this thread might
/// still be helping/reading through can be reclaimed by a concurrent
/// [`Ebr::sync`]. [`commit::commit`] and [`read::read`] each hold one for
/// the duration of their call; nothing else in this crate needs to.
///
/// [`commit::commit`]: crate::commit::commit
/// [`read::read`]: crate::read::read
pub(crate) struct Pin<'a> {
    pool: &'a PoolHandle,
    worker: WorkerHandle,
}

impl Drop for Pin<'_> {
    fn drop(&mut self) {
        self.pool.ebr.exit(&self.worker);
    }
}

/// Enters a critical section against `pool`'s `Ebr`, registering the
/// calling thread on first use and reusing that registration on every
/// subsequent call from the same thread against the same pool.
pub(crate) fn pin(pool: &PoolHandle) -> Pin<'_> {
    let key = pool.base() as usize;
    let worker = WORKERS.with(|cell| {
        let mut workers = cell.borrow_mut();
        if let Some((_, w)) = workers.0.iter().find(|(k, _)| *k == key) {
            return w.clone();
        }
        let w = pool.ebr.register();
        workers.0.push((key, w.clone()));
        w
    });
    pool.ebr.enter(&worker);
    Pin { pool, worker }
}

/// Finalizes a retired descriptor back to `FREE`, following the same
/// persist-then-clear-dirty discipline as every other status transition.
/// Grounded on `reclaim_PMwCAS` in the original `PMwCAS.cpp`.
fn reclaim(pool: &PoolHandle, mdesc_ptr: RelPtr<Mdesc>) {
    let mdesc = unsafe { mdesc_ptr.deref(pool) };
    mdesc
        .status
        .store(status::FREE | crate::tag::DIRTY_BIT, Ordering::SeqCst);
    persist_clear_bit(&mdesc.status, crate::tag::DIRTY_BIT);
}
