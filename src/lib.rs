//! Persistent multi-word compare-and-swap (PMwCAS).
//!
//! This crate implements a lock-free state machine that atomically
//! transitions up to [`WORD_DESCRIPTOR_SIZE`] machine words in
//! byte-addressable persistent memory from a vector of expected values to a
//! vector of new values, with crash consistency: after any crash and
//! [`recovery::recover`], every participating word is either all-expected or
//! all-new.
//!
//! The hard part, and the bulk of this crate, is the lock-free install
//! protocol ([`commit`]), the RDCSS-style two-stage word install it builds
//! on ([`tag`]), the dirty-bit persistence discipline ([`pmem`]), crash
//! recovery ([`recovery`]), and the epoch-based reclamation that retires
//! descriptors once no reader can still observe them ([`ebr`]).
//!
//! A B-tree or other persistent data structure is expected to sit on top of
//! this crate; only four calls matter to such a consumer: [`pool::alloc`],
//! [`descriptor::add`], [`commit::commit`], [`read::read`]. See
//! `demos/bztree_like.rs` for a minimal illustration.
#![allow(clippy::type_complexity)]
#![allow(clippy::too_many_arguments)]

pub mod commit;
pub mod descriptor;
pub mod ebr;
pub mod error;
pub mod pmem;
pub mod pool;
pub mod read;
pub mod recovery;
pub mod tag;

pub use descriptor::{Mdesc, RecyclePolicy, Status, Wdesc};
pub use error::PMwCasError;
pub use pmem::pool::{PoolConfig, PoolHandle};
pub use pmem::ptr::RelPtr;

/// Compile-time word descriptor capacity per multi-descriptor (`K` in the
/// design document). Kept small and fixed per spec: every `Mdesc` embeds a
/// `[Wdesc; WORD_DESCRIPTOR_SIZE]` array inline.
pub const WORD_DESCRIPTOR_SIZE: usize = 8;

/// Compile-time size of the descriptor pool (number of `Mdesc` slots).
pub const DESCRIPTOR_POOL_SIZE: usize = 1024;

/// Bound on helping recursion depth in [`commit::commit`]/[`read::read`]
/// before a helper backs off and re-reads instead of recursing further into
/// another descriptor's commit. See [`read::resolve`].
pub const MAX_HELP_DEPTH: usize = 64;
