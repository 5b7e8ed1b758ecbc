//! Byte-addressable persistent memory underneath PMwCAS.
//!
//! This module provides the three things the rest of the crate needs from a
//! storage substrate: a cache-line `persist` primitive ([`ll`]), a 48-bit
//! relative pointer so descriptors can address each other and their target
//! words without depending on a fixed load address ([`ptr`]), and a minimal
//! backing store that owns the mmap'd arena everything else lives in
//! ([`pool`]).
//!
//! General persistent-memory pool/heap management (arbitrary-size
//! application allocation, garbage collection of application objects) is
//! explicitly out of scope for this crate — `pool` only manages the one
//! fixed-size arena PMwCAS itself needs.

pub mod ll;
pub mod pool;
pub mod ptr;
