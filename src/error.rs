//! Error types.
//!
//! Kept as a plain `enum` with hand-written `Display`/`Error` impls rather
//! than reaching for a derive macro crate — the surface is small and fixed
//! and doesn't need one.

use std::fmt;

/// Errors this crate's public operations can return.
#[derive(Debug)]
pub enum PMwCasError {
    /// A descriptor already holds [`crate::WORD_DESCRIPTOR_SIZE`] word
    /// descriptors; `add`/`reserve` cannot accept another.
    Capacity,
    /// `add`/`reserve` was called with a target address already present in
    /// the descriptor.
    DuplicateTarget,
    /// A compare-and-swap this operation depended on observed a value other
    /// than the one it expected.
    CasFailed,
    /// Opening, sizing, or mapping the backing pool file failed.
    PoolIo(std::io::Error),
}

impl PartialEq for PMwCasError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Capacity, Self::Capacity) => true,
            (Self::DuplicateTarget, Self::DuplicateTarget) => true,
            (Self::CasFailed, Self::CasFailed) => true,
            (Self::PoolIo(a), Self::PoolIo(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}

impl fmt::Display for PMwCasError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capacity => write!(f, "descriptor is at capacity"),
            Self::DuplicateTarget => write!(f, "target address already present in descriptor"),
            Self::CasFailed => write!(f, "compare-and-swap failed"),
            Self::PoolIo(e) => write!(f, "pool I/O error: {e}"),
        }
    }
}

impl std::error::Error for PMwCasError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::PoolIo(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PMwCasError {
    fn from(e: std::io::Error) -> Self {
        Self::PoolIo(e)
    }
}
