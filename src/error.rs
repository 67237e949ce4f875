//! Error types for cache operations.
//!
//! Errors are clonable because a single failure can fan out to every
//! listener that depended on the failed range. Invariant violations (a
//! reader returning fewer bytes than guaranteed, a write to a slot the
//! region no longer owns) are asserted, not surfaced as errors: they are
//! programming mistakes in a collaborator, not recoverable conditions.

use std::sync::Arc;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type CacheResult<T> = Result<T, CacheError>;

/// Failures surfaced by cache operations.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Every slot is in use and none is currently evictable. Transient
    /// resource exhaustion: the caller may retry or reduce concurrency. No
    /// data was lost.
    #[error("no free region available")]
    NoFreeRegion,

    /// The operation raced with eviction of the region it targeted. The
    /// caller must re-acquire the region from the cache.
    #[error("cache region was evicted")]
    AlreadyEvicted,

    /// The configuration failed validation at construction time.
    #[error("invalid cache configuration: {0}")]
    InvalidConfig(&'static str),

    /// A reader or writer callback failed with an I/O error, typically a
    /// remote fetch that could not complete.
    #[error("i/o failure while accessing cached data")]
    Io(#[source] Arc<std::io::Error>),

    /// The result channel was dropped before the operation completed.
    #[error("operation was canceled before completing")]
    Canceled,
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(Arc::new(err))
    }
}
