#![doc = include_str!("../README.md")]
//!
//! ---
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                           CacheFile                               │
//! │      absolute ranges ⇆ region indices + region-local ranges       │
//! └──────────────────────────────┬────────────────────────────────────┘
//!                                │ get(key, len, region)
//! ┌──────────────────────────────▼────────────────────────────────────┐
//! │                          RegionCache                              │
//! │  key map ─ frequency buckets ─ decay ─ free pools ─ eviction scan │
//! └──────────────────────────────┬────────────────────────────────────┘
//!                                │ Arc<CacheFileRegion>
//! ┌──────────────────────────────▼────────────────────────────────────┐
//! │                        CacheFileRegion                            │
//! │    ref count ─ evicted flag ─ SparseFileTracker ─ slot index      │
//! └───────────────┬──────────────────────────────┬────────────────────┘
//!                 │ gaps / listeners             │ read_at / write_at
//! ┌───────────────▼──────────────┐  ┌────────────▼───────────────────┐
//! │      SparseFileTracker       │  │          SharedBytes           │
//! │  completed / pending ranges  │  │  fixed slab of large + small   │
//! │  progress watermarks         │  │  slots, owner tracking (debug) │
//! └──────────────────────────────┘  └────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`range`]: half-open byte interval arithmetic
//! - [`key`]: cache key types identifying remote-backed files and regions
//! - [`config`]: configuration and region geometry
//! - [`tracker`]: sparse range tracking and the gap/listener protocol
//! - [`slab`]: the shared byte slab and its physical slots
//! - [`region`]: reference-counted evictable region entries
//! - [`cache`]: the frequency-bucketed eviction engine and decay task
//! - [`file`]: the per-file facade fanning requests across regions
//! - [`executor`]: execution of asynchronous gap-fill work
//! - [`future`]: the future type returned by asynchronous reads
//! - [`time`]: the injected monotonic time source
//! - [`metrics`]: atomic counters describing cache behavior

/// Half-open byte interval arithmetic.
pub mod range;

/// Cache key types: shard, snapshot, file, and region identity.
pub mod key;

/// Cache configuration and region geometry.
pub mod config;

/// Sparse population tracking for one cache region.
pub mod tracker;

/// The shared byte slab divided into physical slots.
pub mod slab;

/// Reference-counted cache regions and their read/populate operations.
pub mod region;

/// The region cache eviction engine and its decay task.
pub mod cache;

/// Per-file view fanning requests out across regions.
pub mod file;

/// Error types for cache operations.
pub mod error;

/// Execution of asynchronous gap-fill work.
pub mod executor;

/// Future type for asynchronous read results.
pub mod future;

/// Injected monotonic time source.
pub mod time;

/// Atomic counters describing cache behavior.
pub mod metrics;

/// Frequency-bucketed linked lists over a fixed arena.
pub(crate) mod list;

pub use cache::{DecayTask, RegionCache};
pub use config::{CacheConfig, RegionClass};
pub use error::{CacheError, CacheResult};
pub use executor::{Executor, SameThreadExecutor, Task, ThreadPoolExecutor};
pub use file::{CacheFile, FileRangeReader, FileRangeWriter};
pub use future::ReadFuture;
pub use key::{CacheKey, RegionKey, ShardId, SnapshotId};
pub use metrics::CacheMetrics;
pub use range::ByteRange;
pub use region::{CacheFileRegion, RangeReader, RangeWriter, SlotHandle};
pub use slab::{SharedBytes, SlotId};
pub use time::{Clock, ManualClock, SystemClock};
pub use tracker::{Gap, RangeListener, SparseFileTracker};
