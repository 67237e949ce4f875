//! Cache configuration and region geometry.
//!
//! [`CacheConfig`] carries every construction-time constant of the cache:
//! the total slab size, the two region size classes, and the timing knobs of
//! the eviction policy. Following the crate's configuration philosophy the
//! struct has all-public fields and no builder; create it, [`validate`] it,
//! hand it to [`RegionCache::new`](crate::RegionCache::new).
//!
//! The configuration also owns all *region geometry*: how a file of a given
//! length is partitioned into large and small regions, which region a byte
//! position falls into, and how absolute file ranges map into region-local
//! coordinates. Keeping the arithmetic here means every component derives
//! the same partition from the same two size constants.
//!
//! # Region partitioning
//!
//! A file is covered by whole large regions of `region_size` bytes. The
//! remainder is handled so that neither a nearly-empty large region nor a
//! long run of small regions is spent on it:
//!
//! - a remainder larger than half a large region rounds up to one more
//!   large region;
//! - otherwise the remainder is covered by small regions of
//!   `small_region_size` bytes, unless more than `2 * (large + 1)` of them
//!   would be needed, in which case one more large region is used instead.
//!
//! [`validate`]: CacheConfig::validate

use core::fmt;
use std::time::Duration;

use crate::error::{CacheError, CacheResult};
use crate::range::ByteRange;

/// Size class of a region or of a physical slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionClass {
    /// Full-size region of `region_size` bytes.
    Large,
    /// Tail region of `small_region_size` bytes.
    Small,
}

/// Construction-time configuration of the cache.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use frozen_cache::CacheConfig;
///
/// let config = CacheConfig {
///     cache_size: 64 * 1024 * 1024,
///     region_size: 1024 * 1024,
///     small_region_size: 64 * 1024,
///     small_region_share: 0.1,
///     decay_interval: Duration::from_secs(60),
///     max_freq: 100,
///     min_time_delta: Duration::from_secs(60),
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Copy)]
pub struct CacheConfig {
    /// Total byte capacity of the shared slab.
    pub cache_size: u64,
    /// Size of one large region in bytes.
    pub region_size: u64,
    /// Size of one small region in bytes. Must be smaller than
    /// `region_size`.
    pub small_region_size: u64,
    /// Fraction of `cache_size` dedicated to small-region slots, in
    /// `[0.0, 1.0)`.
    pub small_region_share: f64,
    /// Interval between decay sweeps. At least one second.
    pub decay_interval: Duration,
    /// Number of frequency buckets. At least one.
    pub max_freq: usize,
    /// Minimum wall-clock time between two promotions of the same entry.
    pub min_time_delta: Duration,
}

impl CacheConfig {
    /// Checks the configuration against its documented bounds.
    pub fn validate(&self) -> CacheResult<()> {
        if self.region_size == 0 {
            return Err(CacheError::InvalidConfig("region_size must be positive"));
        }
        if self.small_region_size == 0 {
            return Err(CacheError::InvalidConfig(
                "small_region_size must be positive",
            ));
        }
        if self.small_region_size >= self.region_size {
            return Err(CacheError::InvalidConfig(
                "small_region_size must be smaller than region_size",
            ));
        }
        if !(0.0..1.0).contains(&self.small_region_share) {
            return Err(CacheError::InvalidConfig(
                "small_region_share must be in [0.0, 1.0)",
            ));
        }
        if self.max_freq == 0 {
            return Err(CacheError::InvalidConfig("max_freq must be at least 1"));
        }
        if self.decay_interval < Duration::from_secs(1) {
            return Err(CacheError::InvalidConfig(
                "decay_interval must be at least one second",
            ));
        }
        if self.num_large_slots() == 0 {
            return Err(CacheError::InvalidConfig(
                "cache_size must hold at least one large region",
            ));
        }
        Ok(())
    }

    /// Bytes of the slab dedicated to small-region slots.
    fn small_pool_bytes(&self) -> u64 {
        (self.cache_size as f64 * self.small_region_share) as u64
    }

    /// Number of large physical slots the slab is divided into.
    pub fn num_large_slots(&self) -> usize {
        ((self.cache_size - self.small_pool_bytes()) / self.region_size) as usize
    }

    /// Number of small physical slots the slab is divided into.
    pub fn num_small_slots(&self) -> usize {
        (self.small_pool_bytes() / self.small_region_size) as usize
    }

    /// Number of large regions a file of `file_length` bytes occupies.
    pub fn large_region_count(&self, file_length: u64) -> u32 {
        let full = file_length / self.region_size;
        let remainder = file_length % self.region_size;
        if remainder == 0 {
            return full as u32;
        }
        if remainder > self.region_size / 2 {
            return (full + 1) as u32;
        }
        let needed_small = remainder.div_ceil(self.small_region_size);
        if needed_small > 2 * (full + 1) {
            (full + 1) as u32
        } else {
            full as u32
        }
    }

    /// Number of small regions covering the tail of a file of
    /// `file_length` bytes.
    pub fn small_region_count(&self, file_length: u64) -> u32 {
        let covered = u64::from(self.large_region_count(file_length)) * self.region_size;
        if covered >= file_length {
            0
        } else {
            (file_length - covered).div_ceil(self.small_region_size) as u32
        }
    }

    /// Total number of regions (large plus small) of a file.
    pub fn region_count(&self, file_length: u64) -> u32 {
        self.large_region_count(file_length) + self.small_region_count(file_length)
    }

    /// Size class of `region` within a file of `file_length` bytes.
    pub fn region_class(&self, region: u32, file_length: u64) -> RegionClass {
        if region < self.large_region_count(file_length) {
            RegionClass::Large
        } else {
            RegionClass::Small
        }
    }

    /// Region index covering byte `position` of a file of `file_length`
    /// bytes.
    ///
    /// # Panics
    ///
    /// Panics if `position >= file_length`.
    pub fn region_of(&self, position: u64, file_length: u64) -> u32 {
        assert!(
            position < file_length,
            "position {position} outside file of length {file_length}"
        );
        let large = u64::from(self.large_region_count(file_length));
        if position < large * self.region_size {
            (position / self.region_size) as u32
        } else {
            (large + (position - large * self.region_size) / self.small_region_size) as u32
        }
    }

    /// Absolute byte range covered by `region` of a file of `file_length`
    /// bytes. Tail regions may be shorter than their nominal class size.
    ///
    /// # Panics
    ///
    /// Panics if `region` is out of bounds for the file.
    pub fn region_range(&self, region: u32, file_length: u64) -> ByteRange {
        assert!(
            region < self.region_count(file_length),
            "region {region} outside file of length {file_length}"
        );
        let large = self.large_region_count(file_length);
        let start = if region < large {
            u64::from(region) * self.region_size
        } else {
            u64::from(large) * self.region_size
                + u64::from(region - large) * self.small_region_size
        };
        let nominal = if region < large {
            self.region_size
        } else {
            self.small_region_size
        };
        ByteRange::new(start, (start + nominal).min(file_length))
    }

    /// Usable size of `region`, accounting for a short tail.
    pub fn effective_region_size(&self, file_length: u64, region: u32) -> u64 {
        self.region_range(region, file_length).len()
    }

    /// Clips `range` to `region` and re-expresses it in region-local
    /// coordinates. Returns the empty range when they do not overlap.
    pub fn map_sub_range_to_region(
        &self,
        range: ByteRange,
        region: u32,
        file_length: u64,
    ) -> ByteRange {
        let region_range = self.region_range(region, file_length);
        match region_range.overlap(range) {
            Some(overlap) => overlap.shift_left(region_range.start),
            None => ByteRange::EMPTY,
        }
    }
}

impl fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("cache_size", &self.cache_size)
            .field("region_size", &self.region_size)
            .field("small_region_size", &self.small_region_size)
            .field("small_region_share", &self.small_region_share)
            .field("decay_interval", &self.decay_interval)
            .field("max_freq", &self.max_freq)
            .field("min_time_delta", &self.min_time_delta)
            .finish()
    }
}
