//! The region cache eviction engine.
//!
//! [`RegionCache`] maps `(cache key, region index)` to reference-counted
//! [`CacheFileRegion`] entries backed by slots of the shared slab. Entries
//! holding a slot live in one of `max_freq` frequency buckets, implemented
//! as arena-linked lists where the node index is the slot index. Lookups of
//! an assigned entry promote it at most once per `min_time_delta`; a
//! periodic [`decay`](RegionCache::decay) sweep demotes entries that have
//! not been touched for twice that long, so previously hot regions cool
//! down and become evictable again.
//!
//! When the free pool of the required size class is empty, allocation scans
//! the buckets in ascending order and evicts the first entry whose
//! reference count shows no other use. If that still yields no slot the
//! lookup fails with [`CacheError::NoFreeRegion`] — a transient condition,
//! not data loss.
//!
//! # Locking
//!
//! Three locks exist, in this acquisition order: a region's `init` mutex
//! (serializes slot acquisition for one entry), then the single `lists`
//! mutex (all bucket-list mutation, the eviction scan, and slot-assignment
//! commits), with the key map's mutex taken only on its own. Free pools are
//! lock-free queues, and releasing a slot never takes a lock, so eviction
//! may release slots while the list lock is held. Slot assignment commits
//! under the list lock so forced eviction (which also runs under it) can
//! never interleave with an assignment half-way through.

use std::fmt;
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::config::{CacheConfig, RegionClass};
use crate::error::{CacheError, CacheResult};
use crate::file::CacheFile;
use crate::key::{CacheKey, RegionKey, SnapshotId};
use crate::list::{BucketLists, NIL};
use crate::metrics::CacheMetrics;
use crate::region::{CacheFileRegion, SharedState};
use crate::slab::{SharedBytes, SlotId};
use crate::time::Clock;

/// Shared block cache for remote-backed files.
pub struct RegionCache {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    state: Arc<SharedState>,
    regions: Mutex<HashMap<RegionKey, Arc<CacheFileRegion>>>,
    lists: Mutex<BucketLists<Arc<CacheFileRegion>>>,
}

impl RegionCache {
    /// Creates a cache from a validated configuration and an injected time
    /// source.
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> CacheResult<RegionCache> {
        config.validate()?;
        let bytes = SharedBytes::new(
            config.num_large_slots(),
            config.region_size,
            config.num_small_slots(),
            config.small_region_size,
        );
        let num_slots = bytes.num_slots();
        info!(
            cache_size = config.cache_size,
            num_large = config.num_large_slots(),
            num_small = config.num_small_slots(),
            "initialized shared block cache"
        );
        Ok(RegionCache {
            lists: Mutex::new(BucketLists::new(config.max_freq, num_slots)),
            state: Arc::new(SharedState::new(bytes)),
            regions: Mutex::new(HashMap::new()),
            config,
            clock,
        })
    }

    /// The configuration the cache was built from.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Counters describing cache behavior.
    pub fn metrics(&self) -> &CacheMetrics {
        &self.state.metrics
    }

    /// Number of regions currently tracked (assigned or still allocating).
    pub fn len(&self) -> usize {
        self.regions.lock().len()
    }

    /// Returns `true` when no regions are tracked.
    pub fn is_empty(&self) -> bool {
        self.regions.lock().is_empty()
    }

    /// Creates a per-file facade that fans requests out across the file's
    /// regions.
    pub fn cache_file(self: Arc<Self>, cache_key: CacheKey, file_length: u64) -> CacheFile {
        CacheFile::new(self, cache_key, file_length)
    }

    /// Looks up — or creates, allocating a slot — the region entry for
    /// `region` of the file identified by `cache_key`.
    ///
    /// Fails with [`CacheError::NoFreeRegion`] when every slot of the
    /// required size class is in use and nothing is evictable; the caller
    /// may retry once concurrent operations drain.
    ///
    /// # Panics
    ///
    /// Panics if `region` is out of bounds for `file_length`.
    pub fn get(
        &self,
        cache_key: &CacheKey,
        file_length: u64,
        region: u32,
    ) -> CacheResult<Arc<CacheFileRegion>> {
        assert!(
            region < self.config.region_count(file_length),
            "region {region} outside file of length {file_length}"
        );
        let region_key = RegionKey {
            cache_key: cache_key.clone(),
            region,
        };
        loop {
            let entry = {
                let mut map = self.regions.lock();
                match map.get(&region_key).cloned() {
                    Some(existing) if existing.is_evicted() => {
                        map.remove(&region_key);
                        continue;
                    }
                    Some(existing) => existing,
                    None => {
                        let len = self.config.effective_region_size(file_length, region);
                        let class = self.config.region_class(region, file_length);
                        let entry = CacheFileRegion::new(
                            region_key.clone(),
                            len,
                            class,
                            Arc::clone(&self.state),
                        );
                        map.insert(region_key.clone(), Arc::clone(&entry));
                        entry
                    }
                }
            };

            // Fast path: the region already holds a slot.
            if let Some(slot) = entry.slot() {
                if entry.is_evicted() {
                    continue;
                }
                self.state.metrics.record_hit();
                self.maybe_promote(slot, &entry);
                return Ok(entry);
            }

            // Slow path: acquire a slot under the entry's init lock.
            let init = entry.init_lock();
            if entry.slot().is_some() {
                drop(init);
                continue;
            }
            if entry.is_evicted() {
                drop(init);
                continue;
            }
            let class = entry.region_class();
            let Some(slot) = self.acquire_slot(class) else {
                // Still under the init lock, so no concurrent assignment can
                // slip in before the placeholder is poisoned.
                entry.force_evict();
                drop(init);
                self.remove_mapping(&region_key, &entry);
                self.state.metrics.record_allocation_failure();
                debug!(region = %region_key, "no free region available");
                return Err(CacheError::NoFreeRegion);
            };
            {
                let mut lists = self.lists.lock();
                if entry.is_evicted() {
                    // Raced with forced eviction; hand the slot back.
                    drop(lists);
                    drop(init);
                    let pushed = self.state.free_pool(class).push(slot).is_ok();
                    debug_assert!(pushed, "free pool cannot overflow its slot count");
                    continue;
                }
                self.state.bytes.claim(slot, &region_key);
                entry.assign_slot(slot);
                lists.push_back(0, slot.index(), Arc::clone(&entry), self.clock.now_millis());
            }
            drop(init);
            self.state.metrics.record_miss();
            trace!(region = %region_key, %slot, "assigned slot to region");
            return Ok(entry);
        }
    }

    /// Returns the region entry for `(cache_key, region)` only if it
    /// already holds a slot. Records a hit and may promote, but never
    /// creates entries or allocates slots.
    pub fn get_if_cached(
        &self,
        cache_key: &CacheKey,
        region: u32,
    ) -> Option<Arc<CacheFileRegion>> {
        let region_key = RegionKey {
            cache_key: cache_key.clone(),
            region,
        };
        let entry = self.regions.lock().get(&region_key).cloned()?;
        if entry.is_evicted() {
            return None;
        }
        let slot = entry.slot()?;
        self.state.metrics.record_hit();
        self.maybe_promote(slot, &entry);
        Some(entry)
    }

    /// Pops a free slot, evicting the coldest idle entry first if needed.
    fn acquire_slot(&self, class: RegionClass) -> Option<SlotId> {
        let pool = self.state.free_pool(class);
        if let Some(slot) = pool.pop() {
            return Some(slot);
        }
        self.maybe_evict();
        pool.pop()
    }

    /// Evicts the first entry with no other users, scanning buckets in
    /// ascending frequency order. Returns `true` if an entry was evicted.
    fn maybe_evict(&self) -> bool {
        let mut lists = self.lists.lock();
        for bucket in 0..lists.num_buckets() {
            let mut cursor = lists.head(bucket);
            while cursor != NIL {
                let next = lists.next(cursor);
                let region = lists
                    .value(cursor)
                    .map(Arc::clone)
                    .expect("linked node holds a region");
                if region.try_evict() {
                    // The freed slot must not be re-linked before this node
                    // is gone; both happen under the list lock.
                    lists.unlink(cursor);
                    drop(lists);
                    self.remove_mapping(region.region_key(), &region);
                    self.state.metrics.record_eviction();
                    debug!(region = %region.region_key(), bucket, "evicted region");
                    return true;
                }
                cursor = next;
            }
        }
        false
    }

    /// Promotes the entry one bucket if `min_time_delta` elapsed since its
    /// last promotion and it is not already in the top bucket.
    fn maybe_promote(&self, slot: SlotId, entry: &Arc<CacheFileRegion>) {
        let now = self.clock.now_millis();
        let min_delta = self.config.min_time_delta.as_millis() as u64;
        let mut lists = self.lists.lock();
        let index = slot.index();
        let current = match lists.value(index) {
            Some(linked) if Arc::ptr_eq(linked, entry) => lists.bucket_of(index),
            _ => return,
        };
        if now.saturating_sub(lists.last_accessed(index)) >= min_delta
            && current + 1 < lists.num_buckets()
        {
            let value = lists.unlink(index);
            lists.push_back(current + 1, index, value, now);
            trace!(region = %entry.region_key(), bucket = current + 1, "promoted region");
        }
    }

    /// Demotes every entry untouched for at least `2 * min_time_delta` by
    /// exactly one bucket, never below bucket zero.
    ///
    /// The last-accessed stamp is preserved, so an entry that stays cold
    /// loses one bucket per sweep until it reaches the bottom.
    pub fn decay(&self) {
        let now = self.clock.now_millis();
        let threshold = 2 * self.config.min_time_delta.as_millis() as u64;
        let mut demoted = 0usize;
        {
            let mut lists = self.lists.lock();
            let mut stale: Vec<usize> = Vec::new();
            for bucket in 1..lists.num_buckets() {
                let mut cursor = lists.head(bucket);
                while cursor != NIL {
                    if now.saturating_sub(lists.last_accessed(cursor)) >= threshold {
                        stale.push(cursor);
                    }
                    cursor = lists.next(cursor);
                }
            }
            for index in stale {
                let bucket = lists.bucket_of(index);
                let last_accessed = lists.last_accessed(index);
                let value = lists.unlink(index);
                lists.push_back(bucket - 1, index, value, last_accessed);
                demoted += 1;
            }
        }
        self.state.metrics.record_decay_run();
        debug!(demoted, "completed decay sweep");
    }

    /// Forcibly evicts every region of the file identified by `cache_key`,
    /// regardless of reference counts. Returns the number of regions
    /// evicted. In-flight operations on them observe
    /// [`CacheError::AlreadyEvicted`].
    pub fn remove_from_cache(&self, cache_key: &CacheKey) -> usize {
        self.evict_matching(|region_key| region_key.cache_key == *cache_key)
    }

    /// Forcibly evicts every region belonging to the given shard of the
    /// given snapshot, as happens when a shard relocates or its snapshot is
    /// deleted. Returns the number of regions evicted.
    pub fn mark_shard_as_evicted(
        &self,
        snapshot: &SnapshotId,
        index_name: &str,
        shard_id: u32,
    ) -> usize {
        self.evict_matching(|region_key| {
            region_key.cache_key.snapshot == *snapshot
                && region_key.cache_key.shard.index_name == index_name
                && region_key.cache_key.shard.id == shard_id
        })
    }

    fn evict_matching<F: Fn(&RegionKey) -> bool>(&self, predicate: F) -> usize {
        let matches: Vec<Arc<CacheFileRegion>> = {
            let map = self.regions.lock();
            map.values()
                .filter(|region| predicate(region.region_key()))
                .cloned()
                .collect()
        };
        let mut evicted = 0;
        for region in matches {
            let mut lists = self.lists.lock();
            // Capture before the eviction below possibly releases the slot.
            let slot = region.slot();
            if region.force_evict() {
                if let Some(slot) = slot {
                    let index = slot.index();
                    let ours = lists
                        .value(index)
                        .map(|linked| Arc::ptr_eq(linked, &region))
                        .unwrap_or(false);
                    if ours {
                        lists.unlink(index);
                    }
                }
                drop(lists);
                self.remove_mapping(region.region_key(), &region);
                self.state.metrics.record_forced_eviction();
                evicted += 1;
                debug!(region = %region.region_key(), "forcibly evicted region");
            }
        }
        evicted
    }

    /// Removes the key mapping if it still points at `expected`.
    fn remove_mapping(&self, region_key: &RegionKey, expected: &Arc<CacheFileRegion>) {
        let mut map = self.regions.lock();
        if map
            .get(region_key)
            .is_some_and(|current| Arc::ptr_eq(current, expected))
        {
            map.remove(region_key);
        }
    }
}

impl fmt::Debug for RegionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionCache")
            .field("config", &self.config)
            .field("tracked_regions", &self.len())
            .finish()
    }
}

/// Background thread running [`RegionCache::decay`] at the configured
/// interval until dropped.
pub struct DecayTask {
    stop: Option<Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl DecayTask {
    /// Spawns the decay thread for `cache`.
    pub fn spawn(cache: Arc<RegionCache>) -> std::io::Result<DecayTask> {
        let interval = cache.config().decay_interval;
        let (stop, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("frozen-cache-decay".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => cache.decay(),
                    _ => break,
                }
            })?;
        Ok(DecayTask {
            stop: Some(stop),
            handle: Some(handle),
        })
    }
}

impl Drop for DecayTask {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl fmt::Debug for DecayTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecayTask")
            .field("running", &self.handle.is_some())
            .finish()
    }
}
