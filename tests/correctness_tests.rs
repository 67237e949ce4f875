//! Correctness tests for the region cache.
//!
//! These tests drive the public API end to end with a deterministic clock
//! and a deferrable executor, validating the allocation, promotion,
//! eviction, and invalidation behavior the engine promises.
//!
//! ## Test strategy
//! - Small cache (2 large + 2 small slots) for predictable eviction
//! - A manual clock so promotion and decay timing is exact
//! - A deferring executor to hold gap fills "in flight" at will
//! - Explicit checks of which region gets evicted and when

use std::sync::Arc;
use std::time::Duration;

use futures::executor::block_on;
use parking_lot::Mutex;

use frozen_cache::{
    ByteRange, CacheConfig, CacheError, CacheKey, Clock, Executor, FileRangeReader,
    FileRangeWriter, ManualClock, RangeReader, RangeWriter, RegionCache, SameThreadExecutor,
    ShardId, SnapshotId, Task,
};

const MIN_DELTA_MS: u64 = 60_000;

fn test_config() -> CacheConfig {
    CacheConfig {
        cache_size: 2560,
        region_size: 1024,
        small_region_size: 256,
        small_region_share: 0.2,
        decay_interval: Duration::from_secs(60),
        max_freq: 4,
        min_time_delta: Duration::from_millis(MIN_DELTA_MS),
    }
}

fn make_cache() -> (Arc<ManualClock>, Arc<RegionCache>) {
    let clock = Arc::new(ManualClock::new(0));
    let cache = RegionCache::new(test_config(), Arc::clone(&clock) as Arc<dyn Clock>).unwrap();
    (clock, Arc::new(cache))
}

fn key(file_name: &str) -> CacheKey {
    CacheKey {
        shard: ShardId {
            index_name: "logs".to_string(),
            id: 1,
        },
        snapshot: SnapshotId {
            name: "snap-1".to_string(),
            uuid: "uuid-1".to_string(),
        },
        file_name: file_name.to_string(),
    }
}

/// Byte value of the simulated remote file at an absolute offset.
fn remote_byte(offset: u64) -> u8 {
    (offset % 251) as u8
}

/// Region-level writer serving the simulated remote file; region-local
/// offsets equal absolute offsets because these tests use region 0.
fn region_writer() -> RangeWriter {
    Arc::new(|handle, gap, progress| {
        let data: Vec<u8> = (gap.start..gap.end).map(remote_byte).collect();
        handle.write(gap.start, &data);
        progress(gap.len());
        Ok(())
    })
}

fn region_reader() -> RangeReader {
    Arc::new(|handle, range| {
        let mut buf = vec![0u8; range.len() as usize];
        handle.read(range.start, &mut buf);
        for (i, &byte) in buf.iter().enumerate() {
            assert_eq!(byte, remote_byte(range.start + i as u64));
        }
        Ok(range.len())
    })
}

fn file_writer() -> FileRangeWriter {
    Arc::new(|handle, file_offset, gap, progress| {
        let data: Vec<u8> = (0..gap.len()).map(|i| remote_byte(file_offset + i)).collect();
        handle.write(gap.start, &data);
        progress(gap.len());
        Ok(())
    })
}

fn file_reader() -> FileRangeReader {
    Arc::new(|handle, file_offset, range| {
        let mut buf = vec![0u8; range.len() as usize];
        handle.read(range.start, &mut buf);
        for (i, &byte) in buf.iter().enumerate() {
            assert_eq!(byte, remote_byte(file_offset + i as u64));
        }
        Ok(range.len())
    })
}

/// Executor that queues tasks until the test chooses to run them,
/// simulating gap fills that are still in flight.
#[derive(Default)]
struct DeferredExecutor {
    tasks: Mutex<Vec<Task>>,
}

impl std::fmt::Debug for DeferredExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredExecutor")
            .field("pending", &self.pending())
            .finish()
    }
}

impl DeferredExecutor {
    fn run_all(&self) {
        loop {
            let task = self.tasks.lock().pop();
            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }

    fn pending(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl Executor for DeferredExecutor {
    fn execute(&self, task: Task) {
        self.tasks.lock().push(task);
    }
}

#[test]
fn test_lookup_promotion_and_eviction_scenario() {
    let (clock, cache) = make_cache();

    // Region 0 of key "a" (file of 2000 bytes spans two large regions).
    let a = cache.get(&key("a"), 2000, 0).unwrap();
    assert!(a.slot().is_some());
    assert_eq!(cache.metrics().region_misses(), 1);

    // An immediate re-request is a hit but does not promote yet.
    cache.get(&key("a"), 2000, 0).unwrap();
    assert_eq!(cache.metrics().region_hits(), 1);

    // After min_time_delta the re-request promotes "a" out of bucket 0.
    clock.advance(MIN_DELTA_MS);
    cache.get(&key("a"), 2000, 0).unwrap();

    // A second key takes the remaining free large slot without eviction.
    let b = cache.get(&key("b"), 1024, 0).unwrap();
    assert_eq!(cache.metrics().evictions(), 0);
    assert!(b.slot().is_some());

    // A third key exceeds capacity: exactly one eviction, of the coldest
    // entry — the unpromoted "b", not the promoted "a".
    let c = cache.get(&key("c"), 1024, 0).unwrap();
    assert_eq!(cache.metrics().evictions(), 1);
    assert!(!a.is_evicted(), "promoted entry must survive");
    assert!(b.is_evicted(), "bucket-0 entry evicted before promoted one");
    assert!(c.slot().is_some());

    // The evicted region is re-created from scratch: empty tracker.
    let b2 = cache.get(&key("b"), 1024, 0).unwrap();
    assert_eq!(cache.metrics().evictions(), 2);
    assert!(!a.is_evicted());
    assert_eq!(b2.tracker().complete_up_to(), 0);
}

#[test]
fn test_populate_then_cached_read_through_file_view() {
    let (_clock, cache) = make_cache();
    // 2 large + 2 small regions, exactly the slot capacity.
    let file = Arc::clone(&cache).cache_file(key("data"), 2448);
    let range = ByteRange::new(100, 2300);

    let future = file.populate_and_read(
        range,
        range,
        file_reader(),
        file_writer(),
        &SameThreadExecutor,
    );
    assert_eq!(block_on(future).unwrap(), 2200);

    // Everything the read needed is now cached; re-reading fetches nothing.
    let written = cache.metrics().bytes_written();
    let panicking_writer: FileRangeWriter =
        Arc::new(|_, _, _, _| panic!("cached bytes must not be fetched again"));
    let again = file.populate_and_read(range, range, file_reader(), panicking_writer, &SameThreadExecutor);
    assert_eq!(block_on(again).unwrap(), 2200);
    assert_eq!(cache.metrics().bytes_written(), written);
}

#[test]
fn test_slot_exclusivity_across_live_regions() {
    let (_clock, cache) = make_cache();
    let regions = vec![
        cache.get(&key("a"), 1024, 0).unwrap(),
        cache.get(&key("b"), 1024, 0).unwrap(),
        cache.get(&key("small-a"), 200, 0).unwrap(),
        cache.get(&key("small-b"), 200, 0).unwrap(),
    ];
    let mut slots: Vec<_> = regions
        .iter()
        .map(|region| region.slot().expect("assigned").index())
        .collect();
    slots.sort_unstable();
    slots.dedup();
    assert_eq!(slots.len(), 4, "no two live regions may share a slot");
}

#[test]
fn test_exhaustion_with_inflight_fills_is_retryable() {
    let (_clock, cache) = make_cache();
    let executor = DeferredExecutor::default();

    // Start populating both large slots; the gap fills stay in flight, so
    // both regions hold extra references.
    let a = cache.get(&key("a"), 1024, 0).unwrap();
    let fut_a = a.populate_and_read(
        ByteRange::new(0, 1024),
        ByteRange::new(0, 1024),
        region_reader(),
        region_writer(),
        &executor,
    );
    let b = cache.get(&key("b"), 1024, 0).unwrap();
    let fut_b = b.populate_and_read(
        ByteRange::new(0, 1024),
        ByteRange::new(0, 1024),
        region_reader(),
        region_writer(),
        &executor,
    );
    assert_eq!(executor.pending(), 2);

    // Nothing is evictable: every slot is pinned by an in-flight fill.
    let err = cache.get(&key("c"), 1024, 0).unwrap_err();
    assert!(matches!(err, CacheError::NoFreeRegion));
    assert_eq!(cache.metrics().allocation_failures(), 1);

    // Once the fills complete the same lookup succeeds via eviction.
    executor.run_all();
    assert_eq!(block_on(fut_a).unwrap(), 1024);
    assert_eq!(block_on(fut_b).unwrap(), 1024);
    let c = cache.get(&key("c"), 1024, 0).unwrap();
    assert!(c.slot().is_some());
    assert_eq!(cache.metrics().evictions(), 1);
}

#[test]
fn test_forced_shard_eviction_fails_inflight_operation() {
    let (_clock, cache) = make_cache();
    let executor = DeferredExecutor::default();

    let region = cache.get(&key("a"), 1024, 0).unwrap();
    let future = Arc::clone(&region).populate_and_read(
        ByteRange::new(0, 1024),
        ByteRange::new(0, 1024),
        region_reader(),
        region_writer(),
        &executor,
    );
    assert_eq!(executor.pending(), 1, "gap fill is in flight");

    // Shard invalidation ignores the in-flight reference.
    let snapshot = SnapshotId {
        name: "snap-1".to_string(),
        uuid: "uuid-1".to_string(),
    };
    assert_eq!(cache.mark_shard_as_evicted(&snapshot, "logs", 1), 1);
    assert!(region.is_evicted());
    assert!(
        region.slot().is_some(),
        "slot retained until in-flight work drains"
    );

    // The deferred fill now observes the eviction and fails the read.
    executor.run_all();
    assert!(matches!(block_on(future), Err(CacheError::AlreadyEvicted)));
    assert!(region.slot().is_none(), "slot released after the last reference");

    // The freed slot is usable again.
    let fresh = cache.get(&key("a"), 1024, 0).unwrap();
    assert!(fresh.slot().is_some());
    assert_eq!(fresh.tracker().complete_up_to(), 0, "cache starts over");
}

#[test]
fn test_remove_from_cache_only_touches_matching_file() {
    let (_clock, cache) = make_cache();
    let file = Arc::clone(&cache).cache_file(key("victim"), 1024);
    let range = ByteRange::new(0, 1024);
    let populated = file.populate_and_read(
        range,
        range,
        file_reader(),
        file_writer(),
        &SameThreadExecutor,
    );
    assert_eq!(block_on(populated).unwrap(), 1024);
    let other = cache.get(&key("other"), 1024, 0).unwrap();

    assert_eq!(cache.remove_from_cache(&key("victim")), 1);
    assert!(!other.is_evicted());

    // The non-blocking path no longer sees the removed file.
    assert!(file
        .read_if_available_or_pending(range, file_reader())
        .is_none());
}

#[test]
fn test_read_if_available_sees_pending_population() {
    let (_clock, cache) = make_cache();
    let executor = DeferredExecutor::default();
    let file = Arc::clone(&cache).cache_file(key("data"), 1024);
    let range = ByteRange::new(0, 1024);

    let populate = file.populate_and_read(range, range, file_reader(), file_writer(), &executor);

    // The range is pending, so the non-blocking read registers and waits.
    let waiting = file
        .read_if_available_or_pending(ByteRange::new(0, 512), file_reader())
        .expect("pending range is observable");

    executor.run_all();
    assert_eq!(block_on(populate).unwrap(), 1024);
    assert_eq!(block_on(waiting).unwrap(), 512);
}

#[test]
fn test_decay_makes_hot_entries_evictable_again() {
    let (clock, cache) = make_cache();
    let hot = cache.get(&key("hot"), 1024, 0).unwrap();
    for _ in 0..3 {
        clock.advance(MIN_DELTA_MS);
        cache.get(&key("hot"), 1024, 0).unwrap();
    }
    let cold = cache.get(&key("cold"), 1024, 0).unwrap();

    // Still hot: the cold entry is the eviction victim.
    cache.get(&key("x"), 1024, 0).unwrap();
    assert!(cold.is_evicted());
    assert!(!hot.is_evicted());

    // After enough idle time every decay sweep strips one bucket; three
    // sweeps bring the hot entry back to the bottom.
    clock.advance(2 * MIN_DELTA_MS);
    cache.decay();
    cache.decay();
    cache.decay();
    assert_eq!(cache.metrics().decay_runs(), 3);

    // Two more lookups evict both bucket-0 residents, the replacement key
    // first (inserted earlier) and then the fully decayed entry.
    cache.get(&key("y"), 1024, 0).unwrap();
    cache.get(&key("z"), 1024, 0).unwrap();
    assert!(
        hot.is_evicted(),
        "fully decayed entry is evictable once more"
    );
}

#[test]
fn test_each_overflow_lookup_evicts_exactly_once() {
    let (_clock, cache) = make_cache();
    for (i, name) in ["a", "b", "c", "d", "e"].into_iter().enumerate() {
        cache.get(&key(name), 1024, 0).unwrap();
        // Two free slots, then one eviction per additional distinct key.
        assert_eq!(cache.metrics().evictions(), (i as u64).saturating_sub(1));
    }
}
