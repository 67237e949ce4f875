//! Per-file view over the region cache.
//!
//! A [`CacheFile`] translates absolute byte ranges of one logical file into
//! the region-local requests the engine understands: it computes the
//! covering regions, obtains each region's entry from the
//! [`RegionCache`], dispatches the per-region operation with region-local
//! coordinates, and combines the per-region byte counts into a single
//! future. Reader and writer callbacks receive the absolute file offset of
//! each sub-request alongside the slot-local range, so collaborators can
//! address the remote file directly.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::RegionCache;
use crate::error::CacheResult;
use crate::executor::Executor;
use crate::future::{ReadFuture, ReadPromise};
use crate::key::CacheKey;
use crate::range::ByteRange;
use crate::region::{RangeReader, RangeWriter, SlotHandle};

/// Copies already-populated bytes out of a slot, file-level variant.
/// Receives the slot handle, the absolute file offset corresponding to the
/// start of the slot-local range, and the slot-local range itself.
pub type FileRangeReader =
    Arc<dyn Fn(&SlotHandle<'_>, u64, ByteRange) -> CacheResult<u64> + Send + Sync>;

/// Fills one gap, file-level variant. Receives the slot handle, the
/// absolute file offset of the gap start, the slot-local gap range, and the
/// progress callback to invoke as bytes are committed.
pub type FileRangeWriter = Arc<
    dyn Fn(&SlotHandle<'_>, u64, ByteRange, &mut dyn FnMut(u64)) -> CacheResult<()> + Send + Sync,
>;

/// View of one logical remote-backed file on top of a [`RegionCache`].
pub struct CacheFile {
    cache: Arc<RegionCache>,
    cache_key: CacheKey,
    file_length: u64,
}

/// Combines per-region completions into one result: byte counts are summed
/// and the first failure wins.
struct FanIn {
    state: Mutex<FanInState>,
}

struct FanInState {
    remaining: usize,
    total: u64,
    promise: Option<ReadPromise>,
}

impl FanIn {
    fn new(remaining: usize, promise: ReadPromise) -> Arc<FanIn> {
        Arc::new(FanIn {
            state: Mutex::new(FanInState {
                remaining,
                total: 0,
                promise: Some(promise),
            }),
        })
    }

    fn complete_one(&self, result: CacheResult<u64>) {
        let mut state = self.state.lock();
        match result {
            Ok(bytes) => {
                state.total += bytes;
                state.remaining -= 1;
                if state.remaining == 0 {
                    if let Some(promise) = state.promise.take() {
                        let total = state.total;
                        drop(state);
                        promise.complete(Ok(total));
                    }
                }
            }
            Err(error) => {
                if let Some(promise) = state.promise.take() {
                    drop(state);
                    promise.complete(Err(error));
                }
            }
        }
    }
}

fn wrap_reader(reader: &FileRangeReader, region_start: u64) -> RangeReader {
    let reader = Arc::clone(reader);
    Arc::new(move |handle, local| reader(handle, region_start + local.start, local))
}

fn wrap_writer(writer: &FileRangeWriter, region_start: u64) -> RangeWriter {
    let writer = Arc::clone(writer);
    Arc::new(move |handle, local, progress| {
        writer(handle, region_start + local.start, local, progress)
    })
}

impl CacheFile {
    pub(crate) fn new(cache: Arc<RegionCache>, cache_key: CacheKey, file_length: u64) -> CacheFile {
        CacheFile {
            cache,
            cache_key,
            file_length,
        }
    }

    /// Identity of the file this view reads.
    pub fn cache_key(&self) -> &CacheKey {
        &self.cache_key
    }

    /// Length of the file in bytes.
    pub fn file_length(&self) -> u64 {
        self.file_length
    }

    /// Ensures `range_to_write` is populated across every region it touches
    /// and reads `range_to_read`, resolving to the total byte count once all
    /// involved regions complete. The first per-region failure — including
    /// an allocation failure while acquiring regions — fails the whole
    /// future.
    ///
    /// # Panics
    ///
    /// Panics if the ranges exceed the file or `range_to_read` is not
    /// contained in `range_to_write`.
    pub fn populate_and_read(
        &self,
        range_to_write: ByteRange,
        range_to_read: ByteRange,
        reader: FileRangeReader,
        writer: FileRangeWriter,
        executor: &dyn Executor,
    ) -> ReadFuture {
        assert!(
            range_to_write.end <= self.file_length,
            "write range {range_to_write} exceeds file of {} bytes",
            self.file_length
        );
        assert!(
            range_to_read.is_empty() || range_to_write.contains(range_to_read),
            "read range {range_to_read} not contained in write range {range_to_write}"
        );
        if range_to_write.is_empty() {
            return ReadFuture::ready(Ok(0));
        }
        let config = *self.cache.config();
        let first = config.region_of(range_to_write.start, self.file_length);
        let last = config.region_of(range_to_write.end - 1, self.file_length);

        // Acquire every region up front so resource exhaustion fails fast
        // instead of leaving a half-dispatched request.
        let mut targets = Vec::with_capacity((last - first + 1) as usize);
        for region in first..=last {
            match self.cache.get(&self.cache_key, self.file_length, region) {
                Ok(entry) => targets.push((region, entry)),
                Err(error) => return ReadFuture::ready(Err(error)),
            }
        }

        let (promise, future) = ReadFuture::channel();
        let fan_in = FanIn::new(targets.len(), promise);
        for (region, entry) in targets {
            let region_start = config.region_range(region, self.file_length).start;
            let local_write =
                config.map_sub_range_to_region(range_to_write, region, self.file_length);
            let local_read =
                config.map_sub_range_to_region(range_to_read, region, self.file_length);
            let fan_in = Arc::clone(&fan_in);
            entry.populate_and_read_notify(
                local_write,
                local_read,
                wrap_reader(&reader, region_start),
                wrap_writer(&writer, region_start),
                executor,
                Box::new(move |result| fan_in.complete_one(result)),
            );
        }
        future
    }

    /// Reads `range` only if every covering region is cached and the range
    /// is already populated or pending under other writers. Returns `None`
    /// without allocating regions, slots, or gaps when any part is absent.
    ///
    /// # Panics
    ///
    /// Panics if `range` exceeds the file.
    pub fn read_if_available_or_pending(
        &self,
        range: ByteRange,
        reader: FileRangeReader,
    ) -> Option<ReadFuture> {
        assert!(
            range.end <= self.file_length,
            "range {range} exceeds file of {} bytes",
            self.file_length
        );
        if range.is_empty() {
            return Some(ReadFuture::ready(Ok(0)));
        }
        let config = *self.cache.config();
        let first = config.region_of(range.start, self.file_length);
        let last = config.region_of(range.end - 1, self.file_length);

        let mut targets = Vec::with_capacity((last - first + 1) as usize);
        for region in first..=last {
            let entry = self.cache.get_if_cached(&self.cache_key, region)?;
            targets.push((region, entry));
        }

        let (promise, future) = ReadFuture::channel();
        let fan_in = FanIn::new(targets.len(), promise);
        for (region, entry) in targets {
            let region_start = config.region_range(region, self.file_length).start;
            let local = config.map_sub_range_to_region(range, region, self.file_length);
            let fan_in = Arc::clone(&fan_in);
            let registered = entry.read_if_available_notify(
                local,
                wrap_reader(&reader, region_start),
                Box::new(move |result| fan_in.complete_one(result)),
            );
            if !registered {
                // Listeners already registered on earlier regions complete
                // against a future nobody holds, which is harmless.
                return None;
            }
        }
        Some(future)
    }
}

impl fmt::Debug for CacheFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheFile")
            .field("cache_key", &self.cache_key)
            .field("file_length", &self.file_length)
            .finish()
    }
}
