//! Reference-counted cache regions.
//!
//! A [`CacheFileRegion`] is the evictable unit of the cache: one region of
//! one logical file, its [`SparseFileTracker`], and (once assigned) one
//! physical slot in the shared slab. A manual reference count guards
//! in-flight reads and gap fills against concurrent eviction: the slot is
//! returned to its free pool only when the count reaches zero after the
//! `evicted` flag has been set, and the compare-and-set on that flag
//! guarantees the release happens exactly once no matter how eviction was
//! triggered.
//!
//! Every operation re-checks `evicted` after acquiring a reference. Eviction
//! can still race ahead of a lookup that already returned this region, so
//! callers observe [`CacheError::AlreadyEvicted`] rather than stale data.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use parking_lot::{Mutex, MutexGuard};
use tracing::{trace, warn};

use crate::config::RegionClass;
use crate::error::{CacheError, CacheResult};
use crate::executor::Executor;
use crate::future::ReadFuture;
use crate::key::RegionKey;
use crate::metrics::CacheMetrics;
use crate::range::ByteRange;
use crate::slab::{SharedBytes, SlotId};
use crate::tracker::{Gap, RangeListener, SparseFileTracker};

/// Copies already-populated bytes out of a slot. Receives the slot handle
/// and the region-local range to read; must return exactly the range length.
pub type RangeReader = Arc<dyn Fn(&SlotHandle<'_>, ByteRange) -> CacheResult<u64> + Send + Sync>;

/// Fills one gap of a region, typically by fetching from remote storage.
/// Receives the slot handle, the region-local gap range, and a progress
/// callback that must be invoked with the number of gap bytes committed so
/// far as writes land in the slot.
pub type RangeWriter =
    Arc<dyn Fn(&SlotHandle<'_>, ByteRange, &mut dyn FnMut(u64)) -> CacheResult<()> + Send + Sync>;

/// Completion callback for the listener-based operation variants.
pub(crate) type ReadListener = Box<dyn FnOnce(CacheResult<u64>) + Send>;

/// State shared by the eviction engine and every region: the slab, the
/// per-class free-slot pools, and the metrics sink.
#[derive(Debug)]
pub(crate) struct SharedState {
    pub(crate) bytes: SharedBytes,
    pub(crate) free_large: ArrayQueue<SlotId>,
    pub(crate) free_small: ArrayQueue<SlotId>,
    pub(crate) metrics: CacheMetrics,
}

impl SharedState {
    pub(crate) fn new(bytes: SharedBytes) -> Self {
        // ArrayQueue rejects zero capacity; a never-used pool of one is fine.
        let free_large = ArrayQueue::new(bytes.num_large_slots().max(1));
        let free_small = ArrayQueue::new(bytes.num_small_slots().max(1));
        for i in 0..bytes.num_large_slots() {
            free_large.push(SlotId(i)).expect("pool sized for all large slots");
        }
        for i in 0..bytes.num_small_slots() {
            free_small
                .push(SlotId(bytes.num_large_slots() + i))
                .expect("pool sized for all small slots");
        }
        SharedState {
            bytes,
            free_large,
            free_small,
            metrics: CacheMetrics::default(),
        }
    }

    pub(crate) fn free_pool(&self, class: RegionClass) -> &ArrayQueue<SlotId> {
        match class {
            RegionClass::Large => &self.free_large,
            RegionClass::Small => &self.free_small,
        }
    }
}

/// Bounds- and ownership-checked access to one slot of the slab.
///
/// Handed to reader and writer callbacks so that a stale in-flight task can
/// never touch a slot its region no longer owns: in debug builds every
/// access re-asserts ownership against the slab's owner table.
pub struct SlotHandle<'a> {
    bytes: &'a SharedBytes,
    key: &'a RegionKey,
    slot: SlotId,
    len: u64,
}

impl SlotHandle<'_> {
    /// Usable length of the region in this slot (a tail region may be
    /// shorter than the slot itself).
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns `true` for a zero-length region.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The physical slot this handle accesses.
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Copies `buf.len()` bytes out of the region starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the read runs past the region length.
    pub fn read(&self, offset: u64, buf: &mut [u8]) {
        self.bytes.assert_owner(self.slot, self.key);
        assert!(
            offset + buf.len() as u64 <= self.len,
            "read of {} bytes at {offset} exceeds region length {}",
            buf.len(),
            self.len
        );
        self.bytes.read_at(self.slot, offset, buf);
    }

    /// Copies `data` into the region starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the write runs past the region length.
    pub fn write(&self, offset: u64, data: &[u8]) {
        self.bytes.assert_owner(self.slot, self.key);
        assert!(
            offset + data.len() as u64 <= self.len,
            "write of {} bytes at {offset} exceeds region length {}",
            data.len(),
            self.len
        );
        self.bytes.write_at(self.slot, offset, data);
    }
}

impl fmt::Debug for SlotHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotHandle")
            .field("slot", &self.slot)
            .field("len", &self.len)
            .finish()
    }
}

/// Releases one reference when dropped, no matter how the holding closure
/// exits.
struct RefGuard {
    region: Arc<CacheFileRegion>,
}

impl Drop for RefGuard {
    fn drop(&mut self) {
        self.region.dec_ref();
    }
}

/// One region of one logical file: the evictable unit of the cache.
pub struct CacheFileRegion {
    region_key: RegionKey,
    len: u64,
    class: RegionClass,
    tracker: SparseFileTracker,
    state: Arc<SharedState>,
    /// Assigned slot index, or -1 while the region holds no storage.
    slot: AtomicI64,
    /// Serializes slot acquisition for this entry during lookups.
    init: Mutex<()>,
    refs: AtomicUsize,
    evicted: AtomicBool,
}

impl CacheFileRegion {
    pub(crate) fn new(
        region_key: RegionKey,
        len: u64,
        class: RegionClass,
        state: Arc<SharedState>,
    ) -> Arc<CacheFileRegion> {
        Arc::new(CacheFileRegion {
            region_key,
            len,
            class,
            tracker: SparseFileTracker::new(len),
            state,
            slot: AtomicI64::new(-1),
            init: Mutex::new(()),
            refs: AtomicUsize::new(1),
            evicted: AtomicBool::new(false),
        })
    }

    /// Identity of the region.
    pub fn region_key(&self) -> &RegionKey {
        &self.region_key
    }

    /// Usable length of the region in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns `true` for a zero-length region.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size class of the slot this region occupies.
    pub fn region_class(&self) -> RegionClass {
        self.class
    }

    /// The region's population tracker.
    pub fn tracker(&self) -> &SparseFileTracker {
        &self.tracker
    }

    /// Physical slot currently assigned, or `None` before assignment and
    /// after release.
    pub fn slot(&self) -> Option<SlotId> {
        let raw = self.slot.load(Ordering::SeqCst);
        if raw < 0 {
            None
        } else {
            Some(SlotId(raw as usize))
        }
    }

    /// Records the slot this region now owns. Callers serialize through
    /// [`init_lock`](Self::init_lock) and the engine's list lock.
    pub(crate) fn assign_slot(&self, slot: SlotId) {
        let previous = self.slot.swap(slot.index() as i64, Ordering::SeqCst);
        debug_assert!(previous < 0, "region already held a slot");
    }

    /// Per-entry mutex serializing slot acquisition during lookups.
    pub(crate) fn init_lock(&self) -> MutexGuard<'_, ()> {
        self.init.lock()
    }

    /// Returns `true` once the region has been (organically or forcibly)
    /// evicted.
    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::SeqCst)
    }

    /// Current reference count.
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> CacheResult<()> {
        if self.is_evicted() {
            Err(CacheError::AlreadyEvicted)
        } else {
            Ok(())
        }
    }

    /// Acquires a reference unless the count already reached zero.
    pub(crate) fn try_inc_ref(&self) -> bool {
        let mut current = self.refs.load(Ordering::SeqCst);
        loop {
            if current == 0 {
                return false;
            }
            match self.refs.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Releases one reference; the last one after eviction closes the
    /// region and returns its slot to the free pool.
    pub(crate) fn dec_ref(&self) {
        let previous = self.refs.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "reference count underflow");
        if previous == 1 {
            debug_assert!(self.is_evicted(), "last reference dropped without eviction");
            self.close_internal();
        }
    }

    /// Evicts the region if nothing else holds a reference.
    ///
    /// Must only be called while the caller can guarantee no new reference
    /// is being handed out for allocation purposes (the engine holds its
    /// list lock). A racing `try_inc_ref` is still possible and is handled
    /// by the reference holder re-checking `evicted` afterwards.
    pub(crate) fn try_evict(&self) -> bool {
        if self.ref_count() > 1 {
            trace!(region = %self.region_key, refs = self.ref_count(), "region in use, not evicting");
            return false;
        }
        self.evict()
    }

    /// Evicts the region regardless of its reference count. In-flight
    /// operations fail at their next open check; the slot is released once
    /// they drop their references.
    pub(crate) fn force_evict(&self) -> bool {
        self.evict()
    }

    fn evict(&self) -> bool {
        if self
            .evicted
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            trace!(region = %self.region_key, "region evicted");
            self.dec_ref();
            true
        } else {
            false
        }
    }

    /// Returns the slot to its free pool. Runs exactly once, when the last
    /// reference goes away after eviction. Deliberately lock-free so it can
    /// run while the engine holds its list lock.
    fn close_internal(&self) {
        let raw = self.slot.swap(-1, Ordering::SeqCst);
        if raw >= 0 {
            let slot = SlotId(raw as usize);
            self.state.bytes.release(slot, &self.region_key);
            let pushed = self.state.free_pool(self.class).push(slot).is_ok();
            debug_assert!(pushed, "free pool cannot overflow its slot count");
            trace!(region = %self.region_key, %slot, "slot returned to free pool");
        }
    }

    /// Ensures `range_to_write` is populated and reads `range_to_read`.
    ///
    /// Missing sub-ranges of `range_to_write` are claimed as gaps and filled
    /// by `writer` tasks submitted to `executor`; each task holds its own
    /// reference for its duration. Once the tracker reports
    /// `range_to_read` fully available, `reader` copies the bytes out and
    /// the future resolves with the byte count, which must equal the
    /// requested length.
    pub fn populate_and_read(
        self: Arc<Self>,
        range_to_write: ByteRange,
        range_to_read: ByteRange,
        reader: RangeReader,
        writer: RangeWriter,
        executor: &dyn Executor,
    ) -> ReadFuture {
        let (promise, future) = ReadFuture::channel();
        self.populate_and_read_notify(
            range_to_write,
            range_to_read,
            reader,
            writer,
            executor,
            Box::new(move |result| promise.complete(result)),
        );
        future
    }

    /// Listener-based core of [`populate_and_read`](Self::populate_and_read).
    pub(crate) fn populate_and_read_notify(
        self: Arc<Self>,
        range_to_write: ByteRange,
        range_to_read: ByteRange,
        reader: RangeReader,
        writer: RangeWriter,
        executor: &dyn Executor,
        listener: ReadListener,
    ) {
        if let Err(error) = self.ensure_open() {
            listener(Err(error));
            return;
        }
        if !self.try_inc_ref() {
            listener(Err(CacheError::AlreadyEvicted));
            return;
        }
        // Re-check after acquiring: eviction may have won the race.
        if let Err(error) = self.ensure_open() {
            self.dec_ref();
            listener(Err(error));
            return;
        }

        let guard = RefGuard {
            region: Arc::clone(&self),
        };
        let this = Arc::clone(&self);
        let tracker_listener: RangeListener = Box::new(move |result| {
            let _guard = guard;
            match result {
                Ok(()) => listener(this.read_checked(range_to_read, &reader)),
                Err(error) => listener(Err(error)),
            }
        });
        let gaps = self
            .tracker
            .wait_for_range(range_to_write, range_to_read, tracker_listener);
        for gap in gaps {
            let this = Arc::clone(&self);
            let writer = Arc::clone(&writer);
            executor.execute(Box::new(move || this.fill_gap(&gap, &writer)));
        }
    }

    /// Reads `range` if it is already populated or claimed by a pending
    /// writer. Returns `None` — registering nothing — when some sub-range is
    /// missing; never claims gaps or triggers fetches.
    pub fn read_if_available_or_pending(
        self: Arc<Self>,
        range: ByteRange,
        reader: RangeReader,
    ) -> Option<ReadFuture> {
        let (promise, future) = ReadFuture::channel();
        if self.read_if_available_notify(range, reader, Box::new(move |result| promise.complete(result)))
        {
            Some(future)
        } else {
            None
        }
    }

    /// Listener-based core of
    /// [`read_if_available_or_pending`](Self::read_if_available_or_pending).
    pub(crate) fn read_if_available_notify(
        self: Arc<Self>,
        range: ByteRange,
        reader: RangeReader,
        listener: ReadListener,
    ) -> bool {
        if self.ensure_open().is_err() || !self.try_inc_ref() {
            return false;
        }
        if self.ensure_open().is_err() {
            self.dec_ref();
            return false;
        }
        let guard = RefGuard {
            region: Arc::clone(&self),
        };
        let this = Arc::clone(&self);
        let tracker_listener: RangeListener = Box::new(move |result| {
            let _guard = guard;
            match result {
                Ok(()) => listener(this.read_checked(range, &reader)),
                Err(error) => listener(Err(error)),
            }
        });
        // On `false` the unfired listener is dropped and the guard releases
        // the reference.
        self.tracker.wait_for_range_if_pending(range, tracker_listener)
    }

    /// Runs the reader over a range the tracker guarantees available.
    fn read_checked(&self, range: ByteRange, reader: &RangeReader) -> CacheResult<u64> {
        if range.is_empty() {
            return Ok(0);
        }
        self.ensure_open()?;
        let slot = self
            .slot()
            .expect("open region with populated ranges always holds a slot");
        let handle = SlotHandle {
            bytes: &self.state.bytes,
            key: &self.region_key,
            slot,
            len: self.len,
        };
        let bytes_read = reader(&handle, range)?;
        assert!(
            bytes_read == range.len(),
            "reader returned {bytes_read} bytes for available range {range}"
        );
        self.state.metrics.record_bytes_read(bytes_read);
        Ok(bytes_read)
    }

    /// Fills one claimed gap; runs on the caller-supplied executor.
    fn fill_gap(&self, gap: &Gap, writer: &RangeWriter) {
        if !self.try_inc_ref() {
            gap.on_failure(CacheError::AlreadyEvicted);
            return;
        }
        let result = self.write_gap(gap, writer);
        self.dec_ref();
        match result {
            Ok(()) => {
                self.state.metrics.record_bytes_written(gap.range().len());
                gap.on_completion();
            }
            Err(error) => {
                warn!(region = %self.region_key, gap = %gap.range(), %error, "failed to fill cache gap");
                gap.on_failure(error);
            }
        }
    }

    fn write_gap(&self, gap: &Gap, writer: &RangeWriter) -> CacheResult<()> {
        self.ensure_open()?;
        let slot = self
            .slot()
            .expect("region holding a reference keeps its slot");
        let handle = SlotHandle {
            bytes: &self.state.bytes,
            key: &self.region_key,
            slot,
            len: self.len,
        };
        let mut progress = |bytes: u64| gap.on_progress(bytes);
        writer(&handle, gap.range(), &mut progress)
    }
}

impl fmt::Debug for CacheFileRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheFileRegion")
            .field("region_key", &self.region_key)
            .field("len", &self.len)
            .field("class", &self.class)
            .field("slot", &self.slot())
            .field("refs", &self.ref_count())
            .field("evicted", &self.is_evicted())
            .finish()
    }
}
