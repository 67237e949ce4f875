//! Sparse population tracking for one cache region.
//!
//! A [`SparseFileTracker`] records which byte sub-ranges of a fixed-size
//! region are already populated, which are being written by someone, and
//! which are missing. Writers claim missing sub-ranges as [`Gap`]s — each
//! gap is handed to exactly one caller — and report progress, completion, or
//! failure on them. Readers subscribe with a listener that fires as soon as
//! their requested range is fully available, which can happen before a whole
//! gap completes thanks to per-gap progress watermarks.
//!
//! Failure of a gap removes its range from the tracker (the bytes become
//! missing again and can be re-claimed) and fails only the listeners whose
//! requested range depended on it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::CacheError;
use crate::range::ByteRange;

/// Callback fired once a waited-on range is fully available (`Ok`) or a
/// required gap failed (`Err`).
pub type RangeListener = Box<dyn FnOnce(Result<(), CacheError>) + Send>;

/// Tracks populated, pending, and missing sub-ranges of one region.
pub struct SparseFileTracker {
    len: u64,
    state: Arc<Mutex<TrackerState>>,
}

/// A missing sub-range claimed for writing by exactly one caller.
///
/// The owner must call exactly one of [`on_completion`](Gap::on_completion)
/// or [`on_failure`](Gap::on_failure), optionally preceded by any number of
/// monotonic [`on_progress`](Gap::on_progress) updates.
pub struct Gap {
    state: Arc<Mutex<TrackerState>>,
    range: ByteRange,
}

#[derive(Debug)]
struct TrackerState {
    /// Non-overlapping tracked ranges keyed by start offset.
    ranges: BTreeMap<u64, TrackedRange>,
}

#[derive(Debug)]
struct TrackedRange {
    end: u64,
    status: RangeStatus,
}

#[derive(Debug)]
enum RangeStatus {
    Completed,
    Pending(PendingState),
}

#[derive(Debug)]
struct PendingState {
    /// Absolute watermark: bytes in `[start, progress)` are committed and
    /// visible to readers.
    progress: u64,
    waiters: Vec<Waiter>,
}

struct Waiter {
    /// Absolute offset the waiter needs this range to be filled up to.
    required_end: u64,
    group: Arc<WaitGroup>,
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("required_end", &self.required_end)
            .finish()
    }
}

/// Countdown shared by all pending ranges one listener depends on.
struct WaitGroup {
    state: Mutex<WaitGroupState>,
}

struct WaitGroupState {
    remaining: usize,
    failed: bool,
    listener: Option<RangeListener>,
}

impl WaitGroup {
    fn new(remaining: usize, listener: RangeListener) -> Arc<Self> {
        Arc::new(WaitGroup {
            state: Mutex::new(WaitGroupState {
                remaining,
                failed: false,
                listener: Some(listener),
            }),
        })
    }

    /// Marks one dependency satisfied; returns the listener once all are.
    fn complete_one(&self) -> Option<RangeListener> {
        let mut state = self.state.lock();
        if state.failed {
            return None;
        }
        state.remaining -= 1;
        if state.remaining == 0 {
            state.listener.take()
        } else {
            None
        }
    }

    /// Marks the group failed; returns the listener the first time only.
    fn fail(&self) -> Option<RangeListener> {
        let mut state = self.state.lock();
        if state.failed {
            return None;
        }
        state.failed = true;
        state.listener.take()
    }
}

impl SparseFileTracker {
    /// Creates a tracker for a region of `len` bytes with nothing populated.
    pub fn new(len: u64) -> Self {
        SparseFileTracker {
            len,
            state: Arc::new(Mutex::new(TrackerState {
                ranges: BTreeMap::new(),
            })),
        }
    }

    /// Region length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns `true` for a zero-length region.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Claims every missing sub-range of `range_to_write` for the caller and
    /// registers `listener` to fire once `range_to_read` is fully available.
    ///
    /// The returned gaps are exclusively owned: no concurrent or later call
    /// is handed an overlapping gap. Sub-ranges already completed or pending
    /// under another writer are skipped. If `range_to_read` is already fully
    /// available the listener fires before this method returns.
    ///
    /// # Panics
    ///
    /// Panics if the ranges exceed the region or `range_to_read` is not
    /// contained in `range_to_write`.
    pub fn wait_for_range(
        &self,
        range_to_write: ByteRange,
        range_to_read: ByteRange,
        listener: RangeListener,
    ) -> Vec<Gap> {
        assert!(
            range_to_write.end <= self.len,
            "write range {range_to_write} exceeds region of {} bytes",
            self.len
        );
        assert!(
            range_to_read.is_empty() || range_to_write.contains(range_to_read),
            "read range {range_to_read} not contained in write range {range_to_write}"
        );

        let mut fire_ok = None;
        let gaps: Vec<Gap>;
        {
            let mut state = self.state.lock();
            let mut missing: Vec<ByteRange> = Vec::new();
            // Pending ranges the read depends on: (start key, required end).
            let mut required: Vec<(u64, u64)> = Vec::new();
            let mut cursor = range_to_write.start;
            for (&start, tracked) in state.ranges.range(..range_to_write.end) {
                if tracked.end <= range_to_write.start {
                    continue;
                }
                if start > cursor {
                    missing.push(ByteRange::new(cursor, start));
                }
                if let RangeStatus::Pending(pending) = &tracked.status {
                    if start < range_to_read.end && tracked.end > range_to_read.start {
                        let need = tracked.end.min(range_to_read.end);
                        if pending.progress < need {
                            required.push((start, need));
                        }
                    }
                }
                cursor = cursor.max(tracked.end);
                if cursor >= range_to_write.end {
                    break;
                }
            }
            if cursor < range_to_write.end {
                missing.push(ByteRange::new(cursor, range_to_write.end));
            }

            for gap in &missing {
                trace!(gap = %gap, "claiming gap");
                state.ranges.insert(
                    gap.start,
                    TrackedRange {
                        end: gap.end,
                        status: RangeStatus::Pending(PendingState {
                            progress: gap.start,
                            waiters: Vec::new(),
                        }),
                    },
                );
                if gap.start < range_to_read.end && gap.end > range_to_read.start {
                    required.push((gap.start, gap.end.min(range_to_read.end)));
                }
            }

            if required.is_empty() {
                fire_ok = Some(listener);
            } else {
                let group = WaitGroup::new(required.len(), listener);
                for (start, need) in required {
                    match &mut state
                        .ranges
                        .get_mut(&start)
                        .expect("pending range inserted under this lock")
                        .status
                    {
                        RangeStatus::Pending(pending) => pending.waiters.push(Waiter {
                            required_end: need,
                            group: Arc::clone(&group),
                        }),
                        RangeStatus::Completed => unreachable!("range was pending"),
                    }
                }
            }

            gaps = missing
                .into_iter()
                .map(|range| Gap {
                    state: Arc::clone(&self.state),
                    range,
                })
                .collect();
        }
        if let Some(listener) = fire_ok {
            listener(Ok(()));
        }
        gaps
    }

    /// Registers `listener` for `range` only if every byte of it is already
    /// completed or claimed by a pending writer.
    ///
    /// Never creates gaps. Returns `false` — without registering anything —
    /// when some sub-range is missing and unclaimed. When it returns `true`
    /// the listener fires exactly once, possibly before this method returns.
    pub fn wait_for_range_if_pending(&self, range: ByteRange, listener: RangeListener) -> bool {
        assert!(
            range.end <= self.len,
            "range {range} exceeds region of {} bytes",
            self.len
        );
        let mut fire_ok = None;
        {
            let mut state = self.state.lock();
            let mut required: Vec<(u64, u64)> = Vec::new();
            let mut cursor = range.start;
            for (&start, tracked) in state.ranges.range(..range.end) {
                if tracked.end <= range.start {
                    continue;
                }
                if start > cursor {
                    return false;
                }
                if let RangeStatus::Pending(pending) = &tracked.status {
                    let need = tracked.end.min(range.end);
                    if pending.progress < need {
                        required.push((start, need));
                    }
                }
                cursor = cursor.max(tracked.end);
                if cursor >= range.end {
                    break;
                }
            }
            if cursor < range.end {
                return false;
            }

            if required.is_empty() {
                fire_ok = Some(listener);
            } else {
                let group = WaitGroup::new(required.len(), listener);
                for (start, need) in required {
                    match &mut state
                        .ranges
                        .get_mut(&start)
                        .expect("pending range seen under this lock")
                        .status
                    {
                        RangeStatus::Pending(pending) => pending.waiters.push(Waiter {
                            required_end: need,
                            group: Arc::clone(&group),
                        }),
                        RangeStatus::Completed => unreachable!("range was pending"),
                    }
                }
            }
        }
        if let Some(listener) = fire_ok {
            listener(Ok(()));
        }
        true
    }

    /// Length of the maximal populated prefix: the largest `n` such that
    /// every byte of `[0, n)` is completed or committed by a pending
    /// writer's progress.
    pub fn complete_up_to(&self) -> u64 {
        let state = self.state.lock();
        let mut cursor = 0;
        while let Some(tracked) = state.ranges.get(&cursor) {
            match &tracked.status {
                RangeStatus::Completed => cursor = tracked.end,
                RangeStatus::Pending(pending) => return pending.progress,
            }
        }
        cursor
    }

    /// Returns `true` if every byte of `range` is readable right now:
    /// completed, or below a pending writer's progress watermark.
    pub fn is_range_complete(&self, range: ByteRange) -> bool {
        if range.is_empty() {
            return true;
        }
        let state = self.state.lock();
        let mut cursor = range.start;
        for (&start, tracked) in state.ranges.range(..range.end) {
            if tracked.end <= range.start {
                continue;
            }
            if start > cursor {
                return false;
            }
            match &tracked.status {
                RangeStatus::Completed => cursor = cursor.max(tracked.end),
                RangeStatus::Pending(pending) => {
                    if pending.progress <= cursor {
                        return false;
                    }
                    cursor = cursor.max(pending.progress);
                    if cursor < range.end && tracked.end >= range.end {
                        return false;
                    }
                }
            }
            if cursor >= range.end {
                return true;
            }
        }
        cursor >= range.end
    }
}

impl fmt::Debug for SparseFileTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SparseFileTracker")
            .field("len", &self.len)
            .field("tracked_ranges", &state.ranges.len())
            .finish()
    }
}

impl Gap {
    /// First byte of the gap.
    pub fn start(&self) -> u64 {
        self.range.start
    }

    /// First byte past the end of the gap.
    pub fn end(&self) -> u64 {
        self.range.end
    }

    /// The gap as a [`ByteRange`].
    pub fn range(&self) -> ByteRange {
        self.range
    }

    /// Reports that the first `bytes` bytes of the gap are committed.
    ///
    /// Monotonic: regressions are ignored. Listeners whose required point is
    /// now covered fire immediately, before the gap completes.
    pub fn on_progress(&self, bytes: u64) {
        let mut fired: Vec<RangeListener> = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(tracked) = state.ranges.get_mut(&self.range.start) else {
                return;
            };
            if tracked.end != self.range.end {
                return;
            }
            let RangeStatus::Pending(pending) = &mut tracked.status else {
                return;
            };
            let progress = (self.range.start + bytes).min(self.range.end);
            if progress <= pending.progress {
                return;
            }
            pending.progress = progress;
            let mut i = 0;
            while i < pending.waiters.len() {
                if pending.waiters[i].required_end <= progress {
                    let waiter = pending.waiters.swap_remove(i);
                    if let Some(listener) = waiter.group.complete_one() {
                        fired.push(listener);
                    }
                } else {
                    i += 1;
                }
            }
        }
        for listener in fired {
            listener(Ok(()));
        }
    }

    /// Marks the whole gap as populated and releases every waiter on it.
    ///
    /// The completed range merges with adjacent completed neighbors.
    pub fn on_completion(&self) {
        let mut fired: Vec<RangeListener> = Vec::new();
        {
            let mut state = self.state.lock();
            match state.ranges.get(&self.range.start) {
                Some(tracked)
                    if tracked.end == self.range.end
                        && matches!(tracked.status, RangeStatus::Pending(_)) => {}
                _ => return,
            }
            let tracked = state
                .ranges
                .remove(&self.range.start)
                .expect("checked above");
            if let RangeStatus::Pending(pending) = tracked.status {
                for waiter in pending.waiters {
                    if let Some(listener) = waiter.group.complete_one() {
                        fired.push(listener);
                    }
                }
            }

            let mut start = self.range.start;
            let mut end = self.range.end;
            let merge_before = state
                .ranges
                .range(..start)
                .next_back()
                .filter(|(_, prev)| matches!(prev.status, RangeStatus::Completed) && prev.end == start)
                .map(|(&prev_start, _)| prev_start);
            if let Some(prev_start) = merge_before {
                state.ranges.remove(&prev_start);
                start = prev_start;
            }
            let merge_after = state
                .ranges
                .get(&end)
                .filter(|next| matches!(next.status, RangeStatus::Completed))
                .map(|next| next.end);
            if let Some(next_end) = merge_after {
                state.ranges.remove(&end);
                end = next_end;
            }
            state.ranges.insert(
                start,
                TrackedRange {
                    end,
                    status: RangeStatus::Completed,
                },
            );
            trace!(gap = %self.range, "gap completed");
        }
        for listener in fired {
            listener(Ok(()));
        }
    }

    /// Reports that filling the gap failed.
    ///
    /// The gap's bytes become missing again (a later writer can re-claim
    /// them) and every listener that depended on this gap fails. Listeners
    /// waiting on disjoint ranges are unaffected.
    pub fn on_failure(&self, error: CacheError) {
        let mut fired: Vec<RangeListener> = Vec::new();
        {
            let mut state = self.state.lock();
            match state.ranges.get(&self.range.start) {
                Some(tracked)
                    if tracked.end == self.range.end
                        && matches!(tracked.status, RangeStatus::Pending(_)) => {}
                _ => return,
            }
            let tracked = state
                .ranges
                .remove(&self.range.start)
                .expect("checked above");
            if let RangeStatus::Pending(pending) = tracked.status {
                for waiter in pending.waiters {
                    if let Some(listener) = waiter.group.fail() {
                        fired.push(listener);
                    }
                }
            }
            trace!(gap = %self.range, "gap failed");
        }
        for listener in fired {
            listener(Err(error.clone()));
        }
    }
}

impl fmt::Debug for Gap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gap").field("range", &self.range).finish()
    }
}
