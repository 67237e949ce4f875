//! The shared byte slab.
//!
//! [`SharedBytes`] owns the cache's entire fixed byte capacity, divided into
//! uniformly sized physical slots: large slots first, then small slots. The
//! slab itself enforces only bounds; *ownership* of a slot (which region may
//! read or write it) is the eviction engine's business, backed here by a
//! debug-only owner-tracking table that catches stale in-flight tasks
//! touching a slot that has been freed and handed to another region.
//!
//! Reads and writes copy in or out under a briefly held per-slot lock, so a
//! slow remote fetch never blocks readers of already-populated bytes for
//! longer than one `memcpy`.

use core::fmt;

use parking_lot::RwLock;

#[cfg(debug_assertions)]
use parking_lot::Mutex;

use crate::config::RegionClass;
use crate::key::RegionKey;

/// Index of one physical slot in the slab.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SlotId(pub(crate) usize);

impl SlotId {
    /// Position of the slot within the slab.
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// Fixed-capacity slab of large and small slots.
pub struct SharedBytes {
    num_large: usize,
    large_size: u64,
    small_size: u64,
    slots: Box<[RwLock<Box<[u8]>>]>,
    #[cfg(debug_assertions)]
    owners: Mutex<Box<[Option<RegionKey>]>>,
}

impl SharedBytes {
    /// Allocates a slab of `num_large` slots of `large_size` bytes followed
    /// by `num_small` slots of `small_size` bytes.
    pub fn new(num_large: usize, large_size: u64, num_small: usize, small_size: u64) -> Self {
        let slots = (0..num_large + num_small)
            .map(|i| {
                let size = if i < num_large { large_size } else { small_size };
                RwLock::new(vec![0u8; size as usize].into_boxed_slice())
            })
            .collect();
        SharedBytes {
            num_large,
            large_size,
            small_size,
            slots,
            #[cfg(debug_assertions)]
            owners: Mutex::new(vec![None; num_large + num_small].into_boxed_slice()),
        }
    }

    /// Total number of slots.
    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// Number of large slots. Slot indices below this are large.
    pub fn num_large_slots(&self) -> usize {
        self.num_large
    }

    /// Number of small slots.
    pub fn num_small_slots(&self) -> usize {
        self.slots.len() - self.num_large
    }

    /// Size class of `slot`.
    pub fn slot_class(&self, slot: SlotId) -> RegionClass {
        if slot.0 < self.num_large {
            RegionClass::Large
        } else {
            RegionClass::Small
        }
    }

    /// Byte capacity of `slot`.
    pub fn slot_size(&self, slot: SlotId) -> u64 {
        match self.slot_class(slot) {
            RegionClass::Large => self.large_size,
            RegionClass::Small => self.small_size,
        }
    }

    /// Copies `buf.len()` bytes out of `slot` starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the read would run past the end of the slot; that is a
    /// programming error in the caller, not a runtime condition.
    pub fn read_at(&self, slot: SlotId, offset: u64, buf: &mut [u8]) {
        let data = self.slots[slot.0].read();
        let offset = offset as usize;
        assert!(
            offset + buf.len() <= data.len(),
            "read of {} bytes at {offset} overruns {slot}",
            buf.len()
        );
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
    }

    /// Copies `data` into `slot` starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the write would run past the end of the slot.
    pub fn write_at(&self, slot: SlotId, offset: u64, data: &[u8]) {
        let mut dest = self.slots[slot.0].write();
        let offset = offset as usize;
        assert!(
            offset + data.len() <= dest.len(),
            "write of {} bytes at {offset} overruns {slot}",
            data.len()
        );
        dest[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Records `key` as the exclusive owner of `slot` (debug builds only).
    #[cfg(debug_assertions)]
    pub(crate) fn claim(&self, slot: SlotId, key: &RegionKey) {
        let mut owners = self.owners.lock();
        assert!(
            owners[slot.0].is_none(),
            "{slot} claimed by {key} while still owned by {}",
            owners[slot.0].as_ref().expect("checked above")
        );
        owners[slot.0] = Some(key.clone());
    }

    #[cfg(not(debug_assertions))]
    pub(crate) fn claim(&self, _slot: SlotId, _key: &RegionKey) {}

    /// Clears ownership of `slot`, asserting `key` held it (debug builds
    /// only).
    #[cfg(debug_assertions)]
    pub(crate) fn release(&self, slot: SlotId, key: &RegionKey) {
        let mut owners = self.owners.lock();
        assert_eq!(
            owners[slot.0].as_ref(),
            Some(key),
            "{slot} released by a region that does not own it"
        );
        owners[slot.0] = None;
    }

    #[cfg(not(debug_assertions))]
    pub(crate) fn release(&self, _slot: SlotId, _key: &RegionKey) {}

    /// Asserts that `key` currently owns `slot` (debug builds only).
    #[cfg(debug_assertions)]
    pub(crate) fn assert_owner(&self, slot: SlotId, key: &RegionKey) {
        let owners = self.owners.lock();
        assert_eq!(
            owners[slot.0].as_ref(),
            Some(key),
            "stale access to {slot}, which {key} no longer owns"
        );
    }

    #[cfg(not(debug_assertions))]
    pub(crate) fn assert_owner(&self, _slot: SlotId, _key: &RegionKey) {}
}

impl fmt::Debug for SharedBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBytes")
            .field("num_large", &self.num_large)
            .field("large_size", &self.large_size)
            .field("num_small", &self.num_small_slots())
            .field("small_size", &self.small_size)
            .finish()
    }
}
