use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::paging_entry::PagingEntryId;

/// Holds metadata for a physical memory frame managed by the memory manager.
///
/// A frame becomes pageable only when a paging entry is attached to it; until then it
/// belongs to whoever allocated it.
pub struct Frame {
    /// Flags identifying the state of this frame.
    pub flags: FrameFlags,
    /// The attached paging entry, or zero.
    paging_entry: AtomicU32,
}

impl Frame {
    /// Returns the attached paging entry, if any.
    pub fn paging_entry(&self) -> Option<PagingEntryId> {
        PagingEntryId::from_raw(self.paging_entry.load(Ordering::Acquire))
    }

    /// Attaches or detaches a paging entry.
    pub fn set_paging_entry(&self, entry: Option<PagingEntryId>) {
        let raw = entry.map_or(0, PagingEntryId::into_raw);
        self.paging_entry.store(raw, Ordering::Release);
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            flags: FrameFlags::new(),
            paging_entry: AtomicU32::new(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFlag {
    /// Frame is allocated.
    Allocated = 1 << 0,
    /// Frame may never be paged out.
    NonPaged = 1 << 1,
}

/// Atomic flags for a physical memory frame.
#[derive(Default)]
pub struct FrameFlags(AtomicU64);

impl FrameFlags {
    /// Creates a new `FrameFlags` instance with all flags cleared.
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Sets the given flag atomically.
    pub fn atomic_set(&self, flag: FrameFlag) {
        self.0.fetch_or(flag as u64, Ordering::AcqRel);
    }

    /// Clears the given flag atomically.
    pub fn atomic_clear(&self, flag: FrameFlag) {
        self.0.fetch_and(!(flag as u64), Ordering::AcqRel);
    }

    /// Tests if the given flag is set, atomically.
    pub fn atomic_test(&self, flag: FrameFlag) -> bool {
        self.0.load(Ordering::Acquire) & flag as u64 != 0
    }

    /// Tests the given flag and sets it atomically, returning the previous value.
    pub fn atomic_test_and_set(&self, flag: FrameFlag) -> bool {
        let old = self.0.fetch_or(flag as u64, Ordering::AcqRel);
        old & flag as u64 != 0
    }

    /// Clears every flag.
    pub fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }
}
