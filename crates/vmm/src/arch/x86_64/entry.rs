//! Page table entry for x86_64 architecture.

use x86_64::structures::paging::PageTableFlags;

use crate::{MapFlags, PhysicalAddress};

/// A single page table entry for x86_64.
///
/// Bits 12-51 hold the frame; the remaining bits are `PageTableFlags`. A non-present
/// entry with a nonzero frame is an offline page or a preallocated table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(u64);

impl PageEntry {
    /// Physical address mask for x86_64 page table entries.
    const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    /// The empty entry.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates an entry from its raw value.
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub const fn raw(self) -> u64 {
        self.0
    }

    fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0)
    }

    fn with_flags(frame: PhysicalAddress, flags: PageTableFlags) -> Self {
        Self((frame.as_u64() & Self::ADDRESS_MASK) | flags.bits())
    }

    /// Creates a present, writable entry pointing at a lower-level table.
    pub fn table(frame: PhysicalAddress, user: bool) -> Self {
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        flags.set(PageTableFlags::USER_ACCESSIBLE, user);
        Self::with_flags(frame, flags)
    }

    /// Creates a non-present entry that only records the frame of a reserved table.
    pub fn reserved_table(frame: PhysicalAddress) -> Self {
        Self::with_flags(frame, PageTableFlags::empty())
    }

    /// Creates a leaf entry from architecture-neutral mapping flags.
    pub fn leaf(frame: PhysicalAddress, map: MapFlags) -> Self {
        let mut flags = PageTableFlags::empty();
        flags.set(PageTableFlags::PRESENT, map.contains(MapFlags::PRESENT));
        flags.set(PageTableFlags::WRITABLE, !map.contains(MapFlags::READ_ONLY));
        if map.contains(MapFlags::CACHE_DISABLE) {
            flags |= PageTableFlags::NO_CACHE;
        } else if map.contains(MapFlags::WRITE_THROUGH) {
            flags |= PageTableFlags::WRITE_THROUGH;
        }

        if map.contains(MapFlags::USER_MODE) {
            flags |= PageTableFlags::USER_ACCESSIBLE;
        } else if map.contains(MapFlags::GLOBAL) {
            flags |= PageTableFlags::GLOBAL;
        }

        flags.set(PageTableFlags::DIRTY, map.contains(MapFlags::DIRTY));
        flags.set(PageTableFlags::HUGE_PAGE, map.contains(MapFlags::LARGE_PAGE));
        flags.set(PageTableFlags::NO_EXECUTE, !map.contains(MapFlags::EXECUTE));
        Self::with_flags(frame, flags)
    }

    /// Returns the frame recorded in this entry, present or not.
    pub fn frame(self) -> Option<PhysicalAddress> {
        let address = (self.0 & Self::ADDRESS_MASK) as usize;
        (address != 0).then(|| PhysicalAddress::new(address))
    }

    /// Describes this entry with architecture-neutral flags.
    pub fn map_flags(self) -> MapFlags {
        let flags = self.flags();
        let mut map = MapFlags::empty();
        map.set(MapFlags::PRESENT, flags.contains(PageTableFlags::PRESENT));
        map.set(MapFlags::READ_ONLY, !flags.contains(PageTableFlags::WRITABLE));
        map.set(MapFlags::EXECUTE, !flags.contains(PageTableFlags::NO_EXECUTE));
        map.set(MapFlags::USER_MODE, flags.contains(PageTableFlags::USER_ACCESSIBLE));
        map.set(MapFlags::GLOBAL, flags.contains(PageTableFlags::GLOBAL));
        map.set(MapFlags::DIRTY, flags.contains(PageTableFlags::DIRTY));
        map.set(MapFlags::LARGE_PAGE, flags.contains(PageTableFlags::HUGE_PAGE));
        map.set(MapFlags::CACHE_DISABLE, flags.contains(PageTableFlags::NO_CACHE));
        map.set(MapFlags::WRITE_THROUGH, flags.contains(PageTableFlags::WRITE_THROUGH));
        map
    }

    /// Applies the access bits of `map` selected by `mask`.
    pub fn with_access(self, map: MapFlags, mask: MapFlags) -> Self {
        let mut flags = self.flags();
        if mask.contains(MapFlags::PRESENT) {
            flags.set(PageTableFlags::PRESENT, map.contains(MapFlags::PRESENT));
        }

        if mask.contains(MapFlags::READ_ONLY) {
            flags.set(PageTableFlags::WRITABLE, !map.contains(MapFlags::READ_ONLY));
        }

        if mask.contains(MapFlags::EXECUTE) {
            flags.set(PageTableFlags::NO_EXECUTE, !map.contains(MapFlags::EXECUTE));
        }

        Self((self.0 & Self::ADDRESS_MASK) | flags.bits())
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PageTableFlags::PRESENT)
    }

    pub fn is_writable(self) -> bool {
        self.flags().contains(PageTableFlags::WRITABLE)
    }

    pub fn is_user(self) -> bool {
        self.flags().contains(PageTableFlags::USER_ACCESSIBLE)
    }

    pub fn is_global(self) -> bool {
        self.flags().contains(PageTableFlags::GLOBAL)
    }

    pub fn is_dirty(self) -> bool {
        self.flags().contains(PageTableFlags::DIRTY)
    }

    pub fn is_accessed(self) -> bool {
        self.flags().contains(PageTableFlags::ACCESSED)
    }

    pub fn is_executable(self) -> bool {
        !self.flags().contains(PageTableFlags::NO_EXECUTE)
    }

    /// Returns a copy with the present bit set or cleared.
    pub fn with_present(self, present: bool) -> Self {
        let mut flags = self.flags();
        flags.set(PageTableFlags::PRESENT, present);
        Self((self.0 & Self::ADDRESS_MASK) | flags.bits())
    }

    /// Returns a copy with the writable bit set or cleared.
    pub fn with_writable(self, writable: bool) -> Self {
        let mut flags = self.flags();
        flags.set(PageTableFlags::WRITABLE, writable);
        Self((self.0 & Self::ADDRESS_MASK) | flags.bits())
    }

    /// Returns a copy with the dirty bit cleared.
    pub fn without_dirty(self) -> Self {
        Self(self.0 & !PageTableFlags::DIRTY.bits())
    }

    /// Records an access made on the memory manager's behalf, setting the dirty bit on
    /// writes.
    pub(crate) fn mark_accessed(self, write: bool) -> Self {
        let mut flags = self.flags() | PageTableFlags::ACCESSED;
        if write {
            flags |= PageTableFlags::DIRTY;
        }

        Self((self.0 & Self::ADDRESS_MASK) | flags.bits())
    }
}
