//! Page table entry for software emulation.

use crate::{MapFlags, PhysicalAddress};

/// A single page table entry for software emulation.
///
/// The layout is a scale model of x86_64:
/// - Bit 0: present
/// - Bit 1: writable
/// - Bit 2: user accessible
/// - Bit 3: write-through
/// - Bit 4: cache disable
/// - Bit 5: accessed
/// - Bit 6: dirty
/// - Bit 7: large page
/// - Bit 8: global
/// - Bits 12-31: physical frame
/// - Bit 63: no-execute
///
/// A non-present entry with a nonzero frame is an offline page or a preallocated table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(u64);

impl PageEntry {
    const PRESENT: u64 = 1 << 0;
    const WRITABLE: u64 = 1 << 1;
    const USER: u64 = 1 << 2;
    const WRITE_THROUGH: u64 = 1 << 3;
    const CACHE_DISABLE: u64 = 1 << 4;
    const ACCESSED: u64 = 1 << 5;
    const DIRTY: u64 = 1 << 6;
    const LARGE_PAGE: u64 = 1 << 7;
    const GLOBAL: u64 = 1 << 8;
    const NO_EXECUTE: u64 = 1 << 63;

    /// Physical frame mask (bits 12-31).
    const ADDRESS_MASK: u64 = 0xFFFF_F000;

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

    /// Creates a present, writable entry pointing at a lower-level table.
    pub fn table(frame: PhysicalAddress, user: bool) -> Self {
        let mut value = (frame.as_u64() & Self::ADDRESS_MASK) | Self::PRESENT | Self::WRITABLE;
        if user {
            value |= Self::USER;
        }

        Self(value)
    }

    /// Creates a non-present entry that only records the frame of a reserved table.
    pub fn reserved_table(frame: PhysicalAddress) -> Self {
        Self(frame.as_u64() & Self::ADDRESS_MASK)
    }

    /// Creates a leaf entry from architecture-neutral mapping flags.
    pub fn leaf(frame: PhysicalAddress, flags: MapFlags) -> Self {
        let mut value = frame.as_u64() & Self::ADDRESS_MASK;
        if flags.contains(MapFlags::PRESENT) {
            value |= Self::PRESENT;
        }

        if !flags.contains(MapFlags::READ_ONLY) {
            value |= Self::WRITABLE;
        }

        if flags.contains(MapFlags::CACHE_DISABLE) {
            value |= Self::CACHE_DISABLE;
        } else if flags.contains(MapFlags::WRITE_THROUGH) {
            value |= Self::WRITE_THROUGH;
        }

        if flags.contains(MapFlags::USER_MODE) {
            value |= Self::USER;
        } else if flags.contains(MapFlags::GLOBAL) {
            value |= Self::GLOBAL;
        }

        if flags.contains(MapFlags::DIRTY) {
            value |= Self::DIRTY;
        }

        if flags.contains(MapFlags::LARGE_PAGE) {
            value |= Self::LARGE_PAGE;
        }

        if !flags.contains(MapFlags::EXECUTE) {
            value |= Self::NO_EXECUTE;
        }

        Self(value)
    }

    /// Returns the frame recorded in this entry, present or not.
    pub fn frame(self) -> Option<PhysicalAddress> {
        let address = (self.0 & Self::ADDRESS_MASK) as usize;
        (address != 0).then(|| PhysicalAddress::new(address))
    }

    /// Describes this entry with architecture-neutral flags.
    pub fn map_flags(self) -> MapFlags {
        let mut flags = MapFlags::empty();
        flags.set(MapFlags::PRESENT, self.is_present());
        flags.set(MapFlags::READ_ONLY, !self.is_writable());
        flags.set(MapFlags::EXECUTE, self.is_executable());
        flags.set(MapFlags::USER_MODE, self.is_user());
        flags.set(MapFlags::GLOBAL, self.is_global());
        flags.set(MapFlags::DIRTY, self.is_dirty());
        flags.set(MapFlags::LARGE_PAGE, self.0 & Self::LARGE_PAGE != 0);
        flags.set(MapFlags::CACHE_DISABLE, self.0 & Self::CACHE_DISABLE != 0);
        flags.set(MapFlags::WRITE_THROUGH, self.0 & Self::WRITE_THROUGH != 0);
        flags
    }

    /// Applies the access bits of `flags` selected by `mask`.
    pub fn with_access(self, flags: MapFlags, mask: MapFlags) -> Self {
        let mut entry = self;
        if mask.contains(MapFlags::PRESENT) {
            entry.set_bit(Self::PRESENT, flags.contains(MapFlags::PRESENT));
        }

        if mask.contains(MapFlags::READ_ONLY) {
            entry.set_bit(Self::WRITABLE, !flags.contains(MapFlags::READ_ONLY));
        }

        if mask.contains(MapFlags::EXECUTE) {
            entry.set_bit(Self::NO_EXECUTE, !flags.contains(MapFlags::EXECUTE));
        }

        entry
    }

    pub fn is_present(self) -> bool {
        self.0 & Self::PRESENT != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE != 0
    }

    pub fn is_user(self) -> bool {
        self.0 & Self::USER != 0
    }

    pub fn is_global(self) -> bool {
        self.0 & Self::GLOBAL != 0
    }

    pub fn is_dirty(self) -> bool {
        self.0 & Self::DIRTY != 0
    }

    pub fn is_accessed(self) -> bool {
        self.0 & Self::ACCESSED != 0
    }

    pub fn is_executable(self) -> bool {
        self.0 & Self::NO_EXECUTE == 0
    }

    /// Returns a copy with the present bit set or cleared.
    pub fn with_present(mut self, present: bool) -> Self {
        self.set_bit(Self::PRESENT, present);
        self
    }

    /// Returns a copy with the writable bit set or cleared.
    pub fn with_writable(mut self, writable: bool) -> Self {
        self.set_bit(Self::WRITABLE, writable);
        self
    }

    /// Returns a copy with the dirty bit cleared.
    pub fn without_dirty(self) -> Self {
        Self(self.0 & !Self::DIRTY)
    }

    /// Records a hardware access, setting the dirty bit on writes.
    pub(crate) fn mark_accessed(self, write: bool) -> Self {
        let mut value = self.0 | Self::ACCESSED;
        if write {
            value |= Self::DIRTY;
        }

        Self(value)
    }

    fn set_bit(&mut self, bit: u64, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_encodes_map_flags() {
        let frame = PhysicalAddress::new(0x5000);
        let entry = PageEntry::leaf(frame, MapFlags::PRESENT | MapFlags::USER_MODE);
        assert!(entry.is_present());
        assert!(entry.is_writable());
        assert!(entry.is_user());
        assert!(!entry.is_global());
        assert!(!entry.is_executable());
        assert_eq!(entry.frame(), Some(frame));
    }

    #[test]
    fn kernel_leaf_is_global_unless_user() {
        let frame = PhysicalAddress::new(0x5000);
        let flags = MapFlags::PRESENT | MapFlags::GLOBAL | MapFlags::READ_ONLY | MapFlags::EXECUTE;
        let entry = PageEntry::leaf(frame, flags);
        assert!(entry.is_global());
        assert!(!entry.is_writable());
        assert!(entry.is_executable());
        assert_eq!(entry.map_flags() & flags, flags);
    }

    #[test]
    fn offline_entry_keeps_frame() {
        let entry = PageEntry::leaf(PhysicalAddress::new(0x7000), MapFlags::PRESENT).with_present(false);
        assert!(!entry.is_present());
        assert_eq!(entry.frame(), Some(PhysicalAddress::new(0x7000)));
        assert_eq!(PageEntry::empty().frame(), None);
    }

    #[test]
    fn access_change_respects_mask() {
        let entry = PageEntry::leaf(PhysicalAddress::new(0x7000), MapFlags::PRESENT);
        let changed = entry.with_access(MapFlags::READ_ONLY, MapFlags::READ_ONLY);
        assert!(changed.is_present());
        assert!(!changed.is_writable());
    }

    #[test]
    fn hardware_access_sets_accessed_and_dirty() {
        let entry = PageEntry::leaf(PhysicalAddress::new(0x7000), MapFlags::PRESENT);
        assert!(!entry.is_dirty());
        assert!(entry.mark_accessed(false).is_accessed());
        assert!(!entry.mark_accessed(false).is_dirty());
        assert!(entry.mark_accessed(true).is_dirty());
        assert!(!entry.mark_accessed(true).without_dirty().is_dirty());
    }
}
