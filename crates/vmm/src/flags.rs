//! Flag vocabularies shared by the mapping layer and the section engine.

use bitflags::bitflags;

bitflags! {
    /// Architecture-neutral attributes of a single page mapping.
    ///
    /// `PRESENT` makes the entry walkable, `READ_ONLY` clears the writable bit and the
    /// absence of `EXECUTE` sets no-execute. Kernel mappings without `USER_MODE` are
    /// normally `GLOBAL`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct MapFlags: u32 {
        const PRESENT = 1 << 0;
        const READ_ONLY = 1 << 1;
        const EXECUTE = 1 << 2;
        const USER_MODE = 1 << 3;
        const GLOBAL = 1 << 4;
        const LARGE_PAGE = 1 << 5;
        const DIRTY = 1 << 6;
        const CACHE_DISABLE = 1 << 7;
        const WRITE_THROUGH = 1 << 8;
    }
}

impl MapFlags {
    /// Flags that can be toggled on live entries by an access change.
    pub const ACCESS_MASK: Self = Self::PRESENT.union(Self::READ_ONLY).union(Self::EXECUTE);

    /// Flags a section may carry through to every mapping it installs.
    pub const SECTION_MASK: Self = Self::CACHE_DISABLE
        .union(Self::WRITE_THROUGH)
        .union(Self::LARGE_PAGE);
}

bitflags! {
    /// Options for unmapping a run of pages.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct UnmapFlags: u32 {
        /// Release the physical frames once no processor can reach them.
        const FREE_PHYSICAL_PAGES = 1 << 0;
        /// Invalidate the range on every processor, not just this one.
        const SEND_INVALIDATE_IPI = 1 << 1;
    }
}

bitflags! {
    /// State and permissions of an image section.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct SectionFlags: u32 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const EXECUTABLE = 1 << 2;
        /// Writes are visible to every mapper; backed by the page cache directly.
        const SHARED = 1 << 3;
        /// Backed by a file handle.
        const BACKED = 1 << 4;
        /// Pages are locked in memory for the life of the section.
        const NON_PAGED = 1 << 5;
        /// The section has been writable at some point in its life.
        const WAS_WRITABLE = 1 << 6;
        const DESTROYED = 1 << 7;
        const DESTROYING = 1 << 8;
        /// The backing offset is page-cache aligned and clean pages come from the cache.
        const PAGE_CACHE_BACKED = 1 << 9;
        /// No image backs the section; clean pages are zero.
        const NO_IMAGE_BACKING = 1 << 10;
        /// Created through the map system call.
        const MAP_SYSTEM_CALL = 1 << 11;
    }
}

impl SectionFlags {
    /// Permission bits.
    pub const ACCESS_MASK: Self = Self::READABLE.union(Self::WRITABLE).union(Self::EXECUTABLE);

    /// Bits a forked section inherits from its source.
    pub const COPY_MASK: Self = Self::ACCESS_MASK
        .union(Self::SHARED)
        .union(Self::BACKED)
        .union(Self::NON_PAGED)
        .union(Self::WAS_WRITABLE)
        .union(Self::PAGE_CACHE_BACKED)
        .union(Self::NO_IMAGE_BACKING)
        .union(Self::MAP_SYSTEM_CALL);

    /// Bits a caller may pass when creating a section.
    pub const CREATE_MASK: Self = Self::ACCESS_MASK
        .union(Self::SHARED)
        .union(Self::NON_PAGED)
        .union(Self::MAP_SYSTEM_CALL);

    /// Returns true if pages of this section map with any access at all.
    pub const fn is_accessible(self) -> bool {
        self.intersects(Self::READABLE.union(Self::WRITABLE))
    }

    /// Returns true once destruction has started or finished.
    pub const fn is_going_away(self) -> bool {
        self.intersects(Self::DESTROYED.union(Self::DESTROYING))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_mask_excludes_lifecycle_bits() {
        assert!(!SectionFlags::COPY_MASK.contains(SectionFlags::DESTROYED));
        assert!(!SectionFlags::COPY_MASK.contains(SectionFlags::DESTROYING));
        assert!(SectionFlags::COPY_MASK.contains(SectionFlags::WAS_WRITABLE));
    }

    #[test]
    fn accessibility() {
        assert!(SectionFlags::READABLE.is_accessible());
        assert!(SectionFlags::WRITABLE.is_accessible());
        assert!(!SectionFlags::EXECUTABLE.is_accessible());
        assert!((SectionFlags::DESTROYING | SectionFlags::SHARED).is_going_away());
    }

    #[test]
    fn access_mask_covers_protection_bits() {
        let flags = MapFlags::PRESENT | MapFlags::READ_ONLY | MapFlags::GLOBAL;
        assert_eq!(flags & MapFlags::ACCESS_MASK, MapFlags::PRESENT | MapFlags::READ_ONLY);
    }
}
