//! Page table manipulation.
//!
//! Tables of the active address space (and every kernel address) are reached through the
//! self-map. Tables of any other address space are reached by mapping them one at a time
//! at a per-processor scratch page, which is only done at dispatch level so no other
//! thread can observe the scratch translation.
//!
//! Leaf updates follow two rules. Installing a translation where none was present needs
//! no invalidation, because non-present entries are never cached. Removing or weakening
//! a translation must be followed by an invalidation on every processor that may cache it
//! before the old frame is reused.

use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use crate::{
    MapFlags, MmResult, PAGE_SIZE, PhysicalAddress, UnmapFlags, VirtualAddress,
    address::AddressTranslator,
    address_space::AddressSpace,
    arch::{self, ENTRIES_PER_TABLE, ENTRY_SIZE, PAGE_TABLE_LEVELS, PageEntry, TOP_LEVEL},
    manager::MemoryManager,
    platform::{Platform, RunLevel, RunLevelGuard},
    tlb,
};

/// A page removed by [`MemoryManager::unmap_page`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnmappedPage {
    pub frame: PhysicalAddress,
    pub dirty: bool,
}

/// One of the executing processor's scratch pages, used as a window onto a page table
/// frame that is not reachable through the self-map.
pub(crate) struct ScratchWindow<'a> {
    _level: RunLevelGuard<'a>,
    va: VirtualAddress,
    mapped: Option<PhysicalAddress>,
}

impl<'a> ScratchWindow<'a> {
    pub(crate) fn new(platform: &'a dyn Platform, slot: usize) -> Self {
        let level = RunLevelGuard::raise(platform, RunLevel::Dispatch);
        let va = VirtualAddress::new(arch::scratch_page(platform.current_processor(), slot));
        Self {
            _level: level,
            va,
            mapped: None,
        }
    }

    /// Maps `frame` at the window and returns a pointer to its first byte.
    pub(crate) fn map(&mut self, frame: PhysicalAddress) -> *mut u8 {
        if self.mapped != Some(frame) {
            let leaf = arch::entry_ptr(self.va, 0);
            let entry = PageEntry::leaf(frame, MapFlags::PRESENT | MapFlags::GLOBAL);
            unsafe { leaf.write_volatile(entry) };
            arch::invalidate_tlb_entry(self.va);
            self.mapped = Some(frame);
        }

        arch::kernel_ptr(self.va)
    }

    fn entry(&mut self, table: PhysicalAddress, index: usize) -> *mut PageEntry {
        let base: *mut PageEntry = self.map(table).cast();
        unsafe { base.add(index) }
    }
}

impl Drop for ScratchWindow<'_> {
    fn drop(&mut self) {
        if self.mapped.is_some() {
            unsafe { arch::entry_ptr(self.va, 0).write_volatile(PageEntry::empty()) };
            arch::invalidate_tlb_entry(self.va);
        }
    }
}

/// Reads and writes the entries of one address space's tables.
enum Walker<'a> {
    Active,
    Foreign {
        root: PhysicalAddress,
        window: ScratchWindow<'a>,
    },
}

impl Walker<'_> {
    /// Returns the table holding the level `level` entry for `va`, if every table above
    /// it is present.
    fn foreign_table(root: PhysicalAddress, window: &mut ScratchWindow<'_>, va: VirtualAddress, level: usize) -> Option<PhysicalAddress> {
        let mut table = root;
        for upper in (level + 1..PAGE_TABLE_LEVELS).rev() {
            let entry = unsafe { window.entry(table, va.page_index(upper)).read_volatile() };
            if !entry.is_present() {
                return None;
            }

            table = entry.frame()?;
        }

        Some(table)
    }

    fn read(&mut self, va: VirtualAddress, level: usize) -> Option<PageEntry> {
        match self {
            Self::Active => {
                for upper in (level + 1..PAGE_TABLE_LEVELS).rev() {
                    let entry = unsafe { arch::entry_ptr(va, upper).read_volatile() };
                    if !entry.is_present() {
                        return None;
                    }
                }

                Some(unsafe { arch::entry_ptr(va, level).read_volatile() })
            }
            Self::Foreign { root, window } => {
                let table = Self::foreign_table(*root, window, va, level)?;
                Some(unsafe { window.entry(table, va.page_index(level)).read_volatile() })
            }
        }
    }

    /// Writes an entry. Every table above `level` must be present.
    fn write(&mut self, va: VirtualAddress, level: usize, entry: PageEntry) {
        match self {
            Self::Active => unsafe { arch::entry_ptr(va, level).write_volatile(entry) },
            Self::Foreign { root, window } => {
                let Some(table) = Self::foreign_table(*root, window, va, level) else {
                    panic!("page table for {} at level {} is missing", va, level);
                };

                unsafe { window.entry(table, va.page_index(level)).write_volatile(entry) };
            }
        }
    }

    /// Fills a whole table with empty entries.
    fn clear_table(&mut self, va: VirtualAddress, level: usize) {
        let span = arch::level_span(level + 1);
        let base = VirtualAddress::new(arch::canonicalize_virtual(va.as_usize() & !(span - 1)));
        for index in 0..ENTRIES_PER_TABLE {
            let slot = VirtualAddress::new(arch::canonicalize_virtual(
                base.as_usize() + index * arch::level_span(level),
            ));
            self.write(slot, level, PageEntry::empty());
        }
    }
}

impl MemoryManager {
    /// Returns true if `space` is loaded on the executing processor.
    pub fn is_current(&self, space: &AddressSpace) -> bool {
        space.is_kernel() || arch::active_root() == space.root()
    }

    fn walker(&self, space: &AddressSpace, va: VirtualAddress, slot: usize) -> Walker<'_> {
        if va.is_kernel() {
            self.sync_kernel_entry(va);
            Walker::Active
        } else if arch::active_root() == space.root() {
            Walker::Active
        } else {
            Walker::Foreign {
                root: space.root(),
                window: ScratchWindow::new(self.platform.as_ref(), slot),
            }
        }
    }

    fn canonical_entry(&self, index: usize) -> *mut PageEntry {
        let root = self.kernel_space.root();
        AddressTranslator::current().phys_to_ptr(root + index * ENTRY_SIZE)
    }

    /// Copies a missing kernel top-level entry from the canonical kernel root into the
    /// active root. Returns true if an entry was repaired.
    pub(crate) fn sync_kernel_entry(&self, va: VirtualAddress) -> bool {
        if !va.is_kernel() || arch::active_root() == self.kernel_space.root() {
            return false;
        }

        let index = arch::top_level_index(va.as_usize());
        let canonical = unsafe { self.canonical_entry(index).read_volatile() };
        let active = arch::entry_ptr(va, TOP_LEVEL);
        let current = unsafe { active.read_volatile() };
        if current == canonical || !canonical.is_present() {
            return false;
        }

        unsafe { active.write_volatile(canonical) };
        true
    }

    /// Makes sure every table above the leaf for `va` exists and is present.
    fn ensure_tables(&self, space: &AddressSpace, walker: &mut Walker<'_>, va: VirtualAddress) -> MmResult<()> {
        for level in (1..PAGE_TABLE_LEVELS).rev() {
            let Some(entry) = walker.read(va, level) else {
                panic!("table above level {} missing for {}", level, va);
            };

            if entry.is_present() {
                continue;
            }

            let user = va.is_user();
            let table = match entry.frame() {
                // A table reserved by fork: activate it now.
                Some(frame) => frame,
                None => {
                    let frame = self.physical.allocate(true)?;
                    if user || level != TOP_LEVEL {
                        space.page_table_pages.fetch_add(1, Ordering::AcqRel);
                    }

                    frame
                }
            };

            let table_entry = PageEntry::table(table, user);
            walker.write(va, level, table_entry);
            if va.is_kernel() && level == TOP_LEVEL {
                unsafe {
                    self.canonical_entry(arch::top_level_index(va.as_usize()))
                        .write_volatile(table_entry)
                };
            }

            if matches!(walker, Walker::Active) {
                arch::invalidate_tlb_entry(VirtualAddress::new(arch::self_map_table_address(
                    va.as_usize(),
                    level - 1,
                )));
            }

            walker.clear_table(va, level - 1);
        }

        Ok(())
    }

    fn set_leaf(&self, space: &AddressSpace, walker: &mut Walker<'_>, va: VirtualAddress, old: PageEntry, new: PageEntry) {
        walker.write(va, 0, new);
        if va.is_user() {
            match (old.frame().is_some(), new.frame().is_some()) {
                (false, true) => {
                    space.resident_set.fetch_add(1, Ordering::AcqRel);
                }
                (true, false) => {
                    space.resident_set.fetch_sub(1, Ordering::AcqRel);
                }
                _ => {}
            }
        }
    }

    /// Invalidates a range after translations were removed or weakened.
    ///
    /// Without `ipi` only the executing processor is invalidated. A user space with at
    /// most one thread that is running here cannot be cached anywhere else.
    pub(crate) fn invalidate_range(&self, space: &AddressSpace, va: VirtualAddress, count: usize, ipi: bool) {
        let root = if va.is_kernel() { self.kernel_space.root() } else { space.root() };
        if !ipi
            || (va.is_user()
                && space.thread_count() <= 1
                && arch::active_root() == space.root())
        {
            tlb::invalidate_local(root, va, count);
            return;
        }

        self.shootdown.send(self.platform.as_ref(), root, va, count);
    }

    /// Maps `phys` at `va` in `space`, creating intermediate tables as needed.
    ///
    /// Without `PRESENT` the entry records the frame but is not walkable.
    pub fn map_page(&self, space: &AddressSpace, phys: PhysicalAddress, va: VirtualAddress, flags: MapFlags) -> MmResult<()> {
        debug_assert!(va.is_page_aligned() && phys.is_page_aligned());
        let owner = if va.is_kernel() { &self.kernel_space } else { space };
        let _tables = owner.tables.lock();
        let mut walker = self.walker(owner, va, 0);
        self.ensure_tables(owner, &mut walker, va)?;
        let old = walker.read(va, 0).unwrap_or_default();
        let mut flags = flags;
        if va.is_kernel() && !flags.contains(MapFlags::USER_MODE) {
            flags |= MapFlags::GLOBAL;
        }

        self.set_leaf(owner, &mut walker, va, old, PageEntry::leaf(phys, flags));
        drop(walker);
        if old.is_present() {
            self.invalidate_range(owner, va, 1, true);
        }

        Ok(())
    }

    /// Removes the translation at `va`, returning the frame it held.
    ///
    /// With `FREE_PHYSICAL_PAGES` the frame is released after the invalidation.
    pub fn unmap_page(&self, space: &AddressSpace, va: VirtualAddress, flags: UnmapFlags) -> Option<UnmappedPage> {
        let owner = if va.is_kernel() { &self.kernel_space } else { space };
        let page = {
            let _tables = owner.tables.lock();
            let mut walker = self.walker(owner, va, 0);
            let old = walker.read(va, 0)?;
            let frame = old.frame()?;
            self.set_leaf(owner, &mut walker, va, old, PageEntry::empty());
            UnmappedPage {
                frame,
                dirty: old.is_dirty(),
            }
        };

        self.invalidate_range(owner, va, 1, flags.contains(UnmapFlags::SEND_INVALIDATE_IPI));
        if flags.contains(UnmapFlags::FREE_PHYSICAL_PAGES) {
            self.physical.free(page.frame);
        }

        Some(page)
    }

    /// Unmaps `count` pages. Returns true if any of them was dirty.
    ///
    /// Entries are cleared first, the range is invalidated once, and only then are the
    /// frames freed, so no processor can reach a frame after it is reused.
    pub fn unmap_pages(&self, space: &AddressSpace, va: VirtualAddress, count: usize, flags: UnmapFlags) -> MmResult<bool> {
        let owner = if va.is_kernel() { &self.kernel_space } else { space };
        let free = flags.contains(UnmapFlags::FREE_PHYSICAL_PAGES);
        let mut frames = Vec::new();
        let mut dirty = false;
        {
            let _tables = owner.tables.lock();
            let mut walker = self.walker(owner, va, 0);
            for page in 0..count {
                let address = va + page * PAGE_SIZE;
                let Some(old) = walker.read(address, 0) else {
                    continue;
                };

                let Some(frame) = old.frame() else {
                    continue;
                };

                dirty |= old.is_dirty();
                self.set_leaf(owner, &mut walker, address, old, PageEntry::empty());
                if free && frames.try_reserve(1).is_ok() {
                    frames.push(frame);
                } else if free {
                    log::error!("leaking frame {} unmapped from {}", frame, address);
                }
            }
        }

        self.invalidate_range(owner, va, count, flags.contains(UnmapFlags::SEND_INVALIDATE_IPI));
        for frame in frames {
            self.physical.free(frame);
        }

        Ok(dirty)
    }

    /// Changes the access bits selected by `mask` on every present page of a range.
    pub fn change_memory_region_access(&self, space: &AddressSpace, va: VirtualAddress, count: usize, flags: MapFlags, mask: MapFlags) {
        let owner = if va.is_kernel() { &self.kernel_space } else { space };
        let mut changed = false;
        {
            let _tables = owner.tables.lock();
            let mut walker = self.walker(owner, va, 0);
            for page in 0..count {
                let address = va + page * PAGE_SIZE;
                let Some(old) = walker.read(address, 0) else {
                    continue;
                };

                if old.frame().is_none() {
                    continue;
                }

                let new = old.with_access(flags, mask);
                if new != old {
                    walker.write(address, 0, new);
                    changed = true;
                }
            }
        }

        if changed {
            self.invalidate_range(owner, va, count, true);
        }
    }

    /// Returns the leaf entry for `va` in `space`, present or not.
    pub fn leaf_entry(&self, space: &AddressSpace, va: VirtualAddress) -> Option<PageEntry> {
        let owner = if va.is_kernel() { &self.kernel_space } else { space };
        let mut walker = self.walker(owner, va.align_down(PAGE_SIZE), 0);
        walker.read(va.align_down(PAGE_SIZE), 0)
    }

    /// Translates a virtual address in `space` to the physical address it maps.
    pub fn virtual_to_physical(&self, space: &AddressSpace, va: VirtualAddress) -> Option<PhysicalAddress> {
        let entry = self.leaf_entry(space, va)?;
        if !entry.is_present() {
            return None;
        }

        entry.frame().map(|frame| frame + va.page_offset())
    }

    /// Creates every intermediate table needed to map `[va, va + size)`.
    ///
    /// Called when a section is created so that installing pages later, with the section
    /// lock held, never has to allocate.
    pub fn create_page_tables(&self, space: &AddressSpace, va: VirtualAddress, size: usize) -> MmResult<()> {
        let owner = if va.is_kernel() { &self.kernel_space } else { space };
        let _tables = owner.tables.lock();
        let mut walker = self.walker(owner, va, 0);
        let leaf_span = arch::level_span(1);
        let end = va.as_usize() + size;
        let mut address = va.as_usize() & !(leaf_span - 1);
        while address < end {
            self.ensure_tables(owner, &mut walker, VirtualAddress::new(arch::canonicalize_virtual(address)))?;
            address += leaf_span;
        }

        Ok(())
    }

    /// Copies the kernel half of the canonical root into a new root and points its
    /// self-map slot at itself.
    pub(crate) fn initialize_root(&self, root: PhysicalAddress) {
        let mut window = ScratchWindow::new(self.platform.as_ref(), 0);
        for index in arch::KERNEL_TOP_LEVEL_INDEX..ENTRIES_PER_TABLE {
            let entry = if index == arch::SELF_MAP_INDEX {
                PageEntry::table(root, false)
            } else {
                unsafe { self.canonical_entry(index).read_volatile() }
            };

            unsafe { window.entry(root, index).write_volatile(entry) };
        }
    }

    /// First pass of fork: gives `destination` a table for every table `source` has in
    /// the user half.
    ///
    /// Intermediate tables are installed present and empty. Leaf tables are only
    /// reserved: the entry records the frame but stays non-present until the second pass
    /// first writes into it.
    pub fn preallocate_page_tables(&self, source: &AddressSpace, destination: &AddressSpace) -> MmResult<()> {
        let _source_tables = source.tables.lock();
        let _destination_tables = destination.tables.lock();
        let mut from = self.walker(source, VirtualAddress::NULL, 0);
        let mut to = self.walker(destination, VirtualAddress::NULL, 1);
        self.preallocate_level(&mut from, &mut to, destination, 0, TOP_LEVEL)
    }

    fn preallocate_level(
        &self,
        from: &mut Walker<'_>,
        to: &mut Walker<'_>,
        destination: &AddressSpace,
        base: usize,
        level: usize,
    ) -> MmResult<()> {
        let span = arch::level_span(level);
        for index in 0..ENTRIES_PER_TABLE {
            let address = base + index * span;
            if address >= arch::USER_VA_END {
                break;
            }

            let va = VirtualAddress::new(address);
            let Some(source_entry) = from.read(va, level) else {
                continue;
            };

            if !source_entry.is_present() {
                continue;
            }

            let existing = to.read(va, level).unwrap_or_default();
            if level == 1 {
                if existing.frame().is_none() {
                    let frame = self.physical.allocate(true)?;
                    destination.page_table_pages.fetch_add(1, Ordering::AcqRel);
                    to.write(va, level, PageEntry::reserved_table(frame));
                }

                continue;
            }

            if !existing.is_present() {
                let frame = self.physical.allocate_zeroed(true)?;
                destination.page_table_pages.fetch_add(1, Ordering::AcqRel);
                to.write(va, level, PageEntry::table(frame, true));
            }

            self.preallocate_level(from, to, destination, address, level - 1)?;
        }

        Ok(())
    }

    /// Second pass of fork for one section's range: makes every populated source page
    /// read-only and copies the entry to `destination`.
    ///
    /// Returns the number of pages copied. The caller flushes the source's TLB afterwards.
    pub fn copy_and_change_section_mappings(
        &self,
        destination: &AddressSpace,
        source: &AddressSpace,
        va: VirtualAddress,
        size: usize,
    ) -> MmResult<usize> {
        let _source_tables = source.tables.lock();
        let _destination_tables = destination.tables.lock();
        let mut from = self.walker(source, va, 0);
        let mut to = self.walker(destination, va, 1);
        let mut copied = 0;
        for page in 0..size / PAGE_SIZE {
            let address = va + page * PAGE_SIZE;
            let Some(entry) = from.read(address, 0) else {
                continue;
            };

            if !entry.is_present() || entry.frame().is_none() {
                continue;
            }

            let read_only = entry.with_writable(false);
            if read_only != entry {
                from.write(address, 0, read_only);
            }

            self.ensure_tables(destination, &mut to, address)?;
            let old = to.read(address, 0).unwrap_or_default();
            self.set_leaf(destination, &mut to, address, old, read_only.without_dirty());
            copied += 1;
        }

        Ok(copied)
    }

    /// Frees every table and leaf frame in the user half of a space that is no longer
    /// loaded anywhere, then its root.
    pub(crate) fn destroy_page_tables(&self, space: &AddressSpace) {
        debug_assert!(arch::active_root() != space.root());
        let mut frames = Vec::new();
        {
            let _tables = space.tables.lock();
            let mut walker = Walker::Foreign {
                root: space.root(),
                window: ScratchWindow::new(self.platform.as_ref(), 0),
            };

            self.collect_tables(&mut walker, space, 0, TOP_LEVEL, &mut frames);
        }

        for frame in frames {
            self.physical.free(frame);
        }

        self.physical.free(space.root());
    }

    fn collect_tables(&self, walker: &mut Walker<'_>, space: &AddressSpace, base: usize, level: usize, frames: &mut Vec<PhysicalAddress>) {
        let span = arch::level_span(level);
        for index in 0..ENTRIES_PER_TABLE {
            let address = base + index * span;
            if address >= arch::USER_VA_END {
                break;
            }

            let va = VirtualAddress::new(address);
            let Some(entry) = walker.read(va, level) else {
                continue;
            };

            let Some(frame) = entry.frame() else {
                continue;
            };

            if level == 0 {
                if entry.is_present() {
                    space.resident_set.fetch_sub(1, Ordering::AcqRel);
                    if frames.try_reserve(1).is_ok() {
                        frames.push(frame);
                    }
                }

                continue;
            }

            if entry.is_present() {
                self.collect_tables(walker, space, address, level - 1, frames);
            }

            space.page_table_pages.fetch_sub(1, Ordering::AcqRel);
            if frames.try_reserve(1).is_ok() {
                frames.push(frame);
            }
        }
    }
}

/// Returns the self-map pointer to the present leaf entry for `va` in the active tables,
/// checking each level top-down so that no table access can fault.
fn active_leaf(va: VirtualAddress) -> Option<*mut PageEntry> {
    for level in (1..PAGE_TABLE_LEVELS).rev() {
        if !unsafe { arch::entry_ptr(va, level).read_volatile() }.is_present() {
            return None;
        }
    }

    let leaf = arch::entry_ptr(va, 0);
    unsafe { leaf.read_volatile() }.is_present().then_some(leaf)
}

/// Returns how many bytes starting at `va` can be touched without a page fault, and
/// whether every page among them is writable.
///
/// For a debugger running with the rest of the system frozen: no locks are taken and
/// nothing is paged in.
pub fn validate_memory_access_for_debugger(va: VirtualAddress, len: usize) -> (usize, bool) {
    let end = va.as_usize().saturating_add(len);
    let mut writable = true;
    let mut page = va.align_down(PAGE_SIZE).as_usize();
    while page < end {
        let Some(leaf) = VirtualAddress::try_new(page).and_then(active_leaf) else {
            break;
        };

        if !unsafe { leaf.read_volatile() }.is_writable() {
            writable = false;
        }

        match page.checked_add(PAGE_SIZE) {
            Some(next) => page = next,
            None => return (len, writable),
        }
    }

    (page.saturating_sub(va.as_usize()).min(len), writable)
}

/// Makes the page holding `va` writable or read-only in the active tables and returns
/// whether it was writable before, or `None` if the page is not mapped.
///
/// Only the executing processor's TLB is invalidated. The debugger restores the old
/// protection before anything else runs.
pub fn modify_mapping_for_debugger(va: VirtualAddress, writable: bool) -> Option<bool> {
    let leaf = active_leaf(va)?;
    let entry = unsafe { leaf.read_volatile() };
    let was_writable = entry.is_writable();
    if was_writable != writable {
        unsafe { leaf.write_volatile(entry.with_writable(writable)) };
    }

    arch::invalidate_tlb_entry(va.align_down(PAGE_SIZE));
    Some(was_writable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        arch::{Access, Machine},
        testing::TestSystem,
    };

    const USER_PAGE: usize = 0x40_0000;

    #[test]
    fn map_and_translate_in_current_space() {
        let system = TestSystem::new();
        let space = system.create_process();
        system.switch_to(&space);
        let frame = system.manager.physical.allocate_zeroed(false).unwrap();
        let va = VirtualAddress::new(USER_PAGE);
        system
            .manager
            .map_page(&space, frame, va, MapFlags::PRESENT | MapFlags::USER_MODE)
            .unwrap();

        assert_eq!(system.manager.virtual_to_physical(&space, va + 5), Some(frame + 5));
        assert_eq!(space.resident_set(), 1);
        assert_eq!(Machine::current().translate(va, Access::Write, true), Ok(frame));
    }

    #[test]
    fn debugger_sees_only_present_pages() {
        let system = TestSystem::new();
        let space = system.create_process();
        system.switch_to(&space);
        let va = VirtualAddress::new(USER_PAGE);
        for (page, extra) in [(0, MapFlags::empty()), (1, MapFlags::READ_ONLY)] {
            let frame = system.manager.physical.allocate_zeroed(false).unwrap();
            system
                .manager
                .map_page(&space, frame, va + page * PAGE_SIZE, MapFlags::PRESENT | MapFlags::USER_MODE | extra)
                .unwrap();
        }

        assert_eq!(validate_memory_access_for_debugger(va, 8), (8, true));
        assert_eq!(validate_memory_access_for_debugger(va + 16, PAGE_SIZE), (PAGE_SIZE, false));
        assert_eq!(
            validate_memory_access_for_debugger(va + 16, 3 * PAGE_SIZE),
            (2 * PAGE_SIZE - 16, false)
        );

        assert_eq!(validate_memory_access_for_debugger(va + 2 * PAGE_SIZE, 8).0, 0);
        assert_eq!(validate_memory_access_for_debugger(VirtualAddress::new(0x10_0000_0000), 8).0, 0);
    }

    #[test]
    fn debugger_toggles_write_access_in_place() {
        let system = TestSystem::new();
        let space = system.create_process();
        system.switch_to(&space);
        let frame = system.manager.physical.allocate_zeroed(false).unwrap();
        let va = VirtualAddress::new(USER_PAGE);
        system
            .manager
            .map_page(&space, frame, va, MapFlags::PRESENT | MapFlags::USER_MODE | MapFlags::READ_ONLY)
            .unwrap();

        assert_eq!(Machine::current().translate(va, Access::Read, true), Ok(frame));
        assert_eq!(modify_mapping_for_debugger(va + 3, true), Some(false));
        assert!(system.manager.leaf_entry(&space, va).unwrap().is_writable());
        assert_eq!(Machine::current().translate(va, Access::Write, true), Ok(frame));

        assert_eq!(modify_mapping_for_debugger(va, false), Some(true));
        assert!(!system.manager.leaf_entry(&space, va).unwrap().is_writable());
        assert_eq!(modify_mapping_for_debugger(va + PAGE_SIZE, true), None);
    }

    #[test]
    fn foreign_space_is_reached_through_scratch_page() {
        let system = TestSystem::new();
        let first = system.create_process();
        let second = system.create_process();
        system.switch_to(&first);
        let frame = system.manager.physical.allocate_zeroed(false).unwrap();
        let va = VirtualAddress::new(USER_PAGE);
        system
            .manager
            .map_page(&second, frame, va, MapFlags::PRESENT | MapFlags::USER_MODE)
            .unwrap();

        assert_eq!(system.manager.virtual_to_physical(&first, va), None);
        assert_eq!(system.manager.virtual_to_physical(&second, va), Some(frame));
        system.switch_to(&second);
        assert_eq!(system.manager.virtual_to_physical(&second, va), Some(frame));
    }

    #[test]
    fn unmap_invalidates_every_processor_before_freeing() {
        let system = TestSystem::new();
        let space = system.create_process();
        space.add_thread();
        space.add_thread();
        let machine = Machine::current();
        let va = VirtualAddress::new(USER_PAGE);
        let frame = system.manager.physical.allocate_zeroed(false).unwrap();
        for cpu in 0..2 {
            machine.set_current_processor(cpu);
            system.switch_to(&space);
        }

        machine.set_current_processor(0);
        system
            .manager
            .map_page(&space, frame, va, MapFlags::PRESENT | MapFlags::USER_MODE)
            .unwrap();

        for cpu in 0..2 {
            machine.set_current_processor(cpu);
            machine.translate(va, Access::Read, true).unwrap();
        }

        machine.set_current_processor(0);
        let free_before = system.manager.physical.free_frames();
        let dirty = system
            .manager
            .unmap_pages(&space, va, 1, UnmapFlags::FREE_PHYSICAL_PAGES | UnmapFlags::SEND_INVALIDATE_IPI)
            .unwrap();

        assert!(!dirty);
        assert_eq!(system.manager.physical.free_frames(), free_before + 1);
        assert_eq!(space.resident_set(), 0);
        for cpu in 0..2 {
            machine.set_current_processor(cpu);
            assert!(!machine.is_cached(va));
        }

        machine.set_current_processor(0);
    }

    #[test]
    fn access_change_write_protects_present_pages() {
        let system = TestSystem::new();
        let space = system.create_process();
        system.switch_to(&space);
        let va = VirtualAddress::new(USER_PAGE);
        let frame = system.manager.physical.allocate_zeroed(false).unwrap();
        system
            .manager
            .map_page(&space, frame, va, MapFlags::PRESENT | MapFlags::USER_MODE)
            .unwrap();

        Machine::current().translate(va, Access::Write, true).unwrap();
        system.manager.change_memory_region_access(
            &space,
            va,
            4,
            MapFlags::READ_ONLY,
            MapFlags::READ_ONLY,
        );

        let fault = Machine::current()
            .translate(va, Access::Write, true)
            .unwrap_err();
        assert!(fault.present);
    }

    #[test]
    fn kernel_mappings_reach_spaces_created_earlier() {
        let system = TestSystem::new();
        let space = system.create_process();
        system.switch_to(&space);
        let frame = system.manager.physical.allocate_zeroed(true).unwrap();
        let va = VirtualAddress::new(arch::KERNEL_POOL_START + 0x1234_5000);
        system
            .manager
            .map_page(&system.manager.kernel_space, frame, va, MapFlags::PRESENT)
            .unwrap();

        let other = system.create_process();
        system.switch_to(&other);
        assert_eq!(system.manager.virtual_to_physical(&other, va), Some(frame));
        assert!(Machine::current().walk(va).is_some());
    }

    #[test]
    fn fork_passes_share_frames_read_only() {
        let system = TestSystem::new();
        let parent = system.create_process();
        let child = system.create_process();
        system.switch_to(&parent);
        let va = VirtualAddress::new(USER_PAGE);
        let frame = system.manager.physical.allocate_zeroed(false).unwrap();
        system
            .manager
            .map_page(&parent, frame, va + PAGE_SIZE, MapFlags::PRESENT | MapFlags::USER_MODE)
            .unwrap();

        let tables_before = child.page_table_pages();
        system
            .manager
            .preallocate_page_tables(&parent, &child)
            .unwrap();
        assert!(child.page_table_pages() > tables_before);

        let copied = system
            .manager
            .copy_and_change_section_mappings(&child, &parent, va, 4 * PAGE_SIZE)
            .unwrap();

        assert_eq!(copied, 1);
        assert_eq!(child.resident_set(), 1);
        let parent_entry = system.manager.leaf_entry(&parent, va + PAGE_SIZE).unwrap();
        let child_entry = system.manager.leaf_entry(&child, va + PAGE_SIZE).unwrap();
        assert_eq!(parent_entry.frame(), child_entry.frame());
        assert!(!parent_entry.is_writable());
        assert!(!child_entry.is_writable());
        assert_eq!(system.manager.leaf_entry(&child, va), Some(PageEntry::empty()));
    }

    #[test]
    fn destroyed_tables_return_their_frames() {
        let system = TestSystem::new();
        let before = system.manager.physical.free_frames();
        let space = system.create_process();
        system.switch_to(&space);
        let frame = system.manager.physical.allocate_zeroed(false).unwrap();
        system
            .manager
            .map_page(&space, frame, VirtualAddress::new(USER_PAGE), MapFlags::PRESENT | MapFlags::USER_MODE)
            .unwrap();

        system.switch_to_kernel();
        system.manager.destroy_page_tables(&space);
        assert_eq!(system.manager.physical.free_frames(), before);
    }
}
