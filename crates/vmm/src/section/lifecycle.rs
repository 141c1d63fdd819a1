//! Creating, copying, splitting and destroying image sections.

use alloc::{sync::Arc, sync::Weak, vec::Vec};

use super::{ImageSection, SectionNode, SectionTree, TreeState, UnmapSectionFlags};
use crate::{
    MapFlags, MmError, MmResult, PAGE_SIZE, SectionFlags, UnmapFlags, VirtualAddress,
    address_space::AddressSpace,
    arch,
    bitmap::Bitmap,
    cow::Reservation,
    io::{HandleAccess, ImageBacking},
    manager::MemoryManager,
    mapping::ScratchWindow,
    page_file::PageFileList,
};

impl MemoryManager {
    /// Creates a section of `size` bytes at `va` in `space`.
    ///
    /// The caller has already reserved the range. Page tables for the whole range are
    /// created up front, and a non-paged section is paged in completely before this
    /// returns.
    pub fn create_image_section(
        &self,
        space: &Arc<AddressSpace>,
        va: VirtualAddress,
        size: usize,
        flags: SectionFlags,
        image: Option<ImageBacking>,
        map_flags: MapFlags,
    ) -> MmResult<Arc<ImageSection>> {
        if !va.is_page_aligned() || size == 0 || size % PAGE_SIZE != 0 {
            return Err(MmError::InvalidParameter);
        }

        let mut flags = flags & SectionFlags::CREATE_MASK;
        match &image {
            Some(image) => {
                flags |= SectionFlags::BACKED;
                if image.file().is_cacheable() && image.offset % PAGE_SIZE as u64 == 0 {
                    flags |= SectionFlags::PAGE_CACHE_BACKED;
                }
            }
            None => flags |= SectionFlags::NO_IMAGE_BACKING,
        }

        if flags.contains(SectionFlags::SHARED) && !flags.contains(SectionFlags::PAGE_CACHE_BACKED) {
            return Err(MmError::NotSupported);
        }

        if flags.contains(SectionFlags::WRITABLE) {
            flags |= SectionFlags::WAS_WRITABLE;
        }

        self.create_page_tables(space, va, size)?;
        let pages = size / PAGE_SIZE;
        let node = SectionNode {
            va,
            size,
            flags,
            map_flags,
            space: Arc::downgrade(space),
            parent: None,
            children: Vec::new(),
            inherit: Bitmap::new(pages, false)?,
            dirty: Bitmap::new(pages, false)?,
            touched: 0..0,
            image: image.clone(),
            page_file: None,
            truncate_count: 0,
            handle: Weak::new(),
        };

        let section = ImageSection::attach(SectionTree::new(), node)?;
        space.insert_section(section.clone());
        if let Some(image) = &image {
            image.file().image_sections().add(section.clone());
        }

        if flags.contains(SectionFlags::NON_PAGED) {
            for page in 0..pages {
                if let Err(error) = self.page_in(&section, page, false) {
                    if let Err(cleanup) = self.remove_image_section(&section) {
                        log::warn!("failed to remove section at {}: {}", va, cleanup);
                    }

                    return Err(error);
                }
            }
        }

        log::debug!("created section at {} ({} pages, {:?})", va, pages, flags);
        Ok(section)
    }

    /// Mirrors `section` of `source` into `destination` for fork.
    ///
    /// A shared section gets an independent section over the same file. A private
    /// section gets a child in the same tree that inherits every page, and every page
    /// the source has mapped becomes read-only in both spaces.
    pub(crate) fn copy_image_section(
        &self,
        section: &Arc<ImageSection>,
        source: &Arc<AddressSpace>,
        destination: &Arc<AddressSpace>,
    ) -> MmResult<()> {
        let index = section.index();
        let mut state = section.lock();
        let node = state.node(index);
        if node.flags.is_going_away() {
            return Ok(());
        }

        let (va, size, flags, map_flags) = (node.va, node.size, node.flags, node.map_flags);
        if flags.contains(SectionFlags::SHARED) {
            let image = node.image.clone();
            drop(state);
            self.create_image_section(
                destination,
                va,
                size,
                flags & SectionFlags::CREATE_MASK,
                image,
                map_flags,
            )?;

            return Ok(());
        }

        let pages = node.page_count();
        let child = SectionNode {
            va,
            size,
            flags: flags & SectionFlags::COPY_MASK,
            map_flags,
            space: Arc::downgrade(destination),
            parent: Some(index),
            children: Vec::new(),
            inherit: Bitmap::new(pages, true)?,
            dirty: node.dirty.clone(),
            touched: node.touched.clone(),
            image: node.image.clone(),
            page_file: None,
            truncate_count: node.truncate_count,
            handle: Weak::new(),
        };

        state
            .node_mut(index)
            .children
            .try_reserve(1)
            .map_err(|_| MmError::ResourceExhausted)?;

        let child_index = state.insert(child)?;
        state.node_mut(index).children.push(child_index);
        let copy = ImageSection::attach_locked(section.tree(), &mut state, child_index);
        if let Err(error) = self.copy_and_change_section_mappings(destination, source, va, size) {
            state.node_mut(index).children.retain(|&child| child != child_index);
            let node = state.node_mut(child_index);
            node.parent = None;
            node.flags.insert(SectionFlags::DESTROYED);
            drop(state);
            // The copied entries point at the parent's frames, which must survive.
            if let Err(cleanup) = self.unmap_pages(destination, va, pages, UnmapFlags::empty()) {
                log::warn!("failed to unmap partial copy at {}: {}", va, cleanup);
            }

            return Err(error);
        }

        let image = state.node(child_index).image.clone();
        drop(state);
        destination.insert_section(copy.clone());
        if let Some(image) = image {
            image.file().image_sections().add(copy);
        }

        Ok(())
    }

    /// Destroys a section: gives children private copies of the pages they still
    /// inherit, detaches it from its space and tree, and tears down its mappings.
    pub fn remove_image_section(&self, section: &Arc<ImageSection>) -> MmResult<()> {
        let index = section.index();
        let mut state = section.lock();
        {
            let node = state.node_mut(index);
            if node.flags.is_going_away() {
                return Ok(());
            }

            node.flags.insert(SectionFlags::DESTROYING);
        }

        let node = state.node(index);
        let pages = node.page_count();
        let non_paged = node.flags.contains(SectionFlags::NON_PAGED);
        if !node.children.is_empty() {
            let mut reservation = Reservation::new(&self.physical, non_paged);
            for page in 0..pages {
                if !state.any_child_inherits(index, page) {
                    continue;
                }

                if let Err(error) = self.isolate_children(&mut state, index, page, &mut reservation) {
                    log::warn!(
                        "failed to isolate page {} of section at {}: {}",
                        page,
                        section.virtual_address(),
                        error
                    );
                }
            }
        }

        if let Some(space) = state.node(index).space.upgrade() {
            space.unlink_section(section);
        }

        if let Some(parent) = state.node_mut(index).parent.take() {
            state.node_mut(parent).children.retain(|&child| child != index);
        }

        let children = core::mem::take(&mut state.node_mut(index).children);
        for child in children {
            state.node_mut(child).parent = None;
        }

        self.destroy_section_mappings(&mut state, index);
        let node = state.node_mut(index);
        node.flags.insert(SectionFlags::DESTROYED);
        let image = node.image.clone();
        drop(state);
        if let Some(image) = image {
            image.file().image_sections().remove(section);
        }

        log::debug!("removed section at {}", section.virtual_address());
        Ok(())
    }

    /// Unmaps every page the section ever mapped, freeing the frames it owns.
    fn destroy_section_mappings(&self, state: &mut TreeState, index: usize) {
        let node = state.node(index);
        if node.touched.is_empty() {
            return;
        }

        let Some(space) = node.space.upgrade() else {
            state.node_mut(index).touched = 0..0;
            return;
        };

        let touched = node.touched.clone();
        let va = node.page_va(touched.start);
        let count = touched.len();
        let flags = node.flags;
        if !flags.contains(SectionFlags::BACKED) && !node.inherit.any() {
            let unmap = UnmapFlags::FREE_PHYSICAL_PAGES | UnmapFlags::SEND_INVALIDATE_IPI;
            if let Err(error) = self.unmap_pages(&space, va, count, unmap) {
                log::warn!("failed to unmap section pages at {}: {}", va, error);
            }

            state.node_mut(index).touched = 0..0;
            return;
        }

        // With several pages and other processors involved, one sweep marking the whole
        // range not-present replaces an IPI per page.
        let multiple_ipis = count > 1 && !(va.is_user() && space.thread_count() <= 1);
        if multiple_ipis {
            self.change_memory_region_access(&space, va, count, MapFlags::empty(), MapFlags::PRESENT);
        }

        let unmap = if multiple_ipis {
            UnmapFlags::empty()
        } else {
            UnmapFlags::SEND_INVALIDATE_IPI
        };

        let shared = flags.contains(SectionFlags::SHARED);
        let cache_backed = flags.contains(SectionFlags::PAGE_CACHE_BACKED);
        for page in touched {
            let node = state.node(index);
            let Some(unmapped) = self.unmap_page(&space, node.page_va(page), unmap) else {
                continue;
            };

            let cache_owned = shared || (cache_backed && !node.dirty.get(page));
            if !node.inherits(page) && !cache_owned {
                self.physical.free(unmapped.frame);
            }

            if shared && cache_backed && flags.contains(SectionFlags::WAS_WRITABLE) && unmapped.dirty {
                if let Some(image) = &node.image {
                    image.file().mark_dirty(image.page_offset(page));
                }
            }
        }

        state.node_mut(index).touched = 0..0;
    }

    /// Unmaps `count` pages of section `index` starting at `start`.
    pub(crate) fn unmap_image_section(
        &self,
        state: &mut TreeState,
        index: usize,
        start: usize,
        count: usize,
        flags: UnmapSectionFlags,
    ) -> MmResult<()> {
        let node = state.node_mut(index);
        if node.flags.contains(SectionFlags::DESTROYED) {
            return Ok(());
        }

        if flags.contains(UnmapSectionFlags::TRUNCATE) {
            node.truncate_count += 1;
        }

        let section_flags = node.flags;
        let shared = section_flags.contains(SectionFlags::SHARED);
        let cache_backed = section_flags.contains(SectionFlags::PAGE_CACHE_BACKED);
        let end = start.saturating_add(count).min(node.page_count());
        let mut result = Ok(());
        for page in start..end {
            let owner = state.owner(index, page);
            let cache_owned = shared || (cache_backed && !state.node(owner).dirty.get(page));
            if flags.contains(UnmapSectionFlags::PAGE_CACHE_ONLY) && !cache_owned {
                continue;
            }

            let frame = if state.node(index).touched.contains(&page) {
                self.section_frame(state, index, page)
            } else {
                None
            };

            if let Some(frame) = frame {
                if flags.contains(UnmapSectionFlags::PAGE_CACHE_ONLY)
                    && section_flags.contains(SectionFlags::NON_PAGED)
                {
                    if result.is_ok() {
                        result = Err(MmError::InUse);
                    }

                    continue;
                }

                let dirty = self.modify_section_mapping(state, index, page, None)?;
                if owner == index && !cache_owned {
                    self.physical.free(frame);
                }

                if shared && cache_backed && section_flags.contains(SectionFlags::WAS_WRITABLE) && dirty {
                    if let Some(image) = &state.node(index).image {
                        image.file().mark_dirty(image.page_offset(page));
                    }
                }
            }

            if flags.contains(UnmapSectionFlags::TRUNCATE) {
                state.node_mut(index).dirty.set(page, false);
            }
        }

        result
    }

    /// Unmaps the pages of `section` that overlap file bytes `[start, end)`.
    pub(crate) fn unmap_file_range(
        &self,
        section: &Arc<ImageSection>,
        start: u64,
        end: u64,
        flags: UnmapSectionFlags,
    ) -> MmResult<()> {
        let index = section.index();
        let mut state = section.lock();
        let node = state.node(index);
        let Some(image) = &node.image else {
            return Ok(());
        };

        let section_start = image.offset;
        let section_end = section_start + node.size as u64;
        let start = start.max(section_start);
        let end = end.min(section_end);
        if start >= end {
            return Ok(());
        }

        let first = ((start - section_start) / PAGE_SIZE as u64) as usize;
        let last = (end - section_start).div_ceil(PAGE_SIZE as u64) as usize;
        self.unmap_image_section(&mut state, index, first, last - first, flags)
    }

    /// Punches `[address, address + size)` out of `section`.
    ///
    /// The part after the hole becomes a new section. A zero `size` only splits the
    /// section at `address`; a hole covering the whole section removes it.
    pub(crate) fn clip_image_section(
        &self,
        space: &Arc<AddressSpace>,
        section: &Arc<ImageSection>,
        address: VirtualAddress,
        size: usize,
    ) -> MmResult<()> {
        let start = section.virtual_address();
        let pages = section.page_count();
        let end = start + pages * PAGE_SIZE;
        let hole_begin = address.max(start).min(end);
        let hole_end = (address + size).max(hole_begin).min(end);
        let first = (hole_begin - start) / PAGE_SIZE;
        let last = (hole_end - start) / PAGE_SIZE;
        if first == 0 && last == pages && size != 0 {
            return self.remove_image_section(section);
        }

        if first >= pages {
            return Ok(());
        }

        let index = section.index();
        let mut state = section.lock();
        let node = state.node(index);
        if node.flags.is_going_away() {
            return Ok(());
        }

        // Pages that move to the remainder or vanish with the hole must stop being shared
        // with the rest of the tree first.
        if node.parent.is_some() || !node.children.is_empty() {
            let non_paged = node.flags.contains(SectionFlags::NON_PAGED);
            let mut reservation = Reservation::new(&self.physical, non_paged);
            for page in first..pages {
                match self.isolate_locked(&mut state, index, page, &mut reservation) {
                    Ok(()) | Err(MmError::EndOfFile) => {}
                    Err(error) => return Err(error),
                }
            }
        }

        let remainder = if last < pages {
            let node = state.node(index);
            let count = pages - last;
            let touched = if node.touched.end > last {
                node.touched.start.max(last) - last..node.touched.end - last
            } else {
                0..0
            };

            let image = node.image.clone().map(|mut image| {
                image.offset += (last * PAGE_SIZE) as u64;
                image
            });

            let page_file = node.page_file.clone().map(|mut space| {
                space.first_page += last;
                space
            });

            let moved = SectionNode {
                va: node.page_va(last),
                size: count * PAGE_SIZE,
                flags: node.flags & SectionFlags::COPY_MASK,
                map_flags: node.map_flags,
                space: node.space.clone(),
                parent: None,
                children: Vec::new(),
                inherit: Bitmap::new(count, false)?,
                dirty: node.dirty.slice(last, count)?,
                touched,
                image,
                page_file,
                truncate_count: node.truncate_count,
                handle: Weak::new(),
            };

            let remainder = ImageSection::attach(SectionTree::new(), moved)?;
            let old = state.node(index).handle.clone();
            let new = Arc::downgrade(&remainder);
            for page in last..pages {
                if let Some(frame) = self.section_frame(&state, index, page) {
                    self.physical.migrate_paging_entry(frame, &old, &new, page - last);
                }
            }

            Some(remainder)
        } else {
            None
        };

        self.unmap_image_section(&mut state, index, first, last - first, UnmapSectionFlags::empty())?;
        let node = state.node_mut(index);
        if let Some(page_file) = &node.page_file {
            PageFileList::free_space(page_file, first, last - first);
        }

        node.size = first * PAGE_SIZE;
        node.inherit.truncate(first);
        node.dirty.truncate(first);
        node.touched.end = node.touched.end.min(first);
        if node.touched.start >= node.touched.end {
            node.touched = 0..0;
        }

        let image = node.image.clone();
        drop(state);
        if let Some(remainder) = remainder {
            space.insert_section(remainder.clone());
            if let Some(image) = image.as_ref() {
                image.file().image_sections().add(remainder);
            }
        }

        if first == 0 {
            return self.remove_image_section(section);
        }

        Ok(())
    }

    /// Changes the access of every section in `[address, address + size)`, splitting
    /// sections that straddle the edges.
    pub fn change_region_access(
        &self,
        space: &Arc<AddressSpace>,
        address: VirtualAddress,
        size: usize,
        access: SectionFlags,
    ) -> MmResult<()> {
        if size == 0 {
            return Ok(());
        }

        let end = address + size;
        for edge in [address, end] {
            for section in space.sections_overlapping(edge, 1) {
                let start = section.virtual_address();
                if start < edge && start + section.size() > edge {
                    if space.is_kernel() {
                        return Err(MmError::NotSupported);
                    }

                    self.clip_image_section(space, &section, edge, 0)?;
                }
            }
        }

        for section in space.sections_overlapping(address, size) {
            self.change_section_access(&section, access)?;
        }

        Ok(())
    }

    /// Replaces the access bits of a whole section and updates its live mappings.
    pub(crate) fn change_section_access(&self, section: &Arc<ImageSection>, access: SectionFlags) -> MmResult<()> {
        let index = section.index();
        let mut state = section.lock();
        let node = state.node_mut(index);
        if node.flags.is_going_away() {
            return Err(MmError::TooLate);
        }

        let access = access & SectionFlags::ACCESS_MASK;
        if node.flags.contains(SectionFlags::SHARED) && access.contains(SectionFlags::WRITABLE) {
            if let Some(image) = &node.image {
                if !image.handle.access.contains(HandleAccess::WRITE) {
                    return Err(MmError::AccessDenied);
                }
            }
        }

        node.flags = (node.flags - SectionFlags::ACCESS_MASK) | access;
        if access.contains(SectionFlags::WRITABLE) {
            node.flags |= SectionFlags::WAS_WRITABLE;
        }

        let mut flags = MapFlags::empty();
        let mut mask = MapFlags::PRESENT | MapFlags::EXECUTE;
        if access.is_accessible() {
            flags |= MapFlags::PRESENT;
        }

        if access.contains(SectionFlags::EXECUTABLE) {
            flags |= MapFlags::EXECUTE;
        }

        // Gaining write access is left to the write fault, which knows about sharing.
        if !access.contains(SectionFlags::WRITABLE) {
            flags |= MapFlags::READ_ONLY;
            mask |= MapFlags::READ_ONLY;
        }

        let (va, size) = (node.va, node.size);
        if let Some(space) = node.space.upgrade() {
            self.change_memory_region_access(&space, va, size / PAGE_SIZE, flags, mask);
        }

        drop(state);
        if access.contains(SectionFlags::EXECUTABLE) {
            arch::sync_instruction_cache(va, size);
        }

        Ok(())
    }

    /// Writes `data` into another process's memory on behalf of a debugger, ignoring
    /// page protection. The pages written become private to the process.
    pub fn debugger_write(&self, space: &Arc<AddressSpace>, va: VirtualAddress, data: &[u8]) -> MmResult<()> {
        let mut done = 0;
        while done < data.len() {
            let address = va + done;
            let section = space.find_section(address).ok_or(MmError::AccessViolation)?;
            let page = (address - section.virtual_address()) / PAGE_SIZE;
            let within = address.page_offset();
            let chunk = (PAGE_SIZE - within).min(data.len() - done);
            let original = section.flags() & SectionFlags::ACCESS_MASK;
            let writable = original.contains(SectionFlags::WRITABLE);
            if !writable {
                self.change_section_access(&section, original | SectionFlags::WRITABLE)?;
            }

            let written = self.write_isolated(&section, page, within, &data[done..done + chunk]);
            if !writable {
                self.change_section_access(&section, original)?;
            }

            written?;
            arch::sync_instruction_cache(address, chunk);
            done += chunk;
        }

        Ok(())
    }

    fn write_isolated(&self, section: &Arc<ImageSection>, page: usize, within: usize, bytes: &[u8]) -> MmResult<()> {
        self.isolate_page(section, page)?;
        let index = section.index();
        let mut state = self.page_in_and_lock(section, page)?;
        let frame = self
            .section_frame(&state, index, page)
            .ok_or(MmError::TryAgain)?;

        {
            let mut window = ScratchWindow::new(self.platform.as_ref(), 1);
            let target = window.map(frame);
            unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), target.add(within), bytes.len()) };
        }

        let node = state.node_mut(index);
        if !node.flags.contains(SectionFlags::SHARED) {
            node.dirty.set(page, true);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        MmError, PAGE_SIZE, SectionFlags,
        io::{FileObject, HandleAccess},
        testing::{TestFile, TestSystem},
    };

    const RW: SectionFlags = SectionFlags::READABLE.union(SectionFlags::WRITABLE);

    #[test]
    fn creation_validates_arguments() {
        let system = TestSystem::new();
        let space = system.create_process();
        let va = space.reserve(crate::VirtualAddress::new(0x10_0000), PAGE_SIZE, false).unwrap();
        assert_eq!(
            system.manager.create_image_section(&space, va + 1, PAGE_SIZE, RW, None, crate::MapFlags::empty()).unwrap_err(),
            MmError::InvalidParameter
        );
        assert_eq!(
            system.manager.create_image_section(&space, va, 0, RW, None, crate::MapFlags::empty()).unwrap_err(),
            MmError::InvalidParameter
        );
    }

    #[test]
    fn shared_sections_need_the_page_cache() {
        let system = TestSystem::new();
        let space = system.create_process();
        let file = TestFile::uncached(b"abc");
        let image = system.backing(&file, HandleAccess::READ | HandleAccess::WRITE, 0);
        let va = space.reserve(crate::VirtualAddress::new(0x10_0000), PAGE_SIZE, false).unwrap();
        let result = system.manager.create_image_section(
            &space,
            va,
            PAGE_SIZE,
            RW | SectionFlags::SHARED,
            Some(image),
            crate::MapFlags::empty(),
        );
        assert_eq!(result.unwrap_err(), MmError::NotSupported);
    }

    #[test]
    fn writable_sections_remember_it() {
        let system = TestSystem::new();
        let space = system.create_process();
        let va = system.map_anonymous(&space, PAGE_SIZE, RW);
        let flags = space.find_section(va).unwrap().flags();
        assert!(flags.contains(SectionFlags::WAS_WRITABLE | SectionFlags::NO_IMAGE_BACKING));
    }

    #[test]
    fn non_paged_sections_are_resident_at_creation() {
        let system = TestSystem::new();
        let space = system.create_process();
        let va = system.map_anonymous(&space, 3 * PAGE_SIZE, RW | SectionFlags::NON_PAGED);
        assert_eq!(space.resident_set(), 3);
        for page in 0..3 {
            assert!(system.manager.virtual_to_physical(&space, va + page * PAGE_SIZE).is_some());
        }
    }

    #[test]
    fn clipping_the_middle_leaves_two_sections() {
        let system = TestSystem::new();
        let space = system.create_process();
        system.switch_to(&space);
        let va = system.map_anonymous(&space, 4 * PAGE_SIZE, RW);
        for page in 0..4 {
            system.write_user(&space, va + page * PAGE_SIZE, &[page as u8 + 1]);
        }

        let free_before = system.manager.physical.free_frames();
        let section = space.find_section(va).unwrap();
        system
            .manager
            .clip_image_section(&space, &section, va + PAGE_SIZE, 2 * PAGE_SIZE)
            .unwrap();

        assert_eq!(system.manager.physical.free_frames(), free_before + 2);
        assert_eq!(section.size(), PAGE_SIZE);
        let tail = space.find_section(va + 3 * PAGE_SIZE).unwrap();
        assert_eq!(tail.virtual_address(), va + 3 * PAGE_SIZE);
        assert_eq!(tail.size(), PAGE_SIZE);
        assert!(space.find_section(va + PAGE_SIZE).is_none());
        assert_eq!(system.read_user(&space, va + 3 * PAGE_SIZE, 1), vec![4]);
        assert_eq!(system.read_user(&space, va, 1), vec![1]);
    }

    #[test]
    fn clipping_everything_removes_the_section() {
        let system = TestSystem::new();
        let space = system.create_process();
        let va = system.map_anonymous(&space, 2 * PAGE_SIZE, RW);
        let section = space.find_section(va).unwrap();
        system
            .manager
            .clip_image_section(&space, &section, va, 2 * PAGE_SIZE)
            .unwrap();

        assert!(section.flags().contains(SectionFlags::DESTROYED));
        assert!(space.sections().is_empty());
    }

    #[test]
    fn protection_change_splits_and_write_protects() {
        let system = TestSystem::new();
        let space = system.create_process();
        system.switch_to(&space);
        let va = system.map_anonymous(&space, 3 * PAGE_SIZE, RW);
        system.write_user(&space, va + PAGE_SIZE, &[7]);
        system
            .manager
            .change_region_access(&space, va + PAGE_SIZE, PAGE_SIZE, SectionFlags::READABLE)
            .unwrap();

        assert_eq!(space.sections().len(), 3);
        let middle = space.find_section(va + PAGE_SIZE).unwrap();
        assert_eq!(middle.flags() & SectionFlags::ACCESS_MASK, SectionFlags::READABLE);
        assert_eq!(system.manager.copy_to_user(&space, va + PAGE_SIZE, &[9]), Err(MmError::AccessViolation));
        assert_eq!(system.read_user(&space, va + PAGE_SIZE, 1), vec![7]);
        system.write_user(&space, va, &[1]);
    }

    #[test]
    fn kernel_sections_cannot_be_split() {
        let system = TestSystem::new();
        let kernel = system.manager.kernel_space.clone();
        let va = system.map_anonymous(&kernel, 2 * PAGE_SIZE, RW);
        assert_eq!(
            system.manager.change_region_access(&kernel, va, PAGE_SIZE, SectionFlags::READABLE),
            Err(MmError::NotSupported)
        );
    }

    #[test]
    fn shared_write_needs_a_writable_handle() {
        let system = TestSystem::new();
        let space = system.create_process();
        let file = TestFile::cached(&[b'A'; PAGE_SIZE]);
        let va = system.map_file(&space, &file, HandleAccess::READ, 0, PAGE_SIZE, SectionFlags::READABLE | SectionFlags::SHARED);
        assert_eq!(
            system.manager.change_region_access(&space, va, PAGE_SIZE, RW),
            Err(MmError::AccessDenied)
        );
    }

    #[test]
    fn truncation_discards_private_changes_and_bumps_the_counter() {
        let system = TestSystem::new();
        let space = system.create_process();
        system.switch_to(&space);
        let file = TestFile::cached(&[b'A'; 2 * PAGE_SIZE]);
        let va = system.map_file(&space, &file, HandleAccess::READ, 0, 2 * PAGE_SIZE, RW);
        system.write_user(&space, va + PAGE_SIZE, b"Q");
        let section = space.find_section(va).unwrap();
        assert!(section.is_dirty(1));

        let list = file.image_sections();
        assert_eq!(list.len(), 1);
        system
            .manager
            .unmap_image_section_list(list, PAGE_SIZE as u64, PAGE_SIZE as u64, super::UnmapSectionFlags::TRUNCATE)
            .unwrap();

        assert!(!section.is_dirty(1));
        assert_eq!(section.lock().node(section.index()).truncate_count, 1);
        assert_eq!(system.read_user(&space, va + PAGE_SIZE, 1), b"A".to_vec());
    }

    #[test]
    fn cache_only_unmap_keeps_private_pages() {
        let system = TestSystem::new();
        let space = system.create_process();
        system.switch_to(&space);
        let file = TestFile::cached(&[b'A'; 2 * PAGE_SIZE]);
        let va = system.map_file(&space, &file, HandleAccess::READ, 0, 2 * PAGE_SIZE, RW);
        system.write_user(&space, va, b"Q");
        system.read_user(&space, va + PAGE_SIZE, 1);
        assert_eq!(space.resident_set(), 2);

        system
            .manager
            .unmap_image_section_list(file.image_sections(), 0, 2 * PAGE_SIZE as u64, super::UnmapSectionFlags::PAGE_CACHE_ONLY)
            .unwrap();

        assert_eq!(space.resident_set(), 1);
        assert_eq!(system.read_user(&space, va, 1), b"Q".to_vec());
    }

    #[test]
    fn debugger_write_reaches_read_only_code() {
        let system = TestSystem::new();
        let space = system.create_process();
        system.switch_to(&space);
        let file = TestFile::cached(&[0x90; PAGE_SIZE]);
        let code = SectionFlags::READABLE | SectionFlags::EXECUTABLE;
        let va = system.map_file(&space, &file, HandleAccess::READ, 0, PAGE_SIZE, code);
        system.manager.debugger_write(&space, va + 16, &[0xCC]).unwrap();

        assert_eq!(system.read_user(&space, va + 15, 2), vec![0x90, 0xCC]);
        let section = space.find_section(va).unwrap();
        assert_eq!(section.flags() & SectionFlags::ACCESS_MASK, code);
        assert!(section.is_dirty(0));
        assert_eq!(file.contents()[16], 0x90);
        assert_eq!(
            system.manager.debugger_write(&space, va + 2 * PAGE_SIZE, &[0]),
            Err(MmError::AccessViolation)
        );
    }
}
