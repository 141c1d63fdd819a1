//! Copy-on-write: giving a section its own copy of a page it shares with its tree.

use alloc::{sync::Arc, sync::Weak, vec::Vec};

use crate::{
    MapFlags, MmError, MmResult, PhysicalAddress, SectionFlags,
    manager::MemoryManager,
    paging_entry::PagingEntryId,
    physical::{PhysicalPages, copy_frame, zero_frame},
    section::{ImageSection, TreeState},
};

/// Frames (and their paging entries) set aside before a section lock is taken.
///
/// Anything left over is returned when the reservation is dropped.
pub(crate) struct Reservation<'a> {
    physical: &'a PhysicalPages,
    non_paged: bool,
    pages: Vec<(PhysicalAddress, Option<PagingEntryId>)>,
}

impl<'a> Reservation<'a> {
    pub(crate) fn new(physical: &'a PhysicalPages, non_paged: bool) -> Self {
        Self {
            physical,
            non_paged,
            pages: Vec::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pages.len()
    }

    fn allocate(&self) -> MmResult<(PhysicalAddress, Option<PagingEntryId>)> {
        let frame = self.physical.allocate(self.non_paged)?;
        if self.non_paged {
            return Ok((frame, None));
        }

        match self.physical.create_paging_entry(Weak::new(), 0) {
            Ok(entry) => Ok((frame, Some(entry))),
            Err(error) => {
                self.physical.free(frame);
                Err(error)
            }
        }
    }

    /// Tops the reservation up to `count` frames.
    pub(crate) fn fill(&mut self, count: usize) -> MmResult<()> {
        if count > self.pages.len() {
            self.pages
                .try_reserve(count - self.pages.len())
                .map_err(|_| MmError::ResourceExhausted)?;
        }

        while self.pages.len() < count {
            let page = self.allocate()?;
            self.pages.push(page);
        }

        Ok(())
    }

    /// Hands out a reserved frame, allocating one if the reservation ran dry.
    pub(crate) fn take(&mut self) -> MmResult<(PhysicalAddress, Option<PagingEntryId>)> {
        match self.pages.pop() {
            Some(page) => Ok(page),
            None => self.allocate(),
        }
    }

    /// Returns a frame taken with [`Reservation::take`] that ended up unused.
    pub(crate) fn give_back(&mut self, frame: PhysicalAddress, entry: Option<PagingEntryId>) {
        if self.pages.try_reserve(1).is_ok() {
            self.pages.push((frame, entry));
            return;
        }

        if let Some(entry) = entry {
            self.physical.destroy_paging_entry(entry);
        }

        self.physical.free(frame);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        for (frame, entry) in self.pages.drain(..) {
            if let Some(entry) = entry {
                self.physical.destroy_paging_entry(entry);
            }

            self.physical.free(frame);
        }
    }
}

impl MemoryManager {
    /// Gives every child of `index` that inherits page `page` its own copy.
    pub(crate) fn isolate_children(
        &self,
        state: &mut TreeState,
        index: usize,
        page: usize,
        reservation: &mut Reservation<'_>,
    ) -> MmResult<()> {
        let owner = state.owner(index, page);
        let owner_dirty = state.node(owner).dirty.get(page);
        let backed_clean = state.node(index).flags.contains(SectionFlags::PAGE_CACHE_BACKED) && !owner_dirty;
        let resident = match self.section_frame(state, index, page) {
            Some(frame) => Some(frame),
            None if owner != index => self.section_frame(state, owner, page),
            None => None,
        };

        let mut children = Vec::new();
        children
            .try_reserve(state.node(index).children.len())
            .map_err(|_| MmError::ResourceExhausted)?;

        children.extend(state.node(index).children.iter().copied());
        for child in children {
            let node = state.node_mut(child);
            if page >= node.inherit.len() || !node.inherit.get(page) {
                continue;
            }

            // Clean pages come from the cache or are zero either way, so the child can
            // simply stop inheriting.
            if backed_clean || (resident.is_none() && !owner_dirty) {
                node.inherit.set(page, false);
                node.dirty.set(page, false);
                continue;
            }

            let (frame, entry) = reservation.take()?;
            let filled = match resident {
                Some(source) => {
                    copy_frame(source, frame);
                    Ok(())
                }
                None => self.read_swapped(state, owner, page, frame),
            };

            if let Err(error) = filled {
                reservation.give_back(frame, entry);
                return Err(error);
            }

            let node = state.node_mut(child);
            node.inherit.set(page, false);
            node.dirty.set(page, true);
            self.map_page_in_section(state, child, page, frame, entry, false)?;
        }

        Ok(())
    }

    /// Fills `frame` with the current contents of page `page` of `index`, whose owner is
    /// `owner`.
    fn fill_private_copy(
        &self,
        state: &TreeState,
        index: usize,
        owner: usize,
        page: usize,
        frame: PhysicalAddress,
    ) -> MmResult<()> {
        if let Some(source) = self.section_frame(state, index, page) {
            copy_frame(source, frame);
            return Ok(());
        }

        if owner != index {
            if let Some(source) = self.section_frame(state, owner, page) {
                copy_frame(source, frame);
                return Ok(());
            }
        }

        // A clean page that is not resident never gets here: the caller drops the
        // inheritance instead, and the image is read on the next page-in.
        if state.node(owner).dirty.get(page) {
            return self.read_swapped(state, owner, page, frame);
        }

        zero_frame(frame);
        Ok(())
    }

    /// Makes page `page` private to section `index`, with the tree locked.
    ///
    /// Children inheriting the page get their own copies first. A shared section cannot
    /// be isolated; for those the page is just made writable and reported to the cache.
    pub(crate) fn isolate_locked(
        &self,
        state: &mut TreeState,
        index: usize,
        page: usize,
        reservation: &mut Reservation<'_>,
    ) -> MmResult<()> {
        let node = state.node(index);
        let flags = node.flags;
        if flags.is_going_away() {
            return Ok(());
        }

        let space = node.space.upgrade();
        let va = node.page_va(page);
        if flags.contains(SectionFlags::SHARED) {
            if flags.contains(SectionFlags::WRITABLE) && self.section_frame(state, index, page).is_some() {
                if let Some(space) = &space {
                    self.change_memory_region_access(space, va, 1, MapFlags::empty(), MapFlags::READ_ONLY);
                }

                if let Some(image) = &node.image {
                    image.file().mark_dirty(image.page_offset(page));
                }
            }

            return Ok(());
        }

        self.isolate_children(state, index, page, reservation)?;
        let owner = state.owner(index, page);
        let owner_dirty = state.node(owner).dirty.get(page);
        let backed_clean = flags.contains(SectionFlags::PAGE_CACHE_BACKED) && !owner_dirty;
        let own_frame = self.section_frame(state, index, page);
        if owner == index && !backed_clean {
            if own_frame.is_some() {
                if flags.contains(SectionFlags::WRITABLE) {
                    let access = state.mapping_flags(index, index, page) & MapFlags::ACCESS_MASK;
                    if let Some(space) = &space {
                        self.change_memory_region_access(space, va, 1, access, MapFlags::ACCESS_MASK);
                    }
                }

                if flags.contains(SectionFlags::WAS_WRITABLE) {
                    state.node_mut(index).dirty.set(page, true);
                }
            }

            return Ok(());
        }

        let owner_frame = if owner != index {
            self.section_frame(state, owner, page)
        } else {
            None
        };

        if own_frame.is_none() && owner_frame.is_none() && !owner_dirty {
            state.node_mut(index).inherit.set(page, false);
            return Ok(());
        }

        let (frame, entry) = reservation.take()?;
        if let Err(error) = self.fill_private_copy(state, index, owner, page, frame) {
            reservation.give_back(frame, entry);
            return Err(error);
        }

        let node = state.node_mut(index);
        node.inherit.set(page, false);
        node.dirty.set(page, true);
        self.map_page_in_section(state, index, page, frame, entry, false)
    }

    /// Pages in page `page` of `section` and makes it private to the section.
    pub(crate) fn isolate_page(&self, section: &Arc<ImageSection>, page: usize) -> MmResult<()> {
        let index = section.index();
        let non_paged = section.flags().contains(SectionFlags::NON_PAGED);
        let mut reservation = Reservation::new(&self.physical, non_paged);
        loop {
            let mut state = self.page_in_and_lock(section, page)?;
            let node = state.node(index);
            let inheriting = node
                .children
                .iter()
                .filter(|&&child| {
                    let child = state.node(child);
                    page < child.inherit.len() && child.inherit.get(page)
                })
                .count();

            let demand = inheriting + 1;
            if reservation.len() < demand {
                drop(state);
                reservation.fill(demand)?;
                continue;
            }

            return self.isolate_locked(&mut state, index, page, &mut reservation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PAGE_SIZE, testing::TestSystem};

    const RW: SectionFlags = SectionFlags::READABLE.union(SectionFlags::WRITABLE);

    #[test]
    fn reservation_returns_unused_frames() {
        let system = TestSystem::new();
        let physical = system.manager.physical.clone();
        let before = physical.free_frames();
        let entries = physical.paging_entry_count();
        {
            let mut reservation = Reservation::new(&physical, false);
            reservation.fill(3).unwrap();
            assert_eq!(reservation.len(), 3);
            let (frame, entry) = reservation.take().unwrap();
            assert!(entry.is_some());
            reservation.give_back(frame, entry);
            assert_eq!(physical.free_frames(), before - 3);
        }

        assert_eq!(physical.free_frames(), before);
        assert_eq!(physical.paging_entry_count(), entries);
    }

    #[test]
    fn non_paged_reservations_carry_no_paging_entry() {
        let system = TestSystem::new();
        let physical = system.manager.physical.clone();
        let mut reservation = Reservation::new(&physical, true);
        let (frame, entry) = reservation.take().unwrap();
        assert!(entry.is_none());
        reservation.give_back(frame, entry);
    }

    #[test]
    fn write_after_fork_copies_only_the_written_page() {
        let system = TestSystem::new();
        let parent = system.create_process();
        system.switch_to(&parent);
        let va = system.map_anonymous(&parent, 2 * PAGE_SIZE, RW);
        system.write_user(&parent, va, &[0xAA]);
        system.write_user(&parent, va + PAGE_SIZE, &[0xBB]);

        let child = system.manager.fork_address_space(&parent).unwrap();
        system.write_user(&parent, va, &[0xCC]);

        let parent_page0 = system.manager.virtual_to_physical(&parent, va).unwrap();
        let child_page0 = system.manager.virtual_to_physical(&child, va).unwrap();
        assert_ne!(parent_page0, child_page0);
        assert_eq!(
            system.manager.virtual_to_physical(&parent, va + PAGE_SIZE),
            system.manager.virtual_to_physical(&child, va + PAGE_SIZE)
        );

        assert_eq!(system.read_user(&parent, va, 1), vec![0xCC]);
        assert_eq!(system.read_user(&child, va, 1), vec![0xAA]);
        assert_eq!(system.read_user(&child, va + PAGE_SIZE, 1), vec![0xBB]);

        let section = child.find_section(va).unwrap();
        assert!(!section.inherits(0));
        assert!(section.inherits(1));
    }

    #[test]
    fn untouched_pages_stop_inheriting_without_a_copy() {
        let system = TestSystem::new();
        let parent = system.create_process();
        system.switch_to(&parent);
        let va = system.map_anonymous(&parent, 2 * PAGE_SIZE, RW);
        let child = system.manager.fork_address_space(&parent).unwrap();
        let section = parent.find_section(va).unwrap();
        let copy = child.find_section(va).unwrap();

        let free = system.manager.physical.free_frames();
        {
            let mut reservation = Reservation::new(&system.manager.physical, false);
            let mut state = section.lock();
            system
                .manager
                .isolate_children(&mut state, section.index(), 1, &mut reservation)
                .unwrap();
        }

        assert!(!copy.inherits(1));
        assert!(copy.inherits(0));
        assert_eq!(system.manager.physical.free_frames(), free);
    }
}
