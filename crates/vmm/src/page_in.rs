//! Demand paging: bringing a section page into memory.
//!
//! A page comes from one of three places depending on the section. Shared sections map
//! the file's cache page directly. Private sections backed by the page cache map the
//! cache page read-only until the first write isolates it. Everything else gets a frame
//! of its own, filled from the page file, the file or with zeros.
//!
//! File and cache I/O never happens under a section lock. Anything observed before the
//! I/O (the owning section and the truncation counter in particular) is checked again
//! after relocking, and the attempt starts over if it changed. Page file reads go
//! straight into a reserved frame and are the one transfer made with the lock held.

use alloc::{sync::Arc, vec::Vec};

use crate::{
    MapFlags, MmError, MmResult, PAGE_SIZE, PhysicalAddress, SectionFlags,
    address::AddressTranslator,
    cow::Reservation,
    io::{CachePage, ImageBacking, IoBuffer},
    manager::MemoryManager,
    mapping::ScratchWindow,
    page_file::PageFileSpace,
    paging_entry::PagingEntryId,
    physical::{PhysicalPages, zero_frame},
    section::{ImageSection, SectionGuard, TreeState},
};

/// A resident page that stays put until this value is dropped.
pub struct LockedPage {
    frame: PhysicalAddress,
    pin: Pin,
}

enum Pin {
    Cache(#[allow(dead_code)] CachePage),
    Pageable(Arc<PhysicalPages>),
    Unpinned,
}

impl LockedPage {
    pub fn frame(&self) -> PhysicalAddress {
        self.frame
    }

    fn cached(page: CachePage) -> Self {
        Self {
            frame: page.frame(),
            pin: Pin::Cache(page),
        }
    }
}

impl Drop for LockedPage {
    fn drop(&mut self) {
        if let Pin::Pageable(physical) = &self.pin {
            physical.unlock(self.frame);
        }
    }
}

impl core::fmt::Debug for LockedPage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "LockedPage({})", self.frame)
    }
}

enum Step {
    Done(Option<LockedPage>),
    Retry,
}

impl MemoryManager {
    /// Makes page `page` of `section` resident and mapped.
    ///
    /// With `lock` the frame is pinned against page-out until the returned value is
    /// dropped. Fails with `TooLate` if the section was destroyed and `TryAgain` if it
    /// shrank below `page` in the meantime.
    pub fn page_in(&self, section: &Arc<ImageSection>, page: usize, lock: bool) -> MmResult<Option<LockedPage>> {
        loop {
            let flags = {
                let state = section.lock();
                Self::check_section_page(&state, section.index(), page)?;
                state.node(section.index()).flags
            };

            let step = if flags.contains(SectionFlags::SHARED) {
                self.page_in_shared(section, page, lock)?
            } else if flags.contains(SectionFlags::PAGE_CACHE_BACKED) {
                self.page_in_backed(section, page, lock)?
            } else {
                self.page_in_private(section, page, lock)?
            };

            if let Step::Done(locked) = step {
                return Ok(locked);
            }
        }
    }

    /// Pages in `page` and returns with the section's tree locked and the page resident.
    pub(crate) fn page_in_and_lock<'s>(&self, section: &'s Arc<ImageSection>, page: usize) -> MmResult<SectionGuard<'s>> {
        loop {
            let state = section.lock();
            Self::check_section_page(&state, section.index(), page)?;
            if self.section_frame(&state, section.index(), page).is_some() {
                return Ok(state);
            }

            drop(state);
            self.page_in(section, page, false)?;
        }
    }

    fn pin_existing(&self, frame: PhysicalAddress, lock: bool) -> Option<LockedPage> {
        if !lock {
            return None;
        }

        let pin = if self.physical.lock(frame) {
            Pin::Pageable(self.physical.clone())
        } else {
            Pin::Unpinned
        };

        Some(LockedPage { frame, pin })
    }

    fn pin_resident(&self, frame: PhysicalAddress, cache: CachePage, lock: bool) -> Option<LockedPage> {
        if frame == cache.frame() {
            lock.then(|| LockedPage::cached(cache))
        } else {
            self.pin_existing(frame, lock)
        }
    }

    fn image_snapshot(section: &ImageSection) -> MmResult<(ImageBacking, u64)> {
        let state = section.lock();
        let node = state.node(section.index());
        let image = node.image.clone().ok_or(MmError::NotFound)?;
        Ok((image, node.truncate_count))
    }

    fn page_in_shared(&self, section: &Arc<ImageSection>, page: usize, lock: bool) -> MmResult<Step> {
        let index = section.index();
        let (image, truncate_count) = Self::image_snapshot(section)?;
        let cache = image.file().cache_page(image.page_offset(page))?;

        let mut state = section.lock();
        Self::check_section_page(&state, index, page)?;
        if state.node(index).truncate_count != truncate_count {
            return Ok(Step::Retry);
        }

        if let Some(frame) = self.section_frame(&state, index, page) {
            return Ok(Step::Done(self.pin_resident(frame, cache, lock)));
        }

        // Write access is granted on the first write fault, which tells the cache.
        let flags = state.mapping_flags(index, index, page) | MapFlags::READ_ONLY;
        let node = state.node(index);
        let space = node.space.upgrade().ok_or(MmError::TooLate)?;
        self.map_page(&space, cache.frame(), node.page_va(page), flags)?;
        state.node_mut(index).touch(page);
        Ok(Step::Done(lock.then(|| LockedPage::cached(cache))))
    }

    fn page_in_backed(&self, section: &Arc<ImageSection>, page: usize, lock: bool) -> MmResult<Step> {
        let index = section.index();
        let (image, truncate_count) = Self::image_snapshot(section)?;
        {
            let state = section.lock();
            Self::check_section_page(&state, index, page)?;
            let owner = state.owner(index, page);
            if state.node(owner).dirty.get(page) {
                drop(state);
                return self.page_in_private(section, page, lock);
            }
        }

        let cache = image.file().cache_page(image.page_offset(page))?;

        let mut state = section.lock();
        Self::check_section_page(&state, index, page)?;
        if state.node(index).truncate_count != truncate_count {
            return Ok(Step::Retry);
        }

        if let Some(frame) = self.section_frame(&state, index, page) {
            return Ok(Step::Done(self.pin_resident(frame, cache, lock)));
        }

        let owner = state.owner(index, page);
        if state.node(owner).flags.contains(SectionFlags::DESTROYED) {
            return Err(MmError::TooLate);
        }

        if owner != index {
            if let Some(frame) = self.section_frame(&state, owner, page) {
                self.modify_section_mapping(&mut state, owner, page, Some(frame))?;
                return Ok(Step::Done(self.pin_resident(frame, cache, lock)));
            }
        }

        // Written and paged out while the cache was being consulted.
        if state.node(owner).dirty.get(page) {
            return Ok(Step::Retry);
        }

        self.modify_section_mapping(&mut state, owner, page, Some(cache.frame()))?;
        Ok(Step::Done(lock.then(|| LockedPage::cached(cache))))
    }

    fn page_in_private(&self, section: &Arc<ImageSection>, page: usize, lock: bool) -> MmResult<Step> {
        let index = section.index();
        let non_paged = section.flags().contains(SectionFlags::NON_PAGED);
        let mut reservation = Reservation::new(&self.physical, non_paged);
        reservation.fill(1)?;

        let mut state = section.lock();
        Self::check_section_page(&state, index, page)?;
        let owner = state.owner(index, page);
        if let Some(step) = self.private_page_in_tree(&mut state, index, owner, page, lock)? {
            return Ok(step);
        }

        let owner_node = state.node(owner);
        let dirty = owner_node.dirty.get(page);
        if !dirty && state.node(index).flags.contains(SectionFlags::PAGE_CACHE_BACKED) {
            return Ok(Step::Retry);
        }

        let image = match &owner_node.image {
            Some(image) if !dirty => Some((image.clone(), owner_node.truncate_count)),
            _ => None,
        };

        let (frame, entry) = reservation.take()?;
        let Some((image, truncate_count)) = image else {
            if let Err(error) = self.read_swapped(&state, owner, page, frame) {
                reservation.give_back(frame, entry);
                return Err(error);
            }

            return self.install_private_page(&mut state, owner, page, (frame, entry), lock, &mut reservation);
        };

        // The image may have to be read from storage, which cannot happen under the lock.
        drop(state);
        if let Err(error) = self.read_image_page(&image, page, frame) {
            reservation.give_back(frame, entry);
            return Err(error);
        }

        let mut state = section.lock();
        let resolved = match Self::check_section_page(&state, index, page) {
            Err(error) => Err(error),
            Ok(()) if state.owner(index, page) != owner => Ok(Some(Step::Retry)),
            Ok(()) => self.private_page_in_tree(&mut state, index, owner, page, lock),
        };

        match resolved {
            Ok(None) => {
                let node = state.node(owner);
                if node.truncate_count != truncate_count || node.dirty.get(page) {
                    reservation.give_back(frame, entry);
                    return Ok(Step::Retry);
                }

                self.install_private_page(&mut state, owner, page, (frame, entry), lock, &mut reservation)
            }
            Ok(Some(step)) => {
                reservation.give_back(frame, entry);
                Ok(step)
            }
            Err(error) => {
                reservation.give_back(frame, entry);
                Err(error)
            }
        }
    }

    /// Finds page `page` already resident in the tree, mapping the owner's frame into
    /// `index` if only the owner has it.
    fn private_page_in_tree(
        &self,
        state: &mut TreeState,
        index: usize,
        owner: usize,
        page: usize,
        lock: bool,
    ) -> MmResult<Option<Step>> {
        if let Some(frame) = self.section_frame(state, index, page) {
            return Ok(Some(Step::Done(self.pin_existing(frame, lock))));
        }

        if state.node(owner).flags.contains(SectionFlags::DESTROYED) {
            return Err(MmError::TooLate);
        }

        if owner != index {
            if let Some(frame) = self.section_frame(state, owner, page) {
                self.modify_section_mapping(state, owner, page, Some(frame))?;
                return Ok(Some(Step::Done(self.pin_existing(frame, lock))));
            }
        }

        Ok(None)
    }

    /// Maps a freshly filled frame as page `page` of `owner` and its inheriting children.
    fn install_private_page(
        &self,
        state: &mut TreeState,
        owner: usize,
        page: usize,
        (frame, entry): (PhysicalAddress, Option<PagingEntryId>),
        lock: bool,
        reservation: &mut Reservation<'_>,
    ) -> MmResult<Step> {
        if let Err(error) = self.map_page_in_section(state, owner, page, frame, entry, lock) {
            if let Err(unmap) = self.modify_section_mapping(state, owner, page, None) {
                log::error!("could not unmap page {} after a failed page-in: {}", page, unmap);
            }

            reservation.give_back(frame, entry);
            return Err(error);
        }

        let locked = match (lock, entry) {
            (false, _) => None,
            (true, Some(_)) => Some(LockedPage {
                frame,
                pin: Pin::Pageable(self.physical.clone()),
            }),
            (true, None) => Some(LockedPage {
                frame,
                pin: Pin::Unpinned,
            }),
        };

        Ok(Step::Done(locked))
    }

    /// Reads page `page` of section `owner` back from its page file space. A page with no
    /// space assigned was dirtied but never written out, which only happens to zero pages.
    pub(crate) fn read_swapped(&self, state: &TreeState, owner: usize, page: usize, frame: PhysicalAddress) -> MmResult<()> {
        match &state.node(owner).page_file {
            Some(space) => self.read_page_file(space, page, frame),
            None => {
                zero_frame(frame);
                Ok(())
            }
        }
    }

    pub(crate) fn read_page_file(&self, space: &PageFileSpace, page: usize, frame: PhysicalAddress) -> MmResult<()> {
        let buffer = IoBuffer::single(frame)?;
        space.file.read(space.first_page + page, &buffer)
    }

    /// Fills `destination` with page `page` of an image, zero-padding past the end of the
    /// file. The backing offset need not be page aligned.
    pub(crate) fn read_image_page(&self, image: &ImageBacking, page: usize, destination: PhysicalAddress) -> MmResult<()> {
        let offset = image.page_offset(page);
        let file = image.file();
        let size = file.size();
        if offset >= size {
            return Err(MmError::EndOfFile);
        }

        let valid = (size - offset).min(PAGE_SIZE as u64) as usize;
        let translator = AddressTranslator::current();
        if file.is_cacheable() {
            let within = (offset % PAGE_SIZE as u64) as usize;
            let base = offset - within as u64;
            let first = file.cache_page(base)?;
            let second = if within != 0 && base + (PAGE_SIZE as u64) < size {
                match file.cache_page(base + PAGE_SIZE as u64) {
                    Ok(page) => Some(page),
                    Err(MmError::EndOfFile) => None,
                    Err(error) => return Err(error),
                }
            } else {
                None
            };

            let mut window = ScratchWindow::new(self.platform.as_ref(), 1);
            let target = window.map(destination);
            let head = PAGE_SIZE - within;
            unsafe {
                let source: *const u8 = translator.phys_to_ptr(first.frame() + within);
                core::ptr::copy_nonoverlapping(source, target, head);
                match &second {
                    Some(second) => {
                        let source: *const u8 = translator.phys_to_ptr(second.frame());
                        core::ptr::copy_nonoverlapping(source, target.add(head), within);
                    }
                    None => target.add(head).write_bytes(0, within),
                }

                target.add(valid).write_bytes(0, PAGE_SIZE - valid);
            }

            return Ok(());
        }

        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(PAGE_SIZE)
            .map_err(|_| MmError::ResourceExhausted)?;

        buffer.resize(PAGE_SIZE, 0);
        let read = file.read(offset, &mut buffer)?.min(valid);
        buffer[read..].fill(0);

        let mut window = ScratchWindow::new(self.platform.as_ref(), 1);
        let target = window.map(destination);
        unsafe { core::ptr::copy_nonoverlapping(buffer.as_ptr(), target, PAGE_SIZE) };
        Ok(())
    }
}
