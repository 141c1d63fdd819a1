//! Page-out: evicting pageable frames to the page file.
//!
//! The paging thread sleeps until someone asks for memory or the physical layer reports
//! a severe shortage. It then walks the pageable frames round-robin. Each candidate is
//! evicted together with the resident pages that follow it in its section, so that one
//! write to the page file covers a whole run.

use alloc::{sync::Arc, vec::Vec};

use crate::{
    MmError, MmResult, PAGE_SIZE, PhysicalAddress, SectionFlags,
    io::IoBuffer,
    manager::MemoryManager,
    paging_entry::PagingEntryFlags,
    page_file::PageFileSpace,
    physical::{MemoryWarning, PageOutCandidate},
    sync::wait_any,
};

/// Largest run written to the page file at once.
pub const SWAP_REGION_PAGES: usize = 512 * 1024 / PAGE_SIZE;

/// The pages-freed event is signaled after this many pages.
pub const PAGES_FREED_SIGNAL_INTERVAL: usize = 16;

/// A pass gives up after this many failed evictions.
pub const MAX_PAGE_OUT_FAILURES: usize = 10;

/// Clean pages tolerated inside a run of dirty ones.
pub const CLEAN_STREAK_TOLERANCE: usize = 4;

struct RunPage {
    page: usize,
    frame: PhysicalAddress,
    dirty: bool,
}

impl MemoryManager {
    /// Asks the paging thread to bring the free frame count up to `free_pages_target`.
    ///
    /// The request's pages-freed event is reset here; callers may wait on it for
    /// progress.
    pub fn request_paging_out(&self, free_pages_target: usize) {
        log::trace!("page-out requested, target {}", free_pages_target);
        self.physical.page_out_request().request(free_pages_target);
    }

    pub(crate) fn paging_thread(self: Arc<Self>) {
        log::info!("paging thread running");
        let request = self.physical.page_out_request().clone();
        loop {
            let woken = wait_any(&[&request.event, self.physical.warning_event()], self.platform.as_ref());
            let target = if woken == 0 {
                request.event.unsignal();
                request.take_target()
            } else {
                if self.physical.warning_level() != MemoryWarning::Level1 {
                    continue;
                }

                let statistics = self.physical.statistics();
                statistics.total * self.config.warning_level2_percent / 100
            };

            if !self.page_files.paging_enabled() {
                request.pages_freed.signal();
                continue;
            }

            let freed = self.page_out_pass(target);
            log::debug!("paging thread freed {} pages toward {}", freed, target);
        }
    }

    /// Evicts pages until `target` frames are free or `target` pages were evicted.
    ///
    /// Returns the number of frames freed.
    pub fn page_out_pass(&self, target: usize) -> usize {
        let statistics = self.physical.statistics();
        let target = target.min(statistics.total - statistics.non_paged);
        let request = self.physical.page_out_request();
        let mut freed = 0;
        let mut signaled_at = 0;
        let mut failures = 0;
        while freed < target && self.physical.free_frames() < target && failures < MAX_PAGE_OUT_FAILURES {
            let Some(candidate) = self.physical.select_for_page_out() else {
                break;
            };

            let budget = (target - freed).min(target.saturating_sub(self.physical.free_frames()));
            if budget == 0 {
                self.physical.clear_paging_out(candidate.frame);
                break;
            }

            match self.page_out(&candidate, budget) {
                Ok(count) => freed += count,
                Err(error) => {
                    log::debug!("page-out of {} failed: {}", candidate.frame, error);
                    failures += 1;
                }
            }

            if freed - signaled_at >= PAGES_FREED_SIGNAL_INTERVAL {
                request.pages_freed.signal();
                signaled_at = freed;
            }
        }

        request.pages_freed.signal();
        freed
    }

    fn discard(&self, frame: PhysicalAddress) {
        self.physical.clear_paging_out(frame);
        self.physical.free(frame);
    }

    /// Marks an additional frame of a run as paging out, unless it is pinned or already
    /// on its way out.
    fn claim(&self, frame: PhysicalAddress) -> bool {
        self.physical
            .with_paging_entry(frame, |entry| {
                if entry.lock_count != 0 || entry.flags.intersects(PagingEntryFlags::PAGING_OUT | PagingEntryFlags::FREED) {
                    false
                } else {
                    entry.flags.insert(PagingEntryFlags::PAGING_OUT);
                    true
                }
            })
            .unwrap_or(false)
    }

    /// Evicts the candidate frame and the resident pages after it in its section,
    /// freeing at most `budget` frames. Returns the number freed.
    fn page_out(&self, candidate: &PageOutCandidate, budget: usize) -> MmResult<usize> {
        let frame = candidate.frame;
        let Some(section) = candidate.section.upgrade() else {
            self.discard(frame);
            return Ok(1);
        };

        let index = section.index();
        let offset = candidate.offset;

        // The tree stays locked across the write, so a fault on one of these pages waits
        // until the page file holds its contents.
        let mut state = section.lock();
        let still_ours = self
            .physical
            .with_paging_entry(frame, |entry| entry.section.ptr_eq(&candidate.section) && entry.offset == offset)
            .unwrap_or(false);

        if !still_ours {
            self.physical.clear_paging_out(frame);
            return Err(MmError::TryAgain);
        }

        let node = state.node(index);
        if node.flags.contains(SectionFlags::DESTROYED)
            || offset >= node.page_count()
            || self.section_frame(&state, index, offset) != Some(frame)
        {
            drop(state);
            self.discard(frame);
            return Ok(1);
        }

        let locked = self
            .physical
            .with_paging_entry(frame, |entry| entry.lock_count != 0)
            .unwrap_or(true);

        if locked {
            self.physical.clear_paging_out(frame);
            return Err(MmError::InUse);
        }

        let backed = node.flags.contains(SectionFlags::PAGE_CACHE_BACKED);
        let page_count = node.page_count();
        if node.page_file.is_none() {
            let space = match self.page_files.allocate_space(page_count) {
                Ok(space) => space,
                Err(error) => {
                    self.physical.clear_paging_out(frame);
                    return Err(error);
                }
            };

            state.node_mut(index).page_file = Some(space);
        }

        let mut run: Vec<RunPage> = Vec::new();
        if run.try_reserve(budget.min(SWAP_REGION_PAGES)).is_err() {
            self.physical.clear_paging_out(frame);
            return Err(MmError::ResourceExhausted);
        }

        let mut freed = 0;
        let mut clean_streak = 0;
        let mut page = offset;
        let mut result = Ok(());
        while page < page_count && freed + run.len() < budget && run.len() < SWAP_REGION_PAGES {
            if state.owner(index, page) != index {
                break;
            }

            let Some(current) = self.section_frame(&state, index, page) else {
                break;
            };

            if page != offset && !self.claim(current) {
                break;
            }

            let dirty_bit = state.node(index).dirty.get(page);
            if backed && !dirty_bit {
                self.physical.clear_paging_out(current);
                break;
            }

            let dirty = match self.modify_section_mapping(&mut state, index, page, None) {
                Ok(pte_dirty) => pte_dirty || dirty_bit,
                Err(error) => {
                    self.physical.clear_paging_out(current);
                    result = Err(error);
                    break;
                }
            };

            // Only the candidate itself is dropped in place. Later clean pages join the
            // run and are trimmed from its tail.
            if !dirty && page == offset {
                self.discard(current);
                freed += 1;
                page += 1;
                continue;
            }

            clean_streak = if dirty { 0 } else { clean_streak + 1 };
            run.push(RunPage {
                page,
                frame: current,
                dirty,
            });

            page += 1;
            if clean_streak > CLEAN_STREAK_TOLERANCE {
                break;
            }
        }

        // Clean pages at the end of the run need no write.
        while run.last().is_some_and(|last| !last.dirty) {
            if let Some(last) = run.pop() {
                self.discard(last.frame);
                freed += 1;
            }
        }

        if run.is_empty() {
            return result.map(|()| freed);
        }

        let written = self.write_run(state.node(index).page_file.as_ref(), &run);
        match written {
            Ok(()) => {
                let node = state.node_mut(index);
                for entry in &run {
                    node.dirty.set(entry.page, true);
                }

                drop(state);
                for entry in &run {
                    self.discard(entry.frame);
                }

                log::trace!("paged out {} pages of {:?} at page {}", run.len(), section, run[0].page);
                Ok(freed + run.len())
            }
            Err(error) => {
                log::warn!("page file write for {:?} failed: {}", section, error);
                for entry in &run {
                    state.node_mut(index).dirty.set(entry.page, true);
                    if self
                        .modify_section_mapping(&mut state, index, entry.page, Some(entry.frame))
                        .is_err()
                    {
                        log::error!("could not restore page {} of {:?}", entry.page, section);
                    }

                    self.physical.clear_paging_out(entry.frame);
                }

                Err(error)
            }
        }
    }

    fn write_run(&self, space: Option<&PageFileSpace>, run: &[RunPage]) -> MmResult<()> {
        let Some(space) = space else {
            return Err(MmError::NotFound);
        };

        let mut buffer = IoBuffer::new();
        for entry in run {
            buffer.push(entry.frame, None)?;
        }

        space.file.write(space.first_page + run[0].page, &buffer)
    }
}

/// Evicts every resident page of `section`, for tests that need pages on disk.
#[cfg(test)]
pub(crate) fn evict_section(manager: &MemoryManager, section: &Arc<crate::section::ImageSection>) -> usize {
    let frames: Vec<PhysicalAddress> = {
        let state = section.lock();
        (0..state.node(section.index()).page_count())
            .filter_map(|page| manager.section_frame(&state, section.index(), page))
            .collect()
    };

    let mut freed = 0;
    for frame in frames {
        let Some(entry) = manager.physical.paging_entry(frame) else {
            continue;
        };

        let Some((owner, offset)) = manager
            .physical
            .with_paging_entry(frame, |entry| (entry.section.clone(), entry.offset))
        else {
            continue;
        };

        if !manager.claim(frame) {
            continue;
        }

        let candidate = PageOutCandidate {
            frame,
            entry,
            section: owner,
            offset,
        };

        freed += manager.page_out(&candidate, 1).unwrap_or(0);
    }

    freed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        VirtualAddress,
        address_space::AddressSpace,
        testing::{TestSystem, TestVolume},
    };

    const RW: SectionFlags = SectionFlags::READABLE.union(SectionFlags::WRITABLE);

    /// Counts the leaf entries holding a frame in `pages` pages of `space` from `va`.
    fn mapped_leaves(system: &TestSystem, space: &AddressSpace, va: VirtualAddress, pages: usize) -> usize {
        (0..pages)
            .filter(|page| {
                system
                    .manager
                    .leaf_entry(space, va + page * PAGE_SIZE)
                    .and_then(|entry| entry.frame())
                    .is_some()
            })
            .count()
    }

    /// Pages out the frame behind `page` of `section` with room for `budget` frames.
    fn page_out_from(manager: &MemoryManager, section: &Arc<crate::section::ImageSection>, page: usize, budget: usize) -> usize {
        let frame = {
            let state = section.lock();
            manager.section_frame(&state, section.index(), page).unwrap()
        };

        let entry = manager.physical.paging_entry(frame).unwrap();
        let (owner, offset) = manager
            .physical
            .with_paging_entry(frame, |entry| (entry.section.clone(), entry.offset))
            .unwrap();

        assert!(manager.claim(frame));
        let candidate = PageOutCandidate {
            frame,
            entry,
            section: owner,
            offset,
        };

        manager.page_out(&candidate, budget).unwrap()
    }

    fn system_with_page_file(pages: usize) -> TestSystem {
        let system = TestSystem::new();
        let volume = TestVolume::new(1, true, pages * PAGE_SIZE);
        system.manager.volume_arrival(&volume).unwrap();
        system
    }

    #[test]
    fn request_raises_the_target_and_wakes_the_thread() {
        let system = TestSystem::new();
        let request = system.manager.physical.page_out_request().clone();
        request.pages_freed.signal();
        system.manager.request_paging_out(10);
        system.manager.request_paging_out(4);
        assert_eq!(request.target(), 10);
        assert!(request.event.is_signaled());
        assert!(!request.pages_freed.is_signaled());
    }

    #[test]
    fn dirty_pages_survive_a_trip_through_the_page_file() {
        let system = system_with_page_file(256);
        let space = system.create_process();
        system.switch_to(&space);
        let va = system.map_anonymous(&space, 4 * PAGE_SIZE, RW);
        for page in 0..4 {
            system.write_user(&space, va + page * PAGE_SIZE, &[page as u8 + 1; 32]);
        }

        let section = space.find_section(va).unwrap();
        let before = system.manager.physical.free_frames();
        assert_eq!(evict_section(&system.manager, &section), 4);
        assert_eq!(system.manager.physical.free_frames(), before + 4);
        assert!(section.has_page_file_space());
        assert!(system.manager.virtual_to_physical(&space, va).is_none());

        for page in 0..4 {
            assert_eq!(system.read_user(&space, va + page * PAGE_SIZE, 32), vec![page as u8 + 1; 32]);
        }
    }

    #[test]
    fn clean_pages_are_dropped_without_a_write() {
        let system = system_with_page_file(64);
        let space = system.create_process();
        system.switch_to(&space);
        let va = system.map_anonymous(&space, PAGE_SIZE, RW);
        assert_eq!(system.read_user(&space, va, 4), vec![0; 4]);

        let section = space.find_section(va).unwrap();
        assert_eq!(evict_section(&system.manager, &section), 1);
        assert!(!section.is_dirty(0));
        assert_eq!(system.read_user(&space, va, 4), vec![0; 4]);
    }

    #[test]
    fn clean_pages_after_the_candidate_ride_along_with_the_run() {
        let system = system_with_page_file(64);
        let space = system.create_process();
        system.switch_to(&space);
        let va = system.map_anonymous(&space, 3 * PAGE_SIZE, RW);
        assert_eq!(system.read_user(&space, va, 1), vec![0]);
        assert_eq!(system.read_user(&space, va + PAGE_SIZE, 1), vec![0]);
        system.write_user(&space, va + 2 * PAGE_SIZE, &[0x33]);

        let section = space.find_section(va).unwrap();
        assert_eq!(page_out_from(&system.manager, &section, 0, 3), 3);
        assert_eq!(space.resident_set(), 0);
        assert!(!section.is_dirty(0));
        assert!(section.is_dirty(1));
        assert!(section.is_dirty(2));

        assert_eq!(system.read_user(&space, va, 1), vec![0]);
        assert_eq!(system.read_user(&space, va + PAGE_SIZE, 1), vec![0]);
        assert_eq!(system.read_user(&space, va + 2 * PAGE_SIZE, 1), vec![0x33]);
    }

    #[test]
    fn pinned_pages_stay_resident() {
        let system = system_with_page_file(64);
        let space = system.create_process();
        system.switch_to(&space);
        let va = system.map_anonymous(&space, PAGE_SIZE, RW);
        let section = space.find_section(va).unwrap();
        let locked = system.manager.page_in(&section, 0, true).unwrap().unwrap();

        assert_eq!(evict_section(&system.manager, &section), 0);
        assert_eq!(system.manager.virtual_to_physical(&space, va), Some(locked.frame()));
    }

    #[test]
    fn a_pass_frees_pages_toward_the_target() {
        let system = system_with_page_file(1024);
        let space = system.create_process();
        system.switch_to(&space);
        let pages = 64;
        let va = system.map_anonymous(&space, pages * PAGE_SIZE, RW);
        for page in 0..pages {
            system.write_user(&space, va + page * PAGE_SIZE, &[page as u8; 8]);
        }

        let free = system.manager.physical.free_frames();
        let freed = system.manager.page_out_pass(free + pages / 2);
        assert!(freed >= pages / 2);
        assert!(system.manager.physical.page_out_request().pages_freed.is_signaled());

        for page in 0..pages {
            assert_eq!(system.read_user(&space, va + page * PAGE_SIZE, 8), vec![page as u8; 8]);
        }
    }

    #[test]
    fn two_megabytes_survive_paging_out_half() {
        let system = system_with_page_file(1024);
        let space = system.create_process();
        system.switch_to(&space);
        let pages = 2 * 1024 * 1024 / PAGE_SIZE;
        let pattern = |page: usize| -> Vec<u8> {
            let mut bytes = page.to_le_bytes().to_vec();
            bytes.extend_from_slice(&[page as u8 ^ 0xA5; 56]);
            bytes
        };

        let va = system.map_anonymous(&space, pages * PAGE_SIZE, RW);
        for page in 0..pages {
            system.write_user(&space, va + page * PAGE_SIZE, &pattern(page));
        }

        assert_eq!(space.resident_set(), pages);
        let free = system.manager.physical.free_frames();
        let freed = system.manager.page_out_pass(free + pages / 2);
        assert!(freed >= pages / 2);
        assert!(space.resident_set() <= pages / 2);

        for page in 0..pages {
            assert_eq!(system.read_user(&space, va + page * PAGE_SIZE, 64), pattern(page));
        }

        assert_eq!(space.resident_set(), pages);
    }

    #[test]
    fn paging_without_page_files_fails_cleanly() {
        let system = TestSystem::new();
        let space = system.create_process();
        system.switch_to(&space);
        let va = system.map_anonymous(&space, PAGE_SIZE, RW);
        system.write_user(&space, va, &[1]);
        let section = space.find_section(va).unwrap();

        assert_eq!(evict_section(&system.manager, &section), 0);
        assert_eq!(system.read_user(&space, va, 1), vec![1]);
    }

    #[test]
    fn resident_set_matches_the_page_tables() {
        let system = system_with_page_file(256);
        let parent = system.create_process();
        system.switch_to(&parent);
        let pages = 8;
        let written = 6;
        let va = system.map_anonymous(&parent, pages * PAGE_SIZE, RW);
        for page in 0..written {
            system.write_user(&parent, va + page * PAGE_SIZE, &[page as u8 + 1]);
        }

        let check = |space: &Arc<AddressSpace>| {
            assert_eq!(space.resident_set(), mapped_leaves(&system, space, va, pages));
        };

        check(&parent);
        let child = system.manager.fork_address_space(&parent).unwrap();
        check(&parent);
        check(&child);

        for page in 0..written {
            let address = va + page * PAGE_SIZE;
            assert_eq!(system.read_user(&child, address, 1), vec![page as u8 + 1]);
            assert_eq!(system.read_user(&parent, address, 1), vec![page as u8 + 1]);
            let shared = system.manager.virtual_to_physical(&parent, address);
            assert!(shared.is_some());
            assert_eq!(system.manager.virtual_to_physical(&child, address), shared);
            assert!(!system.manager.leaf_entry(&parent, address).unwrap().is_writable());
            assert!(!system.manager.leaf_entry(&child, address).unwrap().is_writable());
        }

        check(&parent);
        check(&child);

        system.write_user(&child, va, &[0xEE]);
        system.write_user(&parent, va + PAGE_SIZE, &[0xDD]);
        check(&parent);
        check(&child);

        let section = parent.find_section(va).unwrap();
        evict_section(&system.manager, &section);
        check(&parent);
        check(&child);

        system.switch_to(&child);
        system.manager.unmap_memory(&child, va + 2 * PAGE_SIZE, 2 * PAGE_SIZE).unwrap();
        check(&parent);
        check(&child);

        assert_eq!(system.read_user(&child, va, 1), vec![0xEE]);
        assert_eq!(system.read_user(&child, va + PAGE_SIZE, 1), vec![2]);
        assert_eq!(system.read_user(&parent, va + PAGE_SIZE, 1), vec![0xDD]);
        check(&parent);
        check(&child);
    }
}
