//! Address spaces.
//!
//! An address space is a root table plus the bookkeeping the memory manager keeps for
//! it: the image sections mapped into it (sorted by base address), an accountant of
//! reserved virtual ranges, the program break window and a few counters.

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    MmError, MmResult, PAGE_SIZE, PhysicalAddress, VirtualAddress, arch,
    manager::MemoryManager,
    mdl::{AllocationSource, DescriptorType, MemoryDescriptor, MemoryDescriptorList},
    section::ImageSection,
};

/// The heap window moved by the break system call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BreakWindow {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
}

/// One address space.
pub struct AddressSpace {
    root: PhysicalAddress,
    kernel: bool,
    /// Serialises page table edits in this space.
    pub(crate) tables: spin::Mutex<()>,
    pub(crate) sections: spin::Mutex<Vec<Arc<ImageSection>>>,
    pub(crate) accountant: spin::Mutex<MemoryDescriptorList>,
    pub(crate) break_window: spin::Mutex<BreakWindow>,
    pub(crate) resident_set: AtomicUsize,
    pub(crate) page_table_pages: AtomicUsize,
    threads: AtomicUsize,
}

impl AddressSpace {
    /// Wraps a root table. The accountant starts with the whole user half free, or the
    /// kernel pool for the kernel space.
    pub(crate) fn new(root: PhysicalAddress, kernel: bool) -> MmResult<Self> {
        let (start, end) = if kernel {
            (arch::KERNEL_POOL_START, arch::KERNEL_POOL_END)
        } else {
            (PAGE_SIZE, arch::USER_VA_END)
        };

        let mut accountant = MemoryDescriptorList::new(AllocationSource::PagedPool);
        accountant.add(MemoryDescriptor::from_range(
            start as u64,
            end as u64,
            DescriptorType::Free,
        ))?;

        Ok(Self {
            root,
            kernel,
            tables: spin::Mutex::new(()),
            sections: spin::Mutex::new(Vec::new()),
            accountant: spin::Mutex::new(accountant),
            break_window: spin::Mutex::new(BreakWindow::default()),
            resident_set: AtomicUsize::new(0),
            page_table_pages: AtomicUsize::new(0),
            threads: AtomicUsize::new(0),
        })
    }

    /// Physical address of the root table.
    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    pub fn is_kernel(&self) -> bool {
        self.kernel
    }

    /// Number of user pages with a frame in their leaf entry.
    pub fn resident_set(&self) -> usize {
        self.resident_set.load(Ordering::Acquire)
    }

    /// Number of page tables below the root.
    pub fn page_table_pages(&self) -> usize {
        self.page_table_pages.load(Ordering::Acquire)
    }

    pub fn thread_count(&self) -> usize {
        self.threads.load(Ordering::Acquire)
    }

    pub fn add_thread(&self) {
        self.threads.fetch_add(1, Ordering::AcqRel);
    }

    pub fn remove_thread(&self) {
        let previous = self.threads.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous != 0, "thread count underflow");
    }

    pub fn break_window(&self) -> BreakWindow {
        *self.break_window.lock()
    }

    /// Sets the initial program break, normally just past the loaded image.
    pub fn initialize_break(&self, start: VirtualAddress) {
        let start = start.align_up(PAGE_SIZE);
        *self.break_window.lock() = BreakWindow { start, end: start };
    }

    /// Returns the sections in address order.
    pub fn sections(&self) -> Vec<Arc<ImageSection>> {
        self.sections.lock().clone()
    }

    /// Reserves `size` bytes of address space.
    ///
    /// A nonzero `hint` is tried first as a fixed address. With `clobber` the range at
    /// `hint` is taken whatever it holds.
    pub(crate) fn reserve(&self, hint: VirtualAddress, size: usize, clobber: bool) -> MmResult<VirtualAddress> {
        use crate::mdl::AllocationStrategy;

        let mut accountant = self.accountant.lock();
        let (min, max) = if self.kernel {
            (arch::KERNEL_POOL_START as u64, arch::KERNEL_POOL_END as u64)
        } else {
            (PAGE_SIZE as u64, arch::USER_VA_END as u64)
        };

        let kind = if self.kernel {
            DescriptorType::PagedPool
        } else {
            DescriptorType::UserReserved
        };

        let size = size as u64;
        let hint = hint.as_u64();
        if clobber {
            if hint < min || hint.checked_add(size).is_none_or(|end| end > max) {
                return Err(MmError::InvalidAddressRange);
            }

            let address = accountant.allocate(size, PAGE_SIZE as u64, hint, max, kind, AllocationStrategy::FixedAddressClobber)?;
            return Ok(VirtualAddress::new(address as usize));
        }

        if hint >= min && hint < max {
            if let Ok(address) = accountant.allocate(size, PAGE_SIZE as u64, hint, max, kind, AllocationStrategy::FixedAddress) {
                return Ok(VirtualAddress::new(address as usize));
            }
        }

        let address = accountant.allocate(size, PAGE_SIZE as u64, min, max, kind, AllocationStrategy::AnyAddress)?;
        Ok(VirtualAddress::new(address as usize))
    }

    /// Returns a reserved range to the free pool.
    pub(crate) fn release(&self, va: VirtualAddress, size: usize) -> MmResult<()> {
        if size == 0 {
            return Ok(());
        }

        self.accountant.lock().add(MemoryDescriptor::new(
            va.as_u64(),
            size as u64,
            DescriptorType::Free,
        ))
    }

    /// Finds the section covering `va`.
    pub fn find_section(&self, va: VirtualAddress) -> Option<Arc<ImageSection>> {
        let candidate = {
            let sections = self.sections.lock();
            let index = sections.partition_point(|section| section.virtual_address() <= va);
            sections.get(index.checked_sub(1)?)?.clone()
        };

        let end = candidate.virtual_address() + candidate.size();
        (va < end).then_some(candidate)
    }

    /// Returns every section overlapping `[va, va + size)`, in address order.
    pub(crate) fn sections_overlapping(&self, va: VirtualAddress, size: usize) -> Vec<Arc<ImageSection>> {
        let end = va + size;
        let candidates: Vec<_> = self
            .sections
            .lock()
            .iter()
            .filter(|section| section.virtual_address() < end)
            .cloned()
            .collect();

        candidates
            .into_iter()
            .filter(|section| section.virtual_address() + section.size() > va)
            .collect()
    }

    /// Inserts a section keeping the list sorted.
    pub(crate) fn insert_section(&self, section: Arc<ImageSection>) {
        let mut sections = self.sections.lock();
        let index = sections.partition_point(|other| other.virtual_address() < section.virtual_address());
        sections.insert(index, section);
    }

    /// Removes a section from the list. Returns false if it was not there.
    pub(crate) fn unlink_section(&self, section: &ImageSection) -> bool {
        let removed = {
            let mut sections = self.sections.lock();
            sections
                .iter()
                .position(|other| core::ptr::eq(Arc::as_ptr(other), section))
                .map(|index| sections.remove(index))
        };

        removed.is_some()
    }
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("root", &self.root)
            .field("kernel", &self.kernel)
            .field("resident_set", &self.resident_set())
            .field("page_table_pages", &self.page_table_pages())
            .finish()
    }
}

impl MemoryManager {
    /// Creates a user address space: a fresh root whose kernel half is copied from the
    /// canonical kernel root and whose self-map slot points at itself.
    pub fn create_address_space(&self) -> MmResult<Arc<AddressSpace>> {
        let root = self.physical.allocate_zeroed(true)?;
        self.initialize_root(root);
        match AddressSpace::new(root, false) {
            Ok(space) => Ok(Arc::new(space)),
            Err(error) => {
                self.physical.free(root);
                Err(error)
            }
        }
    }

    /// Removes every user section of a space.
    pub fn cleanup_address_space(&self, space: &Arc<AddressSpace>) {
        let sections = core::mem::take(&mut *space.sections.lock());
        for section in sections {
            if let Err(error) = self.remove_image_section(&section) {
                log::warn!("failed to remove section at {}: {}", section.virtual_address(), error);
            }
        }
    }

    /// Tears a space down and frees its tables. The space must not be loaded on any
    /// processor.
    pub fn destroy_address_space(&self, space: Arc<AddressSpace>) {
        assert!(!space.is_kernel(), "attempt to destroy the kernel address space");
        self.cleanup_address_space(&space);
        self.destroy_page_tables(&space);
        log::debug!("destroyed address space {:?}", space);
    }

    /// Forks `source` into a new space whose sections inherit every populated page.
    ///
    /// Shared pages stay shared; private pages become copy-on-write in both spaces.
    pub fn fork_address_space(&self, source: &Arc<AddressSpace>) -> MmResult<Arc<AddressSpace>> {
        let destination = self.create_address_space()?;
        match self.fork_into(source, &destination) {
            Ok(()) => Ok(destination),
            Err(error) => {
                log::warn!("fork of {:?} failed: {}", source, error);
                self.destroy_address_space(destination);
                Err(error)
            }
        }
    }

    fn fork_into(&self, source: &Arc<AddressSpace>, destination: &Arc<AddressSpace>) -> MmResult<()> {
        let sections = source.sections();
        self.preallocate_page_tables(source, destination)?;
        let mut result = Ok(());
        for section in &sections {
            result = self.copy_image_section(section, source, destination);
            if result.is_err() {
                break;
            }
        }

        self.invalidate_range(source, VirtualAddress::NULL, arch::USER_VA_END / PAGE_SIZE, true);
        result?;

        *destination.break_window.lock() = source.break_window();
        let source_accountant = source.accountant.lock();
        let mut destination_accountant = destination.accountant.lock();
        source_accountant.copy_into(&mut destination_accountant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SectionFlags, testing::TestSystem};

    #[test]
    fn new_space_has_kernel_half_and_self_map() {
        let system = TestSystem::new();
        let space = system.create_process();
        system.switch_to(&space);
        let self_slot = arch::entry_ptr(VirtualAddress::new(arch::SELF_MAP_BASE), arch::TOP_LEVEL);
        let entry = unsafe { self_slot.read_volatile() };
        assert_eq!(entry.frame(), Some(space.root()));
        assert_eq!(space.resident_set(), 0);
    }

    #[test]
    fn reservations_honour_hints_and_clobber() {
        let system = TestSystem::new();
        let space = system.create_process();
        let hint = VirtualAddress::new(0x1000_0000);
        let first = space.reserve(hint, 4 * PAGE_SIZE, false).unwrap();
        assert_eq!(first, hint);

        let second = space.reserve(hint, PAGE_SIZE, false).unwrap();
        assert_ne!(second, hint);

        let clobbered = space.reserve(hint, PAGE_SIZE, true).unwrap();
        assert_eq!(clobbered, hint);
        assert_eq!(
            space.reserve(VirtualAddress::new(arch::USER_VA_END - PAGE_SIZE), 2 * PAGE_SIZE, true),
            Err(MmError::InvalidAddressRange)
        );
    }

    #[test]
    fn sections_are_found_by_address() {
        let system = TestSystem::new();
        let space = system.create_process();
        let flags = SectionFlags::READABLE | SectionFlags::WRITABLE;
        let low = system.map_anonymous(&space, 2 * PAGE_SIZE, flags);
        let high = system.map_anonymous(&space, PAGE_SIZE, flags);
        let found = space.find_section(low + PAGE_SIZE + 7).unwrap();
        assert_eq!(found.virtual_address(), low);
        assert_eq!(space.find_section(high).unwrap().virtual_address(), high);
        let empty = space.reserve(VirtualAddress::NULL, PAGE_SIZE, false).unwrap();
        assert!(space.find_section(empty).is_none());
        assert_eq!(space.sections_overlapping(low, 64 * PAGE_SIZE).len(), 2);
    }

    #[test]
    fn destroying_a_space_returns_every_frame() {
        let system = TestSystem::new();
        let before = system.manager.physical.free_frames();
        let space = system.create_process();
        system.switch_to(&space);
        let va = system.map_anonymous(&space, 4 * PAGE_SIZE, SectionFlags::READABLE | SectionFlags::WRITABLE);
        for page in 0..4 {
            system.write_user(&space, va + page * PAGE_SIZE, &[page as u8 + 1]);
        }

        assert_eq!(space.resident_set(), 4);
        system.switch_to_kernel();
        system.manager.destroy_address_space(space);
        assert_eq!(system.manager.physical.free_frames(), before);
    }
}
