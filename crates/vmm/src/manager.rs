//! The memory manager object.
//!
//! [`MemoryManager`] ties together the physical layer, the kernel address space, the
//! page files and the shootdown state. Every operation of the crate is a method on it,
//! spread over the modules that implement them.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use crate::{
    MmResult, PhysicalAddress, VirtualAddress,
    address::AddressTranslator,
    address_space::AddressSpace,
    arch::{self, ENTRY_SIZE, PAGE_TABLE_LEVELS, PageEntry},
    config::VmmConfig,
    fault::RecoveryRegion,
    page_file::PageFileList,
    physical::PhysicalPages,
    platform::Platform,
    tlb::Shootdown,
};

/// The virtual memory manager.
pub struct MemoryManager {
    pub(crate) config: VmmConfig,
    pub(crate) platform: Arc<dyn Platform>,
    /// Physical frames and their paging metadata.
    pub physical: Arc<PhysicalPages>,
    /// The kernel half, shared by every address space.
    pub kernel_space: Arc<AddressSpace>,
    pub(crate) shootdown: Shootdown,
    pub(crate) page_files: PageFileList,
    pub(crate) user_copy_region: spin::Once<RecoveryRegion>,
}

impl MemoryManager {
    /// Brings the memory manager up.
    ///
    /// With `kernel_root` the kernel keeps running on the tables the loader built, which
    /// must be active on the executing processor. Without it a fresh root is allocated
    /// and loaded here; other processors load it with
    /// [`MemoryManager::activate_address_space`] on the kernel space.
    ///
    /// Either way the root gains its self-map slot and the tables behind the
    /// per-processor scratch pages. Both are written through the physical translator,
    /// since the scratch pages cannot be used before their tables exist.
    pub fn new(
        config: VmmConfig,
        platform: Arc<dyn Platform>,
        physical: Arc<PhysicalPages>,
        kernel_root: Option<PhysicalAddress>,
    ) -> MmResult<Arc<Self>> {
        let root = match kernel_root {
            Some(root) => root,
            None => physical.allocate_zeroed(true)?,
        };

        let kernel_space = match AddressSpace::new(root, true) {
            Ok(space) => Arc::new(space),
            Err(error) => {
                if kernel_root.is_none() {
                    physical.free(root);
                }

                return Err(error);
            }
        };

        write_root_entry(root, arch::SELF_MAP_INDEX, PageEntry::table(root, false));
        build_scratch_tables(&physical, &kernel_space)?;
        if kernel_root.is_none() {
            unsafe { arch::set_active_root(root) };
        }

        log::info!(
            "memory manager up: {} frames, kernel root {}, {} processors",
            physical.statistics().total,
            root,
            platform.processor_count()
        );

        Ok(Arc::new(Self {
            config,
            platform,
            physical,
            kernel_space,
            shootdown: Shootdown::new(),
            page_files: PageFileList::new(),
            user_copy_region: spin::Once::new(),
        }))
    }

    pub fn config(&self) -> &VmmConfig {
        &self.config
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// Loads `space` on the executing processor. Loading the kernel space leaves only
    /// the kernel half reachable.
    pub fn activate_address_space(&self, space: &AddressSpace) {
        if arch::active_root() != space.root() {
            unsafe { arch::set_active_root(space.root()) };
        }
    }
}

fn write_root_entry(root: PhysicalAddress, index: usize, entry: PageEntry) {
    let slot: *mut PageEntry = AddressTranslator::current().phys_to_ptr(root + index * ENTRY_SIZE);
    unsafe { slot.write_volatile(entry) };
}

/// Creates the tables above the scratch pages' leaf entries, walking the kernel root
/// physically.
fn build_scratch_tables(physical: &PhysicalPages, kernel_space: &AddressSpace) -> MmResult<()> {
    let translator = AddressTranslator::current();
    let leaf_span = arch::level_span(1);
    let end = arch::SCRATCH_BASE + arch::SCRATCH_SIZE;
    let mut address = arch::SCRATCH_BASE;
    while address < end {
        let va = VirtualAddress::new(address);
        let mut table = kernel_space.root();
        for level in (1..PAGE_TABLE_LEVELS).rev() {
            let slot: *mut PageEntry = translator.phys_to_ptr(table + va.page_index(level) * ENTRY_SIZE);
            let entry = unsafe { slot.read_volatile() };
            table = match entry.frame().filter(|_| entry.is_present()) {
                Some(frame) => frame,
                None => {
                    let frame = physical.allocate_zeroed(true)?;
                    kernel_space.page_table_pages.fetch_add(1, Ordering::AcqRel);
                    unsafe { slot.write_volatile(PageEntry::table(frame, false)) };
                    frame
                }
            };
        }

        address += leaf_span;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{arch::Machine, testing::TestSystem};

    #[test]
    fn the_kernel_root_maps_itself() {
        let system = TestSystem::new();
        let root = system.manager.kernel_space.root();
        let entry = arch::entry_ptr(VirtualAddress::new(arch::SELF_MAP_BASE), arch::TOP_LEVEL);
        let entry = unsafe { entry.read_volatile() };
        assert_eq!(entry.frame(), Some(root));
        assert_eq!(Machine::current().walk(VirtualAddress::new(arch::self_map_table_address(0, arch::TOP_LEVEL))), Some(root));
    }

    #[test]
    fn scratch_pages_work_on_every_processor() {
        let system = TestSystem::new();
        let frame = system.manager.physical.allocate_zeroed(true).unwrap();
        let machine = Machine::current();
        for cpu in 0..machine.processor_count() {
            machine.set_current_processor(cpu);
            let mut window = crate::mapping::ScratchWindow::new(system.platform.as_ref(), 1);
            let pointer = window.map(frame);
            unsafe { pointer.add(cpu).write(cpu as u8 + 1) };
        }

        machine.set_current_processor(0);
        let bytes: *const u8 = AddressTranslator::current().phys_to_ptr(frame);
        assert_eq!(unsafe { bytes.add(1).read() }, 2);
        system.manager.physical.free(frame);
    }

    #[test]
    fn new_spaces_inherit_the_kernel_half() {
        let system = TestSystem::new();
        let space = system.create_process();
        system.switch_to(&space);
        let va = VirtualAddress::new(arch::scratch_page(0, 0));
        assert!(Machine::current().walk(VirtualAddress::new(arch::self_map_table_address(va.as_usize(), 0))).is_some());

        // One middle table and one leaf table cover every scratch page.
        assert_eq!(system.manager.kernel_space.page_table_pages(), 2);
    }
}
