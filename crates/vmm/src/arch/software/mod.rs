//! Software emulation implementation for testing and development.
//!
//! This module provides a software-emulated architecture that can run on any host.
//! The emulated architecture is a "scale model" of x86_64:
//! - 39-bit virtual addresses (vs 48-bit on x86_64)
//! - 3 levels of page tables (vs 4 on x86_64)
//! - 9-bit indexes and 4 KiB pages, exactly like x86_64
//! - 32-bit physical addresses
//!
//! Page tables live in emulated physical memory and are walked by an emulated MMU with
//! per-processor roots and TLBs (see [`Machine`]), so self-map arithmetic, stale TLB
//! entries and accessed/dirty tracking all behave the way they do on hardware.

mod entry;
mod machine;

pub use entry::PageEntry;
pub use machine::{Access, Machine, MmuFault};

use alloc::boxed::Box;
use core::cell::UnsafeCell;

use crate::{PhysicalAddress, VirtualAddress, address::AddressTranslator};

/// Maximum number of bits in a physical address for software emulation.
pub const MAX_PHYSICAL_BITS: usize = 32;

/// Maximum number of bits in a virtual address for software emulation.
pub const MAX_VIRTUAL_BITS: usize = 39;

/// Page size in bytes.
pub const PAGE_SIZE: usize = 4096;

/// log2 of the page size.
pub const PAGE_SHIFT: usize = 12;

/// Number of page table levels (3 levels: level 2, 1, 0).
pub const PAGE_TABLE_LEVELS: usize = 3;

/// Start of the kernel half.
pub const KERNEL_VA_START: usize = 0xFFFF_FFC0_0000_0000;

/// Top-level slot that points back at the root table.
pub const SELF_MAP_INDEX: usize = 510;

/// Base of the window through which page tables are visible.
pub const SELF_MAP_BASE: usize = 0xFFFF_FFFF_8000_0000;

/// Top-level slot holding the per-processor scratch pages.
pub const SCRATCH_INDEX: usize = 509;

/// Base of the per-processor scratch pages.
pub const SCRATCH_BASE: usize = 0xFFFF_FFFF_4000_0000;

/// Maximum number of processors.
pub const MAX_CPUS: usize = 16;

/// Start of the kernel virtual range handed out by the kernel accountant.
pub const KERNEL_POOL_START: usize = KERNEL_VA_START;

/// End of the kernel virtual range handed out by the kernel accountant.
pub const KERNEL_POOL_END: usize = SCRATCH_BASE;

/// Returns the page table index for a given virtual address at the specified level.
///
/// - Level 0: Bits 12-20 (page table)
/// - Level 1: Bits 21-29 (page directory)
/// - Level 2: Bits 30-38 (root)
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(level < PAGE_TABLE_LEVELS, "level out of range for software emulation (0-2)");
    (address >> (PAGE_SHIFT + level * 9)) & 0x1FF
}

/// Validates a physical address for software emulation.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr < (1 << MAX_PHYSICAL_BITS)
}

/// Validates a virtual address for software emulation.
///
/// Virtual addresses must be canonical (bits 39-63 must be sign-extended from bit 38).
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    canonicalize_virtual(addr) == addr
}

/// Canonicalizes a virtual address for software emulation.
///
/// This sign-extends bit 38 to bits 39-63.
#[inline]
pub const fn canonicalize_virtual(addr: usize) -> usize {
    if (addr & (1 << 38)) != 0 {
        addr | 0xFFFF_FF80_0000_0000
    } else {
        addr & 0x0000_007F_FFFF_FFFF
    }
}

/// Returns a pointer to the self-mapped entry for `va` at `level` in the active tables.
///
/// Every table above `level` must be present; the emulated walk panics otherwise, which
/// is the emulation's version of a kernel page fault on the self-map.
pub fn entry_ptr(va: VirtualAddress, level: usize) -> *mut PageEntry {
    let entry = super::self_map_entry_address(va.as_usize(), level);
    kernel_ptr(VirtualAddress::new(entry)).cast()
}

/// Returns a kernel pointer for a mapped kernel virtual address.
///
/// Kernel accesses go straight through the active tables and do not consult or fill
/// the TLB.
pub fn kernel_ptr(va: VirtualAddress) -> *mut u8 {
    let Some(phys) = Machine::current().walk(va) else {
        panic!("kernel access to unmapped address {}", va);
    };

    AddressTranslator::current().phys_to_ptr(phys)
}

/// Returns the root table of the executing processor.
pub fn active_root() -> PhysicalAddress {
    Machine::current().root()
}

/// Loads a new root table on the executing processor.
///
/// # Safety
///
/// `root` must be a fully formed top-level table whose kernel half matches the kernel's.
pub unsafe fn set_active_root(root: PhysicalAddress) {
    Machine::current().set_root(root);
}

/// Invalidates one page on the executing processor.
pub fn invalidate_tlb_entry(va: VirtualAddress) {
    Machine::current().invalidate(va);
}

/// Flushes all non-global translations on the executing processor.
pub fn flush_tlb() {
    Machine::current().flush(false);
}

/// Performs a user-mode access check of `va` the way the MMU would and returns a kernel
/// pointer to the byte. On failure returns whether the page was present.
///
/// The check goes through the executing processor's TLB and sets the accessed and dirty
/// bits, so a successful write probe leaves the page dirty.
pub fn probe_user(va: VirtualAddress, write: bool) -> Result<*mut u8, bool> {
    let access = if write { Access::Write } else { Access::Read };
    match Machine::current().translate(va, access, true) {
        Ok(phys) => Ok(AddressTranslator::current().phys_to_ptr(phys)),
        Err(fault) => Err(fault.present),
    }
}

/// Makes instruction fetches observe prior data writes. Nothing to do on this model.
pub fn sync_instruction_cache(_va: VirtualAddress, _size: usize) {}

/// Emulated memory for software simulation.
///
/// This provides a simulated physical memory space for testing page table operations
/// without requiring actual hardware or virtual memory support from the host OS.
pub struct EmulatedMemory {
    /// The underlying memory buffer, aligned to pages.
    memory: Box<[UnsafeCell<Page>]>,
}

#[repr(C, align(4096))]
struct Page([u8; PAGE_SIZE]);

impl EmulatedMemory {
    /// Creates a new emulated memory region of the specified size.
    pub fn new(size: usize) -> Self {
        Self {
            memory: (0..size.div_ceil(PAGE_SIZE))
                .map(|_| UnsafeCell::new(Page([0; PAGE_SIZE])))
                .collect(),
        }
    }

    /// Translates a physical address to a host pointer.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.size(), "physical address out of bounds");
        let page = self.memory[phys / PAGE_SIZE].get().cast::<u8>();
        unsafe { page.add(phys % PAGE_SIZE) }
    }

    /// Returns the size of the emulated memory region.
    pub fn size(&self) -> usize {
        self.memory.len() * PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_addresses() {
        assert!(validate_virtual(0x3F_FFFF_FFFF));
        assert!(!validate_virtual(0x40_0000_0000));
        assert!(!validate_virtual(0x80_0000_0000));
        assert!(validate_virtual(KERNEL_VA_START));
        assert_eq!(canonicalize_virtual(0x40_0000_0000), KERNEL_VA_START);
    }

    #[test]
    fn layout_constants_agree() {
        assert_eq!(canonicalize_virtual(SELF_MAP_INDEX << 30), SELF_MAP_BASE);
        assert_eq!(canonicalize_virtual(SCRATCH_INDEX << 30), SCRATCH_BASE);
        assert_eq!(page_index(SELF_MAP_BASE, 2), SELF_MAP_INDEX);
    }

    #[test]
    fn emulated_memory_is_page_aligned() {
        let memory = EmulatedMemory::new(3 * PAGE_SIZE + 1);
        assert_eq!(memory.size(), 4 * PAGE_SIZE);
        assert_eq!(memory.translate(0) as usize % PAGE_SIZE, 0);
    }
}
