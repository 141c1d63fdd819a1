//! x86_64 architecture-specific implementation.
//!
//! This module provides the hardware implementation for x86_64 with 4-level paging.
//! Page tables are reached through the self-map slot and TLB maintenance uses the
//! `x86_64` crate's instruction wrappers.

mod entry;

pub use entry::PageEntry;

use x86_64::{
    PhysAddr, VirtAddr,
    instructions::tlb,
    registers::control::{Cr3, Cr3Flags},
    structures::paging::PhysFrame,
};

use crate::{PhysicalAddress, VirtualAddress};

/// Maximum number of bits in a physical address on x86_64.
/// This is typically 52 bits on modern CPUs, but we use 48 as a conservative default.
pub const MAX_PHYSICAL_BITS: usize = 48;

/// Maximum number of bits in a virtual address on x86_64 with 4-level paging.
pub const MAX_VIRTUAL_BITS: usize = 48;

/// Default page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// log2 of the page size.
pub const PAGE_SHIFT: usize = 12;

/// Number of page table levels in x86_64 (4-level paging).
pub const PAGE_TABLE_LEVELS: usize = 4;

/// Start of the kernel half.
pub const KERNEL_VA_START: usize = 0xFFFF_8000_0000_0000;

/// PML4 slot that points back at the PML4 itself.
pub const SELF_MAP_INDEX: usize = 510;

/// Base of the window through which page tables are visible.
pub const SELF_MAP_BASE: usize = 0xFFFF_FF00_0000_0000;

/// PML4 slot holding the per-processor scratch pages.
pub const SCRATCH_INDEX: usize = 509;

/// Base of the per-processor scratch pages.
pub const SCRATCH_BASE: usize = 0xFFFF_FE80_0000_0000;

/// Maximum number of processors.
pub const MAX_CPUS: usize = 256;

/// Start of the kernel virtual range handed out by the kernel accountant.
///
/// The lower quarter of the kernel half is left to the bootloader's direct map.
pub const KERNEL_POOL_START: usize = 0xFFFF_C000_0000_0000;

/// End of the kernel virtual range handed out by the kernel accountant.
pub const KERNEL_POOL_END: usize = SCRATCH_BASE;

/// Returns the page table index for a given virtual address at the specified level.
///
/// For x86_64, each level uses 9 bits, with level 0 being the page table (PT),
/// level 1 being the page directory (PD), level 2 being the page directory pointer
/// table (PDPT), and level 3 being the page map level 4 (PML4).
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(level < PAGE_TABLE_LEVELS, "level out of range for x86_64 page table levels");
    (address >> (PAGE_SHIFT + level * 9)) & 0x1FF
}

/// Validates a physical address for x86_64.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr < (1 << MAX_PHYSICAL_BITS)
}

/// Validates a virtual address for x86_64.
///
/// Virtual addresses must be canonical (bits 47-63 must be sign-extended from bit 47).
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    canonicalize_virtual(addr) == addr
}

/// Canonicalizes a virtual address for x86_64.
///
/// This sign-extends bit 47 to bits 48-63.
#[inline]
pub const fn canonicalize_virtual(addr: usize) -> usize {
    if (addr & (1 << 47)) != 0 {
        addr | 0xFFFF_0000_0000_0000
    } else {
        addr & 0x0000_FFFF_FFFF_FFFF
    }
}

/// Returns a pointer to the self-mapped entry for `va` at `level` in the active tables.
pub fn entry_ptr(va: VirtualAddress, level: usize) -> *mut PageEntry {
    super::self_map_entry_address(va.as_usize(), level) as *mut PageEntry
}

/// Returns a kernel pointer for a mapped kernel virtual address.
pub fn kernel_ptr(va: VirtualAddress) -> *mut u8 {
    va.as_mut_ptr()
}

/// Returns the root table of the executing processor.
pub fn active_root() -> PhysicalAddress {
    let (frame, _) = Cr3::read();
    PhysicalAddress::new(frame.start_address().as_u64() as usize)
}

/// Loads a new root table on the executing processor.
///
/// # Safety
///
/// `root` must be a fully formed PML4 whose kernel half matches the kernel's.
pub unsafe fn set_active_root(root: PhysicalAddress) {
    let frame = PhysFrame::containing_address(PhysAddr::new(root.as_u64()));
    unsafe { Cr3::write(frame, Cr3Flags::empty()) };
}

/// Invalidates one page on the executing processor.
pub fn invalidate_tlb_entry(va: VirtualAddress) {
    tlb::flush(VirtAddr::new(va.as_u64()));
}

/// Flushes all non-global translations on the executing processor.
pub fn flush_tlb() {
    tlb::flush_all();
}

/// Checks that the active tables let user mode access `va` and returns a pointer to it.
/// On failure returns whether the leaf was present.
pub fn probe_user(va: VirtualAddress, write: bool) -> Result<*mut u8, bool> {
    for level in (0..PAGE_TABLE_LEVELS).rev() {
        let entry = unsafe { entry_ptr(va, level).read_volatile() };
        if !entry.is_present() {
            return Err(false);
        }

        if !entry.is_user() || (write && !entry.is_writable()) {
            return Err(true);
        }
    }

    Ok(va.as_mut_ptr())
}

/// Makes instruction fetches observe prior data writes. x86_64 keeps them coherent.
pub fn sync_instruction_cache(_va: VirtualAddress, _size: usize) {}
