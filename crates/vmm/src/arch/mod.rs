//! Architecture-specific implementations for memory management.
//!
//! This module conditionally imports either hardware-specific implementations
//! or software emulation based on the target architecture and features. Both expose
//! the same contract: geometry constants, address validation, the page table entry
//! format, self-map entry access, TLB maintenance and per-CPU scratch pages.

// Use x86_64 hardware implementation when we're on x86_64 and not testing or emulating.
// NOTE: We DO include the module even during tests so that rust-analyzer can see it.
#[cfg(all(target_arch = "x86_64"))]
mod x86_64;
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
pub use x86_64::*;

// Use software emulation ONLY when:
// - Running tests, OR
// - software-emulation feature is explicitly enabled
#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::*;

/// Number of entries in one table at any level.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Bits of virtual address consumed by each table level.
pub const BITS_PER_LEVEL: usize = 9;

/// Size in bytes of one page table entry.
pub const ENTRY_SIZE: usize = core::mem::size_of::<u64>();

/// Shift of the top-level index within a virtual address.
pub const TOP_LEVEL_SHIFT: usize = PAGE_SHIFT + BITS_PER_LEVEL * (PAGE_TABLE_LEVELS - 1);

/// The level number of the root table.
pub const TOP_LEVEL: usize = PAGE_TABLE_LEVELS - 1;

/// First top-level index belonging to the kernel half.
pub const KERNEL_TOP_LEVEL_INDEX: usize = ENTRIES_PER_TABLE / 2;

/// Exclusive end of the user half.
pub const USER_VA_END: usize = 1 << (MAX_VIRTUAL_BITS - 1);

/// Bytes covered by one entry at `level`.
#[inline]
pub const fn level_span(level: usize) -> usize {
    1 << (PAGE_SHIFT + BITS_PER_LEVEL * level)
}

/// Returns the top-level index of a virtual address.
#[inline]
pub const fn top_level_index(address: usize) -> usize {
    page_index(address, TOP_LEVEL)
}

/// Returns the self-map address of the entry that maps `address` at `level`.
///
/// Level 0 yields the leaf entry; `TOP_LEVEL` yields the root entry. The table holding
/// the entry is addressable only when every entry above it is present.
pub const fn self_map_entry_address(address: usize, level: usize) -> usize {
    let mut base = 0;
    let mut step = 0;
    while step <= level {
        base |= SELF_MAP_INDEX << (TOP_LEVEL_SHIFT - BITS_PER_LEVEL * step);
        step += 1;
    }

    let mask = (1usize << MAX_VIRTUAL_BITS) - 1;
    let index_bits = ((address & mask) >> (PAGE_SHIFT + BITS_PER_LEVEL * level)) * ENTRY_SIZE;
    canonicalize_virtual(base | index_bits)
}

/// Returns the self-map address of the table that holds the entries for `address` at
/// `level`.
#[inline]
pub const fn self_map_table_address(address: usize, level: usize) -> usize {
    self_map_entry_address(address, level) & !(PAGE_SIZE - 1)
}

/// Scratch pages reserved for each processor.
pub const SCRATCH_SLOTS: usize = 2;

/// Bytes of kernel VA occupied by all scratch pages.
pub const SCRATCH_SIZE: usize = MAX_CPUS * SCRATCH_SLOTS * PAGE_SIZE;

/// Returns scratch page `slot` of a processor.
#[inline]
pub const fn scratch_page(processor: usize, slot: usize) -> usize {
    assert!(processor < MAX_CPUS, "processor index out of range");
    assert!(slot < SCRATCH_SLOTS, "scratch slot out of range");
    SCRATCH_BASE + (processor * SCRATCH_SLOTS + slot) * PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_entry_of_self_map_points_at_self_map_slot() {
        let root_table = self_map_table_address(0, TOP_LEVEL);
        let self_slot = self_map_entry_address(SELF_MAP_BASE, TOP_LEVEL);
        assert_eq!(self_slot, root_table + SELF_MAP_INDEX * ENTRY_SIZE);
    }

    #[test]
    fn leaf_entries_are_consecutive_for_consecutive_pages() {
        let first = self_map_entry_address(0x40_0000, 0);
        let second = self_map_entry_address(0x40_0000 + PAGE_SIZE, 0);
        assert_eq!(second - first, ENTRY_SIZE);
        assert!(first >= SELF_MAP_BASE);
    }

    #[test]
    fn kernel_addresses_map_into_upper_half_of_self_map() {
        let kernel_leaf = self_map_entry_address(KERNEL_VA_START, 0);
        let user_leaf = self_map_entry_address(0, 0);
        assert!(kernel_leaf > user_leaf);
        assert_eq!(
            kernel_leaf - user_leaf,
            (KERNEL_VA_START & ((1 << MAX_VIRTUAL_BITS) - 1)) / PAGE_SIZE * ENTRY_SIZE
        );
    }

    #[test]
    fn scratch_pages_are_per_processor() {
        assert_eq!(scratch_page(0, 1) - scratch_page(0, 0), PAGE_SIZE);
        assert_eq!(scratch_page(1, 0) - scratch_page(0, 0), SCRATCH_SLOTS * PAGE_SIZE);
        assert_eq!(top_level_index(scratch_page(3, 1)), SCRATCH_INDEX);
    }
}
