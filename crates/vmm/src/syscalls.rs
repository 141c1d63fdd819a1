//! The system calls the memory manager serves directly.
//!
//! Each call takes the caller's address space explicitly. Results convert to the status
//! word returned to user mode with [`crate::status_of`].

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use crate::{
    MapFlags, MmError, MmResult, PAGE_SIZE, SectionFlags, VirtualAddress,
    address_space::AddressSpace,
    arch,
    io::{FileHandle, HandleAccess, ImageBacking, SharedMemoryObject},
    manager::MemoryManager,
    numbers::round_up_to_page,
};

bitflags! {
    /// Flags word of the map/unmap system call.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct MapSyscallFlags: u32 {
        /// Unmap instead of map.
        const UNMAP = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const SHARED = 1 << 4;
        const PRIVATE = 1 << 5;
        const ANONYMOUS = 1 << 6;
        /// Map exactly at the given address, replacing whatever is there.
        const FIXED = 1 << 7;

        const ACCESS_MASK = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

bitflags! {
    /// Flags word of the flush system call.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct FlushFlags: u32 {
        /// Start the write-back without waiting for it.
        const ASYNC = 1 << 0;
    }
}

impl MapSyscallFlags {
    fn section_access(self) -> SectionFlags {
        let mut access = SectionFlags::empty();
        access.set(SectionFlags::READABLE, self.contains(Self::READ));
        access.set(SectionFlags::WRITABLE, self.contains(Self::WRITE));
        access.set(SectionFlags::EXECUTABLE, self.contains(Self::EXECUTE));
        access
    }
}

/// Arguments of the map/unmap system call.
#[derive(Clone, Default)]
pub struct MapRequest {
    pub address: VirtualAddress,
    pub size: usize,
    pub offset: u64,
    pub handle: Option<FileHandle>,
    pub flags: MapSyscallFlags,
}

static NEXT_SHARED_OBJECT: AtomicU64 = AtomicU64::new(1 << 32);

/// Checks that `[address, address + size)` is a page aligned piece of the user half and
/// returns the size rounded up to whole pages.
fn user_range(address: VirtualAddress, size: usize) -> MmResult<usize> {
    if !address.is_page_aligned() {
        return Err(MmError::InvalidParameter);
    }

    let size = round_up_to_page(size).ok_or(MmError::InvalidParameter)?;

    match address.checked_add(size) {
        Some(end) if end.as_usize() <= arch::USER_VA_END => Ok(size),
        _ => Err(MmError::InvalidParameter),
    }
}

impl MemoryManager {
    /// Maps or unmaps memory, POSIX mmap/munmap style. Returns the address and the
    /// rounded size of the mapping.
    pub fn map_or_unmap_memory(&self, space: &Arc<AddressSpace>, request: &MapRequest) -> MmResult<(VirtualAddress, usize)> {
        if request.flags.contains(MapSyscallFlags::UNMAP) {
            let size = self.unmap_memory(space, request.address, request.size)?;
            return Ok((request.address, size));
        }

        self.map_memory(space, request)
    }

    /// Creates a mapping in a user space.
    pub fn map_memory(&self, space: &Arc<AddressSpace>, request: &MapRequest) -> MmResult<(VirtualAddress, usize)> {
        let flags = request.flags;
        let shared = flags.contains(MapSyscallFlags::SHARED);
        if space.is_kernel() || (shared && flags.contains(MapSyscallFlags::PRIVATE)) {
            return Err(MmError::InvalidParameter);
        }

        let anonymous = flags.contains(MapSyscallFlags::ANONYMOUS);
        let mut size = request.size;
        let mut offset = request.offset;
        let handle = if anonymous {
            offset = 0;
            None
        } else {
            let handle = request.handle.clone().ok_or(MmError::InvalidParameter)?;
            if !handle.access.contains(HandleAccess::READ) {
                return Err(MmError::AccessDenied);
            }

            if shared && flags.contains(MapSyscallFlags::WRITE) && !handle.access.contains(HandleAccess::WRITE) {
                return Err(MmError::AccessDenied);
            }

            if shared && !handle.file.is_cacheable() {
                return Err(MmError::NotSupported);
            }

            if size == 0 {
                let file_size = handle.file.size();
                if offset >= file_size {
                    return Err(MmError::InvalidParameter);
                }

                size = usize::try_from(file_size - offset).map_err(|_| MmError::InvalidParameter)?;
            }

            Some(handle)
        };

        if size == 0 {
            return Err(MmError::InvalidParameter);
        }

        let fixed = flags.contains(MapSyscallFlags::FIXED);
        let hint = if fixed {
            request.address
        } else {
            request.address.align_down(PAGE_SIZE)
        };

        let size = user_range(hint, size)?;

        // Shared anonymous memory is a file of its own that every mapping of it shares.
        let handle = match handle {
            Some(handle) => Some(handle),
            None if shared => {
                let id = NEXT_SHARED_OBJECT.fetch_add(1, Ordering::Relaxed);
                let object = SharedMemoryObject::new(id, size as u64, self.physical.clone())?;
                Some(FileHandle::new(Arc::new(object), HandleAccess::READ | HandleAccess::WRITE))
            }
            None => None,
        };

        if fixed {
            self.unmap_sections(space, hint, size)?;
        }

        let va = space.reserve(hint, size, fixed)?;
        let mut section_flags = flags.section_access();
        if shared {
            section_flags |= SectionFlags::SHARED;
        }

        section_flags |= SectionFlags::MAP_SYSTEM_CALL;
        let image = handle.map(|handle| ImageBacking { handle, offset });
        if let Err(error) = self.create_image_section(space, va, size, section_flags, image, MapFlags::empty()) {
            if let Err(release) = space.release(va, size) {
                log::warn!("failed to release {} after a failed map: {}", va, release);
            }

            return Err(error);
        }

        log::trace!("mapped {:#x} bytes at {} ({:?})", size, va, flags);
        Ok((va, size))
    }

    fn unmap_sections(&self, space: &Arc<AddressSpace>, address: VirtualAddress, size: usize) -> MmResult<()> {
        for section in space.sections_overlapping(address, size) {
            self.clip_image_section(space, &section, address, size)?;
        }

        Ok(())
    }

    /// Removes every mapping in a range and returns the range to the free pool. Returns
    /// the rounded size.
    pub fn unmap_memory(&self, space: &Arc<AddressSpace>, address: VirtualAddress, size: usize) -> MmResult<usize> {
        let size = user_range(address, size)?;
        if size == 0 {
            return Ok(0);
        }

        self.unmap_sections(space, address, size)?;
        space.release(address, size)?;
        Ok(size)
    }

    /// Changes the protection of a user range.
    pub fn set_memory_protection(
        &self,
        space: &Arc<AddressSpace>,
        address: VirtualAddress,
        size: usize,
        access: MapSyscallFlags,
    ) -> MmResult<()> {
        let size = user_range(address, size)?;
        self.change_region_access(space, address, size, access.section_access())
    }

    /// Writes back the shared, writable file mappings in a range.
    pub fn flush_memory(&self, space: &Arc<AddressSpace>, address: VirtualAddress, size: usize, flags: FlushFlags) -> MmResult<()> {
        let start = address.align_down(PAGE_SIZE);
        let size = size.checked_add(address - start).ok_or(MmError::InvalidParameter)?;
        let size = user_range(start, size)?;
        let end = start + size;
        let wanted = SectionFlags::SHARED | SectionFlags::BACKED | SectionFlags::WAS_WRITABLE;
        for section in space.sections_overlapping(start, size) {
            if !section.flags().contains(wanted) {
                continue;
            }

            let Some(image) = section.image() else {
                continue;
            };

            let base = section.virtual_address();
            let from = start.max(base);
            let to = end.min(base + section.size());
            let offset = image.offset + (from - base) as u64;
            image
                .file()
                .flush(offset, (to - from) as u64, flags.contains(FlushFlags::ASYNC))?;
        }

        Ok(())
    }

    /// Moves the program break. A request outside the heap window, or one that cannot
    /// be satisfied, leaves the break alone. The current break is always returned.
    pub fn set_break(&self, space: &Arc<AddressSpace>, requested: VirtualAddress) -> VirtualAddress {
        let window = space.break_window();
        if requested == VirtualAddress::NULL || requested < window.start || requested.as_usize() > arch::USER_VA_END {
            return window.end;
        }

        let old_end = window.end.align_up(PAGE_SIZE);
        let new_end = requested.align_up(PAGE_SIZE);
        let resized = if new_end > old_end {
            self.grow_heap(space, old_end, new_end - old_end)
        } else if new_end < old_end {
            self.unmap_memory(space, new_end, old_end - new_end).map(|_| ())
        } else {
            Ok(())
        };

        match resized {
            Ok(()) => {
                space.break_window.lock().end = requested;
                requested
            }
            Err(error) => {
                log::debug!("break move to {} failed: {}", requested, error);
                window.end
            }
        }
    }

    fn grow_heap(&self, space: &Arc<AddressSpace>, va: VirtualAddress, size: usize) -> MmResult<()> {
        let reserved = space.reserve(va, size, false)?;
        if reserved != va {
            space.release(reserved, size)?;
            return Err(MmError::InvalidAddressRange);
        }

        let access = SectionFlags::READABLE | SectionFlags::WRITABLE;
        if let Err(error) = self.create_image_section(space, va, size, access, None, MapFlags::empty()) {
            space.release(va, size)?;
            return Err(error);
        }

        Ok(())
    }

    /// Makes instruction fetches see prior writes to a user range.
    pub fn flush_cache(&self, address: VirtualAddress, size: usize) -> MmResult<()> {
        if !address.is_user() {
            return Err(MmError::InvalidParameter);
        }

        let end = address
            .as_usize()
            .saturating_add(size)
            .min(arch::USER_VA_END);

        if end > address.as_usize() {
            arch::sync_instruction_cache(address, end - address.as_usize());
        }

        Ok(())
    }
}
