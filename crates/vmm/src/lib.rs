#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Polaris Virtual Memory Manager (VMM)
//!
//! The virtual memory core of the Polaris kernel. It provides:
//!
//! - Per-process address spaces with a red-black tree accountant of reserved ranges.
//! - Image sections: anonymous, private file-backed and shared page-cache mappings with
//!   demand paging and copy-on-write across fork.
//! - Page-out of pageable frames to page files on mounted volumes.
//! - Page table maintenance through a self-map, with TLB shootdowns between processors.
//! - The memory system calls, page fault resolution and kernel access to user memory.
//! - A software model of the MMU so the whole engine runs on a host for testing.

extern crate alloc;

mod address;
mod address_space;
mod arch;
mod bitmap;
mod config;
mod cow;
mod error;
mod fault;
mod flags;
mod frame;
mod io;
mod manager;
mod mapping;
mod mdl;
mod numbers;
mod page_file;
mod page_in;
mod page_out;
mod paging_entry;
mod physical;
mod platform;
mod section;
mod sync;
mod syscalls;
mod tlb;
mod usercopy;

#[cfg(test)]
mod testing;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use address_space::{AddressSpace, BreakWindow};
pub use config::VmmConfig;
pub use error::{MmError, MmResult, status_of};
pub use fault::{FaultResolution, PageFault, RecoveryRegion};
pub use flags::{MapFlags, SectionFlags, UnmapFlags};
pub use io::{CachePage, FileHandle, FileObject, HandleAccess, ImageBacking, ImageSectionList, IoBuffer, IoFragment};
pub use manager::MemoryManager;
pub use mapping::{UnmappedPage, modify_mapping_for_debugger, validate_memory_access_for_debugger};
pub use mdl::{
    AllocationSource, AllocationStrategy, DescriptorType, MemoryDescriptor, MemoryDescriptorList,
};
pub use numbers::FrameNumber;
pub use page_file::{PageFile, PageFileStatistics, PagingDevice, Volume};
pub use page_in::LockedPage;
pub use physical::{
    FrameAllocator, FreeFrameList, MemoryWarning, PageOutRequest, PhysicalPages, PhysicalStatistics,
};
pub use platform::{Platform, RunLevel, RunLevelGuard};
pub use section::{ImageSection, UnmapSectionFlags};
pub use syscalls::{FlushFlags, MapRequest, MapSyscallFlags};

pub use arch::PAGE_SIZE;
