//! Page files.
//!
//! A page file is a flat file with no header: page `n` lives at byte `n * PAGE_SIZE`.
//! Occupancy is tracked by an in-memory bitmap whose length is the file's page count
//! rounded down to a multiple of 32. Sections reserve page file space for their whole
//! size at their first page-out and keep it for life.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::{
    MmError, MmResult, PAGE_SIZE,
    bitmap::Bitmap,
    io::IoBuffer,
    manager::MemoryManager,
};

/// Page counts are rounded down to a multiple of this.
pub const PAGE_FILE_GRANULE: usize = 32;

/// Storage a page file is opened on.
pub trait PagingDevice: Send + Sync {
    /// Size of the file in bytes.
    fn size(&self) -> u64;

    /// Block size of the underlying file system.
    fn block_size(&self) -> usize;

    /// Reads `buffer.size()` bytes at `offset` into the buffer's frames.
    fn read(&self, offset: u64, buffer: &IoBuffer) -> MmResult<()>;

    /// Writes the buffer's frames at `offset`.
    fn write(&self, offset: u64, buffer: &IoBuffer) -> MmResult<()>;
}

/// A mounted volume that may carry a page file.
pub trait Volume: Send + Sync {
    fn id(&self) -> u64;

    /// Returns true for the volume the system booted from.
    fn is_system(&self) -> bool;

    /// Opens the named file at the volume root for paging.
    fn open_page_file(&self, name: &str) -> MmResult<Arc<dyn PagingDevice>>;
}

struct PageFileState {
    bitmap: Bitmap,
    hint: usize,
    free: usize,
    failed_allocations: usize,
}

/// Page file statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFileStatistics {
    pub total: usize,
    pub free: usize,
    pub failed_allocations: usize,
}

/// One page file.
pub struct PageFile {
    device: Arc<dyn PagingDevice>,
    volume_id: u64,
    page_count: usize,
    state: spin::Mutex<PageFileState>,
    /// Serialises writes, which become read-modify-write when the file system block is
    /// larger than a page.
    io_lock: spin::Mutex<()>,
}

impl PageFile {
    /// Creates a page file over `device`. Fails if the device holds fewer than
    /// [`PAGE_FILE_GRANULE`] pages.
    pub fn new(device: Arc<dyn PagingDevice>, volume_id: u64) -> MmResult<Self> {
        let pages = usize::try_from(device.size() / PAGE_SIZE as u64).map_err(|_| MmError::InvalidParameter)?;
        let page_count = pages - pages % PAGE_FILE_GRANULE;
        if page_count == 0 {
            return Err(MmError::InvalidParameter);
        }

        Ok(Self {
            device,
            volume_id,
            page_count,
            state: spin::Mutex::new(PageFileState {
                bitmap: Bitmap::new(page_count, false)?,
                hint: 0,
                free: page_count,
                failed_allocations: 0,
            }),
            io_lock: spin::Mutex::new(()),
        })
    }

    pub fn volume_id(&self) -> u64 {
        self.volume_id
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn statistics(&self) -> PageFileStatistics {
        let state = self.state.lock();
        PageFileStatistics {
            total: self.page_count,
            free: state.free,
            failed_allocations: state.failed_allocations,
        }
    }

    /// Number of pages currently allocated.
    pub fn used(&self) -> usize {
        self.state.lock().bitmap.count_ones()
    }

    /// Allocates `count` consecutive pages, returning the first.
    pub fn allocate(&self, count: usize) -> Option<usize> {
        let mut state = self.state.lock();
        let hint = state.hint;
        match state.bitmap.find_clear_run(count, hint) {
            Some(first) => {
                state.bitmap.set_range(first, count, true);
                state.free -= count;
                state.hint = (first + count) % self.page_count;
                Some(first)
            }
            None => {
                state.failed_allocations += 1;
                None
            }
        }
    }

    /// Frees `count` pages starting at `first`, all of which must be allocated.
    pub fn free(&self, first: usize, count: usize) {
        let mut state = self.state.lock();
        for page in first..first + count {
            assert!(state.bitmap.get(page), "page file page {} freed twice", page);
        }

        state.bitmap.set_range(first, count, false);
        state.free += count;
    }

    /// Reads pages starting at `page` into the buffer.
    pub fn read(&self, page: usize, buffer: &IoBuffer) -> MmResult<()> {
        debug_assert!(page + buffer.len() <= self.page_count);
        self.device.read((page * PAGE_SIZE) as u64, buffer)
    }

    /// Writes the buffer to pages starting at `page`.
    pub fn write(&self, page: usize, buffer: &IoBuffer) -> MmResult<()> {
        debug_assert!(page + buffer.len() <= self.page_count);
        let _io = self.io_lock.lock();
        self.device.write((page * PAGE_SIZE) as u64, buffer)
    }
}

/// A run of page file pages owned by one section.
#[derive(Clone)]
pub struct PageFileSpace {
    pub file: Arc<PageFile>,
    pub first_page: usize,
}

impl core::fmt::Debug for PageFileSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PageFileSpace(volume {}, page {})", self.file.volume_id(), self.first_page)
    }
}

struct PageFileListState {
    files: Vec<Arc<PageFile>>,
    thread_started: bool,
}

/// Every page file in the system.
pub struct PageFileList {
    state: spin::Mutex<PageFileListState>,
    paging_enabled: AtomicBool,
}

impl PageFileList {
    pub const fn new() -> Self {
        Self {
            state: spin::Mutex::new(PageFileListState {
                files: Vec::new(),
                thread_started: false,
            }),
            paging_enabled: AtomicBool::new(false),
        }
    }

    pub fn paging_enabled(&self) -> bool {
        self.paging_enabled.load(Ordering::Acquire)
    }

    pub fn files(&self) -> Vec<Arc<PageFile>> {
        self.state.lock().files.clone()
    }

    /// Reserves `count` pages from the first page file with room.
    pub fn allocate_space(&self, count: usize) -> MmResult<PageFileSpace> {
        for file in self.files() {
            if let Some(first_page) = file.allocate(count) {
                return Ok(PageFileSpace { file, first_page });
            }
        }

        Err(MmError::ResourceExhausted)
    }

    /// Frees `count` pages of a reservation starting `skip` pages into it.
    pub fn free_space(space: &PageFileSpace, skip: usize, count: usize) {
        if count != 0 {
            space.file.free(space.first_page + skip, count);
        }
    }
}

impl Default for PageFileList {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryManager {
    /// Handles a volume becoming available: opens its page file if policy allows and
    /// starts the paging thread the first time paging becomes possible.
    pub fn volume_arrival(self: &Arc<Self>, volume: &dyn Volume) -> MmResult<()> {
        if self.config.paging_force_disabled {
            return Ok(());
        }

        if !volume.is_system() && !self.config.paging_on_all_volumes {
            return Ok(());
        }

        let device = volume.open_page_file(self.config.page_file_name)?;
        let file = Arc::new(PageFile::new(device, volume.id())?);
        let pages = file.page_count();
        let start_thread = {
            let mut state = self.page_files.state.lock();
            state.files.push(file);
            self.page_files.paging_enabled.store(true, Ordering::Release);
            !core::mem::replace(&mut state.thread_started, true)
        };

        log::info!("page file on volume {} online with {} pages", volume.id(), pages);
        if start_thread {
            let manager = self.clone();
            let entry: Box<dyn FnOnce() + Send> = Box::new(move || manager.paging_thread());
            if let Err(error) = self.platform.spawn_thread("paging", entry) {
                log::error!("failed to start the paging thread: {}", error);
                self.page_files.state.lock().thread_started = false;
                return Err(error);
            }
        }

        Ok(())
    }

    /// Handles a volume going away. Removing a page file that still holds pages loses
    /// data that cannot be recovered, so that is fatal.
    pub fn volume_removal(&self, volume: &dyn Volume) -> MmResult<()> {
        let mut state = self.page_files.state.lock();
        let Some(index) = state
            .files
            .iter()
            .position(|file| file.volume_id() == volume.id())
        else {
            return Ok(());
        };

        let used = state.files[index].used();
        if used != 0 {
            panic!("volume {} removed with {} page file pages in use", volume.id(), used);
        }

        state.files.remove(index);
        if state.files.is_empty() {
            self.page_files.paging_enabled.store(false, Ordering::Release);
        }

        log::info!("page file on volume {} removed", volume.id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryPagingDevice, TestSystem, TestVolume};

    #[test]
    fn page_count_rounds_down_to_granule() {
        let device = Arc::new(MemoryPagingDevice::new(100 * PAGE_SIZE + 17));
        let file = PageFile::new(device, 1).unwrap();
        assert_eq!(file.page_count(), 96);

        let tiny = Arc::new(MemoryPagingDevice::new(31 * PAGE_SIZE));
        assert_eq!(PageFile::new(tiny, 2).err(), Some(MmError::InvalidParameter));
    }

    #[test]
    fn allocation_uses_hint_and_counts_failures() {
        let file = PageFile::new(Arc::new(MemoryPagingDevice::new(64 * PAGE_SIZE)), 1).unwrap();
        let first = file.allocate(40).unwrap();
        let second = file.allocate(10).unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, 40);
        assert_eq!(file.allocate(20), None);

        let stats = file.statistics();
        assert_eq!(stats.failed_allocations, 1);
        assert_eq!(stats.free + file.used(), stats.total);

        file.free(first, 40);
        assert_eq!(file.allocate(20), Some(0));
        let stats = file.statistics();
        assert_eq!(stats.free + file.used(), stats.total);
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn double_free_is_fatal() {
        let file = PageFile::new(Arc::new(MemoryPagingDevice::new(32 * PAGE_SIZE)), 1).unwrap();
        let first = file.allocate(2).unwrap();
        file.free(first, 2);
        file.free(first, 1);
    }

    #[test]
    fn io_round_trips_through_device() {
        let system = TestSystem::new();
        let file = PageFile::new(Arc::new(MemoryPagingDevice::new(32 * PAGE_SIZE)), 1).unwrap();
        let source = system.manager.physical.allocate(true).unwrap();
        let destination = system.manager.physical.allocate_zeroed(true).unwrap();
        let pointer: *mut u8 = crate::AddressTranslator::current().phys_to_ptr(source);
        unsafe { pointer.write_bytes(0x5A, PAGE_SIZE) };

        file.write(3, &IoBuffer::single(source).unwrap()).unwrap();
        file.read(3, &IoBuffer::single(destination).unwrap()).unwrap();
        let result: *const u8 = crate::AddressTranslator::current().phys_to_ptr(destination + 100);
        assert_eq!(unsafe { result.read() }, 0x5A);
    }

    #[test]
    fn arrival_policy_and_removal() {
        let system = TestSystem::new();
        let data = TestVolume::new(7, false, 64 * PAGE_SIZE);
        system.manager.volume_arrival(&data).unwrap();
        assert!(!system.manager.page_files.paging_enabled());

        let boot = TestVolume::new(1, true, 64 * PAGE_SIZE);
        system.manager.volume_arrival(&boot).unwrap();
        assert!(system.manager.page_files.paging_enabled());
        assert_eq!(system.platform.spawned(), alloc::vec!["paging"]);

        system.manager.volume_removal(&data).unwrap();
        assert!(system.manager.page_files.paging_enabled());
        system.manager.volume_removal(&boot).unwrap();
        assert!(!system.manager.page_files.paging_enabled());
    }

    #[test]
    #[should_panic(expected = "page file pages in use")]
    fn removing_a_busy_page_file_is_fatal() {
        let system = TestSystem::new();
        let boot = TestVolume::new(1, true, 64 * PAGE_SIZE);
        system.manager.volume_arrival(&boot).unwrap();
        let _space = system.manager.page_files.allocate_space(4).unwrap();
        let _ = system.manager.volume_removal(&boot);
    }
}
