//! Test harness: an emulated machine carrying a fully assembled memory manager, plus
//! in-memory stand-ins for the page cache, volumes and paging devices.
//!
//! Each test thread owns its emulated memory. Frame zero is never used, the managed
//! frames follow it, and a separate pool at the top feeds the fake page cache so cache
//! pages never show up in the manager's statistics.

use alloc::{boxed::Box, collections::BTreeMap, sync::Arc, vec, vec::Vec};
use core::{
    cell::RefCell,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{
    MapFlags, MmError, MmResult, PAGE_SIZE, PhysicalAddress, SectionFlags, VirtualAddress,
    address::AddressTranslator,
    address_space::AddressSpace,
    arch::{MAX_CPUS, Machine},
    config::VmmConfig,
    io::{CachePage, FileHandle, FileObject, HandleAccess, ImageBacking, ImageSectionList, IoBuffer},
    manager::MemoryManager,
    page_file::{PagingDevice, Volume},
    physical::{FrameAllocator, FreeFrameList, PageOutRequest, PhysicalPages},
    platform::{Platform, RunLevel},
};

/// Processors of the emulated machine.
pub const PROCESSORS: usize = 2;

/// Frames handed to the memory manager.
pub const MANAGED_FRAMES: usize = 2048;

/// Frames reserved for the fake page cache.
const CACHE_FRAMES: usize = 512;

std::thread_local! {
    static CACHE_POOL: RefCell<FreeFrameList> = const { RefCell::new(FreeFrameList::new()) };
}

static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(1);

/// Scheduler stand-in driving the emulated processors.
///
/// Interrupts are delivered synchronously by switching the emulated machine to each
/// processor in turn. Threads are recorded by name and never run.
pub struct TestPlatform {
    processors: usize,
    run_levels: spin::Mutex<[RunLevel; MAX_CPUS]>,
    spawned: spin::Mutex<Vec<&'static str>>,
}

impl TestPlatform {
    pub fn new(processors: usize) -> Self {
        Self {
            processors,
            run_levels: spin::Mutex::new([RunLevel::Low; MAX_CPUS]),
            spawned: spin::Mutex::new(Vec::new()),
        }
    }

    /// Names of the threads started so far.
    pub fn spawned(&self) -> Vec<&'static str> {
        self.spawned.lock().clone()
    }
}

impl Platform for TestPlatform {
    fn processor_count(&self) -> usize {
        self.processors
    }

    fn current_processor(&self) -> usize {
        Machine::try_current().map_or(0, |machine| machine.current_processor())
    }

    fn run_level(&self) -> RunLevel {
        self.run_levels.lock()[self.current_processor()]
    }

    fn raise_run_level(&self, level: RunLevel) -> RunLevel {
        let processor = self.current_processor();
        let mut levels = self.run_levels.lock();
        let previous = levels[processor];
        levels[processor] = previous.max(level);
        previous
    }

    fn lower_run_level(&self, previous: RunLevel) {
        let processor = self.current_processor();
        self.run_levels.lock()[processor] = previous;
    }

    fn send_ipi_to_all(&self, handler: &(dyn Fn() + Sync)) {
        let Some(machine) = Machine::try_current() else {
            handler();
            return;
        };

        let home = machine.current_processor();
        for processor in 0..self.processors {
            machine.set_current_processor(processor);
            handler();
        }

        machine.set_current_processor(home);
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }

    fn spawn_thread(&self, name: &'static str, _entry: Box<dyn FnOnce() + Send>) -> MmResult<()> {
        self.spawned.lock().push(name);
        Ok(())
    }
}

/// A paging device backed by a byte vector.
pub struct MemoryPagingDevice {
    bytes: spin::Mutex<Vec<u8>>,
}

impl MemoryPagingDevice {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: spin::Mutex::new(vec![0; size]),
        }
    }

    fn range(&self, offset: u64, index: usize) -> MmResult<core::ops::Range<usize>> {
        let start = usize::try_from(offset).map_err(|_| MmError::DeviceIo)? + index * PAGE_SIZE;
        let end = start + PAGE_SIZE;
        if end > self.bytes.lock().len() {
            return Err(MmError::DeviceIo);
        }

        Ok(start..end)
    }
}

impl PagingDevice for MemoryPagingDevice {
    fn size(&self) -> u64 {
        self.bytes.lock().len() as u64
    }

    fn block_size(&self) -> usize {
        PAGE_SIZE
    }

    fn read(&self, offset: u64, buffer: &IoBuffer) -> MmResult<()> {
        for (index, fragment) in buffer.fragments().iter().enumerate() {
            let range = self.range(offset, index)?;
            let destination: *mut u8 = AddressTranslator::current().phys_to_ptr(fragment.frame);
            let bytes = self.bytes.lock();
            unsafe { core::ptr::copy_nonoverlapping(bytes[range].as_ptr(), destination, PAGE_SIZE) };
        }

        Ok(())
    }

    fn write(&self, offset: u64, buffer: &IoBuffer) -> MmResult<()> {
        for (index, fragment) in buffer.fragments().iter().enumerate() {
            let range = self.range(offset, index)?;
            let source: *const u8 = AddressTranslator::current().phys_to_ptr(fragment.frame);
            let mut bytes = self.bytes.lock();
            unsafe { core::ptr::copy_nonoverlapping(source, bytes[range].as_mut_ptr(), PAGE_SIZE) };
        }

        Ok(())
    }
}

/// A volume whose page file is a [`MemoryPagingDevice`] of a fixed size.
pub struct TestVolume {
    id: u64,
    system: bool,
    page_file_size: usize,
}

impl TestVolume {
    pub fn new(id: u64, system: bool, page_file_size: usize) -> Self {
        Self {
            id,
            system,
            page_file_size,
        }
    }
}

impl Volume for TestVolume {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_system(&self) -> bool {
        self.system
    }

    fn open_page_file(&self, name: &str) -> MmResult<Arc<dyn PagingDevice>> {
        if name != VmmConfig::PAGE_FILE_NAME {
            return Err(MmError::NotFound);
        }

        Ok(Arc::new(MemoryPagingDevice::new(self.page_file_size)))
    }
}

struct TestFileState {
    stored: Vec<u8>,
    cache: BTreeMap<u64, PhysicalAddress>,
    dirty: Vec<u64>,
}

/// A file with an optional page cache.
///
/// `stored` is what the disk holds; cache pages are filled from it on first use and
/// written back only by [`FileObject::flush`].
pub struct TestFile {
    id: u64,
    cacheable: bool,
    state: spin::Mutex<TestFileState>,
    sections: ImageSectionList,
}

impl TestFile {
    /// A cacheable file holding `bytes`.
    pub fn cached(bytes: &[u8]) -> Arc<Self> {
        Self::create(bytes, true)
    }

    /// A file that is read directly and never cached.
    pub fn uncached(bytes: &[u8]) -> Arc<Self> {
        Self::create(bytes, false)
    }

    fn create(bytes: &[u8], cacheable: bool) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed),
            cacheable,
            state: spin::Mutex::new(TestFileState {
                stored: bytes.to_vec(),
                cache: BTreeMap::new(),
                dirty: Vec::new(),
            }),
            sections: ImageSectionList::new(),
        })
    }

    /// The file as readers see it: stored bytes overlaid with the cache.
    pub fn contents(&self) -> Vec<u8> {
        let state = self.state.lock();
        let mut bytes = state.stored.clone();
        for (&offset, &frame) in &state.cache {
            let start = offset as usize;
            let end = (start + PAGE_SIZE).min(bytes.len());
            let source: *const u8 = AddressTranslator::current().phys_to_ptr(frame);
            unsafe { core::ptr::copy_nonoverlapping(source, bytes[start..end].as_mut_ptr(), end - start) };
        }

        bytes
    }

    /// The bytes on disk.
    pub fn stored(&self) -> Vec<u8> {
        self.state.lock().stored.clone()
    }

    /// Offsets reported through [`FileObject::mark_dirty`].
    pub fn dirty_offsets(&self) -> Vec<u64> {
        self.state.lock().dirty.clone()
    }
}

impl FileObject for TestFile {
    fn id(&self) -> u64 {
        self.id
    }

    fn size(&self) -> u64 {
        self.state.lock().stored.len() as u64
    }

    fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    fn cache_page(&self, offset: u64) -> MmResult<CachePage> {
        if !self.cacheable {
            return Err(MmError::NotSupported);
        }

        assert!(offset % PAGE_SIZE as u64 == 0, "unaligned cache offset {:#x}", offset);
        let mut state = self.state.lock();
        if offset >= state.stored.len() as u64 {
            return Err(MmError::EndOfFile);
        }

        if let Some(&frame) = state.cache.get(&offset) {
            return Ok(CachePage::new(frame, None));
        }

        let frame = CACHE_POOL
            .with(|pool| pool.borrow_mut().allocate())
            .ok_or(MmError::ResourceExhausted)?;

        let start = offset as usize;
        let end = (start + PAGE_SIZE).min(state.stored.len());
        let destination: *mut u8 = AddressTranslator::current().phys_to_ptr(frame);
        unsafe {
            destination.write_bytes(0, PAGE_SIZE);
            core::ptr::copy_nonoverlapping(state.stored[start..end].as_ptr(), destination, end - start);
        }

        state.cache.insert(offset, frame);
        Ok(CachePage::new(frame, None))
    }

    fn read(&self, offset: u64, buffer: &mut [u8]) -> MmResult<usize> {
        let contents = self.contents();
        if offset >= contents.len() as u64 {
            return Err(MmError::EndOfFile);
        }

        let start = offset as usize;
        let count = buffer.len().min(contents.len() - start);
        buffer[..count].copy_from_slice(&contents[start..start + count]);
        Ok(count)
    }

    fn flush(&self, offset: u64, size: u64, _asynchronous: bool) -> MmResult<()> {
        let mut state = self.state.lock();
        let end = offset.saturating_add(size);
        let pages: Vec<(u64, PhysicalAddress)> = state
            .cache
            .range(offset & !(PAGE_SIZE as u64 - 1)..end)
            .map(|(&offset, &frame)| (offset, frame))
            .collect();

        for (page, frame) in pages {
            let start = page as usize;
            let stop = (start + PAGE_SIZE).min(state.stored.len());
            let source: *const u8 = AddressTranslator::current().phys_to_ptr(frame);
            unsafe { core::ptr::copy_nonoverlapping(source, state.stored[start..stop].as_mut_ptr(), stop - start) };
        }

        Ok(())
    }

    fn mark_dirty(&self, offset: u64) {
        self.state.lock().dirty.push(offset);
    }

    fn image_sections(&self) -> &ImageSectionList {
        &self.sections
    }
}

impl Drop for TestFile {
    fn drop(&mut self) {
        if AddressTranslator::try_current().is_none() {
            return;
        }

        let frames: Vec<PhysicalAddress> = self.state.get_mut().cache.values().copied().collect();
        let _ = CACHE_POOL.try_with(|pool| {
            let mut pool = pool.borrow_mut();
            for frame in frames {
                pool.free(frame);
            }
        });
    }
}

/// A memory manager running on a freshly installed emulated machine.
pub struct TestSystem {
    pub manager: Arc<MemoryManager>,
    pub platform: Arc<TestPlatform>,
}

impl TestSystem {
    /// Installs the emulated memory and machine for this thread and brings the memory
    /// manager up on it with the kernel root loaded on every processor.
    pub fn new() -> Self {
        let memory = (1 + MANAGED_FRAMES + CACHE_FRAMES) * PAGE_SIZE;
        AddressTranslator::set_current(AddressTranslator::emulated(memory));
        Machine::install(Machine::new(PROCESSORS));

        let platform = Arc::new(TestPlatform::new(PROCESSORS));
        let base = PhysicalAddress::new(PAGE_SIZE);
        let config = VmmConfig::default();
        let physical = Arc::new(PhysicalPages::new(
            Box::new(FreeFrameList::from_range(base, MANAGED_FRAMES)),
            base,
            MANAGED_FRAMES,
            &config,
            Arc::new(PageOutRequest::new()),
            platform.clone(),
        ));

        let manager = MemoryManager::new(config, platform.clone(), physical, None).unwrap();
        let machine = Machine::current();
        for processor in 1..PROCESSORS {
            machine.set_current_processor(processor);
            manager.activate_address_space(&manager.kernel_space);
        }

        machine.set_current_processor(0);
        let cache = base + MANAGED_FRAMES * PAGE_SIZE;
        CACHE_POOL.with(|pool| *pool.borrow_mut() = FreeFrameList::from_range(cache, CACHE_FRAMES));
        Self { manager, platform }
    }

    pub fn create_process(&self) -> Arc<AddressSpace> {
        self.manager.create_address_space().unwrap()
    }

    /// Loads `space` on the executing processor.
    pub fn switch_to(&self, space: &AddressSpace) {
        self.manager.activate_address_space(space);
    }

    pub fn switch_to_kernel(&self) {
        self.manager.activate_address_space(&self.manager.kernel_space);
    }

    /// Reserves `size` bytes anywhere in `space` and covers them with an anonymous
    /// section.
    pub fn map_anonymous(&self, space: &Arc<AddressSpace>, size: usize, flags: SectionFlags) -> VirtualAddress {
        let va = space.reserve(VirtualAddress::NULL, size, false).unwrap();
        self.manager
            .create_image_section(space, va, size, flags, None, MapFlags::empty())
            .unwrap();
        va
    }

    /// Maps `size` bytes of `file` starting at `offset` anywhere in `space`.
    pub fn map_file(
        &self,
        space: &Arc<AddressSpace>,
        file: &Arc<TestFile>,
        access: HandleAccess,
        offset: u64,
        size: usize,
        flags: SectionFlags,
    ) -> VirtualAddress {
        let va = space.reserve(VirtualAddress::NULL, size, false).unwrap();
        let image = self.backing(file, access, offset);
        self.manager
            .create_image_section(space, va, size, flags, Some(image), MapFlags::empty())
            .unwrap();
        va
    }

    pub fn backing(&self, file: &Arc<TestFile>, access: HandleAccess, offset: u64) -> ImageBacking {
        ImageBacking {
            handle: FileHandle::new(file.clone(), access),
            offset,
        }
    }

    /// Writes user memory the way a user thread of `space` would, loading it first.
    pub fn write_user(&self, space: &Arc<AddressSpace>, va: VirtualAddress, data: &[u8]) {
        self.switch_to(space);
        self.manager.copy_to_user(space, va, data).unwrap();
    }

    /// Reads user memory of `space`, loading it first.
    pub fn read_user(&self, space: &Arc<AddressSpace>, va: VirtualAddress, len: usize) -> Vec<u8> {
        self.switch_to(space);
        let mut buffer = vec![0; len];
        self.manager.copy_from_user(space, va, &mut buffer).unwrap();
        buffer
    }
}
