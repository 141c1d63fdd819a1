//! The memory manager's view of files, the page cache and I/O buffers.
//!
//! Files and their page cache live outside this crate. A [`FileObject`] hands out
//! cache pages (frames the cache owns), reads bytes for files that are not cached,
//! flushes dirty cache pages and keeps the list of image sections mapping it so that
//! truncation can reach them.

use alloc::{sync::Arc, vec::Vec};
use core::any::Any;

use bitflags::bitflags;

use crate::{
    MmError, MmResult, PAGE_SIZE, PhysicalAddress, VirtualAddress,
    manager::MemoryManager,
    physical::{PhysicalPages, copy_frame},
    section::{ImageSection, UnmapSectionFlags},
};

/// A page of the page cache, pinned for as long as this value lives.
#[derive(Clone)]
pub struct CachePage {
    frame: PhysicalAddress,
    _pin: Option<Arc<dyn Any + Send + Sync>>,
}

impl CachePage {
    /// Wraps a cache frame. The cache cannot evict the frame while `pin` is alive.
    pub fn new(frame: PhysicalAddress, pin: Option<Arc<dyn Any + Send + Sync>>) -> Self {
        Self { frame, _pin: pin }
    }

    pub fn frame(&self) -> PhysicalAddress {
        self.frame
    }
}

impl core::fmt::Debug for CachePage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "CachePage({})", self.frame)
    }
}

/// A file that image sections can map.
///
/// Writes through a shared mapping land directly in cache pages. The memory manager
/// reports them with [`FileObject::mark_dirty`] when it grants write access to a page
/// and when it tears down a dirty mapping; the cache tracks dirtiness from there.
pub trait FileObject: Send + Sync {
    /// Identifier used in log messages.
    fn id(&self) -> u64;

    /// Current size in bytes.
    fn size(&self) -> u64;

    /// Returns true if pages of this file live in the page cache.
    fn is_cacheable(&self) -> bool;

    /// Returns the cache page holding the page-aligned `offset`.
    ///
    /// Fails with `EndOfFile` when `offset` is at or past the end of the file.
    fn cache_page(&self, offset: u64) -> MmResult<CachePage>;

    /// Reads bytes at `offset`, returning how many were read. Used for files that are
    /// not cacheable.
    fn read(&self, offset: u64, buffer: &mut [u8]) -> MmResult<usize>;

    /// Writes dirty cache pages in `[offset, offset + size)` back to storage.
    fn flush(&self, offset: u64, size: u64, asynchronous: bool) -> MmResult<()>;

    /// Records that the cache page at `offset` was written through a mapping.
    fn mark_dirty(&self, offset: u64);

    /// Sections currently mapping this file.
    fn image_sections(&self) -> &ImageSectionList;
}

bitflags! {
    /// Access granted by a file handle.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct HandleAccess: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// An open file.
#[derive(Clone)]
pub struct FileHandle {
    pub file: Arc<dyn FileObject>,
    pub access: HandleAccess,
}

impl FileHandle {
    pub fn new(file: Arc<dyn FileObject>, access: HandleAccess) -> Self {
        Self { file, access }
    }
}

/// File backing of an image section.
#[derive(Clone)]
pub struct ImageBacking {
    pub handle: FileHandle,
    /// Byte offset of the section's first page within the file.
    pub offset: u64,
}

impl ImageBacking {
    /// File offset of page `page` of the section.
    pub fn page_offset(&self, page: usize) -> u64 {
        self.offset + (page * PAGE_SIZE) as u64
    }

    pub fn file(&self) -> &Arc<dyn FileObject> {
        &self.handle.file
    }
}

/// One page of an [`IoBuffer`]: a frame, and where it is mapped if anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoFragment {
    pub frame: PhysicalAddress,
    pub va: Option<VirtualAddress>,
}

/// A list of page-sized physical fragments to transfer.
#[derive(Debug, Default)]
pub struct IoBuffer {
    fragments: Vec<IoFragment>,
}

impl IoBuffer {
    pub const fn new() -> Self {
        Self {
            fragments: Vec::new(),
        }
    }

    /// A buffer over a single frame.
    pub fn single(frame: PhysicalAddress) -> MmResult<Self> {
        let mut buffer = Self::new();
        buffer.push(frame, None)?;
        Ok(buffer)
    }

    pub fn push(&mut self, frame: PhysicalAddress, va: Option<VirtualAddress>) -> MmResult<()> {
        self.fragments
            .try_reserve(1)
            .map_err(|_| MmError::ResourceExhausted)?;

        self.fragments.push(IoFragment { frame, va });
        Ok(())
    }

    pub fn fragments(&self) -> &[IoFragment] {
        &self.fragments
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Total size in bytes.
    pub fn size(&self) -> usize {
        self.fragments.len() * PAGE_SIZE
    }

    pub fn clear(&mut self) {
        self.fragments.clear();
    }
}

/// The sections mapping one file.
#[derive(Default)]
pub struct ImageSectionList(spin::Mutex<Vec<Arc<ImageSection>>>);

impl ImageSectionList {
    pub const fn new() -> Self {
        Self(spin::Mutex::new(Vec::new()))
    }

    pub(crate) fn add(&self, section: Arc<ImageSection>) {
        self.0.lock().push(section);
    }

    pub(crate) fn remove(&self, section: &ImageSection) {
        let removed = {
            let mut sections = self.0.lock();
            sections
                .iter()
                .position(|other| core::ptr::eq(Arc::as_ptr(other), section))
                .map(|index| sections.swap_remove(index))
        };

        drop(removed);
    }

    pub fn snapshot(&self) -> Vec<Arc<ImageSection>> {
        self.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

impl MemoryManager {
    /// Unmaps the pages overlapping file bytes `[offset, offset + size)` from every
    /// section mapping the file.
    ///
    /// Every section is visited even if one fails; the first error is returned.
    pub fn unmap_image_section_list(
        &self,
        list: &ImageSectionList,
        offset: u64,
        size: u64,
        flags: UnmapSectionFlags,
    ) -> MmResult<()> {
        let end = offset.saturating_add(size);
        let mut result = Ok(());
        for section in list.snapshot() {
            let outcome = self.unmap_file_range(&section, offset, end, flags);
            if result.is_ok() {
                result = outcome;
            }
        }

        result
    }
}

/// Anonymous memory shared between mappings, presented to the section engine as a
/// cacheable file whose pages are zero-filled on first use and never written back.
pub struct SharedMemoryObject {
    id: u64,
    size: u64,
    physical: Arc<PhysicalPages>,
    pages: spin::Mutex<Vec<Option<PhysicalAddress>>>,
    sections: ImageSectionList,
}

impl SharedMemoryObject {
    pub(crate) fn new(id: u64, size: u64, physical: Arc<PhysicalPages>) -> MmResult<Self> {
        let count = usize::try_from(size.div_ceil(PAGE_SIZE as u64)).map_err(|_| MmError::InvalidParameter)?;
        let mut pages = Vec::new();
        pages
            .try_reserve_exact(count)
            .map_err(|_| MmError::ResourceExhausted)?;

        pages.resize(count, None);
        Ok(Self {
            id,
            size,
            physical,
            pages: spin::Mutex::new(pages),
            sections: ImageSectionList::new(),
        })
    }
}

impl FileObject for SharedMemoryObject {
    fn id(&self) -> u64 {
        self.id
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn is_cacheable(&self) -> bool {
        true
    }

    fn cache_page(&self, offset: u64) -> MmResult<CachePage> {
        if offset >= self.size {
            return Err(MmError::EndOfFile);
        }

        let index = (offset / PAGE_SIZE as u64) as usize;
        if let Some(frame) = self.pages.lock()[index] {
            return Ok(CachePage::new(frame, None));
        }

        let frame = self.physical.allocate_zeroed(true)?;
        let mut pages = self.pages.lock();
        match pages[index] {
            Some(existing) => {
                drop(pages);
                self.physical.free(frame);
                Ok(CachePage::new(existing, None))
            }
            None => {
                pages[index] = Some(frame);
                Ok(CachePage::new(frame, None))
            }
        }
    }

    fn read(&self, offset: u64, buffer: &mut [u8]) -> MmResult<usize> {
        if offset >= self.size {
            return Err(MmError::EndOfFile);
        }

        let available = (self.size - offset).min(buffer.len() as u64) as usize;
        let mut done = 0;
        while done < available {
            let position = offset + done as u64;
            let page = self.cache_page(position & !(PAGE_SIZE as u64 - 1))?;
            let within = (position % PAGE_SIZE as u64) as usize;
            let chunk = (PAGE_SIZE - within).min(available - done);
            let source: *const u8 = crate::AddressTranslator::current().phys_to_ptr(page.frame() + within);
            unsafe { core::ptr::copy_nonoverlapping(source, buffer[done..].as_mut_ptr(), chunk) };
            done += chunk;
        }

        Ok(done)
    }

    fn flush(&self, _offset: u64, _size: u64, _asynchronous: bool) -> MmResult<()> {
        Ok(())
    }

    fn mark_dirty(&self, _offset: u64) {}

    fn image_sections(&self) -> &ImageSectionList {
        &self.sections
    }
}

impl Drop for SharedMemoryObject {
    fn drop(&mut self) {
        for frame in self.pages.get_mut().drain(..).flatten() {
            self.physical.free(frame);
        }
    }
}

/// Copies a whole cache page into a private frame.
pub(crate) fn copy_cache_page(page: &CachePage, destination: PhysicalAddress) {
    copy_frame(page.frame(), destination);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestSystem;

    #[test]
    fn io_buffer_collects_fragments() {
        let mut buffer = IoBuffer::new();
        buffer.push(PhysicalAddress::new(0x1000), None).unwrap();
        buffer
            .push(PhysicalAddress::new(0x5000), Some(VirtualAddress::new(0x40_0000)))
            .unwrap();

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.size(), 2 * PAGE_SIZE);
        assert_eq!(buffer.fragments()[1].va, Some(VirtualAddress::new(0x40_0000)));
        buffer.clear();
        assert!(buffer.is_empty());
    }

    #[test]
    fn shared_memory_pages_are_zeroed_and_stable() {
        let system = TestSystem::new();
        let before = system.manager.physical.free_frames();
        let object = SharedMemoryObject::new(1, 3 * PAGE_SIZE as u64 - 10, system.manager.physical.clone()).unwrap();
        let first = object.cache_page(PAGE_SIZE as u64).unwrap();
        let again = object.cache_page(PAGE_SIZE as u64).unwrap();
        assert_eq!(first.frame(), again.frame());
        assert_eq!(object.cache_page(3 * PAGE_SIZE as u64).unwrap_err(), MmError::EndOfFile);

        let mut bytes = [0xFFu8; 16];
        assert_eq!(object.read(PAGE_SIZE as u64, &mut bytes).unwrap(), 16);
        assert_eq!(bytes, [0; 16]);

        drop(object);
        assert_eq!(system.manager.physical.free_frames(), before);
    }
}
