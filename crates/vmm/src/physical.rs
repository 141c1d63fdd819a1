//! Adapter over the external physical frame allocator.
//!
//! The raw allocator only knows how to hand out and take back frames. This layer adds
//! the per-frame metadata the memory manager needs: whether the frame is non-paged,
//! which paging entry (if any) makes it pageable, and the lock count that pins it in
//! memory while I/O or a fault handler is using it. It also keeps the statistics that
//! drive the physical memory warning levels and picks victims for the paging thread.

use alloc::{
    boxed::Box,
    sync::{Arc, Weak},
};
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::{
    AddressTranslator, FrameNumber, MmError, MmResult, PAGE_SIZE, PhysicalAddress,
    config::VmmConfig,
    frame::{Frame, FrameFlag},
    paging_entry::{PagingEntry, PagingEntryFlags, PagingEntryId, PagingEntryPool},
    platform::Platform,
    section::ImageSection,
    sync::Event,
};

/// Contract of the external frame allocator.
pub trait FrameAllocator: Send {
    /// Takes one free frame.
    fn allocate(&mut self) -> Option<PhysicalAddress>;

    /// Returns a frame previously handed out by [`FrameAllocator::allocate`].
    fn free(&mut self, frame: PhysicalAddress);

    /// Number of frames currently free.
    fn free_count(&self) -> usize;
}

/// Frame allocator that threads its free list through the free frames themselves.
///
/// Each free frame stores the address of the next one in its first word, reached
/// through the [`AddressTranslator`]. Frame zero can never be handed to it since zero
/// terminates the list.
pub struct FreeFrameList {
    head: Option<PhysicalAddress>,
    count: usize,
}

impl FreeFrameList {
    /// Creates an empty list.
    pub const fn new() -> Self {
        Self {
            head: None,
            count: 0,
        }
    }

    /// Creates a list holding `count` frames starting at `start`.
    pub fn from_range(start: PhysicalAddress, count: usize) -> Self {
        let mut list = Self::new();
        for index in (0..count).rev() {
            list.free(start + index * PAGE_SIZE);
        }

        list
    }
}

impl Default for FreeFrameList {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAllocator for FreeFrameList {
    fn allocate(&mut self) -> Option<PhysicalAddress> {
        let frame = self.head?;
        let link: *mut u64 = AddressTranslator::current().phys_to_ptr(frame);
        let next = unsafe { link.read_volatile() } as usize;
        self.head = (next != 0).then(|| PhysicalAddress::new(next));
        self.count -= 1;
        Some(frame)
    }

    fn free(&mut self, frame: PhysicalAddress) {
        assert!(
            frame.as_usize() != 0 && frame.is_page_aligned(),
            "invalid frame {} returned to the free list",
            frame
        );

        let link: *mut u64 = AddressTranslator::current().phys_to_ptr(frame);
        let next = self.head.map_or(0, |head| head.as_u64());
        unsafe { link.write_volatile(next) };
        self.head = Some(frame);
        self.count += 1;
    }

    fn free_count(&self) -> usize {
        self.count
    }
}

/// Physical memory warning levels. Level 1 is the most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemoryWarning {
    None = 0,
    Level2 = 2,
    Level1 = 1,
}

impl MemoryWarning {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Level1,
            2 => Self::Level2,
            _ => Self::None,
        }
    }

    fn severity(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Level2 => 1,
            Self::Level1 => 2,
        }
    }
}

/// A request to the paging thread to free up memory.
pub struct PageOutRequest {
    target: AtomicUsize,
    /// Signaled to wake the paging thread.
    pub event: Event,
    /// Signaled by the paging thread as pages become free.
    pub pages_freed: Event,
}

impl PageOutRequest {
    pub const fn new() -> Self {
        Self {
            target: AtomicUsize::new(0),
            event: Event::new(false),
            pages_freed: Event::new(false),
        }
    }

    /// Asks for at least `free_pages_target` free frames.
    pub fn request(&self, free_pages_target: usize) {
        self.target.fetch_max(free_pages_target, Ordering::AcqRel);
        self.pages_freed.unsignal();
        self.event.signal();
    }

    /// Reads and resets the requested target.
    pub fn take_target(&self) -> usize {
        self.target.swap(0, Ordering::AcqRel)
    }

    /// Returns the pending target without resetting it.
    pub fn target(&self) -> usize {
        self.target.load(Ordering::Acquire)
    }
}

impl Default for PageOutRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// A frame picked for eviction, with a snapshot of its paging entry.
#[derive(Debug, Clone)]
pub struct PageOutCandidate {
    pub frame: PhysicalAddress,
    pub entry: PagingEntryId,
    pub section: Weak<ImageSection>,
    pub offset: usize,
}

struct PhysicalState {
    allocator: Box<dyn FrameAllocator>,
    entries: PagingEntryPool,
    cursor: usize,
}

/// Frame statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalStatistics {
    pub total: usize,
    pub allocated: usize,
    pub non_paged: usize,
}

impl PhysicalStatistics {
    pub fn free(&self) -> usize {
        self.total - self.allocated
    }
}

/// The physical page layer of the memory manager.
pub struct PhysicalPages {
    base: FrameNumber,
    frames: Box<[Frame]>,
    state: spin::Mutex<PhysicalState>,
    total: usize,
    allocated: AtomicUsize,
    non_paged: AtomicUsize,
    warning: AtomicU8,
    warning_event: Event,
    level2_percent: usize,
    level1_percent: usize,
    hysteresis_percent: usize,
    retries: usize,
    page_out: Arc<PageOutRequest>,
    platform: Arc<dyn Platform>,
}

impl PhysicalPages {
    /// Wraps `allocator`, whose frames all lie in `[base, base + frame_count)`.
    pub fn new(
        allocator: Box<dyn FrameAllocator>,
        base: PhysicalAddress,
        frame_count: usize,
        config: &VmmConfig,
        page_out: Arc<PageOutRequest>,
        platform: Arc<dyn Platform>,
    ) -> Self {
        let total = allocator.free_count();
        Self {
            base: base.frame_number(),
            frames: (0..frame_count).map(|_| Frame::default()).collect(),
            state: spin::Mutex::new(PhysicalState {
                allocator,
                entries: PagingEntryPool::new(config.max_paging_entry_blocks),
                cursor: 0,
            }),
            total,
            allocated: AtomicUsize::new(0),
            non_paged: AtomicUsize::new(0),
            warning: AtomicU8::new(MemoryWarning::None as u8),
            warning_event: Event::new(false),
            level2_percent: config.warning_level2_percent,
            level1_percent: config.warning_level1_percent,
            hysteresis_percent: config.warning_hysteresis_percent,
            retries: config.allocation_retries,
            page_out,
            platform,
        }
    }

    fn frame(&self, phys: PhysicalAddress) -> Option<&Frame> {
        let number = phys.frame_number().as_usize();
        let index = number.checked_sub(self.base.as_usize())?;
        self.frames.get(index)
    }

    fn frame_address(&self, index: usize) -> PhysicalAddress {
        (self.base + index).start()
    }

    /// Returns current statistics.
    pub fn statistics(&self) -> PhysicalStatistics {
        PhysicalStatistics {
            total: self.total,
            allocated: self.allocated.load(Ordering::Acquire),
            non_paged: self.non_paged.load(Ordering::Acquire),
        }
    }

    pub fn free_frames(&self) -> usize {
        self.statistics().free()
    }

    pub fn warning_level(&self) -> MemoryWarning {
        MemoryWarning::from_raw(self.warning.load(Ordering::Acquire))
    }

    /// Event pulsed whenever the warning level changes.
    pub fn warning_event(&self) -> &Event {
        &self.warning_event
    }

    pub fn page_out_request(&self) -> &Arc<PageOutRequest> {
        &self.page_out
    }

    /// Allocates one frame. Non-paged frames can never become pageable.
    ///
    /// When the allocator is empty the paging thread is asked to make room and the
    /// allocation is retried a bounded number of times.
    pub fn allocate(&self, non_paged: bool) -> MmResult<PhysicalAddress> {
        for attempt in 0..=self.retries {
            let frame = self.state.lock().allocator.allocate();
            if let Some(frame) = frame {
                if let Some(record) = self.frame(frame) {
                    record.flags.reset();
                    record.set_paging_entry(None);
                    record.flags.atomic_set(FrameFlag::Allocated);
                    if non_paged {
                        record.flags.atomic_set(FrameFlag::NonPaged);
                    }
                }

                self.allocated.fetch_add(1, Ordering::AcqRel);
                if non_paged {
                    self.non_paged.fetch_add(1, Ordering::AcqRel);
                }

                self.update_warning_level();
                return Ok(frame);
            }

            if attempt < self.retries {
                self.page_out.request(self.total / 8 + 1);
                self.platform.yield_now();
            }
        }

        log::warn!("physical allocation failed after {} retries", self.retries);
        Err(MmError::ResourceExhausted)
    }

    /// Allocates a frame and fills it with zeros.
    pub fn allocate_zeroed(&self, non_paged: bool) -> MmResult<PhysicalAddress> {
        let frame = self.allocate(non_paged)?;
        zero_frame(frame);
        Ok(frame)
    }

    fn release(&self, state: &mut PhysicalState, frame: PhysicalAddress) {
        let Some(record) = self.frame(frame) else {
            return;
        };

        if record.flags.atomic_test(FrameFlag::NonPaged) {
            self.non_paged.fetch_sub(1, Ordering::AcqRel);
        }

        if let Some(entry) = record.paging_entry() {
            state.entries.destroy(entry);
        }

        record.set_paging_entry(None);
        record.flags.reset();
        state.allocator.free(frame);
        self.allocated.fetch_sub(1, Ordering::AcqRel);
    }

    /// Frees a frame.
    ///
    /// A pageable frame that the page-out path owns is left alone; one that is locked
    /// is marked freed and released on its final unlock.
    pub fn free(&self, frame: PhysicalAddress) {
        let Some(record) = self.frame(frame) else {
            return;
        };

        {
            let mut state = self.state.lock();
            if !record.flags.atomic_test(FrameFlag::Allocated) {
                log::error!("double free of frame {}", frame);
                return;
            }

            if let Some(id) = record.paging_entry() {
                let Some(entry) = state.entries.get_mut(id) else {
                    return;
                };

                if entry.flags.contains(PagingEntryFlags::PAGING_OUT) {
                    return;
                }

                if entry.lock_count != 0 {
                    entry.flags.insert(PagingEntryFlags::FREED);
                    return;
                }
            }

            self.release(&mut state, frame);
        }

        self.update_warning_level();
    }

    /// Returns true if `frame` is an allocated frame managed here.
    pub fn is_allocated(&self, frame: PhysicalAddress) -> bool {
        self.frame(frame)
            .is_some_and(|record| record.flags.atomic_test(FrameFlag::Allocated))
    }

    /// Creates a paging entry for page `offset` of `section`.
    pub fn create_paging_entry(
        &self,
        section: Weak<ImageSection>,
        offset: usize,
    ) -> MmResult<PagingEntryId> {
        self.state.lock().entries.create(section, offset)
    }

    /// Points an unused paging entry at another section page.
    pub fn reinitialize_paging_entry(
        &self,
        entry: PagingEntryId,
        section: Weak<ImageSection>,
        offset: usize,
    ) {
        self.state.lock().entries.reinitialize(entry, section, offset);
    }

    /// Destroys a paging entry that was never attached to a frame.
    pub fn destroy_paging_entry(&self, entry: PagingEntryId) {
        self.state.lock().entries.destroy(entry);
    }

    /// Attaches `entry` to `frame`, making it pageable, optionally locking it once.
    pub fn enable_paging(&self, frame: PhysicalAddress, entry: PagingEntryId, lock: bool) {
        let Some(record) = self.frame(frame) else {
            return;
        };

        let mut state = self.state.lock();
        debug_assert!(!record.flags.atomic_test(FrameFlag::NonPaged));
        if let Some(paging_entry) = state.entries.get_mut(entry) {
            paging_entry.lock_count = u32::from(lock);
            paging_entry.flags = PagingEntryFlags::empty();
        }

        record.set_paging_entry(Some(entry));
    }

    /// Pins a pageable frame. Returns false if the frame is not pageable.
    pub fn lock(&self, frame: PhysicalAddress) -> bool {
        let Some(id) = self.frame(frame).and_then(Frame::paging_entry) else {
            return false;
        };

        let mut state = self.state.lock();
        match state.entries.get_mut(id) {
            Some(entry) => {
                entry.lock_count += 1;
                true
            }
            None => false,
        }
    }

    /// Drops one pin taken with [`PhysicalPages::lock`].
    pub fn unlock(&self, frame: PhysicalAddress) {
        let Some(id) = self.frame(frame).and_then(Frame::paging_entry) else {
            return;
        };

        let released = {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.get_mut(id) else {
                return;
            };

            debug_assert!(entry.lock_count != 0, "unbalanced unlock of frame {}", frame);
            entry.lock_count = entry.lock_count.saturating_sub(1);
            if entry.lock_count == 0 && entry.flags.contains(PagingEntryFlags::FREED) {
                self.release(&mut state, frame);
                true
            } else {
                false
            }
        };

        if released {
            self.update_warning_level();
        }
    }

    /// Returns the paging entry attached to a frame.
    pub fn paging_entry(&self, frame: PhysicalAddress) -> Option<PagingEntryId> {
        self.frame(frame).and_then(Frame::paging_entry)
    }

    /// Runs `f` on the paging entry attached to `frame`, under the physical page lock.
    pub fn with_paging_entry<R>(
        &self,
        frame: PhysicalAddress,
        f: impl FnOnce(&mut PagingEntry) -> R,
    ) -> Option<R> {
        let id = self.paging_entry(frame)?;
        let mut state = self.state.lock();
        state.entries.get_mut(id).map(f)
    }

    /// Number of live paging entries.
    pub fn paging_entry_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Re-points the paging entry of `frame` from `old` to `new` at `offset`, if it
    /// currently belongs to `old`.
    pub fn migrate_paging_entry(
        &self,
        frame: PhysicalAddress,
        old: &Weak<ImageSection>,
        new: &Weak<ImageSection>,
        offset: usize,
    ) -> bool {
        self.with_paging_entry(frame, |entry| {
            if entry.section.ptr_eq(old) {
                entry.section = new.clone();
                entry.offset = offset;
                true
            } else {
                false
            }
        })
        .unwrap_or(false)
    }

    /// Clears the paging-out mark on a frame's entry.
    pub fn clear_paging_out(&self, frame: PhysicalAddress) {
        self.with_paging_entry(frame, |entry| {
            entry.flags.remove(PagingEntryFlags::PAGING_OUT);
        });
    }

    /// Picks the next pageable frame round-robin and marks it as paging out.
    pub fn select_for_page_out(&self) -> Option<PageOutCandidate> {
        let mut state = self.state.lock();
        let count = self.frames.len();
        for step in 0..count {
            let index = (state.cursor + step) % count;
            let record = &self.frames[index];
            if !record.flags.atomic_test(FrameFlag::Allocated)
                || record.flags.atomic_test(FrameFlag::NonPaged)
            {
                continue;
            }

            let Some(id) = record.paging_entry() else {
                continue;
            };

            let Some(entry) = state.entries.get_mut(id) else {
                continue;
            };

            if entry.lock_count != 0
                || entry
                    .flags
                    .intersects(PagingEntryFlags::PAGING_OUT | PagingEntryFlags::FREED)
            {
                continue;
            }

            entry.flags.insert(PagingEntryFlags::PAGING_OUT);
            let candidate = PageOutCandidate {
                frame: self.frame_address(index),
                entry: id,
                section: entry.section.clone(),
                offset: entry.offset,
            };

            state.cursor = (index + 1) % count;
            return Some(candidate);
        }

        None
    }

    fn update_warning_level(&self) {
        if self.total == 0 {
            return;
        }

        let free_percent = self.free_frames() * 100 / self.total;
        let current = self.warning_level();
        let target = if free_percent < self.level1_percent {
            MemoryWarning::Level1
        } else if free_percent < self.level2_percent {
            MemoryWarning::Level2
        } else {
            MemoryWarning::None
        };

        let next = if target.severity() >= current.severity() {
            target
        } else {
            let threshold = match current {
                MemoryWarning::Level1 => self.level1_percent,
                MemoryWarning::Level2 => self.level2_percent,
                MemoryWarning::None => 0,
            };

            if free_percent >= threshold + self.hysteresis_percent {
                target
            } else {
                current
            }
        };

        if next != current
            && self
                .warning
                .compare_exchange(current as u8, next as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            log::info!("physical memory warning level {:?} -> {:?}", current, next);
            self.warning_event.pulse();
        }
    }
}

/// Fills a frame with zeros.
pub fn zero_frame(frame: PhysicalAddress) {
    let ptr: *mut u8 = AddressTranslator::current().phys_to_ptr(frame);
    unsafe { ptr.write_bytes(0, PAGE_SIZE) };
}

/// Copies the contents of one frame to another.
pub fn copy_frame(source: PhysicalAddress, destination: PhysicalAddress) {
    let translator = AddressTranslator::current();
    let from: *const u8 = translator.phys_to_ptr(source);
    let to: *mut u8 = translator.phys_to_ptr(destination);
    unsafe { core::ptr::copy_nonoverlapping(from, to, PAGE_SIZE) };
}
