//! Cross-processor TLB invalidation.
//!
//! Only one shootdown is in flight at a time. The sender publishes the target root,
//! base and page count, interrupts every processor, and spins until each one has
//! acknowledged by decrementing the countdown.

use core::sync::atomic::{AtomicUsize, Ordering, fence};

use crate::{
    PAGE_SIZE, PhysicalAddress, VirtualAddress, arch,
    platform::{Platform, RunLevel, RunLevelGuard},
};

/// Page count above which a receiver flushes its whole TLB instead of each page.
const FULL_FLUSH_THRESHOLD: usize = 64;

/// Shared state of the shootdown protocol.
pub struct Shootdown {
    lock: spin::Mutex<()>,
    target_root: AtomicUsize,
    base: AtomicUsize,
    count: AtomicUsize,
    remaining: AtomicUsize,
}

impl Shootdown {
    pub const fn new() -> Self {
        Self {
            lock: spin::Mutex::new(()),
            target_root: AtomicUsize::new(0),
            base: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
            remaining: AtomicUsize::new(0),
        }
    }

    /// Invalidates `count` pages at `base` in the address space rooted at `root` on every
    /// processor. Kernel addresses are invalidated everywhere regardless of `root`.
    pub fn send(&self, platform: &dyn Platform, root: PhysicalAddress, base: VirtualAddress, count: usize) {
        if count == 0 {
            return;
        }

        if platform.processor_count() <= 1 {
            invalidate_local(root, base, count);
            return;
        }

        let _level = RunLevelGuard::raise(platform, RunLevel::Dispatch);
        let _guard = self.lock.lock();
        self.target_root.store(root.as_usize(), Ordering::Relaxed);
        self.base.store(base.as_usize(), Ordering::Relaxed);
        self.count.store(count, Ordering::Relaxed);
        self.remaining
            .store(platform.processor_count(), Ordering::Relaxed);
        fence(Ordering::SeqCst);

        platform.send_ipi_to_all(&|| self.handle_ipi(platform));
        while self.remaining.load(Ordering::Acquire) != 0 {
            platform.yield_now();
        }
    }

    /// Receiver side of a shootdown, run on each processor at interrupt level.
    fn handle_ipi(&self, platform: &dyn Platform) {
        let _level = RunLevelGuard::raise(platform, RunLevel::Interrupt);
        let root = PhysicalAddress::new(self.target_root.load(Ordering::Acquire));
        let base = VirtualAddress::new(self.base.load(Ordering::Acquire));
        let count = self.count.load(Ordering::Acquire);
        invalidate_local(root, base, count);
        self.remaining.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Default for Shootdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Invalidates a range on the executing processor if it can hold translations for it.
pub fn invalidate_local(root: PhysicalAddress, base: VirtualAddress, count: usize) {
    if !base.is_kernel() && arch::active_root() != root {
        return;
    }

    // A full flush keeps global entries, so kernel ranges are always invalidated per page.
    if count > FULL_FLUSH_THRESHOLD && !base.is_kernel() {
        arch::flush_tlb();
        return;
    }

    for page in 0..count {
        arch::invalidate_tlb_entry(base + page * PAGE_SIZE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        AddressTranslator, MapFlags,
        arch::{Access, Machine, PageEntry},
        testing::TestPlatform,
    };

    const ROOT: usize = 0x1000;
    const MIDDLE: usize = 0x2000;
    const LEAF: usize = 0x3000;
    const DATA: usize = 0x4000;
    const PAGE_VA: usize = 0x4000_0000;

    fn write(table: usize, index: usize, entry: PageEntry) {
        let ptr: *mut u64 = AddressTranslator::current().phys_to_ptr(PhysicalAddress::new(table + index * 8));
        unsafe { ptr.write(entry.raw()) };
    }

    fn setup() -> (&'static Machine, TestPlatform) {
        let _ = std::panic::catch_unwind(|| {
            AddressTranslator::set_current(AddressTranslator::emulated(64 * 1024));
        });
        let _ = std::panic::catch_unwind(|| Machine::install(Machine::new(2)));
        let machine = Machine::current();
        write(ROOT, arch::page_index(PAGE_VA, 2), PageEntry::table(PhysicalAddress::new(MIDDLE), true));
        write(MIDDLE, arch::page_index(PAGE_VA, 1), PageEntry::table(PhysicalAddress::new(LEAF), true));
        write(
            LEAF,
            0,
            PageEntry::leaf(PhysicalAddress::new(DATA), MapFlags::PRESENT | MapFlags::USER_MODE),
        );

        for cpu in 0..2 {
            machine.set_current_processor(cpu);
            machine.set_root(PhysicalAddress::new(ROOT));
            machine.flush(true);
            machine
                .translate(VirtualAddress::new(PAGE_VA), Access::Read, true)
                .unwrap();
        }

        machine.set_current_processor(0);
        (machine, TestPlatform::new(2))
    }

    #[test]
    fn shootdown_reaches_every_processor() {
        let (machine, platform) = setup();
        let shootdown = Shootdown::new();
        shootdown.send(&platform, PhysicalAddress::new(ROOT), VirtualAddress::new(PAGE_VA), 1);
        for cpu in 0..2 {
            machine.set_current_processor(cpu);
            assert!(!machine.is_cached(VirtualAddress::new(PAGE_VA)));
        }

        machine.set_current_processor(0);
        assert_eq!(platform.current_processor(), 0);
    }

    #[test]
    fn other_address_spaces_keep_their_translations() {
        let (machine, platform) = setup();
        let shootdown = Shootdown::new();
        shootdown.send(&platform, PhysicalAddress::new(0x9000), VirtualAddress::new(PAGE_VA), 1);
        machine.set_current_processor(1);
        assert!(machine.is_cached(VirtualAddress::new(PAGE_VA)));
        machine.set_current_processor(0);
    }
}
