//! Emulated processors and MMU.
//!
//! Each emulated processor has its own root table register and TLB. Translations are
//! produced by walking the tables in emulated physical memory, checking permissions at
//! every level, and setting the accessed and dirty bits the way x86_64 hardware does.
//! Present leaf translations are cached per processor until invalidated, so a missing
//! shootdown shows up as a stale translation exactly as it would on real hardware.

use alloc::{boxed::Box, collections::BTreeMap};
use core::sync::atomic::{AtomicUsize, Ordering};

use super::{PAGE_SHIFT, PAGE_TABLE_LEVELS, PageEntry, page_index};
use crate::{PhysicalAddress, VirtualAddress, address::AddressTranslator, arch::ENTRY_SIZE};

/// Kind of memory access being translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

/// A page fault raised by the emulated MMU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmuFault {
    /// Faulting virtual address.
    pub address: VirtualAddress,
    /// Access that faulted.
    pub access: Access,
    /// True if the access was made from user mode.
    pub user: bool,
    /// True if the leaf entry was present (a protection fault).
    pub present: bool,
}

#[derive(Debug, Clone, Copy)]
struct TlbEntry {
    frame: PhysicalAddress,
    writable: bool,
    user: bool,
    executable: bool,
    global: bool,
    dirty: bool,
}

struct Processor {
    root: AtomicUsize,
    tlb: spin::Mutex<BTreeMap<usize, TlbEntry>>,
}

/// The set of emulated processors.
pub struct Machine {
    processors: Box<[Processor]>,
    current: AtomicUsize,
}

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static MACHINE: spin::Once<Machine> = spin::Once::new();
}

impl Machine {
    /// Creates a machine with `count` processors, all with an empty root.
    pub fn new(count: usize) -> Self {
        assert!(count > 0 && count <= super::MAX_CPUS, "invalid processor count");
        Self {
            processors: (0..count)
                .map(|_| Processor {
                    root: AtomicUsize::new(0),
                    tlb: spin::Mutex::new(BTreeMap::new()),
                })
                .collect(),
            current: AtomicUsize::new(0),
        }
    }

    /// Installs the machine for the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if a machine has already been installed.
    pub fn install(machine: Machine) {
        MACHINE.with(|m| {
            if m.get().is_some() {
                panic!("machine already installed");
            }
            m.call_once(|| machine);
        });
    }

    /// Returns the machine installed for the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if no machine has been installed.
    pub fn current() -> &'static Machine {
        match Self::try_current() {
            Some(machine) => machine,
            None => panic!("machine not installed; call Machine::install first"),
        }
    }

    /// Returns the machine installed for the calling thread, if any.
    pub fn try_current() -> Option<&'static Machine> {
        MACHINE.with(|m| {
            m.get().map(|machine| {
                // SAFETY: the machine lives in a thread-local that is never replaced.
                unsafe { &*(machine as *const Machine) }
            })
        })
    }

    /// Returns the number of processors.
    pub fn processor_count(&self) -> usize {
        self.processors.len()
    }

    /// Returns the index of the processor currently executing.
    pub fn current_processor(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    /// Switches execution to another processor.
    pub fn set_current_processor(&self, processor: usize) {
        assert!(processor < self.processors.len(), "processor index out of range");
        self.current.store(processor, Ordering::Release);
    }

    fn processor(&self) -> &Processor {
        &self.processors[self.current_processor()]
    }

    /// Returns the root table of the executing processor.
    pub fn root(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.processor().root.load(Ordering::Acquire))
    }

    /// Loads a root table, dropping every non-global translation.
    pub fn set_root(&self, root: PhysicalAddress) {
        let processor = self.processor();
        processor.root.store(root.as_usize(), Ordering::Release);
        processor.tlb.lock().retain(|_, entry| entry.global);
    }

    /// Drops the cached translation for one page.
    pub fn invalidate(&self, va: VirtualAddress) {
        self.processor().tlb.lock().remove(&(va.as_usize() >> PAGE_SHIFT));
    }

    /// Drops cached translations, keeping global ones unless `global` is set.
    pub fn flush(&self, global: bool) {
        self.processor()
            .tlb
            .lock()
            .retain(|_, entry| !global && entry.global);
    }

    /// Returns true if the executing processor caches a translation for `va`.
    pub fn is_cached(&self, va: VirtualAddress) -> bool {
        self.processor()
            .tlb
            .lock()
            .contains_key(&(va.as_usize() >> PAGE_SHIFT))
    }

    /// Walks the active tables for a kernel access, without permission checks or TLB.
    pub fn walk(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let mut table = self.root();
        for level in (0..PAGE_TABLE_LEVELS).rev() {
            let entry = read_entry(table, page_index(va.as_usize(), level));
            if !entry.is_present() {
                return None;
            }

            table = entry.frame()?;
        }

        Some(table + va.page_offset())
    }

    /// Translates an access the way the MMU would, consulting and filling the TLB.
    pub fn translate(
        &self,
        va: VirtualAddress,
        access: Access,
        user: bool,
    ) -> Result<PhysicalAddress, MmuFault> {
        let page = va.as_usize() >> PAGE_SHIFT;
        let processor = self.processor();
        let fault = |present| MmuFault {
            address: va,
            access,
            user,
            present,
        };

        let cached = processor.tlb.lock().get(&page).copied();
        if let Some(entry) = cached {
            if !permits(&entry, access, user) {
                processor.tlb.lock().remove(&page);
                return Err(fault(true));
            }

            if access != Access::Write || entry.dirty {
                return Ok(entry.frame + va.page_offset());
            }
        }

        let mut table = self.root();
        let mut combined = TlbEntry {
            frame: PhysicalAddress::default(),
            writable: true,
            user: true,
            executable: true,
            global: false,
            dirty: false,
        };

        for level in (0..PAGE_TABLE_LEVELS).rev() {
            let index = page_index(va.as_usize(), level);
            let entry = read_entry(table, index);
            if !entry.is_present() {
                return Err(fault(false));
            }

            combined.writable &= entry.is_writable();
            combined.user &= entry.is_user();
            combined.executable &= entry.is_executable();
            if level == 0 {
                combined.global = entry.is_global();
                if !permits(&combined, access, user) {
                    return Err(fault(true));
                }

                let updated = entry.mark_accessed(access == Access::Write);
                write_entry(table, index, updated);
                combined.dirty = updated.is_dirty();
                combined.frame = updated.frame().ok_or(fault(true))?;
            } else {
                write_entry(table, index, entry.mark_accessed(false));
                table = entry.frame().ok_or(fault(false))?;
            }
        }

        processor.tlb.lock().insert(page, combined);
        Ok(combined.frame + va.page_offset())
    }
}

fn permits(entry: &TlbEntry, access: Access, user: bool) -> bool {
    if user && !entry.user {
        return false;
    }

    match access {
        Access::Read => true,
        Access::Write => entry.writable,
        Access::Execute => entry.executable,
    }
}

fn read_entry(table: PhysicalAddress, index: usize) -> PageEntry {
    let ptr: *const u64 = AddressTranslator::current().phys_to_ptr(table + index * ENTRY_SIZE);
    PageEntry::from_raw(unsafe { ptr.read_volatile() })
}

fn write_entry(table: PhysicalAddress, index: usize, entry: PageEntry) {
    let ptr: *mut u64 = AddressTranslator::current().phys_to_ptr(table + index * ENTRY_SIZE);
    unsafe { ptr.write_volatile(entry.raw()) }
}
