//! Page fault resolution.

use alloc::sync::Arc;

use crate::{
    MmError, MmResult, PAGE_SIZE, SectionFlags, VirtualAddress, address_space::AddressSpace, arch,
    manager::MemoryManager,
};

/// Page-in attempts before a fault on a shrinking section gives up.
const FAULT_RETRIES: usize = 8;

/// What the processor reported about a page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    pub address: VirtualAddress,
    pub write: bool,
    pub execute: bool,
    /// The faulting code ran in user mode.
    pub user: bool,
    /// The leaf entry was present, so the fault is a protection fault.
    pub present: bool,
    /// Instruction pointer of the faulting code, when known.
    pub instruction: Option<usize>,
}

/// How the trap handler should continue after a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// The access can be retried.
    Handled,
    /// Deliver an access violation signal to the faulting thread.
    Signal(MmError),
    /// Resume kernel execution at this address, the failure exit of a user copy routine.
    Redirect(usize),
    /// A kernel-mode fault that cannot be resolved.
    KernelFault(MmError),
}

/// Code range of the routines that touch user memory from kernel mode. A fault inside
/// it resumes at `recovery` instead of crashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryRegion {
    pub start: usize,
    pub end: usize,
    pub recovery: usize,
}

impl RecoveryRegion {
    fn contains(&self, instruction: usize) -> bool {
        (self.start..self.end).contains(&instruction)
    }
}

impl MemoryManager {
    /// Registers the user copy routines' code range. Only the first registration counts.
    pub fn register_user_copy_region(&self, region: RecoveryRegion) {
        self.user_copy_region.call_once(|| region);
    }

    /// Resolves a page fault taken while `space` was active.
    pub fn handle_fault(&self, space: &Arc<AddressSpace>, fault: &PageFault) -> FaultResolution {
        let error = match self.resolve_fault(space, fault) {
            Ok(()) => return FaultResolution::Handled,
            Err(error) => error,
        };

        if fault.user {
            log::debug!("user fault at {} unresolved: {}", fault.address, error);
            return FaultResolution::Signal(MmError::AccessViolation);
        }

        let region = self.user_copy_region.get();
        if let (Some(region), Some(instruction)) = (region, fault.instruction) {
            if region.contains(instruction) {
                return FaultResolution::Redirect(region.recovery);
            }
        }

        log::error!("unresolved kernel fault at {} ({:?}): {}", fault.address, fault, error);
        FaultResolution::KernelFault(error)
    }

    fn resolve_fault(&self, space: &Arc<AddressSpace>, fault: &PageFault) -> MmResult<()> {
        let va = fault.address;
        if va.is_kernel() {
            if self.sync_kernel_entry(va) {
                return Ok(());
            }

            if fault.user {
                return Err(MmError::AccessViolation);
            }
        } else if va.as_usize() >= arch::USER_VA_END {
            return Err(MmError::AccessViolation);
        }

        let space = if va.is_kernel() { &self.kernel_space } else { space };
        let page_va = va.align_down(PAGE_SIZE);
        if let Some(entry) = self.leaf_entry(space, page_va) {
            let permitted = entry.is_present()
                && (!fault.write || entry.is_writable())
                && (!fault.execute || entry.is_executable());

            // Another processor fixed the page up first; only the local TLB is stale.
            if permitted {
                arch::invalidate_tlb_entry(page_va);
                return Ok(());
            }
        }

        for _ in 0..FAULT_RETRIES {
            let section = space.find_section(va).ok_or(MmError::AccessViolation)?;
            let flags = section.flags();
            if flags.is_going_away()
                || (fault.write && !flags.contains(SectionFlags::WRITABLE))
                || (fault.execute && !flags.contains(SectionFlags::EXECUTABLE))
                || !flags.is_accessible()
            {
                return Err(MmError::AccessViolation);
            }

            let page = (page_va - section.virtual_address()) / PAGE_SIZE;
            let present = self.leaf_entry(space, page_va).is_some_and(|entry| entry.is_present());
            let result = if present {
                if fault.write {
                    self.isolate_page(&section, page)
                } else {
                    Ok(())
                }
            } else {
                self.page_in(&section, page, false).map(|_| ())
            };

            match result {
                Err(MmError::TryAgain) => continue,
                Err(MmError::TooLate) => return Err(MmError::AccessViolation),
                other => return other,
            }
        }

        Err(MmError::TryAgain)
    }
}
