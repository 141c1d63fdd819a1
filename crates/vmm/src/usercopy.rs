//! Kernel access to user memory.
//!
//! Every page is probed with user-mode permissions before it is touched. A failed probe
//! is handed to the fault handler exactly as a hardware fault inside a copy routine
//! would be, and the probe is retried once the fault is resolved.

use alloc::sync::Arc;

use crate::{
    MmError, MmResult, PAGE_SIZE, VirtualAddress,
    address_space::AddressSpace,
    arch,
    fault::{FaultResolution, PageFault},
    manager::MemoryManager,
};

/// Faults tolerated on a single page before the copy gives up.
const PROBE_RETRIES: usize = 16;

/// Checks that `[va, va + len)` lies in the user half.
fn check_user_range(va: VirtualAddress, len: usize) -> MmResult<()> {
    match va.as_usize().checked_add(len) {
        Some(end) if end <= arch::USER_VA_END => Ok(()),
        _ => Err(MmError::AccessViolation),
    }
}

impl MemoryManager {
    fn probe(&self, space: &Arc<AddressSpace>, va: VirtualAddress, write: bool) -> MmResult<*mut u8> {
        for _ in 0..PROBE_RETRIES {
            let present = match arch::probe_user(va, write) {
                Ok(pointer) => return Ok(pointer),
                Err(present) => present,
            };

            let fault = PageFault {
                address: va,
                write,
                execute: false,
                user: false,
                present,
                instruction: None,
            };

            if self.handle_fault(space, &fault) != FaultResolution::Handled {
                return Err(MmError::AccessViolation);
            }
        }

        Err(MmError::AccessViolation)
    }

    /// Runs `f` on each page-sized piece of `[va, va + len)` with a kernel pointer to it.
    fn for_each_user_chunk(
        &self,
        space: &Arc<AddressSpace>,
        va: VirtualAddress,
        len: usize,
        write: bool,
        mut f: impl FnMut(*mut u8, usize, usize),
    ) -> MmResult<()> {
        check_user_range(va, len)?;
        debug_assert!(self.is_current(space), "user copy outside the active address space");
        let mut done = 0;
        while done < len {
            let current = va + done;
            let chunk = (PAGE_SIZE - current.page_offset()).min(len - done);
            let pointer = self.probe(space, current, write)?;
            f(pointer, done, chunk);
            done += chunk;
        }

        Ok(())
    }

    /// Copies bytes from user memory of the active space into `buffer`.
    pub fn copy_from_user(&self, space: &Arc<AddressSpace>, source: VirtualAddress, buffer: &mut [u8]) -> MmResult<()> {
        let len = buffer.len();
        self.for_each_user_chunk(space, source, len, false, |pointer, done, chunk| unsafe {
            core::ptr::copy_nonoverlapping(pointer, buffer[done..].as_mut_ptr(), chunk);
        })
    }

    /// Copies `data` into user memory of the active space.
    pub fn copy_to_user(&self, space: &Arc<AddressSpace>, destination: VirtualAddress, data: &[u8]) -> MmResult<()> {
        self.for_each_user_chunk(space, destination, data.len(), true, |pointer, done, chunk| unsafe {
            core::ptr::copy_nonoverlapping(data[done..].as_ptr(), pointer, chunk);
        })
    }

    /// Faults in every page of a user buffer, for writing if `write` is set.
    pub fn touch_user_buffer(&self, space: &Arc<AddressSpace>, va: VirtualAddress, len: usize, write: bool) -> MmResult<()> {
        self.for_each_user_chunk(space, va, len, write, |_, _, _| {})
    }
}
