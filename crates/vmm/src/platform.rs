//! Scheduler and processor services the memory manager relies on.
//!
//! The kernel proper implements [`Platform`]; the memory manager only needs to know how
//! many processors exist, which one it is running on, how to change priority, how to
//! run a routine on every processor, and how to start its paging thread.

use alloc::boxed::Box;

use crate::MmResult;

/// Processor priority ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunLevel {
    /// Ordinary thread execution; blocking is allowed.
    Low,
    /// Preemption disabled; spin locks and per-processor scratch pages may be used.
    Dispatch,
    /// Interrupt handlers, including the TLB shootdown handler.
    Interrupt,
}

/// Kernel services consumed by the memory manager.
pub trait Platform: Send + Sync {
    /// Number of active processors.
    fn processor_count(&self) -> usize;

    /// Index of the executing processor.
    fn current_processor(&self) -> usize;

    /// Current run level of the executing processor.
    fn run_level(&self) -> RunLevel;

    /// Raises the run level, returning the previous one.
    fn raise_run_level(&self, level: RunLevel) -> RunLevel;

    /// Restores a run level returned by [`Platform::raise_run_level`].
    fn lower_run_level(&self, previous: RunLevel);

    /// Runs `handler` once on every active processor, including the caller, at
    /// interrupt level. May return before remote processors have finished.
    fn send_ipi_to_all(&self, handler: &(dyn Fn() + Sync));

    /// Gives up the processor briefly while spinning.
    fn yield_now(&self);

    /// Creates a kernel thread running `entry`.
    fn spawn_thread(&self, name: &'static str, entry: Box<dyn FnOnce() + Send>) -> MmResult<()>;
}

/// Raises the run level for the lifetime of the guard.
pub struct RunLevelGuard<'a> {
    platform: &'a dyn Platform,
    previous: RunLevel,
}

impl<'a> RunLevelGuard<'a> {
    /// Raises to `level`.
    pub fn raise(platform: &'a dyn Platform, level: RunLevel) -> Self {
        let previous = platform.raise_run_level(level);
        Self { platform, previous }
    }
}

impl Drop for RunLevelGuard<'_> {
    fn drop(&mut self) {
        self.platform.lower_run_level(self.previous);
    }
}
