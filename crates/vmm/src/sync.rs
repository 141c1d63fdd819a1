//! Events used to coordinate with the paging thread.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::platform::Platform;

/// A manual-reset event.
///
/// Waiters spin (yielding between checks) until the event is signaled or pulsed.
pub struct Event {
    signaled: AtomicBool,
    generation: AtomicUsize,
}

impl Event {
    /// Creates an event in the given state.
    pub const fn new(signaled: bool) -> Self {
        Self {
            signaled: AtomicBool::new(signaled),
            generation: AtomicUsize::new(0),
        }
    }

    /// Signals the event; it stays signaled until [`Event::unsignal`].
    pub fn signal(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.signaled.store(true, Ordering::Release);
    }

    /// Returns the event to the non-signaled state.
    pub fn unsignal(&self) {
        self.signaled.store(false, Ordering::Release);
    }

    /// Wakes current waiters without leaving the event signaled.
    pub fn pulse(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns true if the event is signaled.
    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    fn generation(&self) -> usize {
        self.generation.load(Ordering::Acquire)
    }

    /// Blocks until the event is signaled or pulsed.
    pub fn wait(&self, platform: &dyn Platform) {
        wait_any(&[self], platform);
    }
}

/// Blocks until any of `events` is signaled or pulsed, returning its index.
pub fn wait_any(events: &[&Event], platform: &dyn Platform) -> usize {
    let start: alloc::vec::Vec<usize> = events.iter().map(|event| event.generation()).collect();
    loop {
        for (index, event) in events.iter().enumerate() {
            if event.is_signaled() || event.generation() != start[index] {
                return index;
            }
        }

        platform.yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_and_unsignal() {
        let event = Event::new(false);
        assert!(!event.is_signaled());
        event.signal();
        assert!(event.is_signaled());
        event.unsignal();
        assert!(!event.is_signaled());
    }

    #[test]
    fn pulse_does_not_latch() {
        let event = Event::new(false);
        let before = event.generation();
        event.pulse();
        assert!(!event.is_signaled());
        assert_ne!(event.generation(), before);
    }
}
