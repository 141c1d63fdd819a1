//! Frame numbers and page rounding.

use core::{fmt, ops::Add};

use crate::{address::PhysicalAddress, arch};

/// Rounds a byte count up to a whole number of pages, returning `None` on overflow.
#[inline]
pub const fn round_up_to_page(bytes: usize) -> Option<usize> {
    match bytes.checked_add(arch::PAGE_SIZE - 1) {
        Some(value) => Some(value & !(arch::PAGE_SIZE - 1)),
        None => None,
    }
}

/// A physical frame number.
///
/// Frame `n` covers physical addresses `[n * PAGE_SIZE, (n + 1) * PAGE_SIZE)`. The
/// physical layer indexes its per-frame records by frame number.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FrameNumber(usize);

impl FrameNumber {
    #[inline]
    pub const fn new(number: usize) -> Self {
        Self(number)
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns the physical address at the start of this frame.
    #[inline]
    pub const fn start(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << arch::PAGE_SHIFT)
    }
}

impl fmt::Debug for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameNumber({:#x})", self.0)
    }
}

impl Add<usize> for FrameNumber {
    type Output = Self;

    #[inline]
    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl From<PhysicalAddress> for FrameNumber {
    #[inline]
    fn from(addr: PhysicalAddress) -> Self {
        Self::new(addr.as_usize() >> arch::PAGE_SHIFT)
    }
}
