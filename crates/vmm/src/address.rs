//! Physical and virtual addresses, and the kernel's way into physical memory.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{FrameNumber, arch};

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::EmulatedMemory;

/// How the kernel reaches a physical address.
///
/// On hardware all of physical memory sits behind the direct map. Under emulation
/// "physical memory" is a host buffer owned by the test thread.
pub enum AddressTranslator {
    Hardware { direct_map_offset: usize },
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

impl AddressTranslator {
    pub const fn hardware(direct_map_offset: usize) -> Self {
        Self::Hardware { direct_map_offset }
    }

    /// Creates `size` bytes of emulated physical memory.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(size))
    }

    /// Installs the translator. Page tables, scratch pages and frame copies all go
    /// through it, so this happens before the memory manager is brought up.
    ///
    /// # Panics
    ///
    /// Panics if a translator is already installed.
    pub fn set_current(translator: AddressTranslator) {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            if ADDRESS_TRANSLATOR.get().is_some() {
                panic!("address translator already set");
            }
            ADDRESS_TRANSLATOR.call_once(|| translator);
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                if t.get().is_some() {
                    panic!("address translator already set");
                }
                t.call_once(|| translator);
            });
        }
    }

    /// Returns the installed translator.
    ///
    /// # Panics
    ///
    /// Panics if none is installed yet.
    pub fn current() -> &'static AddressTranslator {
        match Self::try_current() {
            Some(translator) => translator,
            None => panic!("address translator used before it was set"),
        }
    }

    pub fn try_current() -> Option<&'static AddressTranslator> {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            ADDRESS_TRANSLATOR.get()
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                t.get().map(|translator| {
                    // SAFETY: a thread's translator is set once and lives as long as the
                    // thread.
                    unsafe { &*(translator as *const AddressTranslator) }
                })
            })
        }
    }

    /// Returns a kernel pointer to the physical address `phys`.
    pub fn phys_to_ptr<T>(&self, phys: PhysicalAddress) -> *mut T {
        match self {
            Self::Hardware { direct_map_offset } => {
                phys.as_usize().wrapping_add(*direct_map_offset) as *mut T
            }
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.translate(phys.as_usize()) as *mut T,
        }
    }
}

#[cfg(not(any(test, feature = "software-emulation")))]
static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();

// Each test thread owns its emulated memory.
#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();
}

macro_rules! address_type {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0 as u64
            }

            #[inline]
            pub const fn is_page_aligned(self) -> bool {
                self.0 & (arch::PAGE_SIZE - 1) == 0
            }

            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self((self.0 + align - 1) & !(align - 1))
            }

            /// Byte offset within the containing page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                self.0 & (arch::PAGE_SIZE - 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

address_type!(
    PhysicalAddress,
    "A physical address. Zero doubles as \"no frame\" in page table entries."
);

impl PhysicalAddress {
    /// # Panics
    ///
    /// Panics if `addr` is wider than the architecture's physical address width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(arch::validate_physical(addr), "physical address exceeds maximum width");
        Self(addr)
    }

    #[inline]
    pub fn frame_number(self) -> FrameNumber {
        FrameNumber::from(self)
    }
}

address_type!(
    VirtualAddress,
    "A canonical virtual address, in the user half or the kernel half."
);

impl VirtualAddress {
    /// The null address. Never mapped in a user space.
    pub const NULL: Self = Self(0);

    /// # Panics
    ///
    /// Panics if `addr` is not canonical.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(arch::validate_virtual(addr), "address is not canonical");
        Self(addr)
    }

    #[inline]
    pub const fn try_new(addr: usize) -> Option<Self> {
        if arch::validate_virtual(addr) {
            Some(Self(addr))
        } else {
            None
        }
    }

    #[inline]
    pub const fn is_kernel(self) -> bool {
        self.0 >= arch::KERNEL_VA_START
    }

    #[inline]
    pub const fn is_user(self) -> bool {
        !self.is_kernel()
    }

    /// Adds a byte offset, returning `None` on overflow or a non-canonical result.
    #[inline]
    pub const fn checked_add(self, rhs: usize) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(value) => Self::try_new(value),
            None => None,
        }
    }

    /// The address as a pointer in the active address space.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Index of this address in its table at `level`, counting from 0 at the leaves.
    #[inline]
    pub const fn page_index(self, level: usize) -> usize {
        arch::page_index(self.0, level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn physical_addresses_are_bounded() {
        let widest = (1usize << arch::MAX_PHYSICAL_BITS) - 1;
        assert_eq!(PhysicalAddress::new(widest).as_usize(), widest);
        assert!(std::panic::catch_unwind(|| PhysicalAddress::new(1usize << arch::MAX_PHYSICAL_BITS)).is_err());
    }

    #[test]
    fn page_arithmetic() {
        let addr = PhysicalAddress::new(arch::PAGE_SIZE * 3 + 0x24);
        assert!(!addr.is_page_aligned());
        assert_eq!(addr.align_down(arch::PAGE_SIZE), PhysicalAddress::new(arch::PAGE_SIZE * 3));
        assert_eq!(addr.align_up(arch::PAGE_SIZE), PhysicalAddress::new(arch::PAGE_SIZE * 4));
        assert_eq!(addr.page_offset(), 0x24);
        assert_eq!(PhysicalAddress::new(0x5000) - PhysicalAddress::new(0x2000), 0x3000);
        assert_eq!(format!("{} {:?}", addr, VirtualAddress::NULL), "0x3024 VirtualAddress(0x0)");
    }

    #[test]
    fn emulated_memory_is_reachable() {
        if AddressTranslator::try_current().is_none() {
            AddressTranslator::set_current(AddressTranslator::emulated(16 * arch::PAGE_SIZE));
        }

        let ptr: *mut u8 = AddressTranslator::current().phys_to_ptr(PhysicalAddress::new(0x2000));
        unsafe {
            ptr.write(0x5A);
            assert_eq!(ptr.read(), 0x5A);
        }
    }

    #[test]
    fn halves_are_split_at_the_kernel_base() {
        assert!(VirtualAddress::new(arch::USER_VA_END - 1).is_user());
        assert!(VirtualAddress::new(arch::KERNEL_VA_START).is_kernel());
        assert!(VirtualAddress::try_new(arch::USER_VA_END).is_none());
    }

    #[test]
    fn additions_stay_canonical() {
        let top_user = VirtualAddress::new(arch::USER_VA_END - 1);
        assert!(top_user.checked_add(1).is_none());
        assert!(VirtualAddress::new(usize::MAX).checked_add(1).is_none());
        assert_eq!(VirtualAddress::new(0x1000).checked_add(0x1000), Some(VirtualAddress::new(0x2000)));
    }

    #[test]
    fn indices_follow_the_table_geometry() {
        let addr = VirtualAddress::new((3 << 30) | (5 << 21) | (7 << 12) | 0x123);
        assert_eq!(addr.page_offset(), 0x123);
        assert_eq!(addr.page_index(0), 7);
        assert_eq!(addr.page_index(1), 5);
        assert_eq!(addr.page_index(2), 3);
    }
}
