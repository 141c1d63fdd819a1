//! Memory descriptor lists.
//!
//! A descriptor list records typed, non-overlapping ranges of an address space. Ranges are
//! kept in a red-black tree ordered by base address, and every free range is also threaded
//! onto one of [`BIN_COUNT`] size-class bins so that "any address" allocations can start
//! from a best-fit bin instead of walking the whole tree.
//!
//! Descriptor storage comes from batches of [`DESCRIPTORS_PER_BATCH`] slots. A list whose
//! [`AllocationSource`] is `None` never grows on its own and relies on
//! [`MemoryDescriptorList::donate_descriptors`].

mod tree;

use alloc::vec::Vec;
use core::fmt;

use crate::{MmError, MmResult};

use self::tree::{Links, NIL, RbTree, TreeNode};

/// Number of size-class bins free descriptors are sorted into.
pub const BIN_COUNT: usize = 12;

/// Number of descriptor slots added whenever the list grows.
pub const DESCRIPTORS_PER_BATCH: usize = 32;

const BIN_SHIFT: u32 = 12;

/// What a range of memory is being used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    Reserved,
    Free,
    FirmwareTemporary,
    FirmwarePermanent,
    AcpiTables,
    AcpiNvStorage,
    Bad,
    LoaderTemporary,
    LoaderPermanent,
    PageTables,
    BootPageTables,
    MmStructures,
    NonPagedPool,
    PagedPool,
    Hardware,
    IoBuffer,
    /// Address-space reservations made on behalf of a user mapping.
    UserReserved,
}

impl DescriptorType {
    /// Only free descriptors count toward the free total and may be allocated from.
    pub const fn is_free(self) -> bool {
        matches!(self, Self::Free)
    }
}

/// How [`MemoryDescriptorList::allocate`] picks a free range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStrategy {
    /// Walk the tree upward and take the first fit.
    LowestAddress,
    /// Scan the size bins from the best fit upward.
    AnyAddress,
    /// Walk the tree downward and take the first fit.
    HighestAddress,
    /// Take exactly the range starting at `min`, which must be free.
    FixedAddress,
    /// Take exactly the range starting at `min`, overwriting whatever is there.
    FixedAddressClobber,
}

/// Where a list gets more descriptor slots from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationSource {
    /// Only donated slots are used.
    None,
    NonPagedPool,
    PagedPool,
}

/// A typed range `[base, base + size)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryDescriptor {
    pub base: u64,
    pub size: u64,
    pub kind: DescriptorType,
}

impl MemoryDescriptor {
    pub const fn new(base: u64, size: u64, kind: DescriptorType) -> Self {
        Self { base, size, kind }
    }

    /// Builds a descriptor from a start and an exclusive end.
    pub const fn from_range(start: u64, end: u64, kind: DescriptorType) -> Self {
        Self {
            base: start,
            size: end - start,
            kind,
        }
    }

    /// Exclusive end of the range.
    pub const fn end(&self) -> u64 {
        self.base + self.size
    }
}

impl fmt::Debug for MemoryDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}..{:#x} {:?}", self.base, self.end(), self.kind)
    }
}

/// Returns the bin a free range of `size` bytes belongs in.
///
/// Sizes are counted in 4 KiB units and bucketed two bins per power of four.
pub fn bin_index(size: u64) -> usize {
    let units = (size + ((1 << BIN_SHIFT) - 1)) >> BIN_SHIFT;
    if units == 0 {
        return 0;
    }

    let highest_bit = (63 - units.leading_zeros()) as usize;
    (highest_bit >> 1).min(BIN_COUNT - 1)
}

#[derive(Clone)]
struct Slot {
    descriptor: MemoryDescriptor,
    links: Links,
    free_prev: usize,
    free_next: usize,
    in_use: bool,
}

impl Slot {
    const fn unused() -> Self {
        Self {
            descriptor: MemoryDescriptor::new(0, 0, DescriptorType::Reserved),
            links: Links::unlinked(),
            free_prev: NIL,
            free_next: NIL,
            in_use: false,
        }
    }
}

impl TreeNode for Slot {
    fn key(&self) -> u64 {
        self.descriptor.base
    }

    fn links(&self) -> &Links {
        &self.links
    }

    fn links_mut(&mut self) -> &mut Links {
        &mut self.links
    }
}

/// Reasons [`MemoryDescriptorList::validate`] can reject a list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListCorruption {
    Overlap { base: u64 },
    Uncoalesced { base: u64 },
    TotalMismatch { counted: u64, recorded: u64 },
    FreeMismatch { counted: u64, recorded: u64 },
    CountMismatch { counted: usize, recorded: usize },
    WrongBin { base: u64 },
    Unbalanced,
}

/// An ordered, coalescing list of memory descriptors.
#[derive(Clone)]
pub struct MemoryDescriptorList {
    slots: Vec<Slot>,
    unused: Vec<usize>,
    tree: RbTree,
    bins: [usize; BIN_COUNT],
    descriptor_count: usize,
    total_space: u64,
    free_space: u64,
    source: AllocationSource,
}

impl MemoryDescriptorList {
    pub fn new(source: AllocationSource) -> Self {
        Self {
            slots: Vec::new(),
            unused: Vec::new(),
            tree: RbTree::new(),
            bins: [NIL; BIN_COUNT],
            descriptor_count: 0,
            total_space: 0,
            free_space: 0,
            source,
        }
    }

    pub fn source(&self) -> AllocationSource {
        self.source
    }

    pub fn descriptor_count(&self) -> usize {
        self.descriptor_count
    }

    /// Sum of the sizes of all descriptors.
    pub fn total_space(&self) -> u64 {
        self.total_space
    }

    /// Sum of the sizes of all free descriptors.
    pub fn free_space(&self) -> u64 {
        self.free_space
    }

    /// Number of descriptor slots available without growing.
    pub fn unused_descriptors(&self) -> usize {
        self.unused.len()
    }

    /// Hands `count` additional descriptor slots to the list.
    pub fn donate_descriptors(&mut self, count: usize) -> MmResult<()> {
        self.slots
            .try_reserve(count)
            .map_err(|_| MmError::ResourceExhausted)?;
        self.unused
            .try_reserve(count)
            .map_err(|_| MmError::ResourceExhausted)?;

        for _ in 0..count {
            self.unused.push(self.slots.len());
            self.slots.push(Slot::unused());
        }

        Ok(())
    }

    fn reserve_descriptors(&mut self, count: usize) -> MmResult<()> {
        while self.unused.len() < count {
            if self.source == AllocationSource::None {
                return Err(MmError::ResourceExhausted);
            }

            self.donate_descriptors(DESCRIPTORS_PER_BATCH)?;
        }

        Ok(())
    }

    fn take_slot(&mut self, descriptor: MemoryDescriptor) -> usize {
        let Some(index) = self.unused.pop() else {
            panic!("descriptor slots were not reserved");
        };

        let slot = &mut self.slots[index];
        slot.descriptor = descriptor;
        slot.in_use = true;
        index
    }

    fn link(&mut self, descriptor: MemoryDescriptor) {
        let index = self.take_slot(descriptor);
        self.tree.insert(&mut self.slots, index);
        self.descriptor_count += 1;
        self.total_space += descriptor.size;
        if descriptor.kind.is_free() {
            self.free_space += descriptor.size;
            self.bin_insert(index);
        }
    }

    fn unlink(&mut self, index: usize) {
        let descriptor = self.slots[index].descriptor;
        if descriptor.kind.is_free() {
            self.bin_remove(index);
            self.free_space -= descriptor.size;
        }

        self.tree.remove(&mut self.slots, index);
        self.descriptor_count -= 1;
        self.total_space -= descriptor.size;
        self.slots[index] = Slot::unused();
        self.unused.push(index);
    }

    /// Changes the extent of a linked descriptor without disturbing its tree position.
    fn reshape(&mut self, index: usize, start: u64, end: u64) {
        let old = self.slots[index].descriptor;
        debug_assert!(start < end);
        if old.kind.is_free() {
            self.bin_remove(index);
        }

        self.total_space = self.total_space - old.size + (end - start);
        self.slots[index].descriptor.base = start;
        self.slots[index].descriptor.size = end - start;
        if old.kind.is_free() {
            self.free_space = self.free_space - old.size + (end - start);
            self.bin_insert(index);
        }
    }

    fn bin_insert(&mut self, index: usize) {
        let bin = bin_index(self.slots[index].descriptor.size);
        let head = self.bins[bin];
        self.slots[index].free_prev = NIL;
        self.slots[index].free_next = head;
        if head != NIL {
            self.slots[head].free_prev = index;
        }

        self.bins[bin] = index;
    }

    fn bin_remove(&mut self, index: usize) {
        let bin = bin_index(self.slots[index].descriptor.size);
        let (prev, next) = (self.slots[index].free_prev, self.slots[index].free_next);
        if prev == NIL {
            self.bins[bin] = next;
        } else {
            self.slots[prev].free_next = next;
        }

        if next != NIL {
            self.slots[next].free_prev = prev;
        }

        self.slots[index].free_prev = NIL;
        self.slots[index].free_next = NIL;
    }

    /// Clears `[start, end)` by shrinking, splitting or removing whatever overlaps it.
    ///
    /// The caller must have reserved one slot for a possible split.
    fn clear_range(&mut self, start: u64, end: u64) {
        let mut cursor = self.tree.floor(&self.slots, end - 1);
        while cursor != NIL {
            let current = self.slots[cursor].descriptor;
            if current.end() <= start {
                break;
            }

            let previous = self.tree.next(&self.slots, cursor, true);
            if current.base < start && current.end() > end {
                self.reshape(cursor, current.base, start);
                self.link(MemoryDescriptor::from_range(end, current.end(), current.kind));
            } else if current.base < start {
                self.reshape(cursor, current.base, start);
            } else if current.end() > end {
                self.reshape(cursor, end, current.end());
            } else {
                self.unlink(cursor);
            }

            cursor = previous;
        }
    }

    /// Adds a descriptor, overwriting anything it overlaps and merging it with neighbours
    /// of the same type.
    ///
    /// On failure the list is unchanged.
    pub fn add(&mut self, descriptor: MemoryDescriptor) -> MmResult<()> {
        if descriptor.size == 0 || descriptor.base.checked_add(descriptor.size).is_none() {
            return Err(MmError::InvalidParameter);
        }

        let (mut start, mut end) = (descriptor.base, descriptor.end());
        let covering = self.tree.floor(&self.slots, start);
        if covering != NIL {
            let existing = self.slots[covering].descriptor;
            if existing.kind == descriptor.kind && existing.end() >= end {
                return Ok(());
            }
        }

        self.reserve_descriptors(2)?;
        self.clear_range(start, end);

        if start != 0 {
            let before = self.tree.floor(&self.slots, start - 1);
            if before != NIL {
                let neighbour = self.slots[before].descriptor;
                if neighbour.kind == descriptor.kind && neighbour.end() == start {
                    start = neighbour.base;
                    self.unlink(before);
                }
            }
        }

        let after = self.tree.floor(&self.slots, end);
        if after != NIL {
            let neighbour = self.slots[after].descriptor;
            if neighbour.kind == descriptor.kind && neighbour.base == end {
                end = neighbour.end();
                self.unlink(after);
            }
        }

        self.link(MemoryDescriptor::from_range(start, end, descriptor.kind));
        Ok(())
    }

    /// Removes all coverage of `[start, end)`.
    pub fn remove_range(&mut self, start: u64, end: u64) -> MmResult<()> {
        if start >= end {
            return Err(MmError::InvalidParameter);
        }

        self.reserve_descriptors(1)?;
        self.clear_range(start, end);
        Ok(())
    }

    /// Returns a descriptor overlapping `[start, end)`, if any.
    pub fn lookup(&self, start: u64, end: u64) -> Option<MemoryDescriptor> {
        if start >= end {
            return None;
        }

        let index = self.tree.floor(&self.slots, end - 1);
        if index == NIL {
            return None;
        }

        let descriptor = self.slots[index].descriptor;
        (descriptor.end() > start).then_some(descriptor)
    }

    /// Returns the descriptor covering `address`, if any.
    pub fn find(&self, address: u64) -> Option<MemoryDescriptor> {
        self.lookup(address, address.checked_add(1)?)
    }

    /// Returns the single free descriptor covering all of `[start, end)`.
    pub fn is_range_free(&self, start: u64, end: u64) -> Option<MemoryDescriptor> {
        let index = self.tree.floor(&self.slots, start);
        if index == NIL {
            return None;
        }

        let descriptor = self.slots[index].descriptor;
        (descriptor.kind.is_free() && descriptor.end() >= end).then_some(descriptor)
    }

    fn fit(&self, index: usize, size: u64, alignment: u64, min: u64, max: u64, highest: bool) -> Option<u64> {
        let descriptor = self.slots[index].descriptor;
        if !descriptor.kind.is_free() || descriptor.size < size {
            return None;
        }

        let start = descriptor.base.max(min);
        let end = descriptor.end().min(max);
        if start >= end {
            return None;
        }

        let aligned = if highest {
            end.checked_sub(size)? & !(alignment - 1)
        } else {
            start.checked_add(alignment - 1)? & !(alignment - 1)
        };

        let aligned_end = aligned.checked_add(size)?;
        (aligned >= start && aligned_end <= end).then_some(aligned)
    }

    fn find_any(&self, size: u64, alignment: u64, min: u64, max: u64) -> Option<u64> {
        for bin in bin_index(size)..BIN_COUNT {
            let mut cursor = self.bins[bin];
            while cursor != NIL {
                if let Some(address) = self.fit(cursor, size, alignment, min, max, false) {
                    return Some(address);
                }

                cursor = self.slots[cursor].free_next;
            }
        }

        None
    }

    fn find_edge(&self, size: u64, alignment: u64, min: u64, max: u64, highest: bool) -> Option<u64> {
        let mut cursor = if highest {
            self.tree.last(&self.slots)
        } else {
            self.tree.first(&self.slots)
        };

        while cursor != NIL {
            if let Some(address) = self.fit(cursor, size, alignment, min, max, highest) {
                return Some(address);
            }

            cursor = self.tree.next(&self.slots, cursor, highest);
        }

        None
    }

    /// Carves `size` bytes out of free space in `[min, max)` and marks them `kind`.
    ///
    /// The fixed strategies treat `min` as the exact address wanted.
    pub fn allocate(
        &mut self,
        size: u64,
        alignment: u64,
        min: u64,
        max: u64,
        kind: DescriptorType,
        strategy: AllocationStrategy,
    ) -> MmResult<u64> {
        let alignment = alignment.max(1);
        if size == 0 || min >= max || !alignment.is_power_of_two() {
            return Err(MmError::InvalidParameter);
        }

        let address = match strategy {
            AllocationStrategy::AnyAddress => self.find_any(size, alignment, min, max),
            AllocationStrategy::LowestAddress => self.find_edge(size, alignment, min, max, false),
            AllocationStrategy::HighestAddress => self.find_edge(size, alignment, min, max, true),
            AllocationStrategy::FixedAddress => {
                let end = min.checked_add(size).ok_or(MmError::InvalidParameter)?;
                self.is_range_free(min, end).map(|_| min)
            }
            AllocationStrategy::FixedAddressClobber => {
                min.checked_add(size).ok_or(MmError::InvalidParameter)?;
                Some(min)
            }
        };

        let address = address.ok_or(MmError::ResourceExhausted)?;
        self.add(MemoryDescriptor::new(address, size, kind))?;
        Ok(address)
    }

    /// Allocates `count` separate `size`-aligned blocks of `size` bytes each.
    ///
    /// Runs are taken from the smallest bins first. If the full count cannot be granted,
    /// every block handed out so far is returned to the free pool.
    pub fn allocate_multiple(&mut self, size: u64, count: usize, kind: DescriptorType) -> MmResult<Vec<u64>> {
        if !size.is_power_of_two() || count == 0 {
            return Err(MmError::InvalidParameter);
        }

        let mut addresses = Vec::new();
        addresses
            .try_reserve(count)
            .map_err(|_| MmError::ResourceExhausted)?;

        let shift = size.trailing_zeros();
        let mut bin = bin_index(size);
        let mut result = Ok(());
        'bins: while addresses.len() < count && bin < BIN_COUNT {
            let mut cursor = self.bins[bin];
            let mut run = None;
            while cursor != NIL {
                let free = self.slots[cursor].descriptor;
                let start = free.base.checked_add(size - 1).map(|value| value & !(size - 1));
                let end = free.end() & !(size - 1);
                if let Some(start) = start.filter(|&start| start < end) {
                    run = Some((start, end));
                    break;
                }

                cursor = self.slots[cursor].free_next;
            }

            let Some((start, end)) = run else {
                bin += 1;
                continue;
            };

            let wanted = (count - addresses.len()) as u64;
            let granted = ((end - start) >> shift).min(wanted);
            let end = start + (granted << shift);
            if let Err(error) = self.add(MemoryDescriptor::from_range(start, end, kind)) {
                result = Err(error);
                break 'bins;
            }

            addresses.extend((0..granted).map(|block| start + (block << shift)));
        }

        if result.is_ok() && addresses.len() < count {
            result = Err(MmError::ResourceExhausted);
        }

        if let Err(error) = result {
            for &address in &addresses {
                let freed = self.add(MemoryDescriptor::new(address, size, DescriptorType::Free));
                debug_assert!(freed.is_ok());
            }

            return Err(error);
        }

        Ok(addresses)
    }

    /// Calls `visitor` with every descriptor in address order.
    pub fn iterate(&self, mut visitor: impl FnMut(&MemoryDescriptor)) {
        let mut cursor = self.tree.first(&self.slots);
        while cursor != NIL {
            visitor(&self.slots[cursor].descriptor);
            cursor = self.tree.next(&self.slots, cursor, false);
        }
    }

    /// Returns the descriptors in address order.
    pub fn descriptors(&self) -> Vec<MemoryDescriptor> {
        let mut all = Vec::with_capacity(self.descriptor_count);
        self.iterate(|descriptor| all.push(*descriptor));
        all
    }

    /// Copies every descriptor into `destination`, which must have an allocation source or
    /// enough donated slots.
    pub fn copy_into(&self, destination: &mut MemoryDescriptorList) -> MmResult<()> {
        let mut result = Ok(());
        self.iterate(|descriptor| {
            if result.is_ok() {
                result = destination.add(*descriptor);
            }
        });

        result
    }

    /// Re-derives the counters and checks ordering, coalescing and bin membership.
    pub fn validate(&self) -> Result<(), ListCorruption> {
        if self.tree.check(&self.slots).is_none() {
            return Err(ListCorruption::Unbalanced);
        }

        let mut total = 0;
        let mut free = 0;
        let mut count = 0;
        let mut previous: Option<MemoryDescriptor> = None;
        let mut failure = None;
        self.iterate(|descriptor| {
            if failure.is_some() {
                return;
            }

            if let Some(previous) = previous {
                if previous.end() > descriptor.base {
                    failure = Some(ListCorruption::Overlap {
                        base: descriptor.base,
                    });
                } else if previous.end() == descriptor.base && previous.kind == descriptor.kind {
                    failure = Some(ListCorruption::Uncoalesced {
                        base: descriptor.base,
                    });
                }
            }

            count += 1;
            total += descriptor.size;
            if descriptor.kind.is_free() {
                free += descriptor.size;
            }

            previous = Some(*descriptor);
        });

        if let Some(failure) = failure {
            return Err(failure);
        }

        if count != self.descriptor_count {
            return Err(ListCorruption::CountMismatch {
                counted: count,
                recorded: self.descriptor_count,
            });
        }

        if total != self.total_space {
            return Err(ListCorruption::TotalMismatch {
                counted: total,
                recorded: self.total_space,
            });
        }

        if free != self.free_space {
            return Err(ListCorruption::FreeMismatch {
                counted: free,
                recorded: self.free_space,
            });
        }

        let mut binned = 0;
        for (bin, &head) in self.bins.iter().enumerate() {
            let mut cursor = head;
            while cursor != NIL {
                let descriptor = self.slots[cursor].descriptor;
                if !descriptor.kind.is_free() || bin_index(descriptor.size) != bin {
                    return Err(ListCorruption::WrongBin {
                        base: descriptor.base,
                    });
                }

                binned += descriptor.size;
                cursor = self.slots[cursor].free_next;
            }
        }

        if binned != self.free_space {
            return Err(ListCorruption::FreeMismatch {
                counted: binned,
                recorded: self.free_space,
            });
        }

        Ok(())
    }

    /// Logs every descriptor and the totals.
    pub fn print(&self) {
        log::debug!(
            "descriptor list: {} descriptors, {:#x} total, {:#x} free",
            self.descriptor_count,
            self.total_space,
            self.free_space
        );

        self.iterate(|descriptor| log::debug!("  {descriptor:?}"));
        if let Err(corruption) = self.validate() {
            log::error!("descriptor list is corrupt: {corruption:?}");
            debug_assert!(false, "descriptor list is corrupt: {corruption:?}");
        }
    }
}

impl fmt::Debug for MemoryDescriptorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        self.iterate(|descriptor| {
            list.entry(descriptor);
        });

        list.finish()
    }
}
