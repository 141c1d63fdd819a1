//! Paging entries: the records that make a physical frame pageable.
//!
//! Entries live in fixed-size blocks and are named by a compact handle so the per-frame
//! metadata only needs a `u32` to point at one. The back-reference to the owning section
//! is weak; whoever uses it upgrades and then validates it under the section lock.

use alloc::{boxed::Box, sync::Weak, vec::Vec};
use core::num::NonZeroU32;

use bitflags::bitflags;

use crate::{MmError, MmResult, section::ImageSection};

/// Number of entries carved out of one pool block.
pub const ENTRIES_PER_BLOCK: usize = 50;

bitflags! {
    /// Transient state of a paging entry.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct PagingEntryFlags: u8 {
        /// The page-out path owns the frame.
        const PAGING_OUT = 1 << 0;
        /// The frame was freed while locked; release it on the final unlock.
        const FREED = 1 << 1;
    }
}

/// Handle of a paging entry within a [`PagingEntryPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PagingEntryId(NonZeroU32);

impl PagingEntryId {
    /// Rebuilds a handle from its raw value; zero means "no entry".
    pub fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    /// Returns the raw, nonzero value of the handle.
    pub fn into_raw(self) -> u32 {
        self.0.get()
    }

    fn new(block: usize, slot: usize) -> Option<Self> {
        let raw = block.checked_mul(ENTRIES_PER_BLOCK)?.checked_add(slot + 1)?;
        Self::from_raw(u32::try_from(raw).ok()?)
    }

    fn location(self) -> (usize, usize) {
        let index = self.0.get() as usize - 1;
        (index / ENTRIES_PER_BLOCK, index % ENTRIES_PER_BLOCK)
    }
}

/// Pageability record attached to one physical frame.
#[derive(Debug)]
pub struct PagingEntry {
    /// Section that owns the frame.
    pub section: Weak<ImageSection>,
    /// Page offset of the frame within that section.
    pub offset: usize,
    /// Number of outstanding locks pinning the frame.
    pub lock_count: u32,
    pub flags: PagingEntryFlags,
}

struct Block {
    entries: [Option<PagingEntry>; ENTRIES_PER_BLOCK],
    used: usize,
}

impl Block {
    fn new() -> Box<Self> {
        Box::new(Self {
            entries: core::array::from_fn(|_| None),
            used: 0,
        })
    }
}

/// Block pool of paging entries.
pub struct PagingEntryPool {
    blocks: Vec<Option<Box<Block>>>,
    live: usize,
    max_blocks: Option<usize>,
}

impl PagingEntryPool {
    /// Creates an empty pool, optionally bounded to `max_blocks` blocks.
    pub fn new(max_blocks: Option<usize>) -> Self {
        Self {
            blocks: Vec::new(),
            live: 0,
            max_blocks,
        }
    }

    /// Creates an entry for page `offset` of `section`.
    pub fn create(&mut self, section: Weak<ImageSection>, offset: usize) -> MmResult<PagingEntryId> {
        let entry = PagingEntry {
            section,
            offset,
            lock_count: 0,
            flags: PagingEntryFlags::empty(),
        };

        let block_index = match self
            .blocks
            .iter()
            .position(|block| block.as_ref().is_some_and(|b| b.used < ENTRIES_PER_BLOCK))
        {
            Some(index) => index,
            None => self.grow()?,
        };

        let Some(block) = self.blocks[block_index].as_mut() else {
            return Err(MmError::ResourceExhausted);
        };

        let slot = block
            .entries
            .iter()
            .position(Option::is_none)
            .ok_or(MmError::ResourceExhausted)?;

        let id = PagingEntryId::new(block_index, slot).ok_or(MmError::ResourceExhausted)?;
        block.entries[slot] = Some(entry);
        block.used += 1;
        self.live += 1;
        Ok(id)
    }

    fn grow(&mut self) -> MmResult<usize> {
        if let Some(index) = self.blocks.iter().position(Option::is_none) {
            self.blocks[index] = Some(Block::new());
            return Ok(index);
        }

        let present = self.blocks.len();
        if self.max_blocks.is_some_and(|max| present >= max) {
            return Err(MmError::ResourceExhausted);
        }

        self.blocks.push(Some(Block::new()));
        Ok(present)
    }

    /// Points an existing entry at a different section page and clears its state.
    pub fn reinitialize(&mut self, id: PagingEntryId, section: Weak<ImageSection>, offset: usize) {
        if let Some(entry) = self.get_mut(id) {
            entry.section = section;
            entry.offset = offset;
            entry.lock_count = 0;
            entry.flags = PagingEntryFlags::empty();
        }
    }

    /// Releases an entry. Blocks left completely empty are trimmed.
    pub fn destroy(&mut self, id: PagingEntryId) {
        let (block_index, slot) = id.location();
        let Some(Some(block)) = self.blocks.get_mut(block_index) else {
            return;
        };

        if block.entries[slot].take().is_some() {
            block.used -= 1;
            self.live -= 1;
        }

        if block.used == 0 {
            self.blocks[block_index] = None;
            while matches!(self.blocks.last(), Some(None)) {
                self.blocks.pop();
            }
        }
    }

    pub fn get(&self, id: PagingEntryId) -> Option<&PagingEntry> {
        let (block, slot) = id.location();
        self.blocks.get(block)?.as_ref()?.entries[slot].as_ref()
    }

    pub fn get_mut(&mut self, id: PagingEntryId) -> Option<&mut PagingEntry> {
        let (block, slot) = id.location();
        self.blocks.get_mut(block)?.as_mut()?.entries[slot].as_mut()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Number of blocks currently allocated.
    pub fn block_count(&self) -> usize {
        self.blocks.iter().filter(|block| block.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_nonzero_and_round_trip() {
        let mut pool = PagingEntryPool::new(None);
        let id = pool.create(Weak::new(), 3).unwrap();
        assert_ne!(id.into_raw(), 0);
        assert_eq!(PagingEntryId::from_raw(id.into_raw()), Some(id));
        assert_eq!(pool.get(id).unwrap().offset, 3);
        assert!(PagingEntryId::from_raw(0).is_none());
    }

    #[test]
    fn blocks_fill_then_grow_then_trim() {
        let mut pool = PagingEntryPool::new(None);
        let ids: Vec<_> = (0..ENTRIES_PER_BLOCK + 1)
            .map(|offset| pool.create(Weak::new(), offset).unwrap())
            .collect();

        assert_eq!(pool.block_count(), 2);
        assert_eq!(pool.len(), ENTRIES_PER_BLOCK + 1);

        pool.destroy(ids[ENTRIES_PER_BLOCK]);
        assert_eq!(pool.block_count(), 1);

        for id in &ids[..ENTRIES_PER_BLOCK] {
            pool.destroy(*id);
        }

        assert_eq!(pool.block_count(), 0);
        assert!(pool.is_empty());
    }

    #[test]
    fn bounded_pool_runs_out() {
        let mut pool = PagingEntryPool::new(Some(1));
        for offset in 0..ENTRIES_PER_BLOCK {
            pool.create(Weak::new(), offset).unwrap();
        }

        assert_eq!(pool.create(Weak::new(), 0), Err(MmError::ResourceExhausted));
    }

    #[test]
    fn reinitialize_clears_state() {
        let mut pool = PagingEntryPool::new(None);
        let id = pool.create(Weak::new(), 1).unwrap();
        {
            let entry = pool.get_mut(id).unwrap();
            entry.lock_count = 2;
            entry.flags = PagingEntryFlags::PAGING_OUT;
        }

        pool.reinitialize(id, Weak::new(), 9);
        let entry = pool.get(id).unwrap();
        assert_eq!(entry.offset, 9);
        assert_eq!(entry.lock_count, 0);
        assert!(entry.flags.is_empty());
    }

    #[test]
    fn slots_are_reused() {
        let mut pool = PagingEntryPool::new(None);
        let first = pool.create(Weak::new(), 0).unwrap();
        let _second = pool.create(Weak::new(), 1).unwrap();
        pool.destroy(first);
        let third = pool.create(Weak::new(), 2).unwrap();
        assert_eq!(first, third);
    }
}
