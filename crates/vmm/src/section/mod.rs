//! Image sections.
//!
//! An image section is a run of virtual pages in one address space with a backing
//! policy: anonymous, private copy of a file, or shared view of the page cache. Private
//! sections copied by fork form an inheritance tree. A child inherits page `p` from its
//! parent until it writes the page, and the nearest ancestor whose inherit bit for `p`
//! is clear owns the page's contents.
//!
//! Every section of one tree lives in a single arena guarded by a single lock, so
//! walking parents and children never takes more than one section lock. All sections of
//! a tree start at the same virtual address; splitting a section only ever shrinks its
//! end, and the part cut off becomes the root of a new tree.

mod lifecycle;

use alloc::{sync::Arc, sync::Weak, vec::Vec};
use core::ops::Range;

use bitflags::bitflags;

use crate::{
    MapFlags, MmError, MmResult, PAGE_SIZE, PhysicalAddress, SectionFlags, UnmapFlags,
    VirtualAddress,
    address_space::AddressSpace,
    bitmap::Bitmap,
    io::ImageBacking,
    manager::MemoryManager,
    page_file::{PageFileList, PageFileSpace},
    paging_entry::PagingEntryId,
};

bitflags! {
    /// Options for unmapping part of a section.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct UnmapSectionFlags: u32 {
        /// The backing file is shrinking. Dirty pages past the cut are discarded.
        const TRUNCATE = 1 << 0;
        /// Only unmap pages whose frame the page cache owns.
        const PAGE_CACHE_ONLY = 1 << 1;
    }
}

/// Per-section state kept in the tree arena.
pub(crate) struct SectionNode {
    pub(crate) va: VirtualAddress,
    pub(crate) size: usize,
    pub(crate) flags: SectionFlags,
    pub(crate) map_flags: MapFlags,
    pub(crate) space: Weak<AddressSpace>,
    pub(crate) parent: Option<usize>,
    pub(crate) children: Vec<usize>,
    /// Pages still shared with the parent.
    pub(crate) inherit: Bitmap,
    /// Pages whose contents differ from the backing image.
    pub(crate) dirty: Bitmap,
    /// Page indices that have ever been mapped.
    pub(crate) touched: Range<usize>,
    pub(crate) image: Option<ImageBacking>,
    pub(crate) page_file: Option<PageFileSpace>,
    /// Bumped whenever the backing file is truncated under the section.
    pub(crate) truncate_count: u64,
    pub(crate) handle: Weak<ImageSection>,
}

impl SectionNode {
    pub(crate) fn page_count(&self) -> usize {
        self.size / PAGE_SIZE
    }

    pub(crate) fn page_va(&self, page: usize) -> VirtualAddress {
        self.va + page * PAGE_SIZE
    }

    pub(crate) fn touch(&mut self, page: usize) {
        if self.touched.is_empty() {
            self.touched = page..page + 1;
        } else {
            self.touched.start = self.touched.start.min(page);
            self.touched.end = self.touched.end.max(page + 1);
        }
    }

    fn inherits(&self, page: usize) -> bool {
        page < self.inherit.len() && self.inherit.get(page)
    }
}

/// The arena of one inheritance tree.
pub(crate) struct TreeState {
    nodes: Vec<Option<SectionNode>>,
    free: Vec<usize>,
}

/// Guard over a whole tree.
pub(crate) type SectionGuard<'a> = spin::MutexGuard<'a, TreeState>;

impl TreeState {
    pub(crate) fn node(&self, index: usize) -> &SectionNode {
        match self.nodes.get(index) {
            Some(Some(node)) => node,
            _ => panic!("section {} is not live", index),
        }
    }

    pub(crate) fn node_mut(&mut self, index: usize) -> &mut SectionNode {
        match self.nodes.get_mut(index) {
            Some(Some(node)) => node,
            _ => panic!("section {} is not live", index),
        }
    }

    pub(crate) fn insert(&mut self, node: SectionNode) -> MmResult<usize> {
        if let Some(index) = self.free.pop() {
            self.nodes[index] = Some(node);
            return Ok(index);
        }

        self.nodes
            .try_reserve(1)
            .map_err(|_| MmError::ResourceExhausted)?;

        self.nodes.push(Some(node));
        Ok(self.nodes.len() - 1)
    }

    /// Drops a node whose last handle is gone.
    fn reclaim(&mut self, index: usize) {
        let Some(node) = self.nodes.get_mut(index).and_then(Option::take) else {
            return;
        };

        if let Some(parent) = node.parent {
            if let Some(Some(parent)) = self.nodes.get_mut(parent) {
                parent.children.retain(|&child| child != index);
            }
        }

        for other in self.nodes.iter_mut().flatten() {
            if other.parent == Some(index) {
                other.parent = None;
            }
        }

        if let Some(space) = &node.page_file {
            PageFileList::free_space(space, 0, node.page_count());
        }

        self.free.push(index);
    }

    /// The section holding the contents of page `page` as seen from `index`.
    pub(crate) fn owner(&self, index: usize, page: usize) -> usize {
        let mut current = index;
        loop {
            let node = self.node(current);
            match node.parent {
                Some(parent) if node.inherits(page) && page < self.node(parent).page_count() => {
                    current = parent;
                }
                _ => return current,
            }
        }
    }

    pub(crate) fn any_child_inherits(&self, index: usize, page: usize) -> bool {
        self.node(index)
            .children
            .iter()
            .any(|&child| self.node(child).inherits(page))
    }

    /// Decides whether `index` may map page `page`, owned by `owner`, writable.
    fn can_write(&self, index: usize, owner: usize, page: usize) -> bool {
        let node = self.node(index);
        if !node.flags.contains(SectionFlags::WRITABLE) {
            return false;
        }

        if node.flags.contains(SectionFlags::SHARED) {
            return true;
        }

        if index != owner {
            return false;
        }

        if node.flags.contains(SectionFlags::PAGE_CACHE_BACKED) && !node.dirty.get(page) {
            return false;
        }

        !self.any_child_inherits(index, page)
    }

    /// Mapping attributes for page `page` of `index`, owned by `owner`.
    pub(crate) fn mapping_flags(&self, index: usize, owner: usize, page: usize) -> MapFlags {
        let node = self.node(index);
        let mut flags = node.map_flags & MapFlags::SECTION_MASK;
        if node.flags.is_accessible() {
            flags |= MapFlags::PRESENT;
        }

        if node.flags.contains(SectionFlags::EXECUTABLE) {
            flags |= MapFlags::EXECUTE;
        }

        if node.va.is_user() {
            flags |= MapFlags::USER_MODE;
        } else {
            flags |= MapFlags::GLOBAL;
        }

        if !self.can_write(index, owner, page) {
            flags |= MapFlags::READ_ONLY;
        }

        flags
    }
}

/// Shared home of every section in one inheritance tree.
pub(crate) struct SectionTree {
    state: spin::Mutex<TreeState>,
    /// Nodes whose handle was dropped while the tree was locked.
    retired: spin::Mutex<Vec<usize>>,
}

impl SectionTree {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: spin::Mutex::new(TreeState {
                nodes: Vec::new(),
                free: Vec::new(),
            }),
            retired: spin::Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn lock(&self) -> SectionGuard<'_> {
        let mut state = self.state.lock();
        let retired = core::mem::take(&mut *self.retired.lock());
        for index in retired {
            state.reclaim(index);
        }

        state
    }

    #[cfg(test)]
    pub(crate) fn is_locked(&self) -> bool {
        self.state.is_locked()
    }
}

impl Drop for SectionTree {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for index in self.retired.get_mut().drain(..) {
            state.reclaim(index);
        }
    }
}

/// A handle on one image section.
pub struct ImageSection {
    tree: Arc<SectionTree>,
    index: usize,
    va: VirtualAddress,
}

impl ImageSection {
    /// Inserts `node` into `tree` and returns its handle.
    pub(crate) fn attach(tree: Arc<SectionTree>, node: SectionNode) -> MmResult<Arc<Self>> {
        let va = node.va;
        let mut state = tree.lock();
        let index = state.insert(node)?;
        let section = Arc::new(Self {
            tree: tree.clone(),
            index,
            va,
        });

        state.node_mut(index).handle = Arc::downgrade(&section);
        drop(state);
        Ok(section)
    }

    /// Creates the handle for a node already inserted into a locked tree.
    pub(crate) fn attach_locked(tree: &Arc<SectionTree>, state: &mut TreeState, index: usize) -> Arc<Self> {
        let section = Arc::new(Self {
            tree: tree.clone(),
            index,
            va: state.node(index).va,
        });

        state.node_mut(index).handle = Arc::downgrade(&section);
        section
    }

    pub(crate) fn lock(&self) -> SectionGuard<'_> {
        self.tree.lock()
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn tree(&self) -> &Arc<SectionTree> {
        &self.tree
    }

    pub fn virtual_address(&self) -> VirtualAddress {
        self.va
    }

    pub fn size(&self) -> usize {
        self.lock().node(self.index).size
    }

    pub fn flags(&self) -> SectionFlags {
        self.lock().node(self.index).flags
    }

    pub fn page_count(&self) -> usize {
        self.size() / PAGE_SIZE
    }

    pub fn image(&self) -> Option<ImageBacking> {
        self.lock().node(self.index).image.clone()
    }

    /// Returns true if the section inherits page `page` from a parent.
    pub fn inherits(&self, page: usize) -> bool {
        self.lock().node(self.index).inherits(page)
    }

    /// Returns true if the section's copy of page `page` differs from its backing.
    pub fn is_dirty(&self, page: usize) -> bool {
        let state = self.lock();
        let node = state.node(self.index);
        page < node.dirty.len() && node.dirty.get(page)
    }

    /// Returns true if the section holds page file space.
    pub fn has_page_file_space(&self) -> bool {
        self.lock().node(self.index).page_file.is_some()
    }
}

impl Drop for ImageSection {
    fn drop(&mut self) {
        match self.tree.state.try_lock() {
            Some(mut state) => state.reclaim(self.index),
            None => self.tree.retired.lock().push(self.index),
        }
    }
}

impl core::fmt::Debug for ImageSection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ImageSection")
            .field("va", &self.va)
            .field("index", &self.index)
            .finish()
    }
}

impl MemoryManager {
    /// The frame section `index` maps at page `page`, present or not.
    pub(crate) fn section_frame(&self, state: &TreeState, index: usize, page: usize) -> Option<PhysicalAddress> {
        let node = state.node(index);
        let space = node.space.upgrade()?;
        self.leaf_entry(&space, node.page_va(page))?.frame()
    }

    /// Maps `frame` at page `page` of `owner` and of every descendant that inherits the
    /// page, or unmaps the page from all of them when `frame` is `None`.
    ///
    /// Returns true if any unmapped entry was dirty.
    pub(crate) fn modify_section_mapping(
        &self,
        state: &mut TreeState,
        owner: usize,
        page: usize,
        frame: Option<PhysicalAddress>,
    ) -> MmResult<bool> {
        let mut pending = Vec::new();
        pending
            .try_reserve(1)
            .map_err(|_| MmError::ResourceExhausted)?;

        pending.push(owner);
        let mut dirty = false;
        while let Some(index) = pending.pop() {
            let node = state.node(index);
            if page >= node.page_count() || node.flags.contains(SectionFlags::DESTROYED) {
                continue;
            }

            if index != owner && !node.inherits(page) {
                continue;
            }

            pending
                .try_reserve(node.children.len())
                .map_err(|_| MmError::ResourceExhausted)?;

            pending.extend(node.children.iter().copied());
            let Some(space) = node.space.upgrade() else {
                continue;
            };

            let va = node.page_va(page);
            match frame {
                Some(frame) => {
                    let flags = state.mapping_flags(index, owner, page);
                    self.map_page(&space, frame, va, flags)?;
                    state.node_mut(index).touch(page);
                }
                None => {
                    if let Some(unmapped) = self.unmap_page(&space, va, UnmapFlags::SEND_INVALIDATE_IPI) {
                        dirty |= unmapped.dirty;
                    }
                }
            }
        }

        Ok(dirty)
    }

    /// Installs a freshly filled frame for page `page` of `owner` across its tree and
    /// hands the frame's paging entry to the section.
    pub(crate) fn map_page_in_section(
        &self,
        state: &mut TreeState,
        owner: usize,
        page: usize,
        frame: PhysicalAddress,
        entry: Option<PagingEntryId>,
        lock: bool,
    ) -> MmResult<()> {
        self.modify_section_mapping(state, owner, page, Some(frame))?;
        if let Some(entry) = entry {
            let handle = state.node(owner).handle.clone();
            self.physical.reinitialize_paging_entry(entry, handle, page);
            self.physical.enable_paging(frame, entry, lock);
        }

        Ok(())
    }

    /// Fails with `TooLate` once a section is destroyed and with `TryAgain` if it no
    /// longer covers `page`.
    pub(crate) fn check_section_page(state: &TreeState, index: usize, page: usize) -> MmResult<()> {
        let node = state.node(index);
        if node.flags.contains(SectionFlags::DESTROYED) {
            return Err(MmError::TooLate);
        }

        if page >= node.page_count() {
            return Err(MmError::TryAgain);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestSystem;

    fn anonymous(system: &TestSystem, pages: usize) -> (Arc<AddressSpace>, Arc<ImageSection>) {
        let space = system.create_process();
        system.switch_to(&space);
        let va = system.map_anonymous(&space, pages * PAGE_SIZE, SectionFlags::READABLE | SectionFlags::WRITABLE);
        let section = space.find_section(va).unwrap();
        (space, section)
    }

    #[test]
    fn touched_extent_grows_both_ways() {
        let system = TestSystem::new();
        let (space, section) = anonymous(&system, 8);
        system.write_user(&space, section.virtual_address() + 5 * PAGE_SIZE, &[1]);
        system.write_user(&space, section.virtual_address() + 2 * PAGE_SIZE, &[1]);
        let state = section.lock();
        assert_eq!(state.node(section.index()).touched, 2..6);
    }

    #[test]
    fn root_owns_every_page() {
        let system = TestSystem::new();
        let (_space, section) = anonymous(&system, 4);
        let state = section.lock();
        for page in 0..4 {
            assert_eq!(state.owner(section.index(), page), section.index());
        }
    }

    #[test]
    fn mapping_flags_follow_section_permissions() {
        let system = TestSystem::new();
        let (_space, section) = anonymous(&system, 1);
        let index = section.index();
        let mut state = section.lock();
        let flags = state.mapping_flags(index, index, 0);
        assert!(flags.contains(MapFlags::PRESENT | MapFlags::USER_MODE));
        assert!(!flags.contains(MapFlags::READ_ONLY));
        assert!(!flags.contains(MapFlags::EXECUTE));

        state.node_mut(index).flags.remove(SectionFlags::WRITABLE);
        assert!(state.mapping_flags(index, index, 0).contains(MapFlags::READ_ONLY));
        state.node_mut(index).flags.remove(SectionFlags::READABLE);
        assert!(!state.mapping_flags(index, index, 0).contains(MapFlags::PRESENT));
    }

    #[test]
    fn forked_child_maps_parent_pages_read_only() {
        let system = TestSystem::new();
        let (parent, section) = anonymous(&system, 2);
        let va = section.virtual_address();
        system.write_user(&parent, va, &[0xAA]);
        let child = system.manager.fork_address_space(&parent).unwrap();
        let copy = child.find_section(va).unwrap();
        assert!(Arc::ptr_eq(copy.tree(), section.tree()));

        let state = section.lock();
        let parent_index = section.index();
        let child_index = copy.index();
        assert_eq!(state.owner(child_index, 0), parent_index);
        assert!(state.any_child_inherits(parent_index, 0));
        assert!(state.mapping_flags(parent_index, parent_index, 0).contains(MapFlags::READ_ONLY));
        assert!(state.mapping_flags(child_index, parent_index, 0).contains(MapFlags::READ_ONLY));
    }

    #[test]
    fn dropped_handles_are_reclaimed() {
        let system = TestSystem::new();
        let (space, section) = anonymous(&system, 1);
        let tree = section.tree().clone();
        let index = section.index();
        system.manager.cleanup_address_space(&space);
        drop(section);
        let state = tree.lock();
        assert!(state.nodes[index].is_none());
        assert!(state.free.contains(&index));
    }
}
