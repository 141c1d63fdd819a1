//! Bring-up configuration for the memory manager.

/// Paging policy and tuning handed to [`crate::MemoryManager::new`].
#[derive(Debug, Clone)]
pub struct VmmConfig {
    /// Never create page files, even when a suitable volume arrives.
    pub paging_force_disabled: bool,
    /// Open page files on every volume rather than only the system volume.
    pub paging_on_all_volumes: bool,
    /// Name of the page file at the root of a volume.
    pub page_file_name: &'static str,
    /// Free-frame percentage below which the level 2 warning is raised.
    pub warning_level2_percent: usize,
    /// Free-frame percentage below which the level 1 warning is raised.
    pub warning_level1_percent: usize,
    /// Extra percentage of free frames needed before a warning is lowered.
    pub warning_hysteresis_percent: usize,
    /// Number of times an allocation retries after asking for pages to be paged out.
    pub allocation_retries: usize,
    /// Upper bound on paging entry blocks; `None` means unbounded.
    pub max_paging_entry_blocks: Option<usize>,
}

impl VmmConfig {
    /// Default page file name.
    pub const PAGE_FILE_NAME: &'static str = "pagefile.sys";
}

impl Default for VmmConfig {
    fn default() -> Self {
        Self {
            paging_force_disabled: false,
            paging_on_all_volumes: false,
            page_file_name: Self::PAGE_FILE_NAME,
            warning_level2_percent: 10,
            warning_level1_percent: 5,
            warning_hysteresis_percent: 2,
            allocation_retries: 4,
            max_paging_entry_blocks: None,
        }
    }
}
