//! Performance and policy related configuration.

use std::time::Duration;

#[derive(Copy, Clone, Debug)]
pub struct Configuration {
    /// Block size used for content unless a set overrides it.
    pub default_block_size: u32,
    /// Block size for catalog I/O. Fixed so a catalog written with one
    /// content block size can be read back under another.
    pub toc_block_size: u32,
    /// Capacity withheld from content when the catalog shares the
    /// content partition.
    pub reserved_toc_capacity: u64,
    /// Optional hard cap on content bytes, below what the medium
    /// reports. The capacity guard subtracts this before admitting a
    /// file.
    pub user_capacity_limit: Option<u64>,
    /// Write a locator mark ahead of the catalog on drives that can
    /// space over sequential filemarks.
    pub use_toc_mark: bool,
    /// Attempts for open/load when the drive reports a transient
    /// condition.
    pub open_retry_limit: u32,
    pub open_retry_pause: Duration,
    /// Early-warning zone requested from the drive, in units of the
    /// default block size.
    pub eot_warning_factor: u32,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            default_block_size: 16 * 1024,
            toc_block_size: 16 * 1024,
            reserved_toc_capacity: 16 * 1024 * 1024,
            user_capacity_limit: None,
            use_toc_mark: true,
            open_retry_limit: 4,
            open_retry_pause: Duration::from_secs(1),
            eot_warning_factor: 4,
        }
    }
}
