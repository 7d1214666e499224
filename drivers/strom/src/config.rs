//! # Strom Configuration
//!
//! Tuning constants for the registries and the request scheduler.
//!
//! Shard counts and transfer limits are runtime configuration bounded by
//! compile-time ceilings, so fixed-capacity buffers can be sized statically.

use static_assertions::const_assert;

use crate::error::{Error, Result};

// =============================================================================
// COMPILE-TIME CEILINGS
// =============================================================================

/// Upper bound on the number of mapping shards
pub const MAX_MAPPING_SHARDS: usize = 1024;

/// Upper bound on the number of task shards
pub const MAX_TASK_SHARDS: usize = 4096;

/// Smallest supported host page shift (4 KiB)
pub const MIN_HOST_PAGE_SHIFT: u32 = 12;

/// Largest supported host page shift (64 KiB)
pub const MAX_HOST_PAGE_SHIFT: u32 = 16;

/// Hardware ceiling of a single physical transfer
pub const MAX_TRANSFER_CEILING: u64 = 1024 * 1024;

/// Most host pages a single chunk can span
pub const MAX_CHUNK_PAGES: usize = (MAX_TRANSFER_CEILING >> MIN_HOST_PAGE_SHIFT) as usize;

/// Sector size used by the storage submission queue
pub const SECTOR_SHIFT: u32 = 9;

const_assert!(MAX_TRANSFER_CEILING & ((1 << MIN_HOST_PAGE_SHIFT) - 1) == 0);
const_assert!(MAX_CHUNK_PAGES <= 256);
const_assert!(MIN_HOST_PAGE_SHIFT > SECTOR_SHIFT);

// =============================================================================
// DEFAULTS
// =============================================================================

/// Default number of mapping shards
pub const DEFAULT_MAPPING_SHARDS: usize = 48;

/// Default number of task shards
pub const DEFAULT_TASK_SHARDS: usize = 240;

/// Default maximum physical transfer length
///
/// Some NVMe controllers reject requests larger than 128 KiB.
pub const DEFAULT_MAX_TRANSFER_LEN: u64 = 128 * 1024;

const_assert!(DEFAULT_MAPPING_SHARDS <= MAX_MAPPING_SHARDS);
const_assert!(DEFAULT_TASK_SHARDS <= MAX_TASK_SHARDS);
const_assert!(DEFAULT_MAX_TRANSFER_LEN <= MAX_TRANSFER_CEILING);

// =============================================================================
// STROM CONFIGURATION
// =============================================================================

/// Subsystem configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StromConfig {
    /// Number of independently locked mapping shards
    pub mapping_shards: usize,
    /// Number of independently locked task shards
    pub task_shards: usize,
    /// Seed of the mapping-handle hash
    pub mapping_hash_seed: u64,
    /// Seed of the task-id hash
    pub task_hash_seed: u64,
    /// log2 of the host page size
    pub host_page_shift: u32,
    /// log2 of the device boundary registered addresses are aligned to
    pub device_bound_shift: u32,
    /// Maximum bytes per physical transfer
    pub max_transfer_len: u64,
    /// Write-back threshold is `pages_per_chunk / writeback_divisor`
    pub writeback_divisor: u32,
    /// Target string reported by the status endpoint
    pub target: &'static str,
}

impl StromConfig {
    /// Default configuration
    pub const fn new() -> Self {
        Self {
            mapping_shards: DEFAULT_MAPPING_SHARDS,
            task_shards: DEFAULT_TASK_SHARDS,
            mapping_hash_seed: 0x2014_0702,
            task_hash_seed: 0x2012_0106,
            host_page_shift: MIN_HOST_PAGE_SHIFT,
            device_bound_shift: 16,
            max_transfer_len: DEFAULT_MAX_TRANSFER_LEN,
            writeback_divisor: 2,
            target: "helix",
        }
    }

    /// Override the maximum physical transfer length
    pub const fn with_max_transfer_len(self, max_transfer_len: u64) -> Self {
        Self {
            max_transfer_len,
            ..self
        }
    }

    /// Override the shard counts
    pub const fn with_shards(self, mapping_shards: usize, task_shards: usize) -> Self {
        Self {
            mapping_shards,
            task_shards,
            ..self
        }
    }

    /// Host page size in bytes
    #[inline]
    pub const fn host_page_size(&self) -> u64 {
        1 << self.host_page_shift
    }

    /// Device boundary in bytes
    #[inline]
    pub const fn device_bound(&self) -> u64 {
        1 << self.device_bound_shift
    }

    /// Check every field against its ceiling
    pub fn validate(&self) -> Result<()> {
        if self.mapping_shards == 0 || self.mapping_shards > MAX_MAPPING_SHARDS {
            return Err(Error::InvalidParameter);
        }
        if self.task_shards == 0 || self.task_shards > MAX_TASK_SHARDS {
            return Err(Error::InvalidParameter);
        }
        if !(MIN_HOST_PAGE_SHIFT..=MAX_HOST_PAGE_SHIFT).contains(&self.host_page_shift) {
            return Err(Error::InvalidParameter);
        }
        if self.device_bound_shift < self.host_page_shift || self.device_bound_shift > 30 {
            return Err(Error::InvalidParameter);
        }
        let page = self.host_page_size();
        if self.max_transfer_len < page
            || self.max_transfer_len & (page - 1) != 0
            || self.max_transfer_len > MAX_TRANSFER_CEILING
        {
            return Err(Error::InvalidParameter);
        }
        if self.writeback_divisor == 0 {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }
}

impl Default for StromConfig {
    fn default() -> Self {
        Self::new()
    }
}
