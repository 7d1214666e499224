//! # Platform Collaborators
//!
//! Interfaces of the subsystems strom drives but does not implement:
//! the accelerator pinning API, the page cache, the filesystem block map,
//! the storage classifier and the storage submission queue.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                        StromDevice                        │
//! ├──────────────┬──────────────┬──────────────┬──────────────┤
//! │  GpuPinning  │  SourceFile  │ BlockResolver│ TransferQueue│
//! │  pin/unpin   │  page cache  │  bmap        │  async read  │
//! └──────────────┴──────────────┴──────────────┴──────────────┘
//! ```

use alloc::boxed::Box;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::error::Result;
use crate::mapping::RevocationHook;
use crate::transfer::{Rejected, TransferCompletion, TransferRequest};
use crate::types::PhysAddr;

// =============================================================================
// ACCELERATOR PINNING
// =============================================================================

/// Physical page table of a pinned accelerator range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTable {
    /// Page-table format version reported by the driver
    pub version: u32,
    /// Raw device page-size code
    pub page_size_code: u32,
    /// Bus address of every pinned device page, in virtual order
    pub pages: Vec<PhysAddr>,
}

impl PageTable {
    /// Number of entries
    #[inline]
    pub fn len(&self) -> usize {
        self.pages.len()
    }
}

/// Accelerator vendor API that pins device memory for peer DMA
pub trait GpuPinning: Send + Sync {
    /// Pin `[address, address + length)` and return its page table
    ///
    /// `hook` must be fired if the range is freed behind strom's back.
    /// Firing it blocks until every in-flight user of the range is gone.
    fn pin(&self, address: u64, length: u64, hook: RevocationHook) -> Result<PageTable>;

    /// Unpin a range registered by [`pin`](Self::pin)
    fn unpin(&self, address: u64, table: PageTable) -> Result<()>;

    /// Release a page table whose range the driver already tore down
    fn free_page_table(&self, table: PageTable);
}

// =============================================================================
// PAGE CACHE
// =============================================================================

bitflags! {
    /// State of a cached host page
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// Page holds data newer than the storage copy
        const DIRTY = 1 << 0;
        /// Page contents are valid
        const UPTODATE = 1 << 1;
    }
}

/// A locked, referenced page-cache page
///
/// Dropping the handle unlocks the page and releases the reference.
pub trait CachedPage: Send {
    /// Current page state
    fn flags(&self) -> PageFlags;

    /// Page contents, exactly one host page long
    fn contents(&self) -> &[u8];
}

/// Owned handle to a locked page
pub type PageRef = Box<dyn CachedPage>;

/// Source data of a copy task (an open regular file)
pub trait SourceFile: Send + Sync {
    /// Stable identity of the open file
    fn id(&self) -> u64;

    /// Current file size in bytes
    fn size(&self) -> u64;

    /// Lock the cached page at `index` without triggering a read
    fn find_lock_page(&self, index: u64) -> Option<PageRef>;

    /// Read the page at `index` synchronously and lock it
    fn read_page(&self, index: u64) -> Result<PageRef>;
}

// =============================================================================
// STORAGE
// =============================================================================

/// Block geometry of the partition backing a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGeometry {
    /// log2 of the filesystem block size
    pub block_shift: u32,
    /// First sector of the partition
    pub start_sect: u64,
    /// Number of sectors in the partition
    pub nr_sects: u64,
}

/// Decides whether a source may be read by direct transfers
pub trait DeviceClassifier: Send + Sync {
    /// Geometry of the eligible backing device, or the reason it is not
    fn classify(&self, source: &dyn SourceFile) -> Result<DeviceGeometry>;
}

/// Filesystem block map
pub trait BlockResolver: Send + Sync {
    /// Physical block number backing `logical` (in filesystem blocks)
    fn resolve(&self, source: &dyn SourceFile, logical: u64) -> Result<u64>;
}

/// Storage submission queue performing scatter-gather reads
pub trait TransferQueue: Send + Sync {
    /// Queue one physical transfer
    ///
    /// `completion` must be completed exactly once when the transfer
    /// finishes. A synchronous rejection hands it back unused.
    fn submit(
        &self,
        request: TransferRequest,
        completion: TransferCompletion,
    ) -> core::result::Result<(), Rejected>;
}
