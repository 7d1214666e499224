//! # Command Shapes
//!
//! Requests and responses of the operations [`StromDevice`](crate::StromDevice)
//! exposes. These are plain data; the marshalling layer that fills them from
//! a user-space command block lives outside this crate.

use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::types::{MappingHandle, Owner, PhysAddr, TaskId};

// =============================================================================
// MAPPING COMMANDS
// =============================================================================

/// Register a span of accelerator memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMapping {
    /// Device virtual address of the span
    pub address: u64,
    /// Length of the span in bytes
    pub length: u64,
}

/// Result of a successful registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingRegistration {
    /// Handle naming the mapping
    pub handle: MappingHandle,
    /// Device page size in bytes
    pub gpu_page_size: u64,
    /// Number of pinned device pages
    pub gpu_npages: u32,
}

/// Page-table summary of a registered mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingInfo {
    /// Page-table format version
    pub version: u32,
    /// Device page size in bytes
    pub gpu_page_size: u64,
    /// Principal that registered the mapping
    pub owner: Owner,
    /// Offset of the registered address from the device boundary
    pub map_offset: u64,
    /// `map_offset` plus the registered length
    pub map_length: u64,
    /// Bus address of every pinned page
    pub page_addrs: Vec<PhysAddr>,
}

// =============================================================================
// COPY TASK COMMANDS
// =============================================================================

/// Copy a list of chunks from a file into a mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyTaskRequest {
    /// Destination mapping
    pub handle: MappingHandle,
    /// Destination offset relative to the registered address
    pub offset: u64,
    /// Chunk size in bytes
    pub chunk_size: u32,
    /// Chunks per repeating file segment, 0 for a flat layout
    pub relseg_size: u32,
    /// Chunk indexes to copy, in order
    pub chunk_ids: Vec<u32>,
}

impl CopyTaskRequest {
    /// Number of chunks in the request
    #[inline]
    pub fn nr_chunks(&self) -> usize {
        self.chunk_ids.len()
    }
}

/// Outcome of a submitted copy task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyTaskResult {
    /// Task to wait on
    pub task_id: TaskId,
    /// Chunks routed to direct transfers
    pub nr_direct: u32,
    /// Chunks copied into the write-back buffer
    pub nr_writeback: u32,
    /// Physical transfers submitted
    pub nr_dma_submit: u32,
    /// Storage blocks covered by those transfers
    pub nr_dma_blocks: u32,
    /// Direct chunk ids from the front, write-back ids from the back
    pub chunk_ids: Vec<u32>,
}

// =============================================================================
// OUTPUT SLOTS
// =============================================================================

/// Copy `items` into a caller-sized array
///
/// Returns the total number of items. Fills as many slots as fit and
/// reports [`Error::NoBuffers`] when the array was too small.
pub fn fill_slots<T: Copy>(items: &[T], slots: &mut [T]) -> Result<usize> {
    let n = items.len().min(slots.len());
    slots[..n].copy_from_slice(&items[..n]);
    if items.len() > slots.len() {
        return Err(Error::NoBuffers);
    }
    Ok(items.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_slots_truncates() {
        let items = [1u64, 2, 3];
        let mut slots = [0u64; 2];
        assert_eq!(fill_slots(&items, &mut slots), Err(Error::NoBuffers));
        assert_eq!(slots, [1, 2]);

        let mut slots = [0u64; 4];
        assert_eq!(fill_slots(&items, &mut slots), Ok(3));
        assert_eq!(slots, [1, 2, 3, 0]);
    }
}
