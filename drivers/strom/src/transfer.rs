//! # Physical Transfers
//!
//! Turning a pending run of storage blocks into one scatter-gather read
//! request against the pinned accelerator pages, and the completion token
//! that ties the request back to its task.

use alloc::vec::Vec;
use core::fmt;

use crate::config::SECTOR_SHIFT;
use crate::error::{Error, Result};
use crate::mapping::MappedRegion;
use crate::scheduler::PendingRun;
use crate::task::{TaskConfig, TaskRef};
use crate::types::{PhysAddr, TaskId};

// =============================================================================
// REQUEST
// =============================================================================

/// One scatter-gather segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    /// Bus address of the first byte
    pub dma_addr: PhysAddr,
    /// Segment length in bytes
    pub length: u32,
}

/// One physical storage-to-accelerator read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Task the transfer belongs to
    pub task: TaskId,
    /// First sector on the whole device
    pub start_sector: u64,
    /// Number of filesystem blocks read
    pub nr_blocks: u32,
    /// log2 of the filesystem block size
    pub block_shift: u32,
    /// Destination offset within the pinned pages
    pub dest_offset: u64,
    /// Destination segments, in order
    pub segments: Vec<SgEntry>,
}

impl TransferRequest {
    /// Transfer length in bytes
    #[inline]
    pub fn total_bytes(&self) -> u64 {
        (self.nr_blocks as u64) << self.block_shift
    }

    /// Transfer length in sectors
    #[inline]
    pub fn nr_sectors(&self) -> u64 {
        self.total_bytes() >> SECTOR_SHIFT
    }
}

/// Build the request for `run`
pub fn build_request(
    region: &MappedRegion,
    task: TaskId,
    config: &TaskConfig,
    run: &PendingRun,
    max_transfer_len: u64,
) -> Result<TransferRequest> {
    let total = (run.nr_blocks as u64) << config.block_shift;
    if total == 0 || total > max_transfer_len {
        return Err(Error::InvalidParameter);
    }
    let dest = run.dest_offset;
    if dest < region.map_offset() || dest >= region.map_length() {
        return Err(Error::OutOfRange);
    }
    match dest.checked_add(total) {
        Some(end) if end <= region.map_length() => {},
        _ => return Err(Error::OutOfRange),
    }

    let sector_shift = config.block_shift - SECTOR_SHIFT;
    let rel_sector = run.src_block << sector_shift;
    let nr_sectors = total >> SECTOR_SHIFT;
    if !rel_sector
        .checked_add(nr_sectors)
        .is_some_and(|end| end <= config.nr_sects)
    {
        return Err(Error::OutOfRange);
    }

    let segments = region.with_pinned(|pinned| {
        let page_size = pinned.page_size.bytes();
        let mut index = (dest >> pinned.page_size.shift()) as usize;
        let mut offset = dest & (page_size - 1);
        let mut left = total;
        let mut segments = Vec::new();

        while left > 0 {
            let Some(base) = pinned.table.pages.get(index) else {
                return Err(Error::InvalidParameter);
            };
            let length = left.min(page_size - offset);
            segments.push(SgEntry {
                dma_addr: base.offset(offset),
                length: length as u32,
            });
            left -= length;
            offset = 0;
            index += 1;
        }
        Ok(segments)
    })??;

    log::debug!(
        "strom: transfer task={} dest={:#x} blocks={} segments={}",
        task,
        dest,
        run.nr_blocks,
        segments.len()
    );

    Ok(TransferRequest {
        task,
        start_sector: config.start_sect + rel_sector,
        nr_blocks: run.nr_blocks,
        block_shift: config.block_shift,
        dest_offset: dest,
        segments,
    })
}

// =============================================================================
// COMPLETION TOKEN
// =============================================================================

/// Reference a submitted transfer holds on its task
///
/// Completing it releases the reference with the transfer's status. A
/// token dropped without completion reports [`Error::TransferAborted`].
pub struct TransferCompletion {
    task: Option<TaskRef>,
}

impl TransferCompletion {
    pub(crate) fn new(task: TaskRef) -> Self {
        Self { task: Some(task) }
    }

    /// Task this transfer belongs to
    pub fn task_id(&self) -> Option<TaskId> {
        self.task.as_ref().map(TaskRef::id)
    }

    /// Report the transfer's final status
    pub fn complete(mut self, status: Result<()>) {
        if let Some(task) = self.task.take() {
            task.put(status.err());
        }
    }

    /// Release a transfer that never reached the device
    pub(crate) fn release(mut self) {
        if let Some(task) = self.task.take() {
            task.put(None);
        }
    }
}

impl Drop for TransferCompletion {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.put(Some(Error::TransferAborted));
        }
    }
}

impl fmt::Debug for TransferCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferCompletion")
            .field("task", &self.task_id())
            .finish()
    }
}

/// Synchronous rejection of a submission
#[derive(Debug)]
pub struct Rejected {
    /// Why the queue refused the transfer
    pub error: Error,
    /// Token handed back unused
    pub completion: TransferCompletion,
}
