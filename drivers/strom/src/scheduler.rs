//! # Request Scheduler
//!
//! Routes each chunk of a copy task either to the write-back path (most of
//! it is already in the page cache) or to direct storage-to-accelerator
//! transfers, coalescing direct chunks into as few physical transfers as
//! the hardware limit allows.
//!
//! ## Routing
//!
//! Every page of a chunk is probed in the page cache without triggering a
//! read. A resident page scores 1, a dirty one scores `threshold + 1` with
//! `threshold = pages_per_chunk / writeback_divisor`, so a single dirty page
//! forces write-back. A chunk scoring above the threshold is copied into
//! the caller's write-back buffer; everything else goes to storage.
//!
//! ## Merging
//!
//! A page's blocks join the pending run only if they continue it on
//! storage *and* in the destination, and the run stays within
//! `max_nblocks`. Anything else flushes the run as one transfer first.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use arrayvec::ArrayVec;

use crate::config::{StromConfig, MAX_CHUNK_PAGES};
use crate::error::{Error, Result};
use crate::mapping::MappedRegion;
use crate::platform::{BlockResolver, PageFlags, PageRef, SourceFile, TransferQueue};
use crate::task::{TaskConfig, TaskRef};
use crate::transfer::{build_request, Rejected, TransferCompletion};

// =============================================================================
// WRITE-BACK BUFFER
// =============================================================================

/// Caller memory receiving write-back chunks
///
/// Chunk `k` (1-based) of the write-back path lands at
/// `chunk_size * (nr_chunks - k)`, so the buffer fills from the back.
pub trait WritebackBuffer {
    /// Buffer length in bytes
    fn len(&self) -> usize;

    /// Copy without faulting; `false` sends the copy down the slow path
    fn try_write(&mut self, offset: usize, data: &[u8]) -> bool;

    /// Copy, faulting the destination in if needed
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()>;
}

fn copy_into(dst: &mut [u8], offset: usize, data: &[u8]) -> bool {
    let Some(end) = offset.checked_add(data.len()) else {
        return false;
    };
    match dst.get_mut(offset..end) {
        Some(slot) => {
            slot.copy_from_slice(data);
            true
        },
        None => false,
    }
}

impl WritebackBuffer for Vec<u8> {
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn try_write(&mut self, offset: usize, data: &[u8]) -> bool {
        copy_into(self, offset, data)
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        if copy_into(self, offset, data) {
            Ok(())
        } else {
            Err(Error::Fault)
        }
    }
}

/// Borrowed byte slice as a write-back buffer
#[derive(Debug)]
pub struct SliceBuffer<'a>(pub &'a mut [u8]);

impl WritebackBuffer for SliceBuffer<'_> {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn try_write(&mut self, offset: usize, data: &[u8]) -> bool {
        copy_into(&mut *self.0, offset, data)
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        if copy_into(&mut *self.0, offset, data) {
            Ok(())
        } else {
            Err(Error::Fault)
        }
    }
}

// =============================================================================
// REQUEST / OUTCOME
// =============================================================================

/// Chunk list of one copy task
#[derive(Debug, Clone, Copy)]
pub struct ChunkRequest<'a> {
    /// Chunk indexes in processing order
    pub chunk_ids: &'a [u32],
    /// Chunk size in bytes
    pub chunk_size: u32,
    /// Destination offset relative to the registered address
    pub dest_offset: u64,
    /// Chunks per repeating file segment, 0 for a flat layout
    pub relseg_size: u32,
}

/// Routing and submission counts of one scheduling pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleOutcome {
    /// Chunks routed to direct transfers
    pub nr_direct: u32,
    /// Chunks copied into the write-back buffer
    pub nr_writeback: u32,
    /// Physical transfers submitted
    pub nr_dma_submit: u32,
    /// Blocks covered by those transfers
    pub nr_dma_blocks: u32,
    /// Direct ids from the front, write-back ids from the back
    pub chunk_ids: Vec<u32>,
}

/// Output id list of `len` entries, allocated without aborting
fn zeroed_ids(len: usize) -> Result<Vec<u32>> {
    let mut ids = Vec::new();
    ids.try_reserve_exact(len).map_err(|_| Error::OutOfMemory)?;
    ids.resize(len, 0);
    Ok(ids)
}

/// Check a chunk size against the page size and transfer ceiling
pub fn validate_chunk_size(chunk_size: u32, page_size: u64, max_transfer_len: u64) -> Result<()> {
    let chunk_size = chunk_size as u64;
    if chunk_size & (page_size - 1) != 0 || chunk_size < page_size {
        return Err(Error::MisalignedChunk);
    }
    if chunk_size > max_transfer_len {
        return Err(Error::ChunkTooLarge);
    }
    Ok(())
}

// =============================================================================
// PENDING RUN
// =============================================================================

/// Contiguous blocks waiting to become one physical transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingRun {
    /// Destination offset of the first block
    pub dest_offset: u64,
    /// First storage block
    pub src_block: u64,
    /// Number of blocks
    pub nr_blocks: u32,
}

impl PendingRun {
    /// Check if the run holds no blocks
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nr_blocks == 0
    }

    /// Extend the run if `src_block` at `dest_offset` continues it
    pub fn try_merge(
        &mut self,
        src_block: u64,
        dest_offset: u64,
        nr_blocks: u32,
        config: &TaskConfig,
    ) -> bool {
        if self.nr_blocks > 0
            && self.nr_blocks + nr_blocks <= config.max_nblocks
            && self.src_block + self.nr_blocks as u64 == src_block
            && self.dest_offset + ((self.nr_blocks as u64) << config.block_shift) == dest_offset
        {
            self.nr_blocks += nr_blocks;
            true
        } else {
            false
        }
    }
}

// =============================================================================
// REQUEST SCHEDULER
// =============================================================================

/// One scheduling pass over a copy task's chunk list
pub struct RequestScheduler<'a> {
    resolver: &'a dyn BlockResolver,
    queue: &'a dyn TransferQueue,
    page_shift: u32,
    max_transfer_len: u64,
    writeback_divisor: u32,
}

struct Target<'a> {
    task: &'a TaskRef,
    config: TaskConfig,
    region: Arc<MappedRegion>,
    source: Arc<dyn SourceFile>,
}

impl<'a> RequestScheduler<'a> {
    /// Scheduler submitting through `queue`
    pub fn new(
        config: &StromConfig,
        resolver: &'a dyn BlockResolver,
        queue: &'a dyn TransferQueue,
    ) -> Self {
        Self {
            resolver,
            queue,
            page_shift: config.host_page_shift,
            max_transfer_len: config.max_transfer_len,
            writeback_divisor: config.writeback_divisor,
        }
    }

    /// Route and submit every chunk of `request` under `task`
    ///
    /// Stops at the first error. Transfers submitted before it stay in
    /// flight and hold their own task references.
    pub fn run(
        &self,
        task: &TaskRef,
        request: &ChunkRequest<'_>,
        writeback: &mut dyn WritebackBuffer,
    ) -> Result<ScheduleOutcome> {
        let page_size = 1u64 << self.page_shift;
        validate_chunk_size(request.chunk_size, page_size, self.max_transfer_len)?;

        let (region, source) = task.targets()?;
        let target = Target {
            task,
            config: task.config(),
            region,
            source,
        };

        let nr_chunks = request.chunk_ids.len();
        let chunk_size = request.chunk_size as u64;
        let nr_pages = (chunk_size >> self.page_shift) as usize;
        let threshold = nr_pages / self.writeback_divisor as usize;

        let mut dest_offset = target
            .region
            .map_offset()
            .checked_add(request.dest_offset)
            .ok_or(Error::OutOfRange)?;
        let span = (nr_chunks as u64)
            .checked_mul(chunk_size)
            .and_then(|span| span.checked_add(dest_offset));
        if !span.is_some_and(|end| end <= target.region.map_length()) {
            return Err(Error::OutOfRange);
        }

        let file_size = target.source.size();
        let mut outcome = ScheduleOutcome {
            chunk_ids: zeroed_ids(nr_chunks)?,
            ..ScheduleOutcome::default()
        };
        let mut run = PendingRun::default();
        let mut pages: ArrayVec<Option<PageRef>, MAX_CHUNK_PAGES> = ArrayVec::new();

        for &chunk_id in request.chunk_ids {
            let index = match request.relseg_size {
                0 => chunk_id,
                relseg => chunk_id % relseg,
            };
            let fpos = index as u64 * chunk_size;
            if fpos > file_size {
                return Err(Error::OutOfRange);
            }
            let first_page = fpos >> self.page_shift;

            let mut score = 0;
            for i in 0..nr_pages {
                let page = target.source.find_lock_page(first_page + i as u64);
                if let Some(page) = &page {
                    score += if page.flags().contains(PageFlags::DIRTY) {
                        threshold + 1
                    } else {
                        1
                    };
                }
                pages.try_push(page).map_err(|_| Error::ChunkTooLarge)?;
            }

            if score > threshold {
                outcome.nr_writeback += 1;
                let slot = nr_chunks - outcome.nr_writeback as usize;
                let offset = slot * request.chunk_size as usize;
                self.write_back(&*target.source, &mut pages, first_page, offset, writeback)?;
                outcome.chunk_ids[slot] = chunk_id;
            } else {
                self.submit_chunk(&target, &mut run, &mut outcome, fpos, nr_pages, dest_offset)?;
                outcome.chunk_ids[outcome.nr_direct as usize] = chunk_id;
                outcome.nr_direct += 1;
                dest_offset += chunk_size;
            }

            // unlocks and releases every probed page
            pages.clear();
        }

        if !run.is_empty() {
            self.submit(&target, &run, &mut outcome)?;
        }
        debug_assert_eq!(
            (outcome.nr_direct + outcome.nr_writeback) as usize,
            nr_chunks
        );

        Ok(outcome)
    }

    fn write_back(
        &self,
        source: &dyn SourceFile,
        pages: &mut [Option<PageRef>],
        first_page: u64,
        mut offset: usize,
        writeback: &mut dyn WritebackBuffer,
    ) -> Result<()> {
        let page_size = 1usize << self.page_shift;

        for (i, slot) in pages.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(source.read_page(first_page + i as u64)?);
            }
            let Some(page) = slot.as_ref() else {
                continue;
            };

            let data = page.contents();
            if !writeback.try_write(offset, data) {
                writeback.write(offset, data)?;
            }
            offset += page_size;
        }
        Ok(())
    }

    fn submit_chunk(
        &self,
        target: &Target<'_>,
        run: &mut PendingRun,
        outcome: &mut ScheduleOutcome,
        fpos: u64,
        nr_pages: usize,
        dest_offset: u64,
    ) -> Result<()> {
        let config = &target.config;
        let blocks_per_page = 1u32 << (self.page_shift - config.block_shift);
        let mut curr = dest_offset;
        let mut pos = fpos;

        for _ in 0..nr_pages {
            let block = self
                .resolver
                .resolve(&*target.source, pos >> config.block_shift)
                .inspect_err(|err| {
                    log::error!("strom: block lookup at {:#x} failed: {}", pos, err);
                })?;

            if !run.try_merge(block, curr, blocks_per_page, config) {
                if !run.is_empty() {
                    self.submit(target, run, outcome)?;
                }
                *run = PendingRun {
                    dest_offset: curr,
                    src_block: block,
                    nr_blocks: blocks_per_page,
                };
            }
            curr += 1 << self.page_shift;
            pos += 1 << self.page_shift;
        }
        Ok(())
    }

    fn submit(&self, target: &Target<'_>, run: &PendingRun, outcome: &mut ScheduleOutcome) -> Result<()> {
        outcome.nr_dma_submit += 1;
        outcome.nr_dma_blocks += run.nr_blocks;

        let request = build_request(
            &target.region,
            target.task.id(),
            &target.config,
            run,
            self.max_transfer_len,
        )
        .inspect_err(|err| log::error!("strom: building transfer failed: {}", err))?;

        let completion = TransferCompletion::new(target.task.get());
        match self.queue.submit(request, completion) {
            Ok(()) => Ok(()),
            Err(Rejected { error, completion }) => {
                completion.release();
                log::error!("strom: transfer submission failed: {}", error);
                Err(error)
            },
        }
    }
}

impl fmt::Debug for RequestScheduler<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestScheduler")
            .field("page_shift", &self.page_shift)
            .field("max_transfer_len", &self.max_transfer_len)
            .field("writeback_divisor", &self.writeback_divisor)
            .finish()
    }
}
