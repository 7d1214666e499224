//! # Mapping Registry
//!
//! Registered spans of pinned accelerator memory.
//!
//! A region is reachable through its handle only while it sits in its
//! shard. Every user holds a [`MappingRef`]; the count it maintains is what
//! revocation drains before the page table is released.
//!
//! ## Lifecycle
//!
//! ```text
//!  register ──► published ──► unregister ──┐
//!                   │                      ├──► drain ──► teardown
//!                   └────► revocation ─────┘
//! ```
//!
//! The region leaves its shard before the drain starts, so no new acquirer
//! can find it while the last references go away. Teardown takes the page
//! table exactly once, whichever path gets there first.
//!
//! Lock order is shard, then region state. The page-table lock is a leaf.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::ops::Deref;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use core::task::Waker;

use hashbrown::HashMap;
use spin::Mutex;

use crate::command::{MappingInfo, MappingRegistration};
use crate::config::StromConfig;
use crate::error::{Error, Result};
use crate::hash::Shards;
use crate::platform::{GpuPinning, PageTable};
use crate::sched::{Scheduler, WaitMode};
use crate::types::{GpuPageSize, MappingHandle, Owner};

// =============================================================================
// MAPPED REGION
// =============================================================================

/// Page table of a pinned region together with its classified page size
#[derive(Debug)]
pub struct Pinned {
    /// Driver page table
    pub table: PageTable,
    /// Device page size
    pub page_size: GpuPageSize,
}

#[derive(Debug, Default)]
struct DrainState {
    refcnt: usize,
    waiter: Option<Waker>,
}

/// One registered span of accelerator memory
#[derive(Debug)]
pub struct MappedRegion {
    owner: Owner,
    map_address: u64,
    map_offset: u64,
    map_length: u64,
    pinned: Mutex<Option<Pinned>>,
    state: Mutex<DrainState>,
    revoked: AtomicBool,
}

impl MappedRegion {
    fn new(owner: Owner, map_address: u64, map_offset: u64, map_length: u64) -> Self {
        Self {
            owner,
            map_address,
            map_offset,
            map_length,
            pinned: Mutex::new(None),
            state: Mutex::new(DrainState::default()),
            revoked: AtomicBool::new(false),
        }
    }

    /// Handle naming this region
    #[inline]
    pub fn handle(&self) -> MappingHandle {
        MappingHandle::from_ptr(self as *const Self)
    }

    /// Principal that registered the region
    #[inline]
    pub fn owner(&self) -> Owner {
        self.owner
    }

    /// Device-boundary aligned base address
    #[inline]
    pub fn map_address(&self) -> u64 {
        self.map_address
    }

    /// Offset of the registered address from `map_address`
    #[inline]
    pub fn map_offset(&self) -> u64 {
        self.map_offset
    }

    /// `map_offset` plus the registered length
    #[inline]
    pub fn map_length(&self) -> u64 {
        self.map_length
    }

    /// Current reference count
    pub fn refcnt(&self) -> usize {
        self.state.lock().refcnt
    }

    /// Run `f` against the pinned page table
    ///
    /// Fails with [`Error::Revoked`] once the table has been torn down.
    pub fn with_pinned<R>(&self, f: impl FnOnce(&Pinned) -> R) -> Result<R> {
        let pinned = self.pinned.lock();
        pinned.as_ref().map(f).ok_or(Error::Revoked)
    }

    fn release(&self) {
        let waiter = {
            let mut state = self.state.lock();
            assert!(state.refcnt > 0, "mapping reference count underflow");
            state.refcnt -= 1;
            if state.refcnt == 0 {
                state.waiter.take()
            } else {
                None
            }
        };
        if let Some(waker) = waiter {
            waker.wake();
        }
    }

    /// Block until every reference is gone
    fn drain(&self, scheduler: &dyn Scheduler) {
        let waker = scheduler.current();
        let saved = {
            let mut state = self.state.lock();
            if state.refcnt == 0 {
                return;
            }
            state.waiter.replace(waker.clone())
        };

        loop {
            scheduler.sleep(WaitMode::Uninterruptible);
            let mut state = self.state.lock();
            if state.refcnt == 0 {
                break;
            }
            // spurious wake; re-arm if a release already took us
            if state.waiter.is_none() {
                state.waiter = Some(waker.clone());
            }
        }

        // a drainer that registered before us
        if let Some(previous) = saved {
            previous.wake();
        }
    }
}

// =============================================================================
// MAPPING REFERENCE
// =============================================================================

/// Counted reference to a published region
///
/// Dropping it releases the reference and wakes a drainer on the last one.
pub struct MappingRef {
    region: Arc<MappedRegion>,
}

impl MappingRef {
    /// Handle of the referenced region
    #[inline]
    pub fn handle(&self) -> MappingHandle {
        self.region.handle()
    }

    /// Uncounted pointer to the region, valid to read while `self` lives
    pub(crate) fn region(&self) -> Arc<MappedRegion> {
        Arc::clone(&self.region)
    }
}

impl Deref for MappingRef {
    type Target = MappedRegion;

    fn deref(&self) -> &MappedRegion {
        &self.region
    }
}

impl Drop for MappingRef {
    fn drop(&mut self) {
        self.region.release();
    }
}

impl fmt::Debug for MappingRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MappingRef").field(&self.region.handle()).finish()
    }
}

// =============================================================================
// REVOCATION HOOK
// =============================================================================

/// Callback handed to the pinning driver at registration
///
/// The driver fires it when the pinned range disappears underneath the
/// registry (the owning process freed it). Firing blocks until every
/// in-flight user of the region has released it.
pub struct RevocationHook {
    registry: Weak<MappingRegistry>,
    region: Arc<MappedRegion>,
}

impl RevocationHook {
    /// Handle of the region this hook revokes
    pub fn handle(&self) -> MappingHandle {
        self.region.handle()
    }

    /// Revoke the region
    pub fn revoke(self) {
        match self.registry.upgrade() {
            Some(registry) => registry.revoke(&self.region),
            None => log::warn!(
                "strom: revocation of mapping {} after registry shutdown",
                self.region.handle()
            ),
        }
    }
}

impl fmt::Debug for RevocationHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RevocationHook")
            .field(&self.region.handle())
            .finish()
    }
}

// =============================================================================
// MAPPING REGISTRY
// =============================================================================

type MappingShard = HashMap<u64, Arc<MappedRegion>>;

/// Sharded table of registered regions
pub struct MappingRegistry {
    shards: Shards<MappingShard>,
    pinning: Arc<dyn GpuPinning>,
    scheduler: Arc<dyn Scheduler>,
    host_page_size: u64,
    device_bound: u64,
    live: AtomicUsize,
}

impl MappingRegistry {
    /// Create an empty registry
    pub fn new(
        config: &StromConfig,
        pinning: Arc<dyn GpuPinning>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            shards: Shards::new(config.mapping_shards, config.mapping_hash_seed),
            pinning,
            scheduler,
            host_page_size: config.host_page_size(),
            device_bound: config.device_bound(),
            live: AtomicUsize::new(0),
        })
    }

    /// Number of regions not yet torn down
    pub fn live_mappings(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Pin `[address, address + length)` and publish it
    pub fn register(
        self: &Arc<Self>,
        address: u64,
        length: u64,
        owner: Owner,
    ) -> Result<MappingRegistration> {
        if length == 0 {
            return Err(Error::InvalidParameter);
        }
        let map_address = address & !(self.device_bound - 1);
        let map_offset = address & (self.device_bound - 1);
        let map_length = map_offset
            .checked_add(length)
            .ok_or(Error::InvalidParameter)?;

        let region = Arc::new(MappedRegion::new(owner, map_address, map_offset, map_length));
        let handle = region.handle();
        let hook = RevocationHook {
            registry: Arc::downgrade(self),
            region: Arc::clone(&region),
        };

        // counts the region until its page table is torn down
        self.live.fetch_add(1, Ordering::AcqRel);

        let table = match self.pinning.pin(map_address, map_length, hook) {
            Ok(table) => table,
            Err(err) => {
                log::error!(
                    "strom: pinning device memory (addr={:#x}, len={}) failed: {}",
                    map_address,
                    map_length,
                    err
                );
                self.live.fetch_sub(1, Ordering::AcqRel);
                return Err(err);
            },
        };

        let page_size = match GpuPageSize::from_code(table.page_size_code) {
            Some(page_size) => page_size,
            None => {
                let code = table.page_size_code;
                if let Err(err) = self.pinning.unpin(map_address, table) {
                    log::error!("strom: unpinning device memory failed: {}", err);
                }
                self.live.fetch_sub(1, Ordering::AcqRel);
                return Err(Error::UnsupportedPageSize(code));
            },
        };

        let registration = MappingRegistration {
            handle,
            gpu_page_size: page_size.bytes(),
            gpu_npages: table.len() as u32,
        };
        let version = table.version;
        *region.pinned.lock() = Some(Pinned { table, page_size });

        {
            let mut shard = self.shards.lock(handle.id());
            if region.revoked.load(Ordering::Acquire) {
                drop(shard);
                self.free_table(&region);
                return Err(Error::Revoked);
            }
            shard.insert(handle.id(), Arc::clone(&region));
        }

        log::info!(
            "strom: mapping {} registered (version={}, page_size={}, entries={})",
            handle,
            version,
            registration.gpu_page_size,
            registration.gpu_npages
        );
        if map_offset & (self.host_page_size - 1) != 0
            || map_length & (self.host_page_size - 1) != 0
        {
            log::warn!(
                "strom: mapping {} is not page aligned (map_offset={:#x} map_length={:#x})",
                handle,
                map_offset,
                map_length
            );
        }

        Ok(registration)
    }

    /// Take a reference on a region owned by `owner`
    pub fn acquire(&self, handle: MappingHandle, owner: Owner) -> Result<MappingRef> {
        let shard = self.shards.lock(handle.id());
        match shard.get(&handle.id()) {
            Some(region) if region.owner == owner => {
                region.state.lock().refcnt += 1;
                Ok(MappingRef {
                    region: Arc::clone(region),
                })
            },
            _ => {
                drop(shard);
                log::error!("strom: mapping {} not found", handle);
                Err(Error::NotFound)
            },
        }
    }

    /// Remove a region and unpin it
    ///
    /// The caller is expected to have stopped using the region. If copy
    /// tasks still hold references, this blocks until they are gone.
    pub fn unregister(&self, handle: MappingHandle, owner: Owner) -> Result<()> {
        let region = {
            let mut shard = self.shards.lock(handle.id());
            match shard.get(&handle.id()) {
                Some(region) if region.owner == owner => shard.remove(&handle.id()),
                _ => None,
            }
        };
        let Some(region) = region else {
            log::error!("strom: no mapping found (handle={})", handle);
            return Err(Error::NotFound);
        };

        if region.refcnt() > 0 {
            log::warn!(
                "strom: mapping {} unregistered with {} references outstanding",
                handle,
                region.refcnt()
            );
            region.drain(&*self.scheduler);
        }
        self.unpin_table(&region)
    }

    /// Asynchronous revocation by the pinning driver
    fn revoke(&self, region: &Arc<MappedRegion>) {
        let handle = region.handle();
        {
            let mut shard = self.shards.lock(handle.id());
            region.revoked.store(true, Ordering::Release);
            shard.remove(&handle.id());
        }
        region.drain(&*self.scheduler);
        self.free_table(region);
    }

    /// Take the page table out of `region`, exactly once
    fn take_table(&self, region: &MappedRegion) -> Option<PageTable> {
        let pinned = region.pinned.lock().take()?;
        debug_assert_eq!(region.refcnt(), 0);
        self.live.fetch_sub(1, Ordering::AcqRel);
        log::info!("strom: mapping {} released", region.handle());
        Some(pinned.table)
    }

    /// Unpin a region the caller unregistered
    fn unpin_table(&self, region: &MappedRegion) -> Result<()> {
        let Some(table) = self.take_table(region) else {
            return Ok(());
        };
        self.pinning
            .unpin(region.map_address, table)
            .inspect_err(|err| log::error!("strom: unpinning device memory failed: {}", err))
    }

    /// Release the table of a range the driver already tore down
    fn free_table(&self, region: &MappedRegion) {
        if let Some(table) = self.take_table(region) {
            self.pinning.free_page_table(table);
        }
    }

    /// Handles of every published region
    pub fn list(&self) -> Vec<MappingHandle> {
        let mut handles = Vec::new();
        for index in 0..self.shards.len() {
            let shard = self.shards.lock_at(index);
            handles.extend(shard.values().map(|region| region.handle()));
        }
        handles
    }

    /// Page-table summary of a region owned by `owner`
    pub fn info(&self, handle: MappingHandle, owner: Owner) -> Result<MappingInfo> {
        let mapping = self.acquire(handle, owner)?;
        mapping.with_pinned(|pinned| MappingInfo {
            version: pinned.table.version,
            gpu_page_size: pinned.page_size.bytes(),
            owner: mapping.owner(),
            map_offset: mapping.map_offset(),
            map_length: mapping.map_length(),
            page_addrs: pinned.table.pages.clone(),
        })
    }
}

impl fmt::Debug for MappingRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingRegistry")
            .field("shards", &self.shards)
            .field("live", &self.live_mappings())
            .finish()
    }
}
