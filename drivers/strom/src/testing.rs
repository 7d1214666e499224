//! In-memory collaborators for unit tests.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use hashbrown::HashMap;
use spin::Mutex;

use crate::command::RegisterMapping;
use crate::config::StromConfig;
use crate::device::{Collaborators, StromDevice};
use crate::error::{Error, Result};
use crate::mapping::RevocationHook;
use crate::platform::{
    BlockResolver, CachedPage, DeviceClassifier, DeviceGeometry, GpuPinning, PageFlags, PageRef,
    PageTable, SourceFile, TransferQueue,
};
use crate::sched::ThreadScheduler;
use crate::scheduler::WritebackBuffer;
use crate::session::Session;
use crate::task::{TaskConfig, TaskRegistry};
use crate::transfer::{Rejected, TransferCompletion, TransferRequest};
use crate::types::{GpuPageSize, MappingHandle, Owner, PhysAddr};

/// Device-virtual address of the harness mapping (64 KiB aligned)
pub const MAP_ADDR: u64 = 0x7f10_0000_0000;
/// Length of the harness mapping
pub const MAP_LEN: u64 = 1 << 20;
/// Size of the harness source file
pub const FILE_SIZE: u64 = 64 << 20;
/// Physical block backing logical block 0
pub const BLOCK_BASE: u64 = 0x10000;
/// Partition the harness file lives on
pub const GEOMETRY: DeviceGeometry = DeviceGeometry {
    block_shift: 12,
    start_sect: 2048,
    nr_sects: 1 << 30,
};

const PAGE_BASE: u64 = 0x40_0000_0000;
const HOST_PAGE: usize = 4096;

// =============================================================================
// PINNING
// =============================================================================

#[derive(Default)]
struct PinState {
    hooks: HashMap<u64, RevocationHook>,
    pinned_at: Vec<u64>,
    unpinned: usize,
    freed: usize,
    fail_next: Option<i32>,
}

/// Pinning driver handing out synthetic bus addresses
pub struct MockPinning {
    page_size_code: u32,
    state: Mutex<PinState>,
}

impl MockPinning {
    pub fn new() -> Arc<Self> {
        Self::with_page_size_code(GpuPageSize::Size64K as u32)
    }

    pub fn with_page_size_code(page_size_code: u32) -> Arc<Self> {
        Arc::new(Self {
            page_size_code,
            state: Mutex::new(PinState::default()),
        })
    }

    fn page_bytes(&self) -> u64 {
        GpuPageSize::from_code(self.page_size_code).map_or(HOST_PAGE as u64, GpuPageSize::bytes)
    }

    /// Bus address of device page `index` of any pinned range
    pub fn page_addr(&self, index: usize) -> PhysAddr {
        PhysAddr::new(PAGE_BASE + index as u64 * self.page_bytes())
    }

    pub fn fail_next_pin(&self, rc: i32) {
        self.state.lock().fail_next = Some(rc);
    }

    /// Fire the revocation callback of the range pinned at `address`
    pub fn revoke(&self, address: u64) -> bool {
        let hook = self.state.lock().hooks.remove(&address);
        match hook {
            Some(hook) => {
                hook.revoke();
                true
            },
            None => false,
        }
    }

    pub fn pinned_at(&self) -> Vec<u64> {
        self.state.lock().pinned_at.clone()
    }

    pub fn unpinned(&self) -> usize {
        self.state.lock().unpinned
    }

    pub fn freed(&self) -> usize {
        self.state.lock().freed
    }
}

impl GpuPinning for MockPinning {
    fn pin(&self, address: u64, length: u64, hook: RevocationHook) -> Result<PageTable> {
        let mut state = self.state.lock();
        if let Some(rc) = state.fail_next.take() {
            return Err(Error::PinFailed(rc));
        }
        let count = length.div_ceil(self.page_bytes()) as usize;
        state.hooks.insert(address, hook);
        state.pinned_at.push(address);
        Ok(PageTable {
            version: 0x0001_0000,
            page_size_code: self.page_size_code,
            pages: (0..count).map(|i| self.page_addr(i)).collect(),
        })
    }

    fn unpin(&self, address: u64, _table: PageTable) -> Result<()> {
        let hook = {
            let mut state = self.state.lock();
            state.unpinned += 1;
            state.hooks.remove(&address)
        };
        drop(hook);
        Ok(())
    }

    fn free_page_table(&self, _table: PageTable) {
        self.state.lock().freed += 1;
    }
}

// =============================================================================
// STORAGE
// =============================================================================

/// Classifier accepting every file as living on [`GEOMETRY`]
#[derive(Default)]
pub struct MockClassifier {
    reject: Mutex<Option<Error>>,
}

impl MockClassifier {
    /// Fail every later classification with `err`
    pub fn reject(&self, err: Error) {
        *self.reject.lock() = Some(err);
    }
}

impl DeviceClassifier for MockClassifier {
    fn classify(&self, _source: &dyn SourceFile) -> Result<DeviceGeometry> {
        match *self.reject.lock() {
            Some(err) => Err(err),
            None => Ok(GEOMETRY),
        }
    }
}

/// Linear block map with overrides
#[derive(Default)]
pub struct MockResolver {
    remapped: Mutex<HashMap<u64, u64>>,
    failures: Mutex<HashMap<u64, i32>>,
}

impl MockResolver {
    pub fn base(&self) -> u64 {
        BLOCK_BASE
    }

    pub fn remap(&self, logical: u64, physical: u64) {
        self.remapped.lock().insert(logical, physical);
    }

    pub fn fail_at(&self, logical: u64, rc: i32) {
        self.failures.lock().insert(logical, rc);
    }
}

impl BlockResolver for MockResolver {
    fn resolve(&self, _source: &dyn SourceFile, logical: u64) -> Result<u64> {
        if let Some(rc) = self.failures.lock().get(&logical) {
            return Err(Error::BlockMapping(*rc));
        }
        Ok(self
            .remapped
            .lock()
            .get(&logical)
            .copied()
            .unwrap_or(BLOCK_BASE + logical))
    }
}

/// Queue recording every accepted request
#[derive(Default)]
pub struct MockQueue {
    submitted: Mutex<Vec<TransferRequest>>,
    pending: Mutex<Vec<TransferCompletion>>,
    reject_next: Mutex<Option<Error>>,
}

impl MockQueue {
    pub fn requests(&self) -> Vec<TransferRequest> {
        self.submitted.lock().clone()
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn reject_next(&self, err: Error) {
        *self.reject_next.lock() = Some(err);
    }

    /// Complete every outstanding transfer with `status`
    pub fn complete_all(&self, status: Result<()>) {
        let pending: Vec<_> = self.pending.lock().drain(..).collect();
        for completion in pending {
            completion.complete(status);
        }
    }
}

impl TransferQueue for MockQueue {
    fn submit(
        &self,
        request: TransferRequest,
        completion: TransferCompletion,
    ) -> core::result::Result<(), Rejected> {
        let rejected = self.reject_next.lock().take();
        if let Some(error) = rejected {
            return Err(Rejected { error, completion });
        }
        self.submitted.lock().push(request);
        self.pending.lock().push(completion);
        Ok(())
    }
}

// =============================================================================
// PAGE CACHE
// =============================================================================

struct MockPage {
    flags: PageFlags,
    data: Vec<u8>,
    locked: Arc<AtomicUsize>,
}

impl CachedPage for MockPage {
    fn flags(&self) -> PageFlags {
        self.flags
    }

    fn contents(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for MockPage {
    fn drop(&mut self) {
        self.locked.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Source file with a controllable page cache
///
/// Every page is filled with [`page_byte`](Self::page_byte) of its index.
pub struct MockFile {
    size: u64,
    cached: Mutex<HashMap<u64, bool>>,
    locked: Arc<AtomicUsize>,
    reads: AtomicUsize,
}

impl MockFile {
    pub fn new(size: u64) -> Arc<Self> {
        Arc::new(Self {
            size,
            cached: Mutex::new(HashMap::new()),
            locked: Arc::new(AtomicUsize::new(0)),
            reads: AtomicUsize::new(0),
        })
    }

    pub fn cache_pages(&self, first: u64, count: u64, dirty: bool) {
        let mut cached = self.cached.lock();
        for index in first..first + count {
            cached.insert(index, dirty);
        }
    }

    pub fn cache_chunk(&self, chunk: u64, chunk_size: u32, dirty: bool) {
        let pages = chunk_size as u64 / HOST_PAGE as u64;
        self.cache_pages(chunk * pages, pages, dirty);
    }

    pub fn page_byte(&self, index: u64) -> u8 {
        (index as u8) | 0x80
    }

    /// Pages currently locked by callers
    pub fn locked_pages(&self) -> usize {
        self.locked.load(Ordering::Acquire)
    }

    /// Synchronous reads issued so far
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Acquire)
    }

    fn lock_page(&self, index: u64, flags: PageFlags) -> PageRef {
        self.locked.fetch_add(1, Ordering::AcqRel);
        Box::new(MockPage {
            flags,
            data: vec![self.page_byte(index); HOST_PAGE],
            locked: Arc::clone(&self.locked),
        })
    }
}

impl SourceFile for MockFile {
    fn id(&self) -> u64 {
        0xf11e
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn find_lock_page(&self, index: u64) -> Option<PageRef> {
        let dirty = self.cached.lock().get(&index).copied()?;
        let flags = if dirty {
            PageFlags::UPTODATE | PageFlags::DIRTY
        } else {
            PageFlags::UPTODATE
        };
        Some(self.lock_page(index, flags))
    }

    fn read_page(&self, index: u64) -> Result<PageRef> {
        self.reads.fetch_add(1, Ordering::AcqRel);
        Ok(self.lock_page(index, PageFlags::UPTODATE))
    }
}

// =============================================================================
// WRITE-BACK
// =============================================================================

/// Buffer whose fast path always faults
pub struct FaultingBuffer {
    data: Vec<u8>,
    slow_writes: usize,
}

impl FaultingBuffer {
    pub fn new(len: usize) -> Self {
        Self {
            data: vec![0; len],
            slow_writes: 0,
        }
    }

    pub fn slow_writes(&self) -> usize {
        self.slow_writes
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

impl WritebackBuffer for FaultingBuffer {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn try_write(&mut self, _offset: usize, _data: &[u8]) -> bool {
        false
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.slow_writes += 1;
        let dst = offset
            .checked_add(data.len())
            .and_then(|end| self.data.get_mut(offset..end))
            .ok_or(Error::Fault)?;
        dst.copy_from_slice(data);
        Ok(())
    }
}

// =============================================================================
// HARNESS
// =============================================================================

/// A device wired to fresh mocks, with one mapping registered
pub struct Harness {
    pub config: StromConfig,
    pub device: StromDevice,
    pub pinning: Arc<MockPinning>,
    pub classifier: Arc<MockClassifier>,
    pub resolver: Arc<MockResolver>,
    pub queue: Arc<MockQueue>,
    pub scheduler: Arc<ThreadScheduler>,
    pub file: Arc<MockFile>,
    pub owner: Owner,
    pub mapping: MappingHandle,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(StromConfig::new().with_max_transfer_len(256 * 1024))
    }

    pub fn with_config(config: StromConfig) -> Self {
        let pinning = MockPinning::new();
        let classifier = Arc::new(MockClassifier::default());
        let resolver = Arc::new(MockResolver::default());
        let queue = Arc::new(MockQueue::default());
        let scheduler = Arc::new(ThreadScheduler::new());

        let device = StromDevice::new(config, Collaborators {
            pinning: pinning.clone(),
            classifier: classifier.clone(),
            resolver: resolver.clone(),
            queue: queue.clone(),
            scheduler: scheduler.clone(),
        })
        .expect("harness config is valid");

        let owner = Owner::new(1000);
        let session = device.open_session(owner);
        let mapping = device
            .register_mapping(&session, &RegisterMapping {
                address: MAP_ADDR,
                length: MAP_LEN,
            })
            .expect("harness mapping registers")
            .handle;

        Self {
            config,
            device,
            pinning,
            classifier,
            resolver,
            queue,
            scheduler,
            file: MockFile::new(FILE_SIZE),
            owner,
            mapping,
        }
    }

    /// Fresh collaborators sharing this harness's mocks
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            pinning: self.pinning.clone(),
            classifier: self.classifier.clone(),
            resolver: self.resolver.clone(),
            queue: self.queue.clone(),
            scheduler: self.scheduler.clone(),
        }
    }

    pub fn session(&self) -> Session {
        self.device.open_session(self.owner)
    }

    pub fn tasks(&self) -> &Arc<TaskRegistry> {
        self.device.tasks()
    }

    /// References held on the harness mapping, not counting this lookup
    pub fn mapping_refcnt(&self) -> usize {
        self.device
            .mappings()
            .acquire(self.mapping, self.owner)
            .map_or(0, |m| m.refcnt() - 1)
    }

    pub fn task_config(&self) -> TaskConfig {
        TaskConfig {
            block_shift: GEOMETRY.block_shift,
            start_sect: GEOMETRY.start_sect,
            nr_sects: GEOMETRY.nr_sects,
            max_nblocks: (self.config.max_transfer_len >> GEOMETRY.block_shift) as u32,
        }
    }
}
