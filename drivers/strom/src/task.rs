//! # Task Registry
//!
//! In-flight copy tasks and the failure records they leave behind.
//!
//! Every shard holds one table keyed by task id. A slot is either `Live`
//! (transfers may still be outstanding) or `Failed` (the task finished with
//! an error nobody has collected yet). Moving from one to the other, and
//! consuming a failure, both happen under the shard lock, so an error is
//! observed at most once.
//!
//! ## Reference model
//!
//! ```text
//!   create ──► refcnt=1 (creator)
//!                 │  get() per submitted transfer
//!                 ▼
//!   freeze ──► no more get()
//!                 │  put(status) per finished transfer, put() by creator
//!                 ▼
//!   refcnt=0 ──► status? ── none ──► slot removed
//!                   └───── error ──► Failed slot until wait / session close
//! ```

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use hashbrown::HashMap;
use spin::Mutex;

use crate::config::{StromConfig, SECTOR_SHIFT};
use crate::error::{Error, Result};
use crate::hash::Shards;
use crate::mapping::{MappedRegion, MappingRef, MappingRegistry};
use crate::platform::{DeviceClassifier, DeviceGeometry, SourceFile};
use crate::sched::Scheduler;
use crate::session::{Session, SessionInner};
use crate::sync::{wake_all, WaitQueue};
use crate::types::{MappingHandle, SessionId, TaskId};

// =============================================================================
// DMA TASK
// =============================================================================

/// Storage geometry a task submits against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskConfig {
    /// log2 of the filesystem block size
    pub block_shift: u32,
    /// First sector of the partition
    pub start_sect: u64,
    /// Number of sectors in the partition
    pub nr_sects: u64,
    /// Upper bound on blocks per physical transfer
    pub max_nblocks: u32,
}

struct TaskResources {
    mapping: MappingRef,
    source: Arc<dyn SourceFile>,
    _session: Arc<SessionInner>,
}

/// One logical copy task
pub struct DmaTask {
    refcnt: AtomicUsize,
    frozen: AtomicBool,
    config: TaskConfig,
    session: SessionId,
    resources: Mutex<Option<TaskResources>>,
}

impl DmaTask {
    /// Task identifier (address of this record)
    #[inline]
    pub fn id(&self) -> TaskId {
        TaskId::from_ptr(self as *const Self)
    }

    /// Storage geometry
    #[inline]
    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    /// Whether the task accepts no further transfers
    #[inline]
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }
}

impl fmt::Debug for DmaTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaTask")
            .field("id", &self.id())
            .field("refcnt", &self.refcnt.load(Ordering::Relaxed))
            .field("frozen", &self.is_frozen())
            .field("config", &self.config)
            .finish()
    }
}

// =============================================================================
// SHARD CONTENTS
// =============================================================================

pub(crate) enum TaskSlot {
    // the task itself is kept alive by its outstanding references
    Live { status: Option<Error> },
    Failed {
        // keeps the id from being reused until the failure is collected
        _task: Arc<DmaTask>,
        status: Error,
        session: SessionId,
    },
}

#[derive(Default)]
pub(crate) struct TaskShard {
    pub(crate) slots: HashMap<u64, TaskSlot>,
    pub(crate) waitq: WaitQueue,
}

/// What the registry knows about a task id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Transfers may still be outstanding
    Running,
    /// Finished with an error not yet collected
    Failed(Error),
    /// Finished successfully, or already collected
    Absent,
}

// =============================================================================
// TASK REFERENCE
// =============================================================================

/// Counted reference to a live task
///
/// Dropping it without [`put`](Self::put) releases it with no status.
pub struct TaskRef {
    registry: Arc<TaskRegistry>,
    task: Option<Arc<DmaTask>>,
}

impl TaskRef {
    fn task(&self) -> &Arc<DmaTask> {
        match &self.task {
            Some(task) => task,
            None => unreachable!("task reference used after put"),
        }
    }

    /// Task identifier
    pub fn id(&self) -> TaskId {
        self.task().id()
    }

    /// Storage geometry
    pub fn config(&self) -> TaskConfig {
        self.task().config
    }

    /// Take another reference for a transfer about to be submitted
    pub fn get(&self) -> TaskRef {
        let task = self.task();
        assert!(!task.is_frozen(), "reference taken on a frozen task");
        let prev = task.refcnt.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
        TaskRef {
            registry: Arc::clone(&self.registry),
            task: Some(Arc::clone(task)),
        }
    }

    /// Stop accepting transfers
    pub fn freeze(&self) {
        self.task().frozen.store(true, Ordering::Release);
    }

    /// Destination region and source of the task
    pub(crate) fn targets(&self) -> Result<(Arc<MappedRegion>, Arc<dyn SourceFile>)> {
        let resources = self.task().resources.lock();
        resources
            .as_ref()
            .map(|r| (r.mapping.region(), Arc::clone(&r.source)))
            .ok_or(Error::NotFound)
    }

    /// Release this reference, recording `status` if it is an error
    pub fn put(mut self, status: Option<Error>) {
        if let Some(task) = self.task.take() {
            self.registry.unref(task, status);
        }
    }
}

impl Drop for TaskRef {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            self.registry.unref(task, None);
        }
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.task {
            Some(task) => f.debug_tuple("TaskRef").field(&task.id()).finish(),
            None => f.write_str("TaskRef(<released>)"),
        }
    }
}

// =============================================================================
// TASK REGISTRY
// =============================================================================

/// Sharded table of copy tasks
pub struct TaskRegistry {
    pub(crate) shards: Shards<TaskShard>,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    mappings: Arc<MappingRegistry>,
    classifier: Arc<dyn DeviceClassifier>,
    host_page_shift: u32,
    max_transfer_len: u64,
}

impl TaskRegistry {
    /// Create an empty registry
    pub fn new(
        config: &StromConfig,
        mappings: Arc<MappingRegistry>,
        classifier: Arc<dyn DeviceClassifier>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            shards: Shards::new(config.task_shards, config.task_hash_seed),
            scheduler,
            mappings,
            classifier,
            host_page_shift: config.host_page_shift,
            max_transfer_len: config.max_transfer_len,
        })
    }

    /// Classify `source` for direct transfers
    pub fn check_source(&self, source: &dyn SourceFile) -> Result<DeviceGeometry> {
        let geometry = self.classifier.classify(source)?;
        if geometry.block_shift < SECTOR_SHIFT || geometry.block_shift > self.host_page_shift {
            log::error!(
                "strom: block size {} of source {} is not supported",
                1u64 << geometry.block_shift,
                source.id()
            );
            return Err(Error::NotSupported);
        }
        Ok(geometry)
    }

    /// Create a task copying from `source` into mapping `handle`
    ///
    /// The returned reference is the creator's. The task is live until it
    /// is frozen and every reference has been put.
    pub fn create(
        self: &Arc<Self>,
        handle: MappingHandle,
        source: Arc<dyn SourceFile>,
        session: &Session,
    ) -> Result<TaskRef> {
        let geometry = self.check_source(&*source)?;
        let mapping = self.mappings.acquire(handle, session.owner())?;

        let task = Arc::new(DmaTask {
            refcnt: AtomicUsize::new(1),
            frozen: AtomicBool::new(false),
            config: TaskConfig {
                block_shift: geometry.block_shift,
                start_sect: geometry.start_sect,
                nr_sects: geometry.nr_sects,
                max_nblocks: (self.max_transfer_len >> geometry.block_shift) as u32,
            },
            session: session.id(),
            resources: Mutex::new(Some(TaskResources {
                mapping,
                source,
                _session: session.share(),
            })),
        });

        let id = task.id();
        self.shards
            .lock(id.id())
            .slots
            .insert(id.id(), TaskSlot::Live { status: None });
        log::debug!("strom: task {} created (mapping={})", id, handle);

        Ok(TaskRef {
            registry: Arc::clone(self),
            task: Some(task),
        })
    }

    fn unref(&self, task: Arc<DmaTask>, status: Option<Error>) {
        let key = task.id().id();

        if let Some(err) = status {
            let mut shard = self.shards.lock(key);
            if let Some(TaskSlot::Live { status: sticky, .. }) = shard.slots.get_mut(&key) {
                if sticky.is_none() {
                    *sticky = Some(err);
                }
            }
        }

        if task.refcnt.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        let mut shard = self.shards.lock(key);
        assert!(task.is_frozen(), "task released before it was frozen");
        let status = match shard.slots.remove(&key) {
            Some(TaskSlot::Live { status, .. }) => status,
            _ => None,
        };
        let resources = task.resources.lock().take();
        if let Some(err) = status {
            shard.slots.insert(
                key,
                TaskSlot::Failed {
                    _task: Arc::clone(&task),
                    status: err,
                    session: task.session,
                },
            );
        }
        let waiters = shard.waitq.take_all();
        drop(shard);

        wake_all(waiters);
        // releases the mapping, the source and the session exactly once
        drop(resources);

        match status {
            None => log::debug!("strom: task {} completed", task.id()),
            Some(err) => log::debug!("strom: task {} completed with error: {}", task.id(), err),
        }
    }

    /// Current state of task `id`
    pub fn lookup(&self, id: TaskId) -> TaskState {
        let shard = self.shards.lock(id.id());
        match shard.slots.get(&id.id()) {
            Some(TaskSlot::Live { .. }) => TaskState::Running,
            Some(TaskSlot::Failed { status, .. }) => TaskState::Failed(*status),
            None => TaskState::Absent,
        }
    }

    /// Drop every uncollected failure bound to `session`
    pub fn reap_session(&self, session: SessionId) {
        for index in 0..self.shards.len() {
            let mut shard = self.shards.lock_at(index);
            shard.slots.retain(|id, slot| match slot {
                TaskSlot::Failed {
                    status,
                    session: owner,
                    ..
                } if *owner == session => {
                    log::info!(
                        "strom: unreferenced asynchronous error (task={:#x}, status={})",
                        id,
                        status
                    );
                    false
                },
                _ => true,
            });
        }
    }

    /// Number of live tasks and uncollected failures
    pub fn counts(&self) -> (usize, usize) {
        let mut live = 0;
        let mut failed = 0;
        for index in 0..self.shards.len() {
            let shard = self.shards.lock_at(index);
            for slot in shard.slots.values() {
                match slot {
                    TaskSlot::Live { .. } => live += 1,
                    TaskSlot::Failed { .. } => failed += 1,
                }
            }
        }
        (live, failed)
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("shards", &self.shards)
            .field("max_transfer_len", &self.max_transfer_len)
            .finish()
    }
}
