//! # Strom Device
//!
//! Entry point of the subsystem: owns both registries, holds the platform
//! collaborators and exposes the command surface.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use crate::command::{
    fill_slots, CopyTaskRequest, CopyTaskResult, MappingInfo, MappingRegistration, RegisterMapping,
};
use crate::config::StromConfig;
use crate::error::{Error, Result};
use crate::mapping::MappingRegistry;
use crate::platform::{
    BlockResolver, DeviceClassifier, DeviceGeometry, GpuPinning, SourceFile, TransferQueue,
};
use crate::sched::{Scheduler, WaitMode};
use crate::scheduler::{validate_chunk_size, ChunkRequest, RequestScheduler, WritebackBuffer};
use crate::session::Session;
use crate::status;
use crate::task::TaskRegistry;
use crate::types::{MappingHandle, Owner, TaskId};

/// Platform services the device is built on
pub struct Collaborators {
    /// Accelerator pinning API
    pub pinning: Arc<dyn GpuPinning>,
    /// Storage eligibility check
    pub classifier: Arc<dyn DeviceClassifier>,
    /// Filesystem block map
    pub resolver: Arc<dyn BlockResolver>,
    /// Storage submission queue
    pub queue: Arc<dyn TransferQueue>,
    /// Blocking primitives
    pub scheduler: Arc<dyn Scheduler>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// SSD-to-accelerator direct transfer device
pub struct StromDevice {
    config: StromConfig,
    mappings: Arc<MappingRegistry>,
    tasks: Arc<TaskRegistry>,
    resolver: Arc<dyn BlockResolver>,
    queue: Arc<dyn TransferQueue>,
    signature: String,
}

impl StromDevice {
    /// Build a device from a validated configuration
    pub fn new(config: StromConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let Collaborators {
            pinning,
            classifier,
            resolver,
            queue,
            scheduler,
        } = collaborators;

        let mappings = MappingRegistry::new(&config, pinning, Arc::clone(&scheduler));
        let tasks = TaskRegistry::new(&config, Arc::clone(&mappings), classifier, scheduler);

        log::info!(
            "strom: device ready (mapping shards={}, task shards={}, max transfer={})",
            config.mapping_shards,
            config.task_shards,
            config.max_transfer_len
        );

        Ok(Self {
            signature: status::signature(config.target),
            config,
            mappings,
            tasks,
            resolver,
            queue,
        })
    }

    /// Active configuration
    pub fn config(&self) -> &StromConfig {
        &self.config
    }

    /// Mapping registry
    pub fn mappings(&self) -> &Arc<MappingRegistry> {
        &self.mappings
    }

    /// Task registry
    pub fn tasks(&self) -> &Arc<TaskRegistry> {
        &self.tasks
    }

    /// Open a command session acting for `owner`
    pub fn open_session(&self, owner: Owner) -> Session {
        Session::new(owner, &self.tasks)
    }

    // =========================================================================
    // Mappings
    // =========================================================================

    /// Check whether `source` can be read by direct transfers
    pub fn check_file(&self, source: &dyn SourceFile) -> Result<DeviceGeometry> {
        self.tasks.check_source(source)
    }

    /// Pin and register accelerator memory
    pub fn register_mapping(
        &self,
        session: &Session,
        cmd: &RegisterMapping,
    ) -> Result<MappingRegistration> {
        self.mappings.register(cmd.address, cmd.length, session.owner())
    }

    /// Unregister and unpin a mapping
    pub fn unregister_mapping(&self, session: &Session, handle: MappingHandle) -> Result<()> {
        self.mappings.unregister(handle, session.owner())
    }

    /// Every registered mapping
    pub fn list_mappings(&self) -> Vec<MappingHandle> {
        self.mappings.list()
    }

    /// Copy registered handles into `slots`, returning the total count
    pub fn list_mappings_into(&self, slots: &mut [MappingHandle]) -> Result<usize> {
        fill_slots(&self.mappings.list(), slots)
    }

    /// Page-table summary of a mapping
    pub fn mapping_info(&self, session: &Session, handle: MappingHandle) -> Result<MappingInfo> {
        self.mappings.info(handle, session.owner())
    }

    // =========================================================================
    // Copy tasks
    // =========================================================================

    /// Start copying `request.chunk_ids` of `source` into a mapping
    ///
    /// Chunks served from the page cache are copied into `writeback`
    /// before this returns; the rest are in flight when it returns and
    /// are joined with [`wait_copy_task`](Self::wait_copy_task). On error,
    /// transfers already submitted are drained before returning.
    pub fn submit_copy_task(
        &self,
        session: &Session,
        source: Arc<dyn SourceFile>,
        request: &CopyTaskRequest,
        writeback: &mut dyn WritebackBuffer,
    ) -> Result<CopyTaskResult> {
        validate_chunk_size(
            request.chunk_size,
            self.config.host_page_size(),
            self.config.max_transfer_len,
        )?;

        let task = self.tasks.create(request.handle, source, session)?;
        let task_id = task.id();

        let scheduler = RequestScheduler::new(&self.config, &*self.resolver, &*self.queue);
        let chunks = ChunkRequest {
            chunk_ids: &request.chunk_ids,
            chunk_size: request.chunk_size,
            dest_offset: request.offset,
            relseg_size: request.relseg_size,
        };
        let result = scheduler.run(&task, &chunks, writeback);
        task.freeze();

        match result {
            Ok(outcome) => {
                task.put(None);
                Ok(CopyTaskResult {
                    task_id,
                    nr_direct: outcome.nr_direct,
                    nr_writeback: outcome.nr_writeback,
                    nr_dma_submit: outcome.nr_dma_submit,
                    nr_dma_blocks: outcome.nr_dma_blocks,
                    chunk_ids: outcome.chunk_ids,
                })
            },
            Err(err) => {
                task.put(Some(err));
                // joins the in-flight transfers and consumes the failure
                let _ = self.tasks.wait(task_id, WaitMode::Uninterruptible);
                Err(err)
            },
        }
    }

    /// Wait for a copy task, returning its first error
    pub fn wait_copy_task(&self, task_id: TaskId, mode: WaitMode) -> Result<()> {
        self.tasks.wait(task_id, mode)
    }

    // =========================================================================
    // Status / lifetime
    // =========================================================================

    /// Version, target and build of the running subsystem
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Read the signature at file position `pos`
    pub fn read_status(&self, pos: u64, buf: &mut [u8]) -> usize {
        status::read_at(&self.signature, pos, buf)
    }

    /// Check the device can be torn down
    pub fn try_unload(&self) -> Result<()> {
        let live = self.mappings.live_mappings();
        if live > 0 {
            log::warn!("strom: unload refused, {} mappings still live", live);
            return Err(Error::Busy);
        }
        log::info!("strom: device unloaded");
        Ok(())
    }
}

impl fmt::Debug for StromDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StromDevice")
            .field("config", &self.config)
            .field("mappings", &self.mappings)
            .field("tasks", &self.tasks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::task::TaskState;
    use crate::testing::{Harness, MAP_ADDR, MAP_LEN};

    const CHUNK: u32 = 32 * 1024;

    fn copy_request(h: &Harness, ids: &[u32]) -> CopyTaskRequest {
        CopyTaskRequest {
            handle: h.mapping,
            offset: 0,
            chunk_size: CHUNK,
            relseg_size: 0,
            chunk_ids: ids.to_vec(),
        }
    }

    #[test]
    fn test_copy_and_wait() {
        let h = Harness::new();
        let session = h.session();
        let mut wb: Vec<u8> = Vec::new();

        let res = h
            .device
            .submit_copy_task(&session, h.file.clone(), &copy_request(&h, &[0, 1, 2, 3, 4]), &mut wb)
            .unwrap();
        assert_eq!(res.nr_direct, 5);
        assert_eq!(res.nr_dma_submit, 1);
        assert_eq!(h.tasks().lookup(res.task_id), TaskState::Running);

        h.queue.complete_all(Ok(()));
        assert_eq!(h.device.wait_copy_task(res.task_id, WaitMode::Interruptible), Ok(()));
        assert_eq!(h.mapping_refcnt(), 0);
    }

    #[test]
    fn test_async_error_reported_by_wait() {
        let h = Harness::new();
        let session = h.session();
        let mut wb: Vec<u8> = Vec::new();

        let res = h
            .device
            .submit_copy_task(&session, h.file.clone(), &copy_request(&h, &[0, 2]), &mut wb)
            .unwrap();
        assert_eq!(res.nr_dma_submit, 2);

        h.queue.complete_all(Err(Error::Io(2)));
        assert_eq!(
            h.device.wait_copy_task(res.task_id, WaitMode::Interruptible),
            Err(Error::Io(2))
        );
        assert_eq!(h.device.wait_copy_task(res.task_id, WaitMode::Interruptible), Ok(()));
    }

    #[test]
    fn test_abort_drains_in_flight_transfers() {
        let h = Harness::new();
        h.resolver.fail_at(3 * 8 + 1, -5);
        let session = h.session();
        let mut wb: Vec<u8> = Vec::new();

        let completer = {
            let queue = h.queue.clone();
            thread::spawn(move || {
                while queue.pending() == 0 {
                    thread::yield_now();
                }
                queue.complete_all(Ok(()));
            })
        };

        let err = h
            .device
            .submit_copy_task(&session, h.file.clone(), &copy_request(&h, &[0, 3]), &mut wb)
            .unwrap_err();
        completer.join().unwrap();

        assert_eq!(err, Error::BlockMapping(-5));
        assert_eq!(h.queue.requests().len(), 1);
        // the failure record was consumed by the internal wait
        assert_eq!(h.tasks().counts(), (0, 0));
        assert_eq!(h.mapping_refcnt(), 0);
    }

    #[test]
    fn test_configuration_errors_mutate_nothing() {
        let h = Harness::new();
        let session = h.session();
        let mut wb: Vec<u8> = Vec::new();

        let mut req = copy_request(&h, &[0]);
        req.chunk_size = 5000;
        assert_eq!(
            h.device.submit_copy_task(&session, h.file.clone(), &req, &mut wb),
            Err(Error::MisalignedChunk)
        );

        let mut req = copy_request(&h, &[0]);
        req.handle = MappingHandle::new(0x1234);
        assert_eq!(
            h.device.submit_copy_task(&session, h.file.clone(), &req, &mut wb),
            Err(Error::NotFound)
        );
        assert_eq!(h.tasks().counts(), (0, 0));
        assert!(h.queue.requests().is_empty());
    }

    #[test]
    fn test_revocation_during_copy() {
        let h = Harness::new();
        let session = h.session();
        let mut wb: Vec<u8> = Vec::new();

        let res = h
            .device
            .submit_copy_task(&session, h.file.clone(), &copy_request(&h, &[0, 1]), &mut wb)
            .unwrap();

        let revoker = {
            let pinning = h.pinning.clone();
            thread::spawn(move || pinning.revoke(MAP_ADDR))
        };
        while !h.device.list_mappings().is_empty() {
            thread::yield_now();
        }
        assert_eq!(
            h.device.submit_copy_task(&session, h.file.clone(), &copy_request(&h, &[2]), &mut wb),
            Err(Error::NotFound)
        );
        thread::sleep(Duration::from_millis(20));
        assert!(!revoker.is_finished());

        h.queue.complete_all(Ok(()));
        assert!(revoker.join().unwrap());
        assert_eq!(h.pinning.freed(), 1);
        assert_eq!(h.device.wait_copy_task(res.task_id, WaitMode::Uninterruptible), Ok(()));
        assert_eq!(h.device.try_unload(), Ok(()));
    }

    #[test]
    fn test_unload_refused_while_mapped() {
        let h = Harness::new();
        let session = h.session();
        assert_eq!(h.device.try_unload(), Err(Error::Busy));

        h.device.unregister_mapping(&session, h.mapping).unwrap();
        assert_eq!(h.device.try_unload(), Ok(()));
    }

    #[test]
    fn test_mapping_queries() {
        let h = Harness::new();
        let session = h.session();

        let info = h.device.mapping_info(&session, h.mapping).unwrap();
        assert_eq!(info.map_offset, 0);
        assert_eq!(info.map_length, MAP_LEN);
        assert_eq!(info.gpu_page_size, 64 * 1024);
        assert_eq!(info.page_addrs.len(), 16);

        let second = h
            .device
            .register_mapping(&session, &RegisterMapping {
                address: MAP_ADDR + 4 * MAP_LEN,
                length: MAP_LEN,
            })
            .unwrap();
        let mut one = [MappingHandle::null(); 1];
        assert_eq!(h.device.list_mappings_into(&mut one), Err(Error::NoBuffers));
        let mut slots = [MappingHandle::null(); 4];
        assert_eq!(h.device.list_mappings_into(&mut slots), Ok(2));
        assert!(slots.contains(&second.handle));
        assert!(slots.contains(&h.mapping));
    }

    #[test]
    fn test_check_file() {
        let h = Harness::new();
        assert_eq!(h.device.check_file(&*h.file).map(|g| g.block_shift), Ok(12));

        h.classifier.reject(Error::AccessDenied);
        assert_eq!(h.device.check_file(&*h.file), Err(Error::AccessDenied));
    }

    #[test]
    fn test_status_read() {
        let h = Harness::new();
        let sig = h.device.signature().as_bytes().to_vec();
        let mut buf = [0u8; 8];
        let mut pos = 0u64;
        let mut out = Vec::new();
        loop {
            let n = h.device.read_status(pos, &mut buf);
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
            pos += n as u64;
        }
        assert_eq!(out, sig);
        assert!(h.device.signature().contains("target: helix\n"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let h = Harness::new();
        let config = StromConfig::new().with_shards(0, 0);
        assert!(StromDevice::new(config, h.collaborators()).is_err());
    }
}
