//! # Helix Strom
//!
//! Direct DMA from NVMe storage into pinned accelerator memory.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          StromDevice                            │
//! │    register / unregister / info / list / submit / wait / stat   │
//! │                                                                 │
//! │  ┌─────────────────────┐          ┌──────────────────────────┐  │
//! │  │   MappingRegistry   │◄─────────│       TaskRegistry       │  │
//! │  │ (pinned GPU ranges) │  holds   │ (sharded, sticky errors) │  │
//! │  └──────────┬──────────┘          └────────────┬─────────────┘  │
//! │             │                                  │                │
//! │  ┌──────────┴──────────┐          ┌────────────┴─────────────┐  │
//! │  │     GpuPinning      │          │     RequestScheduler     │  │
//! │  │ (pin, revoke hook)  │          │ (page cache vs. direct)  │  │
//! │  └─────────────────────┘          └──┬──────────────────┬────┘  │
//! │                                      │                  │       │
//! │                           ┌──────────┴───────┐ ┌────────┴─────┐ │
//! │                           │  BlockResolver   │ │TransferQueue │ │
//! │                           │ (file → sectors) │ │ (SG reads)   │ │
//! │                           └──────────────────┘ └──────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Lifetimes
//!
//! A copy task holds a reference on its mapping, its source file and its
//! session until the last in-flight transfer completes. A mapping revoked
//! by the accelerator driver is unpublished immediately and torn down once
//! those references drain.
//!
//! The platform (pinning API, page cache, block map, submission queue and
//! scheduler) is reached only through the traits in [`platform`] and
//! [`sched`].

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod hash;
pub mod mapping;
pub mod platform;
pub mod sched;
pub mod scheduler;
pub mod session;
pub mod status;
pub mod sync;
pub mod task;
pub mod transfer;
pub mod types;
mod wait;

#[cfg(test)]
mod testing;

// Re-exports
pub use command::{
    CopyTaskRequest, CopyTaskResult, MappingInfo, MappingRegistration, RegisterMapping,
};
pub use config::StromConfig;
pub use device::{Collaborators, StromDevice};
pub use error::{Error, ErrorClass, Result};
pub use mapping::{MappingRef, MappingRegistry, RevocationHook};
pub use platform::{
    BlockResolver, CachedPage, DeviceClassifier, DeviceGeometry, GpuPinning, PageFlags, PageRef,
    PageTable, SourceFile, TransferQueue,
};
pub use sched::{Scheduler, WaitMode};
pub use scheduler::{SliceBuffer, WritebackBuffer};
pub use session::Session;
pub use task::{TaskRegistry, TaskState};
pub use transfer::{Rejected, SgEntry, TransferCompletion, TransferRequest};
pub use types::{GpuPageSize, MappingHandle, Owner, PhysAddr, SessionId, TaskId};
