//! # Strom Error Handling
//!
//! Error types for the direct-DMA subsystem.
//!
//! Every error is scoped to one task or one mapping; nothing here is fatal
//! to the kernel. Variants are grouped by the class of failure they belong
//! to, which decides how much state has already been mutated when they are
//! returned.

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// Strom Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERRNO VALUES
// =============================================================================

const ENOENT: i32 = 2;
const EINTR: i32 = 4;
const EIO: i32 = 5;
const EBADF: i32 = 9;
const ENOMEM: i32 = 12;
const EACCES: i32 = 13;
const EFAULT: i32 = 14;
const EBUSY: i32 = 16;
const ENODEV: i32 = 19;
const EINVAL: i32 = 22;
const ERANGE: i32 = 34;
const ENOBUFS: i32 = 105;
const ENOTSUPP: i32 = 524;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// Strom unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid parameter provided
    InvalidParameter,
    /// Handle does not name a live record owned by the caller
    NotFound,
    /// Source handle is not usable
    BadSource,
    /// Chunk size is not a multiple of the host page size
    MisalignedChunk,
    /// Chunk size exceeds the maximum transfer length
    ChunkTooLarge,
    /// Offset or length falls outside the mapped region or the source
    OutOfRange,
    /// Device page-size code is not one the subsystem understands
    UnsupportedPageSize(u32),
    /// Source is not eligible for direct transfers
    NotSupported,
    /// Caller lacks permission on the source
    AccessDenied,

    // =========================================================================
    // Resource Errors
    // =========================================================================
    /// Out of memory
    OutOfMemory,
    /// Output buffer too small
    NoBuffers,
    /// Resource is busy
    Busy,

    // =========================================================================
    // Device Errors
    // =========================================================================
    /// Pinning accelerator memory failed
    PinFailed(i32),
    /// Releasing pinned accelerator memory failed
    UnpinFailed(i32),
    /// Storage block lookup failed
    BlockMapping(i32),
    /// Physical transfer submission failed
    SubmissionFailed(i32),
    /// Copy to the caller's write-back buffer faulted
    Fault,
    /// Mapping was revoked by the accelerator driver
    Revoked,

    // =========================================================================
    // Asynchronous Completion Errors
    // =========================================================================
    /// Transfer completed with a device status
    Io(i32),
    /// Transfer was dropped without reporting completion
    TransferAborted,

    // =========================================================================
    // Wait Errors
    // =========================================================================
    /// Interruptible wait returned early
    Interrupted,
}

/// Failure class of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rejected synchronously, no state mutated
    Configuration,
    /// Rejected synchronously, partial state torn down
    Resource,
    /// Aborted the current batch, submitted transfers still finish
    Device,
    /// Reported after control returned to the caller
    Completion,
    /// Wait cancelled, the task keeps running
    Interrupted,
}

impl Error {
    /// Failure class of this error
    pub const fn class(self) -> ErrorClass {
        match self {
            Self::InvalidParameter
            | Self::NotFound
            | Self::BadSource
            | Self::MisalignedChunk
            | Self::ChunkTooLarge
            | Self::OutOfRange
            | Self::UnsupportedPageSize(_)
            | Self::NotSupported
            | Self::AccessDenied => ErrorClass::Configuration,
            Self::OutOfMemory | Self::NoBuffers | Self::Busy => ErrorClass::Resource,
            Self::PinFailed(_)
            | Self::UnpinFailed(_)
            | Self::BlockMapping(_)
            | Self::SubmissionFailed(_)
            | Self::Fault
            | Self::Revoked => ErrorClass::Device,
            Self::Io(_) | Self::TransferAborted => ErrorClass::Completion,
            Self::Interrupted => ErrorClass::Interrupted,
        }
    }

    /// Negative errno reported at the command boundary
    pub const fn errno(self) -> i32 {
        match self {
            Self::InvalidParameter
            | Self::MisalignedChunk
            | Self::ChunkTooLarge
            | Self::UnsupportedPageSize(_) => -EINVAL,
            Self::NotFound => -ENOENT,
            Self::BadSource => -EBADF,
            Self::OutOfRange => -ERANGE,
            Self::NotSupported => -ENOTSUPP,
            Self::AccessDenied => -EACCES,
            Self::OutOfMemory => -ENOMEM,
            Self::NoBuffers => -ENOBUFS,
            Self::Busy => -EBUSY,
            Self::PinFailed(rc)
            | Self::UnpinFailed(rc)
            | Self::BlockMapping(rc)
            | Self::SubmissionFailed(rc)
            | Self::Io(rc) => device_errno(rc),
            Self::Fault => -EFAULT,
            Self::Revoked => -ENODEV,
            Self::TransferAborted => -EIO,
            Self::Interrupted => -EINTR,
        }
    }
}

/// Collaborators report either a negative errno or a positive device status
const fn device_errno(rc: i32) -> i32 {
    if rc < 0 {
        rc
    } else {
        -EIO
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Configuration
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::NotFound => write!(f, "mapping or task not found"),
            Self::BadSource => write!(f, "source is not available"),
            Self::MisalignedChunk => write!(f, "chunk size is not page aligned"),
            Self::ChunkTooLarge => write!(f, "chunk size exceeds maximum transfer length"),
            Self::OutOfRange => write!(f, "offset out of range"),
            Self::UnsupportedPageSize(code) => {
                write!(f, "unsupported device page size (code={})", code)
            },
            Self::NotSupported => write!(f, "source not supported for direct transfer"),
            Self::AccessDenied => write!(f, "access denied"),

            // Resource
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::NoBuffers => write!(f, "output buffer too small"),
            Self::Busy => write!(f, "resource busy"),

            // Device
            Self::PinFailed(rc) => write!(f, "pinning device memory failed (rc={})", rc),
            Self::UnpinFailed(rc) => write!(f, "unpinning device memory failed (rc={})", rc),
            Self::BlockMapping(rc) => write!(f, "block lookup failed (rc={})", rc),
            Self::SubmissionFailed(rc) => write!(f, "transfer submission failed (rc={})", rc),
            Self::Fault => write!(f, "bad address in write-back buffer"),
            Self::Revoked => write!(f, "mapping revoked"),

            // Completion
            Self::Io(rc) => write!(f, "transfer completed with status {}", rc),
            Self::TransferAborted => write!(f, "transfer aborted before completion"),

            Self::Interrupted => write!(f, "wait interrupted"),
        }
    }
}
