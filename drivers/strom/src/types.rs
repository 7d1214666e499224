//! # Strom Types
//!
//! Fundamental type definitions shared by the registries and the scheduler.
//!
//! These types provide:
//! - Strong typing for handles (mapping vs task vs session)
//! - Physical addresses handed out by the accelerator page table
//! - Device page-size classification

use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;

// =============================================================================
// PHYSICAL ADDRESS (for DMA)
// =============================================================================

/// Physical bus address of a pinned device page
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Create a new physical address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr(0x{:016x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

// =============================================================================
// OWNER
// =============================================================================

/// Principal that registered a mapping (effective user id of the caller)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Owner(u32);

impl Owner {
    /// Superuser principal
    pub const ROOT: Self = Self(0);

    /// Create an owner from a raw user id
    #[inline]
    pub const fn new(uid: u32) -> Self {
        Self(uid)
    }

    /// Get the raw user id
    #[inline]
    pub const fn uid(self) -> u32 {
        self.0
    }
}

// =============================================================================
// HANDLE TYPES
// =============================================================================

/// Opaque handle to a registry record
///
/// The raw value is the address of the record it names, so a handle is
/// unique for as long as the record is alive.
#[repr(transparent)]
pub struct Handle<T> {
    id: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// Create a new handle
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// Create a null handle
    #[inline]
    pub const fn null() -> Self {
        Self::new(0)
    }

    /// Get the raw ID
    #[inline]
    pub const fn id(self) -> u64 {
        self.id
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.id == 0
    }

    /// Handle naming the record at `ptr`
    #[inline]
    pub(crate) fn from_ptr<U>(ptr: *const U) -> Self {
        Self::new(ptr as usize as u64)
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = core::any::type_name::<T>();
        let short = name.rsplit("::").next().unwrap_or(name);
        write!(f, "Handle<{}>(0x{:x})", short, self.id)
    }
}

impl<T> fmt::Display for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.id)
    }
}

// Marker types for handles
/// Marker for mapped accelerator memory
#[derive(Debug)]
pub struct MappingMarker;
/// Marker for DMA tasks
#[derive(Debug)]
pub struct TaskMarker;
/// Marker for sessions
#[derive(Debug)]
pub struct SessionMarker;

/// Handle to a registered accelerator-memory mapping
pub type MappingHandle = Handle<MappingMarker>;
/// Identifier of a DMA task
pub type TaskId = Handle<TaskMarker>;
/// Identifier of a session
pub type SessionId = Handle<SessionMarker>;

// =============================================================================
// DEVICE PAGE SIZE
// =============================================================================

/// Page size of the accelerator's pinned page table
///
/// The discriminants are the page-size codes reported by the pinning API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum GpuPageSize {
    /// 4 KiB device pages
    Size4K   = 0,
    /// 64 KiB device pages
    Size64K  = 1,
    /// 128 KiB device pages
    Size128K = 2,
}

impl GpuPageSize {
    /// Classify a raw page-size code
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Size4K),
            1 => Some(Self::Size64K),
            2 => Some(Self::Size128K),
            _ => None,
        }
    }

    /// log2 of the page size
    #[inline]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Size4K => 12,
            Self::Size64K => 16,
            Self::Size128K => 17,
        }
    }

    /// Page size in bytes
    #[inline]
    pub const fn bytes(self) -> u64 {
        1 << self.shift()
    }
}
