//! # Sharded Tables
//!
//! Stable handle hashing and the fixed array of independently locked
//! buckets both registries are built on.
//!
//! The bucket count is a tuning constant, never a function of load, so the
//! table never resizes and a key always maps to the same lock.

use alloc::boxed::Box;
use alloc::vec::Vec;

use spin::{Mutex, MutexGuard};

// ============================================================================
// XXHash64 (single 8-byte lane)
// ============================================================================

const PRIME64_1: u64 = 0x9E3779B185EBCA87;
const PRIME64_2: u64 = 0xC2B2AE3D27D4EB4F;
const PRIME64_3: u64 = 0x165667B19E3779F9;
const PRIME64_4: u64 = 0x85EBCA77C2B2AE63;
const PRIME64_5: u64 = 0x27D4EB2F165667C5;

/// XXHash64 of the little-endian bytes of `key`
#[inline]
pub const fn hash_u64(key: u64, seed: u64) -> u64 {
    let mut h = seed.wrapping_add(PRIME64_5).wrapping_add(8);
    let k = key
        .wrapping_mul(PRIME64_2)
        .rotate_left(31)
        .wrapping_mul(PRIME64_1);
    h ^= k;
    h = h.rotate_left(27).wrapping_mul(PRIME64_1).wrapping_add(PRIME64_4);
    avalanche(h)
}

#[inline]
const fn avalanche(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(PRIME64_2);
    h ^= h >> 29;
    h = h.wrapping_mul(PRIME64_3);
    h ^= h >> 32;
    h
}

// ============================================================================
// Shards
// ============================================================================

/// Fixed array of spin-locked buckets addressed by a seeded key hash
pub struct Shards<T> {
    buckets: Box<[Mutex<T>]>,
    seed: u64,
}

impl<T: Default> Shards<T> {
    /// Create `count` empty buckets
    pub fn new(count: usize, seed: u64) -> Self {
        assert!(count > 0, "shard count must be non-zero");
        let buckets: Vec<Mutex<T>> = (0..count).map(|_| Mutex::new(T::default())).collect();
        Self {
            buckets: buckets.into_boxed_slice(),
            seed,
        }
    }
}

impl<T> Shards<T> {
    /// Number of buckets
    #[inline]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Bucket index of `key`
    #[inline]
    pub fn index(&self, key: u64) -> usize {
        (hash_u64(key, self.seed) % self.buckets.len() as u64) as usize
    }

    /// Lock the bucket owning `key`
    #[inline]
    pub fn lock(&self, key: u64) -> MutexGuard<'_, T> {
        self.buckets[self.index(key)].lock()
    }

    /// Lock bucket `index`
    #[inline]
    pub fn lock_at(&self, index: usize) -> MutexGuard<'_, T> {
        self.buckets[index].lock()
    }
}

impl<T> core::fmt::Debug for Shards<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Shards")
            .field("buckets", &self.buckets.len())
            .field("seed", &self.seed)
            .finish()
    }
}
