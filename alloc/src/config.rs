//! Configuration types and size-class math.

use crate::error::AllocError;

/// Smallest size class span (1KB). Classes double from here.
pub const CLASS_BASE: usize = 1024;

/// Bytes shaved off each class so the backing allocation, once the system
/// allocator adds its own bookkeeping, stays under the power-of-two
/// boundary instead of spilling onto an extra page.
pub const CLASS_SLACK: usize = 100;

/// Size of the owning-pool back reference stamped in front of every block
/// handed out by the sized allocator.
pub const HEADER_SIZE: usize = size_of::<*const ()>();

/// Default low water mark for a pool's free list.
pub const DEFAULT_MIN_FREE: usize = 16;

/// Default high water mark for a pool's free list.
pub const DEFAULT_MAX_FREE: usize = 32;

/// Default largest payload served by a sized allocator (16KB).
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024;

/// Payload size of the size class at `index`.
///
/// # Panics
///
/// Panics in debug builds if the shift overflows; indices produced by
/// [`class_count_for`] are always in range.
#[inline]
#[must_use]
pub fn class_payload(index: usize) -> usize {
    (CLASS_BASE << index) - CLASS_SLACK
}

/// Number of size classes needed so the largest class can hold
/// `max_payload` plus the back-reference header.
pub fn class_count_for(max_payload: usize) -> Result<usize, AllocError> {
    let target = max_payload
        .checked_add(HEADER_SIZE)
        .ok_or(AllocError::MaxPayloadTooLarge)?;

    let mut span = CLASS_BASE;
    let mut count = 1;
    while span - CLASS_SLACK < target {
        span = span.checked_mul(2).ok_or(AllocError::MaxPayloadTooLarge)?;
        count += 1;
        if count > usize::BITS as usize {
            return Err(AllocError::MaxPayloadTooLarge);
        }
    }
    Ok(count)
}

/// Configuration for a single-size pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Bytes available to the caller in each block.
    pub payload_size: usize,
    /// Low water mark: the replenisher fills the inventory up to this.
    pub min_free: usize,
    /// High water mark: excess inventory is returned to the OS.
    pub max_free: usize,
    /// Select the dual-thread discipline (realtime side plus a separate
    /// replenisher thread). When false, the caller must keep allocate,
    /// deallocate, and replenish on a single thread.
    pub thread_safe: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            payload_size: CLASS_BASE - CLASS_SLACK,
            min_free: DEFAULT_MIN_FREE,
            max_free: DEFAULT_MAX_FREE,
            thread_safe: true,
        }
    }
}

/// Configuration for a sized allocator.
#[derive(Debug, Clone)]
pub struct AllocConfig {
    /// Largest payload the allocator must be able to serve.
    pub max_payload: usize,
    /// Low water mark applied to every pool.
    pub min_free: usize,
    /// High water mark applied to every pool.
    pub max_free: usize,
    /// Select the dual-thread discipline for every pool.
    pub thread_safe: bool,
}

impl Default for AllocConfig {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            min_free: DEFAULT_MIN_FREE,
            max_free: DEFAULT_MAX_FREE,
            thread_safe: true,
        }
    }
}
