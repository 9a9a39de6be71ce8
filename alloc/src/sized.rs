//! Size-class dispatcher over single-size pools.
//!
//! The allocator owns one pool per size class, with payloads doubling
//! from [`CLASS_BASE`] and biased down by [`CLASS_SLACK`]. Each request
//! is routed to the smallest class that fits it, and the owning pool's
//! address is stamped into a hidden header in front of the returned
//! region, so deallocation needs nothing but the user pointer.

use std::ptr::NonNull;

use tracing::{debug, warn};

use crate::config::{AllocConfig, HEADER_SIZE, PoolConfig, class_count_for, class_payload};
use crate::error::AllocError;
use crate::pool::{Pool, PoolStats, Replenisher, Shared};

/// A realtime-safe allocator for variable-size requests.
///
/// Like [`Pool`], this is the realtime handle: it is not clonable, and
/// its `&mut` receivers are what make the unlocked hot paths sound. Move
/// it onto the realtime thread and drive the pools' staged inventory
/// from elsewhere through [`replenisher`](Self::replenisher).
///
/// Dropping the allocator requires every handed-out block to have been
/// returned first.
#[derive(Debug)]
pub struct SizedAllocator {
    classes: Vec<Pool>,
}

impl SizedAllocator {
    /// Create the pool family covering payloads up to
    /// `config.max_payload`, each pool filled to the low water mark.
    pub fn new(config: &AllocConfig) -> Result<Self, AllocError> {
        let count = class_count_for(config.max_payload)?;
        debug!(
            max_payload = config.max_payload,
            classes = count,
            "creating sized allocator"
        );

        let mut classes = Vec::with_capacity(count);
        for index in 0..count {
            classes.push(Pool::new(&PoolConfig {
                payload_size: class_payload(index),
                min_free: config.min_free,
                max_free: config.max_free,
                thread_safe: config.thread_safe,
            })?);
        }

        Ok(Self { classes })
    }

    /// Number of size classes.
    #[inline]
    #[must_use]
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Largest request the allocator can serve.
    #[must_use]
    pub fn max_payload(&self) -> usize {
        self.classes
            .last()
            .map_or(0, |pool| pool.payload_size() - HEADER_SIZE)
    }

    /// Allocate `size` bytes. Realtime-safe: never calls the OS allocator
    /// and never blocks.
    ///
    /// Returns `None` when the request exceeds every size class (logged
    /// as a warning) or when the chosen class has run out of inventory.
    /// There is no fall-through to a larger class: the block would later
    /// be freed to the class stamped in its header, so the class chosen
    /// here is final.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        // The back reference travels in front of the caller's region.
        let Some(adjusted) = size.checked_add(HEADER_SIZE) else {
            warn!(size, "data size too big");
            return None;
        };
        let Some(index) = self
            .classes
            .iter()
            .position(|pool| adjusted <= pool.payload_size())
        else {
            warn!(size, "data size too big");
            return None;
        };

        let pool = &mut self.classes[index];
        debug!(size, class = index, payload = pool.payload_size(), "using size class");

        let payload = pool.allocate()?;
        let shared = pool.shared_ptr();

        // SAFETY: The payload spans at least HEADER_SIZE bytes, is
        // aligned for a pointer, and is exclusively ours until returned.
        unsafe {
            payload.as_ptr().cast::<*const Shared>().write(shared);
            let block = NonNull::new_unchecked(payload.as_ptr().add(HEADER_SIZE));
            debug!(block = ?block, "returning block");
            Some(block)
        }
    }

    /// Return a block to its owning pool. Realtime-safe, cannot fail,
    /// and needs no allocator handle: the owning pool is read back from
    /// the hidden header.
    ///
    /// # Safety
    ///
    /// `block` must have been returned by [`allocate`](Self::allocate) on
    /// an allocator that is still alive, must not be used afterwards, and
    /// must be released from the realtime thread that drives the owning
    /// allocator.
    pub unsafe fn deallocate(block: NonNull<u8>) {
        // SAFETY: Per the caller contract the back reference in front of
        // the block identifies a live pool, and we are on its realtime
        // role.
        unsafe {
            let payload = NonNull::new_unchecked(block.as_ptr().sub(HEADER_SIZE));
            let shared = payload.as_ptr().cast::<*const Shared>().read();
            (*shared).deallocate_rt(payload);
        }
    }

    /// Top up and trim every pool from the calling thread.
    ///
    /// May block and may call the OS allocator; see [`Pool::replenish`].
    pub fn replenish(&mut self) {
        for pool in &mut self.classes {
            pool.replenish();
        }
    }

    /// A cloneable non-realtime handle replenishing every pool, or
    /// `None` if the allocator was created for single-thread use.
    #[must_use]
    pub fn replenisher(&self) -> Option<AllocReplenisher> {
        let pools = self
            .classes
            .iter()
            .map(Pool::replenisher)
            .collect::<Option<Vec<_>>>()?;
        Some(AllocReplenisher { pools })
    }

    /// Snapshot every pool's counters, ordered by size class.
    ///
    /// Diagnostic only; not realtime-safe.
    pub fn stats(&mut self) -> Vec<PoolStats> {
        self.classes.iter_mut().map(Pool::stats).collect()
    }
}

/// Cloneable non-realtime handle that replenishes every pool of a
/// [`SizedAllocator`].
#[derive(Clone)]
pub struct AllocReplenisher {
    pools: Vec<Replenisher>,
}

impl AllocReplenisher {
    /// Bring every pool's effective inventory between the water marks.
    pub fn replenish(&self) {
        for pool in &self.pools {
            pool.replenish();
        }
    }
}
