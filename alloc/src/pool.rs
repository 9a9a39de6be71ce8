//! Single-size memory pool with a realtime / non-realtime split.
//!
//! # Dual-list design
//!
//! The pool keeps two lists with asymmetric ownership:
//!
//! - **free** list: owned by the realtime side. `allocate` pops its head,
//!   `deallocate` pushes its tail. Neither ever calls the OS allocator or
//!   takes a blocking lock.
//! - **pending** list: owned by the replenisher, behind a mutex. Fresh OS
//!   blocks are staged here; surplus blocks are drained back to the OS
//!   from here.
//!
//! The realtime side moves blocks between the two lists only under a
//! successful `try_lock`, and records the free-list length in a mirror
//! counter so the replenisher can size its OS work without ever reading
//! the free list. If the try-lock never succeeds the pool still works;
//! the replenisher's view merely goes stale until the next handoff.
//!
//! Water marks give the exchange hysteresis: the inventory is topped up
//! to `min_free` and trimmed above `max_free`, so alternating allocate /
//! deallocate traffic never touches the OS.

use std::alloc::{Layout, alloc, dealloc};
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::config::PoolConfig;
use crate::error::AllocError;
use crate::list::{BlockLink, BlockList};

/// Bytes reserved at the front of every block for list linkage.
const LINK_SIZE: usize = size_of::<BlockLink>();

/// Alignment of every block. The link header is the same size, so
/// payloads inherit the full alignment.
const BLOCK_ALIGN: usize = 16;

const _: () = assert!(LINK_SIZE == BLOCK_ALIGN);

/// State owned by the realtime side. Never touched by the replenisher.
struct RtState {
    free: BlockList,
    in_use: usize,
}

/// State owned by the replenisher, behind the mutex.
struct Staging {
    pending: BlockList,
    /// The realtime side's last-published free-list length.
    mirror_free: usize,
}

/// Shared pool state referenced by both handle types.
pub(crate) struct Shared {
    payload_size: usize,
    min_free: usize,
    max_free: usize,
    thread_safe: bool,
    block_layout: Layout,
    rt: UnsafeCell<RtState>,
    staging: Mutex<Staging>,
    os_allocated: AtomicU64,
    os_released: AtomicU64,
}

// Safety: `rt` is only reached through `&mut` receivers on the
// non-clonable `Pool` handle, or through the raw entry points whose
// contract requires the caller to be the pool's single realtime role.
// All remaining state is behind the mutex or atomic.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    #[inline]
    fn payload_of(link: NonNull<BlockLink>) -> NonNull<u8> {
        // SAFETY: Blocks span LINK_SIZE + payload_size bytes; the payload
        // starts right after the linkage.
        unsafe { NonNull::new_unchecked(link.as_ptr().cast::<u8>().add(LINK_SIZE)) }
    }

    #[inline]
    unsafe fn link_of(payload: NonNull<u8>) -> NonNull<BlockLink> {
        // SAFETY: Caller guarantees `payload` was produced by payload_of.
        unsafe { NonNull::new_unchecked(payload.as_ptr().sub(LINK_SIZE).cast::<BlockLink>()) }
    }

    /// Ask the OS for one block. Returns `None` when the OS refuses.
    fn grab_block(&self) -> Option<NonNull<BlockLink>> {
        // SAFETY: block_layout has non-zero size.
        let ptr = unsafe { alloc(self.block_layout) };
        let link = NonNull::new(ptr.cast::<BlockLink>())?;
        self.os_allocated.fetch_add(1, Ordering::Relaxed);
        Some(link)
    }

    /// Hand one block back to the OS.
    ///
    /// # Safety
    ///
    /// `link` must have come from `grab_block` on this pool and must not
    /// be on any list or handed out.
    unsafe fn release_block(&self, link: NonNull<BlockLink>) {
        // SAFETY: Same layout the block was allocated with.
        unsafe { dealloc(link.as_ptr().cast::<u8>(), self.block_layout) };
        self.os_released.fetch_add(1, Ordering::Relaxed);
    }

    /// Realtime allocation: pop the free-list head, then opportunistically
    /// adopt staged blocks if the replenisher isn't holding the lock.
    ///
    /// # Safety
    ///
    /// Caller must be the pool's single realtime role.
    pub(crate) unsafe fn allocate_rt(&self) -> Option<NonNull<u8>> {
        // SAFETY: The realtime role has exclusive access to `rt`.
        let rt = unsafe { &mut *self.rt.get() };

        let link = rt.free.pop_head()?;
        rt.in_use += 1;

        if self.thread_safe
            && let Some(mut staging) = self.staging.try_lock()
        {
            while rt.free.len() < self.min_free {
                let Some(spare) = staging.pending.pop_head() else {
                    break;
                };
                // SAFETY: The staged block is live and off every list.
                unsafe { rt.free.push_tail(spare) };
            }
            staging.mirror_free = rt.free.len();
        }

        Some(Self::payload_of(link))
    }

    /// Realtime deallocation: push the block on the free-list tail, then
    /// opportunistically stage any surplus above the high water mark.
    ///
    /// # Safety
    ///
    /// Caller must be the pool's single realtime role, and `payload` must
    /// have been returned by `allocate_rt` on this pool.
    pub(crate) unsafe fn deallocate_rt(&self, payload: NonNull<u8>) {
        // SAFETY: The realtime role has exclusive access to `rt`; the
        // block is live and owned by the caller.
        let rt = unsafe { &mut *self.rt.get() };
        unsafe { rt.free.push_tail(Self::link_of(payload)) };
        rt.in_use -= 1;

        if self.thread_safe
            && let Some(mut staging) = self.staging.try_lock()
        {
            while rt.free.len() > self.max_free {
                let Some(surplus) = rt.free.pop_head() else {
                    break;
                };
                // SAFETY: Just detached from the free list.
                unsafe { staging.pending.push_tail(surplus) };
            }
            staging.mirror_free = rt.free.len();
        }
    }

    /// Staged replenish: bring the effective inventory between the water
    /// marks. Takes the blocking mutex and may call the OS allocator;
    /// never touches the free list.
    fn replenish_staged(&self) {
        let mut staging = self.staging.lock();

        // Counting staged blocks bounds pending growth even when the
        // realtime side rarely publishes a fresh mirror value.
        let mut inventory = staging.mirror_free + staging.pending.len();

        while inventory < self.min_free {
            let Some(fresh) = self.grab_block() else {
                // Out of memory: stop quietly, the next pass retries.
                break;
            };
            // SAFETY: Fresh OS block, not on any list.
            unsafe { staging.pending.push_tail(fresh) };
            inventory += 1;
        }

        while inventory > self.max_free && !staging.pending.is_empty() {
            if let Some(stale) = staging.pending.pop_head() {
                // SAFETY: Detached from the pending list.
                unsafe { self.release_block(stale) };
            }
            inventory -= 1;
        }
    }

    /// Move staged blocks onto the free list up to the low water mark and
    /// publish the mirror value.
    ///
    /// # Safety
    ///
    /// Caller must be the pool's single realtime role (or hold exclusive
    /// access during construction).
    unsafe fn adopt_pending(&self) {
        // SAFETY: Exclusive access per the caller contract.
        let rt = unsafe { &mut *self.rt.get() };
        let mut staging = self.staging.lock();

        while rt.free.len() < self.min_free {
            let Some(spare) = staging.pending.pop_head() else {
                break;
            };
            // SAFETY: The staged block is live and off every list.
            unsafe { rt.free.push_tail(spare) };
        }
        staging.mirror_free = rt.free.len();
    }

    /// Direct replenish for single-thread pools: the free list is topped
    /// up and trimmed in place, with no staging.
    ///
    /// # Safety
    ///
    /// Caller must be the pool's single (realtime) thread.
    unsafe fn replenish_direct(&self) {
        // SAFETY: Exclusive access per the caller contract.
        let rt = unsafe { &mut *self.rt.get() };

        while rt.free.len() < self.min_free {
            let Some(fresh) = self.grab_block() else {
                return;
            };
            // SAFETY: Fresh OS block, not on any list.
            unsafe { rt.free.push_tail(fresh) };
        }

        while rt.free.len() > self.max_free {
            let Some(stale) = rt.free.pop_head() else {
                break;
            };
            // SAFETY: Detached from the free list.
            unsafe { self.release_block(stale) };
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let outstanding = self.rt.get_mut().in_use;
        assert!(
            outstanding == 0,
            "pool dropped with {outstanding} outstanding blocks"
        );

        let mut free = std::mem::take(&mut self.rt.get_mut().free);
        while let Some(block) = free.pop_head() {
            // SAFETY: Every block on the free list came from grab_block.
            unsafe { self.release_block(block) };
        }

        let mut pending = std::mem::take(&mut self.staging.get_mut().pending);
        while let Some(block) = pending.pop_head() {
            // SAFETY: Every staged block came from grab_block.
            unsafe { self.release_block(block) };
        }
    }
}

/// The realtime handle of a single-size pool.
///
/// `Pool` is not clonable: its `&mut` receivers are what make the
/// unlocked free-list operations sound. Move it onto the thread that
/// must meet deadlines and hand [`Replenisher`] clones to everyone else.
///
/// Dropping the last handle releases every pooled block to the OS and
/// requires all handed-out blocks to have been returned first.
pub struct Pool {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").finish_non_exhaustive()
    }
}

impl Pool {
    /// Create a pool and fill its free list to the low water mark.
    ///
    /// The initial fill happens on the calling thread and may invoke the
    /// OS allocator, so create pools before entering the realtime path.
    /// An out-of-memory condition during the fill is absorbed; a later
    /// `replenish` will retry.
    pub fn new(config: &PoolConfig) -> Result<Self, AllocError> {
        if config.min_free >= config.max_free {
            return Err(AllocError::InvalidWaterMarks);
        }
        if config.payload_size == 0 {
            return Err(AllocError::InvalidPayloadSize);
        }
        let size = LINK_SIZE
            .checked_add(config.payload_size)
            .ok_or(AllocError::InvalidPayloadSize)?;
        let block_layout = Layout::from_size_align(size, BLOCK_ALIGN)
            .map_err(|_| AllocError::InvalidPayloadSize)?;

        let shared = Arc::new(Shared {
            payload_size: config.payload_size,
            min_free: config.min_free,
            max_free: config.max_free,
            thread_safe: config.thread_safe,
            block_layout,
            rt: UnsafeCell::new(RtState {
                free: BlockList::new(),
                in_use: 0,
            }),
            staging: Mutex::new(Staging {
                pending: BlockList::new(),
                mirror_free: 0,
            }),
            os_allocated: AtomicU64::new(0),
            os_released: AtomicU64::new(0),
        });

        // Nothing else can reach the pool yet, so the free list itself
        // can be brought to the low water mark.
        if config.thread_safe {
            shared.replenish_staged();
            // SAFETY: Exclusive access: the pool has a single reference.
            unsafe { shared.adopt_pending() };
        } else {
            // SAFETY: Same as above.
            unsafe { shared.replenish_direct() };
        }

        Ok(Self { shared })
    }

    /// Bytes available to the caller in each block.
    #[inline]
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.shared.payload_size
    }

    /// Allocate one block. Realtime-safe: never calls the OS allocator
    /// and never blocks; returns `None` when the free list is empty.
    ///
    /// The returned pointer addresses [`payload_size`](Self::payload_size)
    /// writable bytes.
    #[inline]
    pub fn allocate(&mut self) -> Option<NonNull<u8>> {
        // SAFETY: `&mut self` on the non-clonable handle proves this
        // thread is the pool's realtime role.
        unsafe { self.shared.allocate_rt() }
    }

    /// Return a block to the pool. Realtime-safe, cannot fail.
    ///
    /// # Safety
    ///
    /// `block` must have been returned by [`allocate`](Self::allocate) on
    /// this pool and must not be used afterwards.
    #[inline]
    pub unsafe fn deallocate(&mut self, block: NonNull<u8>) {
        // SAFETY: `&mut self` proves the realtime role; the caller
        // vouches for the block's origin.
        unsafe { self.shared.deallocate_rt(block) };
    }

    /// Top up and trim the inventory from the calling thread.
    ///
    /// May block and may call the OS allocator. On a dual-thread pool
    /// this stages blocks and then adopts them onto the free list, which
    /// is sound here because `&mut self` proves the realtime side is
    /// quiescent; a concurrent replenisher thread should use
    /// [`Replenisher::replenish`] instead.
    pub fn replenish(&mut self) {
        if self.shared.thread_safe {
            self.shared.replenish_staged();
            // SAFETY: `&mut self` proves the realtime role is quiescent.
            unsafe { self.shared.adopt_pending() };
        } else {
            // SAFETY: Single-thread pool, exclusive by contract.
            unsafe { self.shared.replenish_direct() };
        }
    }

    /// Allocate, replenishing as needed, until a block is obtained.
    ///
    /// Not realtime-safe; intended for startup paths. Loops indefinitely
    /// if the OS refuses memory.
    pub fn allocate_blocking(&mut self) -> NonNull<u8> {
        loop {
            self.replenish();
            if let Some(block) = self.allocate() {
                return block;
            }
        }
    }

    /// A cloneable non-realtime handle for replenishing this pool, or
    /// `None` if the pool was created for single-thread use.
    #[must_use]
    pub fn replenisher(&self) -> Option<Replenisher> {
        self.shared.thread_safe.then(|| Replenisher {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Snapshot the pool's counters.
    ///
    /// Diagnostic only: takes the blocking mutex, so keep it off the
    /// realtime path.
    pub fn stats(&mut self) -> PoolStats {
        // SAFETY: `&mut self` proves the realtime role is quiescent.
        let rt = unsafe { &*self.shared.rt.get() };
        let staging = self.shared.staging.lock();

        PoolStats {
            payload_size: self.shared.payload_size,
            min_free: self.shared.min_free,
            max_free: self.shared.max_free,
            in_use: rt.in_use,
            free_blocks: rt.free.len(),
            pending_blocks: staging.pending.len(),
            mirror_free: if self.shared.thread_safe {
                staging.mirror_free
            } else {
                rt.free.len()
            },
            os_allocated: self.shared.os_allocated.load(Ordering::Relaxed),
            os_released: self.shared.os_released.load(Ordering::Relaxed),
        }
    }

    /// Stable address of the shared pool state, for the back reference
    /// the sized allocator stamps into handed-out blocks.
    #[inline]
    pub(crate) fn shared_ptr(&self) -> *const Shared {
        Arc::as_ptr(&self.shared)
    }
}

/// Cloneable non-realtime handle that refills and trims a pool.
///
/// Run [`replenish`](Self::replenish) periodically from any thread other
/// than the pool's realtime thread: it may block on the pool mutex and
/// call the OS allocator, but it never touches the realtime free list.
#[derive(Clone)]
pub struct Replenisher {
    shared: Arc<Shared>,
}

impl Replenisher {
    /// Bring the effective inventory between the water marks.
    pub fn replenish(&self) {
        self.shared.replenish_staged();
    }
}

/// Point-in-time snapshot of a pool's counters.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    /// Bytes available to the caller in each block.
    pub payload_size: usize,
    /// Low water mark.
    pub min_free: usize,
    /// High water mark.
    pub max_free: usize,
    /// Blocks currently handed out.
    pub in_use: usize,
    /// Blocks on the realtime free list.
    pub free_blocks: usize,
    /// Blocks staged by the replenisher.
    pub pending_blocks: usize,
    /// The replenisher's view of the free-list length.
    pub mirror_free: usize,
    /// Cumulative blocks obtained from the OS.
    pub os_allocated: u64,
    /// Cumulative blocks returned to the OS.
    pub os_released: u64,
}

impl PoolStats {
    /// Blocks currently held by the pool or its callers. Always equals
    /// `os_allocated - os_released`.
    #[must_use]
    pub fn resident(&self) -> u64 {
        (self.in_use + self.free_blocks + self.pending_blocks) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(thread_safe: bool) -> Pool {
        Pool::new(&PoolConfig {
            payload_size: 64,
            min_free: 4,
            max_free: 8,
            thread_safe,
        })
        .expect("failed to create test pool")
    }

    fn assert_conserved(stats: &PoolStats) {
        assert_eq!(stats.resident(), stats.os_allocated - stats.os_released);
    }

    #[test]
    fn test_create_fills_free_list() {
        for thread_safe in [false, true] {
            let mut pool = test_pool(thread_safe);
            let stats = pool.stats();
            assert_eq!(stats.free_blocks, 4);
            assert_eq!(stats.pending_blocks, 0);
            assert_eq!(stats.mirror_free, 4);
            assert_eq!(stats.in_use, 0);
            assert_eq!(stats.os_allocated, 4);
            assert_conserved(&stats);
        }
    }

    #[test]
    fn test_invalid_water_marks() {
        for (min_free, max_free) in [(4, 4), (8, 4)] {
            let result = Pool::new(&PoolConfig {
                payload_size: 64,
                min_free,
                max_free,
                thread_safe: true,
            });
            assert_eq!(result.unwrap_err(), AllocError::InvalidWaterMarks);
        }
    }

    #[test]
    fn test_zero_payload_rejected() {
        let result = Pool::new(&PoolConfig {
            payload_size: 0,
            min_free: 4,
            max_free: 8,
            thread_safe: false,
        });
        assert_eq!(result.unwrap_err(), AllocError::InvalidPayloadSize);
    }

    #[test]
    fn test_allocate_until_exhausted() {
        let mut pool = test_pool(true);

        let mut blocks = Vec::new();
        for i in 0..10 {
            match pool.allocate() {
                Some(block) => {
                    assert!(i < 4, "allocation {i} should have failed");
                    blocks.push(block);
                }
                None => assert!(i >= 4, "allocation {i} should have succeeded"),
            }
        }
        assert_eq!(pool.stats().in_use, 4);

        for block in blocks {
            unsafe { pool.deallocate(block) };
        }
        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.free_blocks, 4);
        assert_conserved(&stats);
    }

    #[test]
    fn test_payload_is_aligned_and_writable() {
        let mut pool = test_pool(true);
        let block = pool.allocate().unwrap();

        assert_eq!(block.as_ptr() as usize % align_of::<*const u8>(), 0);
        unsafe {
            std::ptr::write_bytes(block.as_ptr(), 0xAB, pool.payload_size());
            assert_eq!(block.as_ptr().read(), 0xAB);
            pool.deallocate(block);
        }
    }

    #[test]
    fn test_deallocate_stages_surplus() {
        let mut pool = test_pool(true);

        // Force the pool to hold more blocks than the high water mark.
        let blocks: Vec<_> = (0..12).map(|_| pool.allocate_blocking()).collect();
        assert_eq!(pool.stats().in_use, 12);

        for block in blocks {
            unsafe { pool.deallocate(block) };
        }

        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.free_blocks, 8);
        assert_eq!(stats.pending_blocks, 7);
        assert_eq!(stats.mirror_free, 8);
        assert_conserved(&stats);
    }

    #[test]
    fn test_replenish_drains_staged_surplus() {
        let mut pool = test_pool(true);

        let blocks: Vec<_> = (0..12).map(|_| pool.allocate_blocking()).collect();
        for block in blocks {
            unsafe { pool.deallocate(block) };
        }

        // Inventory is 15 against a high water mark of 8; the staged
        // share goes back to the OS.
        pool.replenish();
        let stats = pool.stats();
        assert_eq!(stats.pending_blocks, 0);
        assert_eq!(stats.free_blocks, 8);
        assert_eq!(stats.os_released, 7);
        assert_conserved(&stats);
    }

    #[test]
    fn test_blocking_allocate_refills() {
        let mut pool = test_pool(true);

        let mut blocks: Vec<_> = (0..4).map(|_| pool.allocate().unwrap()).collect();
        assert!(pool.allocate().is_none());

        blocks.push(pool.allocate_blocking());
        assert_eq!(pool.stats().in_use, 5);

        for block in blocks {
            unsafe { pool.deallocate(block) };
        }
    }

    #[test]
    fn test_single_thread_mode() {
        let mut pool = test_pool(false);
        assert!(pool.replenisher().is_none());

        let mut blocks: Vec<_> = (0..4).map(|_| pool.allocate().unwrap()).collect();
        assert!(pool.allocate().is_none());

        pool.replenish();
        let stats = pool.stats();
        assert_eq!(stats.free_blocks, 4);
        assert_eq!(stats.pending_blocks, 0);
        assert_eq!(stats.os_allocated, 8);

        blocks.extend((0..4).map(|_| pool.allocate().unwrap()));
        for block in blocks {
            unsafe { pool.deallocate(block) };
        }

        // Eight blocks sit on the free list, at the high water mark, so
        // a replenish releases nothing.
        pool.replenish();
        let stats = pool.stats();
        assert_eq!(stats.free_blocks, 8);
        assert_eq!(stats.os_released, 0);
        assert_conserved(&stats);
    }

    #[test]
    fn test_single_thread_replenish_trims() {
        let mut pool = test_pool(false);

        let blocks: Vec<_> = (0..12).map(|_| pool.allocate_blocking()).collect();
        for block in blocks {
            unsafe { pool.deallocate(block) };
        }
        assert_eq!(pool.stats().free_blocks, 15);

        pool.replenish();
        let stats = pool.stats();
        assert_eq!(stats.free_blocks, 8);
        assert_eq!(stats.os_released, 7);
        assert_conserved(&stats);
    }

    #[test]
    fn test_recycled_blocks_come_back_first() {
        let mut pool = test_pool(true);

        let first = pool.allocate().unwrap();
        unsafe { pool.deallocate(first) };

        // Three older blocks sit ahead of the recycled one.
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(pool.allocate().unwrap());
        }
        assert_eq!(*seen.last().unwrap(), first);

        for block in seen {
            unsafe { pool.deallocate(block) };
        }
    }

    #[test]
    #[should_panic(expected = "outstanding")]
    fn test_drop_with_outstanding_block_panics() {
        let mut pool = test_pool(true);
        let block = pool.allocate().unwrap();
        // Leak the payload pointer and drop the pool with it outstanding.
        let _ = block;
        drop(pool);
    }

    #[test]
    fn test_replenisher_handle_stages_only() {
        let mut pool = test_pool(true);
        let replenisher = pool.replenisher().unwrap();

        let blocks: Vec<_> = (0..4).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(pool.stats().free_blocks, 0);

        // The replenisher refills the staged inventory but leaves the
        // free list alone...
        replenisher.replenish();
        let stats = pool.stats();
        assert_eq!(stats.free_blocks, 0);
        assert!(stats.pending_blocks >= 4);

        // ...and the next realtime deallocate adopts nothing (free stays
        // under the high water mark), while an allocate pulls staged
        // blocks across under the try-lock.
        for block in blocks {
            unsafe { pool.deallocate(block) };
        }
        let held = pool.allocate().unwrap();
        let stats = pool.stats();
        assert!(stats.free_blocks >= 3);
        assert_conserved(&stats);

        unsafe { pool.deallocate(held) };
    }
}
