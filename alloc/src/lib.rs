//! Realtime-safe pooled memory allocation.
//!
//! This crate provides a general-purpose `allocate(size)` /
//! `deallocate(ptr)` facade whose hot paths never invoke the OS
//! allocator, never block, and never wait on a lock held by another
//! thread. It targets code that must meet hard deadlines — audio
//! callbacks, control loops, low-latency signal paths — where a page
//! fault or a contended mutex blows the budget.
//!
//! # Architecture
//!
//! ```text
//!              +--------------------+
//!              |   SizedAllocator   |  allocate(size) / deallocate(ptr)
//!              +----+-----+-----+---+
//!                   |     |     |
//!                   v     v     v
//!               +------+------+------+
//!               | Pool | Pool | Pool |   payload = 1024 * 2^i - 100
//!               +------+------+------+
//!   realtime side:  free list, try-lock handoff only
//!   replenisher:    pending list, mutex, OS allocator
//! ```
//!
//! Each [`Pool`] serves blocks of a single size from a free list owned
//! by the realtime thread. A separate replenisher thread keeps a staged
//! inventory topped up between two water marks; blocks cross between the
//! two sides only when the realtime thread wins a `try_lock`, so the
//! realtime thread never waits. The [`SizedAllocator`] routes each
//! request to the smallest pool that fits and hides the owning pool in a
//! header, so freeing needs only the pointer.
//!
//! # Example
//!
//! ```
//! use rtalloc::{AllocConfig, SizedAllocator};
//!
//! let mut allocator = SizedAllocator::new(&AllocConfig {
//!     max_payload: 4096,
//!     ..Default::default()
//! })
//! .unwrap();
//!
//! // Hand this to a background thread and call replenish() on a timer.
//! let replenisher = allocator.replenisher().unwrap();
//! replenisher.replenish();
//!
//! // On the realtime thread: never blocks, never calls the OS.
//! let block = allocator.allocate(64).unwrap();
//! // SAFETY: The block came from this allocator and is released once.
//! unsafe { SizedAllocator::deallocate(block) };
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod config;
mod error;
mod list;
mod pool;
mod sized;

pub use config::{
    AllocConfig, CLASS_BASE, CLASS_SLACK, DEFAULT_MAX_FREE, DEFAULT_MAX_PAYLOAD, DEFAULT_MIN_FREE,
    HEADER_SIZE, PoolConfig, class_count_for, class_payload,
};
pub use error::{AllocError, AllocResult};
pub use pool::{Pool, PoolStats, Replenisher};
pub use sized::{AllocReplenisher, SizedAllocator};
