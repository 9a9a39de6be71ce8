//! Stress harness metrics.

use metriken::{AtomicHistogram, Counter, metric};

#[metric(name = "allocate_ok", description = "Successful realtime allocations")]
pub static ALLOCATE_OK: Counter = Counter::new();

#[metric(
    name = "allocate_failed",
    description = "Realtime allocations that found an empty free list"
)]
pub static ALLOCATE_FAILED: Counter = Counter::new();

#[metric(name = "replenish_passes", description = "Background replenish passes")]
pub static REPLENISH_PASSES: Counter = Counter::new();

#[metric(
    name = "pair_latency",
    description = "Allocate + deallocate pair latency histogram (nanoseconds)"
)]
pub static PAIR_LATENCY: AtomicHistogram = AtomicHistogram::new(7, 64);
