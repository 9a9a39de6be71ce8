//! In-process allocator stress harness.
//!
//! Drives the realtime allocate / deallocate path from a dedicated
//! thread while a background thread replenishes on a timer, then reports
//! the latency distribution of the realtime pair. Worst-case latency is
//! the number that matters here: the realtime contract says it must not
//! include any OS allocator call or lock wait.

mod metrics;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use metriken::{AtomicHistogram, histogram::Histogram};
use rtalloc::{AllocConfig, SizedAllocator};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Realtime allocator stress harness.
#[derive(Parser, Debug)]
#[command(name = "rtalloc-stress")]
#[command(about = "Worst-case latency stress harness for rtalloc")]
#[command(version)]
struct Cli {
    /// Largest payload the allocator must serve
    #[arg(long, default_value = "16384")]
    max_payload: usize,

    /// Allocation size exercised by the realtime loop
    #[arg(short, long, default_value = "64")]
    size: usize,

    /// Free list low water mark
    #[arg(long, default_value = "16")]
    min_free: usize,

    /// Free list high water mark
    #[arg(long, default_value = "32")]
    max_free: usize,

    /// Run duration in seconds
    #[arg(short, long, default_value = "10")]
    duration: u64,

    /// Replenish interval in microseconds
    #[arg(long, default_value = "10000")]
    interval: u64,
}

fn main() {
    // RUST_LOG takes precedence over the default level.
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = AllocConfig {
        max_payload: cli.max_payload,
        min_free: cli.min_free,
        max_free: cli.max_free,
        thread_safe: true,
    };
    let mut allocator = SizedAllocator::new(&config)?;
    let replenisher = allocator
        .replenisher()
        .expect("allocator was created thread safe");

    info!(
        max_payload = cli.max_payload,
        classes = allocator.class_count(),
        size = cli.size,
        duration = cli.duration,
        "starting stress run"
    );

    let running = Arc::new(AtomicBool::new(true));
    let interval = Duration::from_micros(cli.interval);
    let background = {
        let running = Arc::clone(&running);
        thread::Builder::new()
            .name("replenisher".into())
            .spawn(move || {
                while running.load(Ordering::Relaxed) {
                    replenisher.replenish();
                    metrics::REPLENISH_PASSES.increment();
                    thread::sleep(interval);
                }
            })?
    };

    // The realtime loop: time each allocate / deallocate pair.
    let deadline = Instant::now() + Duration::from_secs(cli.duration);
    let size = cli.size;
    while Instant::now() < deadline {
        for _ in 0..1024 {
            let start = Instant::now();
            match allocator.allocate(size) {
                Some(block) => {
                    // SAFETY: The block came from this allocator and is
                    // released exactly once, on this thread.
                    unsafe { SizedAllocator::deallocate(block) };
                    let elapsed_ns = start.elapsed().as_nanos() as u64;
                    let _ = metrics::PAIR_LATENCY.increment(elapsed_ns);
                    metrics::ALLOCATE_OK.increment();
                }
                None => {
                    metrics::ALLOCATE_FAILED.increment();
                }
            }
        }
    }

    running.store(false, Ordering::Relaxed);
    background.join().expect("replenisher thread panicked");

    print_summary(&mut allocator);
    Ok(())
}

fn print_summary(allocator: &mut SizedAllocator) {
    let ok = metrics::ALLOCATE_OK.value();
    let failed = metrics::ALLOCATE_FAILED.value();
    let passes = metrics::REPLENISH_PASSES.value();

    eprintln!("pairs completed: {ok}");
    eprintln!("allocation failures: {failed}");
    eprintln!("replenish passes: {passes}");
    print_latency_summary(&metrics::PAIR_LATENCY);

    for (class, stats) in allocator.stats().iter().enumerate() {
        eprintln!(
            "  class {class}: payload={} free={} pending={} os_allocated={} os_released={}",
            stats.payload_size,
            stats.free_blocks,
            stats.pending_blocks,
            stats.os_allocated,
            stats.os_released,
        );
    }
}

fn print_latency_summary(hist: &AtomicHistogram) {
    let p50 = percentile(hist, 50.0) / 1000.0;
    let p99 = percentile(hist, 99.0) / 1000.0;
    let p999 = percentile(hist, 99.9) / 1000.0;
    let max = percentile(hist, 100.0) / 1000.0;

    eprintln!("pair latency (us): p50={p50:.2}  p99={p99:.2}  p999={p999:.2}  max={max:.2}");
}

fn percentile(hist: &AtomicHistogram, p: f64) -> f64 {
    if let Some(snapshot) = hist.load() {
        percentile_from_histogram(&snapshot, p)
    } else {
        0.0
    }
}

fn percentile_from_histogram(hist: &Histogram, p: f64) -> f64 {
    if let Ok(Some(results)) = hist.percentiles(&[p])
        && let Some((_pct, bucket)) = results.first()
    {
        return bucket.end() as f64;
    }
    0.0
}
