//! Unified parallelism abstraction for the decoder
//!
//! Provides a consistent API for parallel work distribution that works both
//! multi-threaded (via rayon) and sequential (without the `parallel` feature).
//!
//! # Design
//!
//! - `parallel` feature: enables multi-threaded execution
//! - Sequential fallback: works without the `parallel` feature
//! - Same API: `dispatch` behaves identically on all targets
//!
//! The core primitive is [`dispatch`]: a dynamic work dispatcher in which
//! workers atomically fetch the next batch of work items from a shared
//! counter. Load balances well when items have very uneven cost (a token may
//! have one out-arc or thousands). With a single worker, items are processed
//! in index order, which makes single-threaded decoding deterministic.

use crate::error::DecodeResult;

/// Work items fetched per counter increment
///
/// Small enough to balance skewed out-degrees, large enough to keep the
/// shared counter off the critical path.
const DISPATCH_CHUNK: u32 = 4;

/// Configure the global thread pool with the specified number of threads.
///
/// This must be called before any parallel operations. If called multiple
/// times, only the first call takes effect (rayon limitation).
///
/// # Arguments
///
/// * `num_threads` - Number of threads to use. If None, uses rayon's default
///   (typically the number of logical CPUs).
///
/// # Returns
///
/// Ok(actual_threads) on success.
#[cfg(feature = "parallel")]
pub fn configure_thread_pool(num_threads: Option<u32>) -> DecodeResult<usize> {
    use rayon::ThreadPoolBuilder;

    let builder = ThreadPoolBuilder::new();
    let builder = if let Some(n) = num_threads {
        builder.num_threads(n as usize)
    } else {
        builder
    };

    match builder.build_global() {
        Ok(()) => Ok(rayon::current_num_threads()),
        Err(_) => {
            // Thread pool already initialized - return current thread count
            Ok(rayon::current_num_threads())
        }
    }
}

/// Sequential fallback - no thread pool to configure.
#[cfg(not(feature = "parallel"))]
pub fn configure_thread_pool(num_threads: Option<u32>) -> DecodeResult<usize> {
    let _ = num_threads;
    Ok(1)
}

/// Get the number of workers available for parallel execution.
#[cfg(feature = "parallel")]
pub fn worker_count() -> usize {
    rayon::current_num_threads()
}

/// Sequential fallback - always 1 worker.
#[cfg(not(feature = "parallel"))]
pub fn worker_count() -> usize {
    1
}

/// Dynamically dispatch `total` work items across up to `workers` workers.
///
/// Each worker repeatedly fetches the next chunk of item indices from a
/// shared atomic counter and calls `f` once per index. Returns after every
/// item has been processed, so a call doubles as a barrier between phases.
#[cfg(feature = "parallel")]
pub fn dispatch_limited<F>(workers: usize, total: u32, f: F)
where
    F: Fn(u32) + Sync,
{
    use std::sync::atomic::{AtomicU32, Ordering};

    if total == 0 {
        return;
    }
    let workers = workers.clamp(1, total as usize);
    if workers == 1 {
        for i in 0..total {
            f(i);
        }
        return;
    }

    let counter = AtomicU32::new(0);
    let counter = &counter;
    let f = &f;
    rayon::scope(|s| {
        for _ in 0..workers {
            s.spawn(move |_| loop {
                let base = counter.fetch_add(DISPATCH_CHUNK, Ordering::Relaxed);
                if base >= total {
                    break;
                }
                let end = (base + DISPATCH_CHUNK).min(total);
                for i in base..end {
                    f(i);
                }
            });
        }
    });
}

/// Sequential fallback - items processed in index order.
#[cfg(not(feature = "parallel"))]
pub fn dispatch_limited<F>(workers: usize, total: u32, f: F)
where
    F: Fn(u32),
{
    let _ = workers;
    for i in 0..total {
        f(i);
    }
}

/// Dispatch `total` work items across all available workers.
#[cfg(feature = "parallel")]
pub fn dispatch<F>(total: u32, f: F)
where
    F: Fn(u32) + Sync,
{
    dispatch_limited(worker_count(), total, f);
}

/// Sequential fallback - items processed in index order.
#[cfg(not(feature = "parallel"))]
pub fn dispatch<F>(total: u32, f: F)
where
    F: Fn(u32),
{
    dispatch_limited(1, total, f);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    #[test]
    fn test_dispatch_visits_every_item_once() {
        let hits: Vec<AtomicU32> = (0..1000).map(|_| AtomicU32::new(0)).collect();
        dispatch(1000, |i| {
            hits[i as usize].fetch_add(1, Ordering::Relaxed);
        });
        for h in &hits {
            assert_eq!(h.load(Ordering::Relaxed), 1);
        }
    }

    #[test]
    fn test_dispatch_empty() {
        dispatch(0, |_| panic!("should not be called"));
    }

    #[test]
    fn test_dispatch_sum() {
        let sum = AtomicU64::new(0);
        dispatch(100, |i| {
            sum.fetch_add(u64::from(i), Ordering::Relaxed);
        });
        assert_eq!(sum.load(Ordering::Relaxed), 99 * 100 / 2);
    }

    #[test]
    fn test_dispatch_limited_single_worker() {
        let sum = AtomicU64::new(0);
        dispatch_limited(1, 10, |i| {
            sum.fetch_add(u64::from(i), Ordering::Relaxed);
        });
        assert_eq!(sum.load(Ordering::Relaxed), 45);
    }

    #[test]
    fn test_worker_count() {
        assert!(worker_count() >= 1);
    }
}
