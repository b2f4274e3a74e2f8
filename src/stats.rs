//! Process-wide request statistics.
//!
//! Each [`crate::executor::RequestExecutor`] accumulates per-instance counters
//! and folds them into this global on drop. A single writer is registered
//! lazily on first use, avoiding module-initialization-order pitfalls.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Global, process-wide request counters.
#[derive(Debug, Default)]
pub struct GlobalStats {
    /// Total number of `run()` invocations across all executors.
    runs: AtomicU64,
    /// Total elapsed time across successful runs, in nanoseconds.
    ///
    /// The first request observed by each executor is excluded (connection
    /// warmup).
    elapsed_nanos: AtomicU64,
    /// Total bytes transferred (request body + response body) across all runs.
    bytes_transferred: AtomicU64,
    /// Total retry attempts beyond the first, across all runs.
    retries: AtomicU64,
}

impl GlobalStats {
    /// Folds one executor's accumulated counters into the global totals.
    pub fn record(&self, runs: u64, elapsed: Duration, bytes: u64, retries: u64) {
        self.runs.fetch_add(runs, Ordering::Relaxed);
        #[allow(clippy::cast_possible_truncation)]
        self.elapsed_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
        self.retries.fetch_add(retries, Ordering::Relaxed);
    }

    /// Total `run()` invocations so far.
    pub fn run_count(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    /// Total elapsed time accounted (excludes each executor's first request).
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_nanos.load(Ordering::Relaxed))
    }

    /// Total bytes transferred.
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    /// Total retry attempts (attempts beyond the first per `run()` call).
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }
}

/// The lazily-initialized global statistics instance.
pub static GLOBAL_STATS: once_cell::sync::Lazy<GlobalStats> =
    once_cell::sync::Lazy::new(GlobalStats::default);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_accumulate() {
        let stats = GlobalStats::default();
        stats.record(1, Duration::from_millis(10), 100, 0);
        stats.record(1, Duration::from_millis(5), 50, 2);

        assert_eq!(stats.run_count(), 2);
        assert_eq!(stats.bytes_transferred(), 150);
        assert_eq!(stats.retries(), 2);
        assert_eq!(stats.elapsed(), Duration::from_millis(15));
    }
}
