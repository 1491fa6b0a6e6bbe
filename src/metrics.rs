//! Optional instrumentation for fetches and frame writes.
//!
//! Components that do I/O take an `Arc<dyn Metrics>`; the default is
//! [`NoopMetrics`]. [`ExtractionStats`] accumulates counters with atomics and
//! is what the CLI prints for `--stats`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Sink for timing and volume samples. Every method defaults to a no-op.
pub trait Metrics: Send + Sync {
    /// One range request completed, delivering `bytes`.
    fn record_fetch(&self, _bytes: u64, _elapsed: Duration) {}

    /// One frame written through the compressed-write fast path.
    fn record_encoded_write(&self, _bytes: u64, _elapsed: Duration) {}

    /// One frame decompressed and written with a positioned write.
    fn record_unencoded_write(&self, _bytes: u64, _elapsed: Duration) {}

    /// An output file, directory or symlink was opened or created.
    fn record_file_opened(&self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {}

/// Atomic counters for a whole extraction run.
#[derive(Debug, Default)]
pub struct ExtractionStats {
    fetch_requests: AtomicU64,
    fetch_bytes: AtomicU64,
    fetch_time_ns: AtomicU64,
    encoded_writes: AtomicU64,
    encoded_bytes: AtomicU64,
    encoded_time_ns: AtomicU64,
    unencoded_writes: AtomicU64,
    unencoded_bytes: AtomicU64,
    unencoded_time_ns: AtomicU64,
    files_opened: AtomicU64,
}

/// Point-in-time copy of [`ExtractionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub fetch_requests: u64,
    pub fetch_bytes: u64,
    pub fetch_time: Duration,
    pub encoded_writes: u64,
    pub encoded_bytes: u64,
    pub encoded_time: Duration,
    pub unencoded_writes: u64,
    pub unencoded_bytes: u64,
    pub unencoded_time: Duration,
    pub files_opened: u64,
}

fn nanos(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)
}

impl ExtractionStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            fetch_requests: self.fetch_requests.load(Ordering::Relaxed),
            fetch_bytes: self.fetch_bytes.load(Ordering::Relaxed),
            fetch_time: Duration::from_nanos(self.fetch_time_ns.load(Ordering::Relaxed)),
            encoded_writes: self.encoded_writes.load(Ordering::Relaxed),
            encoded_bytes: self.encoded_bytes.load(Ordering::Relaxed),
            encoded_time: Duration::from_nanos(self.encoded_time_ns.load(Ordering::Relaxed)),
            unencoded_writes: self.unencoded_writes.load(Ordering::Relaxed),
            unencoded_bytes: self.unencoded_bytes.load(Ordering::Relaxed),
            unencoded_time: Duration::from_nanos(self.unencoded_time_ns.load(Ordering::Relaxed)),
            files_opened: self.files_opened.load(Ordering::Relaxed),
        }
    }
}

impl Metrics for ExtractionStats {
    fn record_fetch(&self, bytes: u64, elapsed: Duration) {
        self.fetch_requests.fetch_add(1, Ordering::Relaxed);
        self.fetch_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.fetch_time_ns.fetch_add(nanos(elapsed), Ordering::Relaxed);
    }

    fn record_encoded_write(&self, bytes: u64, elapsed: Duration) {
        self.encoded_writes.fetch_add(1, Ordering::Relaxed);
        self.encoded_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.encoded_time_ns.fetch_add(nanos(elapsed), Ordering::Relaxed);
    }

    fn record_unencoded_write(&self, bytes: u64, elapsed: Duration) {
        self.unencoded_writes.fetch_add(1, Ordering::Relaxed);
        self.unencoded_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.unencoded_time_ns.fetch_add(nanos(elapsed), Ordering::Relaxed);
    }

    fn record_file_opened(&self) {
        self.files_opened.fetch_add(1, Ordering::Relaxed);
    }
}
