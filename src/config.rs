//! Tunables and derived sizing constants.
//!
//! Split the way the teacher's `config.rs` is split: a handful of
//! compile-time constants that name fixed parts of the wire contract, and a
//! small runtime struct ([`ProxyConfig`]) assembled explicitly by whoever
//! embeds this crate rather than read from a process-wide singleton. The
//! teacher reserves singleton globals for things that are genuinely
//! cross-cutting (its logger); everything with a lifecycle belongs to a
//! value the caller owns, and we follow that here too.

use std::thread;

use crate::compress::CompressionMode;

/// Diff granularity, in bytes. Fixed by the wire format (`spec.md` §4.2);
/// not configurable.
pub const BLOCK_SIZE: usize = 8;

/// Number of trailing matching blocks construct_diff tolerates inside a run
/// before closing it off, to avoid fragmenting one logical edit into many
/// tiny headers.
pub const DIFF_WINDOW_BLOCKS: usize = 4;

/// Initial capacity of a freshly-allocated pipe receive buffer.
pub const PIPE_RECV_INITIAL_CAPACITY: usize = 16 * 1024;

/// Smallest allocation a pipe send buffer grows to before doubling.
pub const PIPE_SEND_FLOOR: usize = 1024;

/// Shared-memory segment naming prefix used on the `apply_update` side when
/// a FILE transfer arrives for an id with no local shadow fd yet.
pub const SHM_NAME_PREFIX: &str = "/waypipe";

/// Approximate scan cost used to size `scancomp_thread_threshold`. Not a
/// measured constant, just a heuristic floor: it exists so thread wakeup
/// latency (dominated by the OS scheduler, not by this crate) is amortized
/// over enough bytes that dispatching workers is worth it.
const SCAN_NS_PER_BYTE: u64 = 2;

/// Estimated round-trip latency to wake a parked worker thread and have it
/// report completion back through the condvar.
const THREAD_WAKEUP_LATENCY_NS: u64 = 20_000;

/// Runtime configuration for a [`TranslationMap`](crate::translation_map::TranslationMap).
///
/// Constructed explicitly via [`ProxyConfig::builder`]; nothing here is a
/// global.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    compression: CompressionMode,
    /// Total logical parallelism for diff+compress work, *including* the
    /// calling thread, which always executes worker index 0 inline. A
    /// worker pool is spawned for the remaining `worker_count - 1` indices.
    worker_count: usize,
    scancomp_thread_threshold: usize,
}

impl ProxyConfig {
    pub fn builder() -> ProxyConfigBuilder {
        ProxyConfigBuilder::default()
    }

    pub fn compression(&self) -> CompressionMode {
        self.compression
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Number of OS threads the worker pool should spawn in addition to the
    /// calling thread.
    pub fn spawned_worker_count(&self) -> usize {
        self.worker_count.saturating_sub(1)
    }

    pub fn scancomp_thread_threshold(&self) -> usize {
        self.scancomp_thread_threshold
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfigBuilder::default().build()
    }
}

#[derive(Debug, Default)]
pub struct ProxyConfigBuilder {
    compression: Option<CompressionMode>,
    worker_count: Option<usize>,
}

impl ProxyConfigBuilder {
    pub fn compression(mut self, mode: CompressionMode) -> Self {
        self.compression = Some(mode);
        self
    }

    /// Override the detected worker count. Mostly useful for tests, which
    /// want deterministic single- or multi-threaded behavior on demand.
    pub fn worker_count(mut self, n: usize) -> Self {
        self.worker_count = Some(n.max(1));
        self
    }

    pub fn build(self) -> ProxyConfig {
        let worker_count = self.worker_count.unwrap_or_else(detect_worker_count);
        let scancomp_thread_threshold = derive_threshold(worker_count);
        ProxyConfig {
            compression: self.compression.unwrap_or_default(),
            worker_count,
            scancomp_thread_threshold,
        }
    }
}

/// `N = max(ncpu/2, 1)`, per the concurrency model.
fn detect_worker_count() -> usize {
    let ncpu = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    (ncpu / 2).max(1)
}

/// Minimum damaged byte count at which dispatching to the worker pool is
/// worth the synchronization overhead. With only one logical worker
/// (`worker_count == 1`, i.e. no spawned threads), parallel dispatch can
/// never be faster than the single-threaded path, so we disable it outright.
fn derive_threshold(worker_count: usize) -> usize {
    if worker_count <= 1 {
        return usize::MAX;
    }
    ((THREAD_WAKEUP_LATENCY_NS * worker_count as u64) / SCAN_NS_PER_BYTE) as usize
}
