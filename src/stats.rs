//! Run-wide counters, the per-second handshake-rate history, and the
//! per-worker latency rings that feed the final report.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, warn};

/// Capacity of each worker's latency ring.
pub const LATENCY_SAMPLES: usize = 1024;

/// Upper bound on retained per-second rate samples (one hour of them).
pub const RATE_HISTORY_LIMIT: usize = 3600;

/// Counters shared by every worker and sampled by the main thread.
///
/// All counters are observational: they are read and written with relaxed
/// ordering and never used to synchronize between threads.  The struct is
/// aligned to a cache line so the hot counters do not share one with
/// whatever the allocator places next to them.
#[repr(align(64))]
pub struct GlobalStats {
    /// Completed TLS handshakes over the whole run.  Monotonic.
    pub tot_tls_handshakes: AtomicU64,
    /// Peers currently waiting for TCP connect to finish.
    pub tcp_handshakes: AtomicI64,
    /// Peers currently holding an established TCP connection.
    pub tcp_connections: AtomicI64,
    /// TLS handshakes completed since the last supervisor tick; the
    /// supervisor drains this each second to form a rate sample.
    pub tls_connections: AtomicI64,
    /// Peers currently inside the TLS handshake.
    pub tls_handshakes: AtomicI64,
    /// Transient connect/handshake failures after the first success.
    pub error_count: AtomicI64,

    /// Set once any peer completes a TCP connect.  A TCP failure before this
    /// point is treated as fatal rather than retried.
    pub tcp_ever_connected: AtomicBool,
    /// Set once any peer completes a TLS handshake; same role as above for
    /// TLS failures.
    pub tls_ever_connected: AtomicBool,

    /// Run termination latch, set by the signal handler, the supervisor's
    /// duration check, or a failing worker.
    terminate: AtomicBool,
    /// Set by the first worker to reach its full peer complement; gates the
    /// rate history so the ramp-up period does not pollute the report.
    pub start_stats: AtomicBool,
}

impl GlobalStats {
    pub fn new() -> Self {
        Self {
            tot_tls_handshakes: AtomicU64::new(0),
            tcp_handshakes: AtomicI64::new(0),
            tcp_connections: AtomicI64::new(0),
            tls_connections: AtomicI64::new(0),
            tls_handshakes: AtomicI64::new(0),
            error_count: AtomicI64::new(0),
            tcp_ever_connected: AtomicBool::new(false),
            tls_ever_connected: AtomicBool::new(false),
            terminate: AtomicBool::new(false),
            start_stats: AtomicBool::new(false),
        }
    }

    pub fn request_terminate(&self) {
        self.terminate.store(true, Ordering::Relaxed);
    }

    pub fn terminate_requested(&self) -> bool {
        self.terminate.load(Ordering::Relaxed)
    }

    /// Latches `start_stats`; returns true for exactly one caller.
    pub fn mark_all_peers_active(&self) -> bool {
        self.start_stats
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    pub fn end_of_work(&self, handshake_budget: u64) -> bool {
        // A few handshakes beyond the budget may slip through; that is fine.
        self.terminate_requested()
            || self.tot_tls_handshakes.load(Ordering::Relaxed) >= handshake_budget
    }
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self::new()
    }
}

/// One per-second handshake-rate observation.
#[derive(Clone, Copy, Debug)]
pub struct RateSample {
    /// Time since the run started.
    pub elapsed: Duration,
    /// Handshakes per second over the sampled interval.
    pub per_second: i64,
}

/// Rolling handshake-rate statistics.  Owned by the supervisor thread only.
pub struct RateStats {
    measures: u64,
    min: i64,
    max: i64,
    avg: i64,
    history: Vec<RateSample>,
    overflow_warned: bool,
}

/// Aggregates over the rate history for the final report.
pub struct RateSummary {
    pub seconds: u64,
    pub max: i64,
    pub avg: i64,
    pub p95: i64,
    pub min: i64,
}

impl RateStats {
    pub fn new() -> Self {
        Self {
            measures: 0,
            min: 0,
            max: 0,
            avg: 0,
            history: Vec::new(),
            overflow_warned: false,
        }
    }

    /// Folds one per-second sample into the running aggregates.
    pub fn record(&mut self, elapsed: Duration, per_second: i64) {
        self.measures += 1;
        if self.max < per_second {
            self.max = per_second;
        }
        if per_second != 0 && (self.min > per_second || self.min == 0) {
            self.min = per_second;
        }
        self.avg = (self.avg * (self.measures as i64 - 1) + per_second) / self.measures as i64;

        if self.history.len() == RATE_HISTORY_LIMIT {
            if !self.overflow_warned {
                warn!("benchmark is running for too long, further rate samples won't be stored");
                self.overflow_warned = true;
            }
            return;
        }
        self.history.push(RateSample {
            elapsed,
            per_second,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.history.len()
    }

    /// Aggregates the recorded history, or `None` when nothing was recorded.
    pub fn summary(&self) -> Option<RateSummary> {
        if self.history.is_empty() {
            return None;
        }
        let mut rates: Vec<i64> = self
            .history
            .iter()
            .map(|sample| sample.per_second)
            .collect();
        // Descending, so that 95% of the samples are faster than the
        // 95th-percentile element.
        rates.sort_unstable_by(|a, b| b.cmp(a));
        Some(RateSummary {
            seconds: self.measures,
            max: self.max,
            avg: self.avg,
            p95: rates[rates.len() * 95 / 100],
            min: self.min,
        })
    }
}

impl Default for RateStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-worker handshake latency ring, in microseconds.
///
/// The ring is written with a growing stride rather than sequentially: the
/// write index advances by `stride`, and every time it wraps, the stride
/// grows by one (cycling back to 1 past a quarter of the capacity).  Under
/// overflow this blends late samples in between the earlier ones instead of
/// discarding whole generations.  A zero slot means "never written".
///
/// The ring is owned by exactly one worker and needs no synchronization
/// during the run; it is aligned to a cache line to keep neighbouring worker
/// state from sharing one with it.
#[repr(align(64))]
pub struct LatencyRing {
    samples: [u64; LATENCY_SAMPLES],
    idx: usize,
    stride: usize,
}

impl LatencyRing {
    pub fn new() -> Self {
        Self {
            samples: [0; LATENCY_SAMPLES],
            idx: 0,
            stride: 1,
        }
    }

    /// Records one handshake duration in microseconds.
    pub fn record(&mut self, us: u64) {
        if us == 0 {
            debug!("bad zero latency sample");
            return;
        }
        self.samples[self.idx] = us;

        self.idx += self.stride;
        if self.idx >= LATENCY_SAMPLES {
            self.idx = 0;
            self.stride += 1;
            if self.stride > LATENCY_SAMPLES / 4 {
                self.stride = 1;
            }
        }
    }

    /// Empties the ring into the merged collection.  Called once, when the
    /// owning worker exits.
    pub fn flush_into(&self, merged: &MergedLatency) {
        let mut inner = merged.inner.lock().unwrap();
        for &sample in self.samples.iter() {
            if sample == 0 {
                break;
            }
            inner.samples.push(sample);
            inner.total += sample;
        }
    }
}

impl Default for LatencyRing {
    fn default() -> Self {
        Self::new()
    }
}

/// Latency samples from every exited worker, merged under one lock.
pub struct MergedLatency {
    inner: Mutex<MergedSamples>,
}

struct MergedSamples {
    samples: Vec<u64>,
    total: u64,
}

/// Aggregates over the merged latency samples for the final report.
pub struct LatencySummary {
    pub min: u64,
    pub avg: u64,
    pub p95: u64,
    pub max: u64,
}

impl MergedLatency {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MergedSamples {
                samples: Vec::new(),
                total: 0,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aggregates all flushed samples, or `None` when no worker recorded any.
    pub fn summary(&self) -> Option<LatencySummary> {
        let inner = self.inner.lock().unwrap();
        if inner.samples.is_empty() {
            return None;
        }
        let mut sorted = inner.samples.clone();
        sorted.sort_unstable();
        Some(LatencySummary {
            min: sorted[0],
            avg: inner.total / sorted.len() as u64,
            p95: sorted[sorted.len() * 95 / 100],
            max: *sorted.last().unwrap(),
        })
    }
}

impl Default for MergedLatency {
    fn default() -> Self {
        Self::new()
    }
}
