//! Metrics bus: circular statistics buffers and atomic gauges.
//!
//! The processor records a per-frame duration into [`StatBuffer`] (the last
//! 1,000 samples) and a `(deformability, area)` pair per qualifying frame into
//! [`ScatterBuffer`] (the last 10,000 pairs). Gauges for frame rate, data
//! rate, queue depths and save timing are plain atomics. UI observers read at
//! their own cadence; the `updated` flag tells them something changed.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// Per-frame processing budget in microseconds; the fraction of samples above
/// it is part of the reported statistics.
pub const LATENCY_BUDGET_US: f64 = 200.0;

/// Capacity of the processing-times buffer.
pub const PROCESSING_TIMES_CAPACITY: usize = 1_000;

/// Capacity of the deformability/area scatter buffer.
pub const SCATTER_CAPACITY: usize = 10_000;

/// Lock-free single-producer circular buffer of `f64` samples.
///
/// Only one thread (the processor) pushes; any number of threads may take
/// snapshots. Readers accept the snapshot semantics of circular reads: a
/// snapshot taken while a push is in flight may miss or double-count the
/// newest sample, never tear an individual one on 64-bit platforms.
pub struct StatBuffer {
    /// Backing storage, kept alive for the lifetime of the buffer.
    #[expect(dead_code, reason = "storage must be kept alive; data points into it")]
    storage: UnsafeCell<Box<[u64]>>,
    /// SAFETY: points into `storage`, which never reallocates.
    data: *mut u64,
    capacity: usize,
    head: AtomicUsize,
    len: AtomicUsize,
}

// SAFETY: samples are stored as u64 bit patterns through a raw pointer; the
// single producer publishes head/len with Release and readers load with
// Acquire. Racy re-reads of the newest sample are tolerated by contract.
#[allow(unsafe_code)]
unsafe impl Send for StatBuffer {}
// SAFETY: see Send.
#[allow(unsafe_code)]
unsafe impl Sync for StatBuffer {}

/// Summary statistics over the retained processing times.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessingStats {
    /// Most recent sample, microseconds.
    pub instant_us: f64,
    pub mean_us: f64,
    pub min_us: f64,
    pub max_us: f64,
    /// Fraction (0..=1) of samples above [`LATENCY_BUDGET_US`].
    pub over_budget: f64,
    pub samples: usize,
}

impl StatBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "stat buffer capacity must be non-zero");
        let mut storage = vec![0u64; capacity].into_boxed_slice();
        let data = storage.as_mut_ptr();
        Self {
            storage: UnsafeCell::new(storage),
            data,
            capacity,
            head: AtomicUsize::new(0),
            len: AtomicUsize::new(0),
        }
    }

    /// Record a sample. Single producer only.
    #[allow(unsafe_code)]
    pub fn push(&self, value: f64) {
        let head = self.head.load(Ordering::Relaxed);
        // SAFETY: head < capacity; single producer, so no concurrent write to
        // the same slot.
        unsafe {
            *self.data.add(head) = value.to_bits();
        }
        self.head.store((head + 1) % self.capacity, Ordering::Release);
        let len = self.len.load(Ordering::Relaxed);
        self.len.store((len + 1).min(self.capacity), Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy out the retained samples, newest first.
    #[allow(unsafe_code)]
    pub fn snapshot(&self) -> Vec<f64> {
        let len = self.len();
        let head = self.head.load(Ordering::Acquire);
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            let slot = (head + self.capacity - 1 - i) % self.capacity;
            // SAFETY: slot < capacity. A concurrent push may rewrite the
            // oldest slot mid-snapshot; a stale or fresh sample is equally
            // acceptable here.
            out.push(f64::from_bits(unsafe { *self.data.add(slot) }));
        }
        out
    }

    pub fn stats(&self) -> ProcessingStats {
        let samples = self.snapshot();
        if samples.is_empty() {
            return ProcessingStats::default();
        }
        let mut sum = 0.0;
        let mut min = f64::MAX;
        let mut max = 0.0f64;
        let mut over = 0usize;
        for &s in &samples {
            sum += s;
            min = min.min(s);
            max = max.max(s);
            if s > LATENCY_BUDGET_US {
                over += 1;
            }
        }
        ProcessingStats {
            instant_us: samples[0],
            mean_us: sum / samples.len() as f64,
            min_us: min,
            max_us: max,
            over_budget: over as f64 / samples.len() as f64,
            samples: samples.len(),
        }
    }
}

/// Bounded buffer of `(deformability, area)` pairs behind a mutex.
///
/// The mutex mirrors the original single coarse lock around the scatter data;
/// contention is negligible at one push per qualifying frame.
pub struct ScatterBuffer {
    inner: Mutex<VecDeque<(f64, f64)>>,
    capacity: usize,
}

impl ScatterBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, deformability: f64, area: f64) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.len() == self.capacity {
            inner.pop_front();
        }
        inner.push_back((deformability, area));
    }

    pub fn snapshot(&self) -> Vec<(f64, f64)> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.clear();
    }
}

/// All run-time metrics shared between workers and observers.
pub struct MetricsBus {
    pub processing_times: StatBuffer,
    pub scatter: ScatterBuffer,
    /// Source-reported frames per second (f64 bit pattern).
    current_fps: AtomicU64,
    /// Camera data rate in MB/s (f64 bit pattern).
    data_rate: AtomicU64,
    pub exposure_time_us: AtomicU64,
    pub processing_queue_depth: AtomicUsize,
    pub display_queue_depth: AtomicUsize,
    pub qualified_results: AtomicUsize,
    pub total_saved: AtomicUsize,
    pub disk_save_ms: AtomicU64,
    pub trigger_onset_us: AtomicI64,
    pub duplicate_frames: AtomicU64,
    pub dropped_frames: AtomicU64,
    /// `HH:MM:SS` wall-clock label of the last background capture.
    background_captured_at: Mutex<String>,
    updated: AtomicBool,
}

impl Default for MetricsBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsBus {
    pub fn new() -> Self {
        Self {
            processing_times: StatBuffer::new(PROCESSING_TIMES_CAPACITY),
            scatter: ScatterBuffer::new(SCATTER_CAPACITY),
            current_fps: AtomicU64::new(0f64.to_bits()),
            data_rate: AtomicU64::new(0f64.to_bits()),
            exposure_time_us: AtomicU64::new(0),
            processing_queue_depth: AtomicUsize::new(0),
            display_queue_depth: AtomicUsize::new(0),
            qualified_results: AtomicUsize::new(0),
            total_saved: AtomicUsize::new(0),
            disk_save_ms: AtomicU64::new(0),
            trigger_onset_us: AtomicI64::new(0),
            duplicate_frames: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
            background_captured_at: Mutex::new(String::new()),
            updated: AtomicBool::new(false),
        }
    }

    pub fn set_fps(&self, fps: f64) {
        self.current_fps.store(fps.to_bits(), Ordering::Relaxed);
        self.mark_updated();
    }

    pub fn fps(&self) -> f64 {
        f64::from_bits(self.current_fps.load(Ordering::Relaxed))
    }

    pub fn set_data_rate(&self, mbps: f64) {
        self.data_rate.store(mbps.to_bits(), Ordering::Relaxed);
        self.mark_updated();
    }

    pub fn data_rate(&self) -> f64 {
        f64::from_bits(self.data_rate.load(Ordering::Relaxed))
    }

    pub fn set_background_captured_at(&self, label: String) {
        let mut guard = self
            .background_captured_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *guard = label;
        self.mark_updated();
    }

    pub fn background_captured_at(&self) -> String {
        self.background_captured_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Raised on any metrics write; cleared by whoever renders.
    pub fn mark_updated(&self) {
        self.updated.store(true, Ordering::Release);
    }

    pub fn take_updated(&self) -> bool {
        self.updated.swap(false, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_buffer_retains_last_capacity_samples() {
        let buf = StatBuffer::new(4);
        for i in 0..6 {
            buf.push(i as f64);
        }
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.snapshot(), vec![5.0, 4.0, 3.0, 2.0]);
    }

    #[test]
    fn stats_cover_min_max_mean_and_budget() {
        let buf = StatBuffer::new(8);
        for v in [100.0, 150.0, 250.0, 300.0] {
            buf.push(v);
        }
        let stats = buf.stats();
        assert_eq!(stats.samples, 4);
        assert!((stats.instant_us - 300.0).abs() < f64::EPSILON);
        assert!((stats.min_us - 100.0).abs() < f64::EPSILON);
        assert!((stats.max_us - 300.0).abs() < f64::EPSILON);
        assert!((stats.mean_us - 200.0).abs() < f64::EPSILON);
        assert!((stats.over_budget - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_stats_are_zero() {
        let buf = StatBuffer::new(4);
        assert_eq!(buf.stats(), ProcessingStats::default());
    }

    #[test]
    fn scatter_buffer_bounds_and_clears() {
        let buf = ScatterBuffer::new(3);
        for i in 0..5 {
            buf.push(i as f64 * 0.1, i as f64 * 10.0);
        }
        let snap = buf.snapshot();
        assert_eq!(snap.len(), 3);
        assert!((snap[0].1 - 20.0).abs() < f64::EPSILON);
        buf.clear();
        assert!(buf.is_empty());
    }

    #[test]
    fn updated_flag_is_sticky_until_taken() {
        let bus = MetricsBus::new();
        assert!(!bus.take_updated());
        bus.set_fps(5_000.0);
        assert!(bus.take_updated());
        assert!(!bus.take_updated());
        assert!((bus.fps() - 5_000.0).abs() < f64::EPSILON);
    }
}
