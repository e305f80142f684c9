//! Shared run state owned by the engine for one start→stop cycle.
//!
//! A single [`SharedState`] is created per run. The engine owns it and hands
//! reference-counted read handles to the workers; no worker owns another. All
//! mutation goes through explicit locks or atomics.

use crate::config::ProcessingConfig;
use crate::frame::{ImageParams, Roi};
use crate::metrics::MetricsBus;
use crate::persist::BatchBuffers;
use crate::processing::filter::FilterResult;
use image::GrayImage;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a worker panicked while holding it.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A mutex-guarded index queue with its own condition variable.
///
/// The dispatcher pushes ring sequence numbers; one consumer pops them.
pub struct FrameQueue {
    inner: Mutex<VecDeque<u64>>,
    cond: Condvar,
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        }
    }

    pub fn push(&self, seq: u64) {
        lock_unpoisoned(&self.inner).push_back(seq);
        self.cond.notify_one();
    }

    /// Block until an index is available or `interrupt()` is true.
    ///
    /// The interrupt predicate is checked before every pop, so a paused or
    /// cancelled consumer returns `None` even when indices are queued.
    pub fn wait_pop<F: Fn() -> bool>(&self, interrupt: F) -> Option<u64> {
        let mut queue = lock_unpoisoned(&self.inner);
        loop {
            if interrupt() {
                return None;
            }
            if let Some(seq) = queue.pop_front() {
                return Some(seq);
            }
            queue = self
                .cond
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Drain everything currently queued, returning the newest index.
    pub fn drain_latest(&self) -> Option<u64> {
        let mut queue = lock_unpoisoned(&self.inner);
        let last = queue.back().copied();
        queue.clear();
        last
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake every waiter (used for pause transitions and cancellation).
    pub fn wake_all(&self) {
        self.cond.notify_all();
    }
}

/// Background frame and its precomputed processed form.
///
/// Both images are rebuilt together under the one mutex, so the processor can
/// never observe a clean background paired with a stale prepared one.
pub struct Background {
    /// Un-blurred capture, persisted as `background_clean.tiff`.
    pub clean: GrayImage,
    /// Blurred and (when enabled) contrast-enhanced with the same parameters
    /// the processor applies to every target frame.
    pub prepared: GrayImage,
}

/// A qualifying frame handed from the processor to the observer publisher.
pub struct ValidFrame {
    /// Original grayscale payload, full resolution.
    pub original: Vec<u8>,
    /// Processed binary mask, full resolution.
    pub mask: Vec<u8>,
    pub verdict: FilterResult,
    pub timestamp_ns: u64,
}

/// State shared by every worker of one run.
pub struct SharedState {
    pub params: ImageParams,

    pub done: AtomicBool,
    pub paused: AtomicBool,
    pub overlay_mode: AtomicBool,
    pub display_needs_update: AtomicBool,
    /// Frame index for navigation while paused (offset from newest).
    pub current_frame_index: AtomicI64,

    /// Count of frames published by the source (the newest sequence number
    /// plus one; 0 = nothing published). Monotone non-decreasing, stored with
    /// Release ordering by the source and read with Acquire by the
    /// dispatcher.
    pub latest_frame_index: AtomicU64,

    pub process_queue: FrameQueue,
    pub display_queue: FrameQueue,

    pub roi: Mutex<Roi>,
    pub background: Mutex<Background>,
    pub processing: Mutex<ProcessingConfig>,

    /// Double-buffered qualified results (see the batcher).
    pub batches: Mutex<BatchBuffers>,
    /// Paired with `batches`; signalled when a flush is requested.
    pub save_signal: Condvar,
    pub saving_in_progress: AtomicBool,
    /// Next batch number; monotone across a run.
    pub batch_number: AtomicU64,

    /// One-shot trigger request raised by the processor, cleared by the
    /// emitter after the pulse.
    pub trigger_request: AtomicBool,

    /// Latest qualifying frame awaiting publication to observers.
    pub valid_frame: Mutex<Option<ValidFrame>>,
    /// Paired with `valid_frame`.
    pub valid_frame_signal: Condvar,

    pub metrics: MetricsBus,
}

impl SharedState {
    pub fn new(
        params: ImageParams,
        processing: ProcessingConfig,
        background: Background,
        roi: Roi,
    ) -> Self {
        Self {
            params,
            done: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            overlay_mode: AtomicBool::new(false),
            display_needs_update: AtomicBool::new(false),
            current_frame_index: AtomicI64::new(-1),
            latest_frame_index: AtomicU64::new(0),
            process_queue: FrameQueue::new(),
            display_queue: FrameQueue::new(),
            roi: Mutex::new(roi),
            background: Mutex::new(background),
            processing: Mutex::new(processing),
            batches: Mutex::new(BatchBuffers::default()),
            save_signal: Condvar::new(),
            saving_in_progress: AtomicBool::new(false),
            batch_number: AtomicU64::new(0),
            trigger_request: AtomicBool::new(false),
            valid_frame: Mutex::new(None),
            valid_frame_signal: Condvar::new(),
            metrics: MetricsBus::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Begin cancellation: set `done` and wake every suspended worker.
    pub fn request_stop(&self) {
        self.done.store(true, Ordering::Release);
        self.process_queue.wake_all();
        self.display_queue.wake_all();
        // Touch the paired mutexes so waiters re-check their predicates.
        drop(lock_unpoisoned(&self.batches));
        self.save_signal.notify_all();
        drop(lock_unpoisoned(&self.valid_frame));
        self.valid_frame_signal.notify_all();
    }

    /// Current ROI clipped to the frame bounds.
    pub fn clipped_roi(&self) -> Roi {
        lock_unpoisoned(&self.roi).clip(self.params.width, self.params.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_state() -> SharedState {
        let params = ImageParams::mono8(8, 8, 16);
        let background = Background {
            clean: GrayImage::new(8, 8),
            prepared: GrayImage::new(8, 8),
        };
        SharedState::new(
            params,
            ProcessingConfig::default(),
            background,
            Roi::full(8, 8),
        )
    }

    #[test]
    fn queue_pops_in_fifo_order() {
        let queue = FrameQueue::new();
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.wait_pop(|| false), Some(1));
        assert_eq!(queue.wait_pop(|| false), Some(2));
        assert!(queue.is_empty());
    }

    #[test]
    fn interrupt_preempts_queued_indices() {
        let queue = FrameQueue::new();
        queue.push(7);
        assert_eq!(queue.wait_pop(|| true), None);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn wait_pop_wakes_on_push_from_other_thread() {
        let queue = Arc::new(FrameQueue::new());
        let producer = Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.push(42);
        });
        assert_eq!(queue.wait_pop(|| false), Some(42));
        handle.join().unwrap();
    }

    #[test]
    fn request_stop_wakes_queue_waiters() {
        let state = Arc::new(test_state());
        let waiter_state = Arc::clone(&state);
        let waiter = std::thread::spawn(move || {
            waiter_state
                .process_queue
                .wait_pop(|| waiter_state.is_done())
        });
        std::thread::sleep(Duration::from_millis(20));
        state.request_stop();
        assert_eq!(waiter.join().unwrap(), None);
    }

    #[test]
    fn clipped_roi_tracks_live_edits() {
        let state = test_state();
        *lock_unpoisoned(&state.roi) = Roi::new(4, 4, 100, 100);
        assert_eq!(state.clipped_roi(), Roi::new(4, 4, 4, 4));
    }
}
