//! Hardware trigger emission on a digital output line.
//!
//! A dedicated thread owns the output line. It busy-waits on the trigger
//! request flag (no sleeping: wake latency dominates the 200 µs frame budget)
//! and emits one short logic-high pulse per request. Requests that arrive
//! while a pulse is in flight coalesce into it.

use crate::error::AppResult;
use crate::state::SharedState;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Minimum high time of the pulse.
pub const PULSE_WIDTH: Duration = Duration::from_micros(1);

/// A digital output line the emitter can drive.
///
/// Implementations wrap whatever I/O the frame grabber or DAQ card exposes.
/// `configure_output` selects the line, sets its mode to output and parks it
/// low; it is called once before the first pulse.
pub trait TriggerLine: Send {
    fn configure_output(&mut self) -> AppResult<()>;
    fn set_high(&mut self) -> AppResult<()>;
    fn set_low(&mut self) -> AppResult<()>;
}

/// Thread entry point for the trigger emitter.
pub fn run(mut line: Box<dyn TriggerLine>, state: Arc<SharedState>) {
    if let Err(err) = line.configure_output() {
        // The output line is this worker's resource; losing it is fatal to
        // the run.
        tracing::error!(error = %err, "trigger line configuration failed");
        state.request_stop();
        return;
    }
    tracing::debug!("trigger emitter started");

    while !state.is_done() {
        if !state.trigger_request.load(Ordering::Acquire) {
            std::hint::spin_loop();
            continue;
        }

        let onset_started = Instant::now();
        if let Err(err) = line.set_high() {
            tracing::error!(error = %err, "trigger set high failed");
            state.trigger_request.store(false, Ordering::Release);
            continue;
        }
        let onset_us = onset_started.elapsed().as_micros() as i64;
        state
            .metrics
            .trigger_onset_us
            .store(onset_us, Ordering::Relaxed);

        let high_since = Instant::now();
        while high_since.elapsed() < PULSE_WIDTH {
            std::hint::spin_loop();
        }

        if let Err(err) = line.set_low() {
            tracing::error!(error = %err, "trigger set low failed");
        }
        // Clearing after the pulse coalesces any request raised meanwhile.
        state.trigger_request.store(false, Ordering::Release);
        state.metrics.mark_updated();
    }

    // Leave the line parked low.
    if let Err(err) = line.set_low() {
        tracing::warn!(error = %err, "could not park trigger line low");
    }
    tracing::debug!("trigger emitter stopped");
}

/// Shared counters recorded by [`MockTriggerLine`].
#[derive(Default)]
pub struct TriggerLineStats {
    pub configured: AtomicBool,
    pub pulses: AtomicUsize,
    pub level_high: AtomicBool,
    pub last_pulse_at_us: AtomicI64,
}

/// In-memory trigger line for tests and hardware-less runs.
#[derive(Default)]
pub struct MockTriggerLine {
    stats: Arc<TriggerLineStats>,
}

impl MockTriggerLine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for asserting on pulses after the line has been moved into the
    /// emitter thread.
    pub fn stats(&self) -> Arc<TriggerLineStats> {
        Arc::clone(&self.stats)
    }
}

impl TriggerLine for MockTriggerLine {
    fn configure_output(&mut self) -> AppResult<()> {
        self.stats.configured.store(true, Ordering::Release);
        self.stats.level_high.store(false, Ordering::Release);
        Ok(())
    }

    fn set_high(&mut self) -> AppResult<()> {
        self.stats.level_high.store(true, Ordering::Release);
        Ok(())
    }

    fn set_low(&mut self) -> AppResult<()> {
        // A falling edge completes one pulse.
        if self.stats.level_high.swap(false, Ordering::AcqRel) {
            self.stats.pulses.fetch_add(1, Ordering::Release);
            self.stats
                .last_pulse_at_us
                .store(chrono::Utc::now().timestamp_micros(), Ordering::Relaxed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessingConfig;
    use crate::frame::{ImageParams, Roi};
    use crate::state::Background;
    use image::GrayImage;

    fn test_state() -> Arc<SharedState> {
        let params = ImageParams::mono8(8, 8, 8);
        let background = Background {
            clean: GrayImage::new(8, 8),
            prepared: GrayImage::new(8, 8),
        };
        Arc::new(SharedState::new(
            params,
            ProcessingConfig::default(),
            background,
            Roi::full(8, 8),
        ))
    }

    fn wait_for<F: Fn() -> bool>(predicate: F, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if predicate() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        predicate()
    }

    #[test]
    fn one_pulse_per_request() {
        let state = test_state();
        let line = MockTriggerLine::new();
        let stats = line.stats();
        let emitter_state = Arc::clone(&state);
        let handle = std::thread::spawn(move || run(Box::new(line), emitter_state));

        assert!(wait_for(
            || stats.configured.load(Ordering::Acquire),
            Duration::from_secs(1)
        ));

        for expected in 1..=3usize {
            state.trigger_request.store(true, Ordering::Release);
            assert!(
                wait_for(
                    || stats.pulses.load(Ordering::Acquire) == expected
                        && !state.trigger_request.load(Ordering::Acquire),
                    Duration::from_secs(1)
                ),
                "pulse {expected} not observed"
            );
        }

        state.request_stop();
        handle.join().unwrap();
        assert_eq!(stats.pulses.load(Ordering::Acquire), 3);
        assert!(!stats.level_high.load(Ordering::Acquire));
    }

    #[test]
    fn emitter_exits_on_done_without_requests() {
        let state = test_state();
        let line = MockTriggerLine::new();
        let emitter_state = Arc::clone(&state);
        let handle = std::thread::spawn(move || run(Box::new(line), emitter_state));
        std::thread::sleep(Duration::from_millis(10));
        state.request_stop();
        handle.join().unwrap();
    }
}
