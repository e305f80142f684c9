//! The processor worker: pops frame indices, runs segmentation and filtering,
//! and publishes qualifying frames.
//!
//! Failure semantics: an error while handling a frame aborts only that frame.
//! It is logged, the dropped-frame counter is bumped, and the loop continues.
//! The worker never unwinds past this entry function.

use crate::config::ProcessingConfig;
use crate::error::AppResult;
use crate::persist::{self, QualifiedResult};
use crate::processing::filter::{self, FilterResult};
use crate::processing::ops::{self, Scratch};
use crate::ring::FrameRing;
use crate::state::{lock_unpoisoned, SharedState, ValidFrame};
use chrono::Utc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct ProcessorContext {
    pub state: Arc<SharedState>,
    pub processing_ring: Arc<FrameRing>,
    pub buffer_threshold: usize,
}

/// Thread entry point for the processor.
pub fn run(ctx: ProcessorContext) {
    let state = &ctx.state;
    let mut scratch = Scratch::new(&state.params);
    tracing::debug!("processor started");

    loop {
        let popped = state
            .process_queue
            .wait_pop(|| state.is_done() || state.is_paused());
        let Some(seq) = popped else {
            if state.is_done() {
                break;
            }
            // Paused: idle briefly, background capture happens elsewhere.
            std::thread::sleep(Duration::from_millis(1));
            continue;
        };

        state
            .metrics
            .processing_queue_depth
            .store(state.process_queue.len(), Ordering::Relaxed);

        let start = Instant::now();
        if let Err(err) = process_one(state, &ctx.processing_ring, &mut scratch, seq, ctx.buffer_threshold) {
            state.metrics.dropped_frames.fetch_add(1, Ordering::Relaxed);
            tracing::error!(seq, error = %err, "frame dropped");
        }
        let elapsed_us = start.elapsed().as_secs_f64() * 1e6;
        state.metrics.processing_times.push(elapsed_us);
        state.metrics.mark_updated();
    }
    tracing::debug!("processor stopped");
}

fn process_one(
    state: &Arc<SharedState>,
    ring: &FrameRing,
    scratch: &mut Scratch,
    seq: u64,
    buffer_threshold: usize,
) -> AppResult<FilterResult> {
    // Copy once; all subsequent work is local to this thread.
    ring.read_seq(seq, &mut scratch.input)?;

    let roi = state.clipped_roi();
    if roi.is_empty() {
        // ROI collapsed to nothing after clipping: skip processing and count
        // the frame as invalid.
        return Ok(FilterResult::default());
    }

    let cfg: ProcessingConfig = *lock_unpoisoned(&state.processing);

    scratch.ensure_roi(roi);
    {
        // The stored background is already blurred and contrast-enhanced with
        // the same parameters; only its ROI crop is needed per frame.
        let background = lock_unpoisoned(&state.background);
        ops::copy_roi(
            background.prepared.as_raw(),
            state.params.width,
            roi,
            &mut scratch.bg_roi,
        );
    }

    ops::process_frame(roi, &cfg, scratch);
    let verdict = filter::evaluate(&scratch.mask, &scratch.input, roi, &cfg);

    if verdict.is_valid {
        qualify(state, scratch, verdict, buffer_threshold);
    }
    Ok(verdict)
}

/// Handle a qualifying frame: scatter point, batch append, trigger request and
/// observer publication.
fn qualify(state: &Arc<SharedState>, scratch: &Scratch, verdict: FilterResult, threshold: usize) {
    let timestamp_us = Utc::now().timestamp_micros();

    state
        .metrics
        .scatter
        .push(verdict.deformability, verdict.area);

    let result = QualifiedResult {
        timestamp_us,
        deformability: verdict.deformability,
        area: verdict.area,
        image: ops::gray_image_from(
            &scratch.input,
            state.params.width as u32,
            state.params.height as u32,
        ),
    };
    persist::append_qualified(state, threshold, result);
    state.metrics.qualified_results.fetch_add(1, Ordering::Relaxed);

    state.trigger_request.store(true, Ordering::Release);

    // Latest-wins publication; the fan-out thread composes and delivers at its
    // own cadence.
    {
        let mut slot = lock_unpoisoned(&state.valid_frame);
        *slot = Some(ValidFrame {
            original: scratch.input.clone(),
            mask: scratch.mask.as_raw().clone(),
            verdict,
            timestamp_ns: timestamp_us as u64 * 1_000,
        });
    }
    state.valid_frame_signal.notify_one();
}
