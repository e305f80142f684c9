//! Live frame source: drives a camera SDK through the [`FrameGrabber`] seam.
//!
//! The acquisition loop drops incomplete frames, suppresses duplicate frame
//! ids (both counted on the metrics bus), pushes accepted payloads into the
//! camera ring and publishes the ring sequence number. Camera telemetry is
//! refreshed every 100 accepted frames.

use crate::error::AppResult;
use crate::frame::ImageParams;
use crate::ring::FrameRing;
use crate::state::SharedState;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Periodic camera statistics surfaced on the metrics bus.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraTelemetry {
    pub frame_rate: f64,
    /// MB/s as reported by the grabber.
    pub data_rate: f64,
    pub exposure_time_us: u64,
}

/// One delivered camera buffer.
pub struct GrabbedFrame<'a> {
    pub data: &'a [u8],
    pub frame_id: u64,
    pub timestamp_ns: u64,
    pub is_incomplete: bool,
    pub size_filled: usize,
}

/// The camera SDK surface the live source consumes.
///
/// `next_frame` blocks until the SDK hands over the next buffer; the returned
/// borrow is valid until the following call.
pub trait FrameGrabber: Send {
    fn image_params(&self) -> ImageParams;
    fn start(&mut self) -> AppResult<()>;
    fn stop(&mut self) -> AppResult<()>;
    fn next_frame(&mut self) -> AppResult<GrabbedFrame<'_>>;
    fn telemetry(&mut self) -> AppResult<CameraTelemetry>;
}

/// Start the live acquisition thread.
pub fn spawn(
    grabber: Box<dyn FrameGrabber>,
    state: Arc<SharedState>,
    camera_ring: Arc<FrameRing>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("source".to_string())
        .spawn(move || run(grabber, state, camera_ring))
}

fn refresh_telemetry(grabber: &mut dyn FrameGrabber, state: &SharedState) {
    match grabber.telemetry() {
        Ok(telemetry) => {
            state.metrics.set_fps(telemetry.frame_rate);
            state.metrics.set_data_rate(telemetry.data_rate);
            state
                .metrics
                .exposure_time_us
                .store(telemetry.exposure_time_us, Ordering::Relaxed);
        }
        Err(err) => tracing::warn!(error = %err, "camera telemetry unavailable"),
    }
}

/// Thread entry point for the live source.
pub fn run(mut grabber: Box<dyn FrameGrabber>, state: Arc<SharedState>, camera_ring: Arc<FrameRing>) {
    if let Err(err) = grabber.start() {
        tracing::error!(error = %err, "camera start failed");
        state.request_stop();
        return;
    }
    refresh_telemetry(grabber.as_mut(), &state);
    tracing::debug!("live source started");

    let mut last_frame_id = 0u64;
    let mut accepted = 0u64;
    while !state.is_done() {
        if state.is_paused() {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }
        if accepted > 0 && accepted % 100 == 0 {
            refresh_telemetry(grabber.as_mut(), &state);
        }

        let pushed = match grabber.next_frame() {
            Err(err) => {
                state.metrics.dropped_frames.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %err, "frame fetch failed");
                continue;
            }
            Ok(frame) => {
                if frame.is_incomplete {
                    state.metrics.dropped_frames.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(
                        frame_id = frame.frame_id,
                        size_filled = frame.size_filled,
                        "incomplete frame dropped"
                    );
                    None
                } else if frame.frame_id <= last_frame_id {
                    state
                        .metrics
                        .duplicate_frames
                        .fetch_add(1, Ordering::Relaxed);
                    last_frame_id = frame.frame_id;
                    None
                } else {
                    last_frame_id = frame.frame_id;
                    Some(camera_ring.push(frame.data))
                }
            }
        };

        match pushed {
            Some(Ok(seq)) => {
                state.latest_frame_index.store(seq + 1, Ordering::Release);
                accepted += 1;
            }
            Some(Err(err)) => {
                state.metrics.dropped_frames.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %err, "camera ring push failed");
            }
            None => {}
        }
    }

    if let Err(err) = grabber.stop() {
        tracing::warn!(error = %err, "camera stop failed");
    }
    tracing::debug!("live source stopped");
}
