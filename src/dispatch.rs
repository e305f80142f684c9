//! Dispatcher: copies each new source frame into the display and processing
//! rings and enqueues its index for the consumers.
//!
//! The dispatcher converts the source's published pointer into *owned* bytes
//! in two independent rings before notifying anyone, so consumers always read
//! a slot whose content is not racing with the source. For every index it
//! reads, either both rings receive the frame and both queues its sequence
//! number, or the run is paused/stopping.

use crate::ring::FrameRing;
use crate::state::SharedState;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub struct DispatcherContext {
    pub state: Arc<SharedState>,
    pub camera_ring: Arc<FrameRing>,
    pub display_ring: Arc<FrameRing>,
    pub processing_ring: Arc<FrameRing>,
}

pub fn spawn(ctx: DispatcherContext) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("dispatcher".to_string())
        .spawn(move || run(ctx))
}

/// Thread entry point for the dispatcher.
pub fn run(ctx: DispatcherContext) {
    let state = &ctx.state;
    let mut last_seen = 0u64;
    tracing::debug!("dispatcher started");

    while !state.is_done() {
        if state.is_paused() {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }
        let latest = state.latest_frame_index.load(Ordering::Acquire);
        if latest == last_seen {
            std::thread::sleep(Duration::from_micros(200));
            continue;
        }
        let seq = latest - 1;
        match ctx.camera_ring.slot_for_seq(seq) {
            Ok(bytes) => {
                let display_seq = ctx.display_ring.push(bytes);
                let processing_seq = ctx.processing_ring.push(bytes);
                match (display_seq, processing_seq) {
                    (Ok(display_seq), Ok(processing_seq)) => {
                        state.display_queue.push(display_seq);
                        state.process_queue.push(processing_seq);
                        state
                            .metrics
                            .processing_queue_depth
                            .store(state.process_queue.len(), Ordering::Relaxed);
                        state
                            .metrics
                            .display_queue_depth
                            .store(state.display_queue.len(), Ordering::Relaxed);
                    }
                    (display_result, processing_result) => {
                        state.metrics.dropped_frames.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(seq, ?display_result, ?processing_result, "ring push failed");
                    }
                }
            }
            Err(err) => {
                // The source lapped us; the frame is gone.
                state.metrics.dropped_frames.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(seq, error = %err, "source frame no longer available");
            }
        }
        last_seen = latest;
    }
    tracing::debug!("dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessingConfig;
    use crate::frame::{ImageParams, Roi};
    use crate::state::Background;
    use image::GrayImage;
    use std::time::Instant;

    fn test_setup() -> (DispatcherContext, Arc<SharedState>, Arc<FrameRing>) {
        let params = ImageParams::mono8(4, 4, 32);
        let background = Background {
            clean: GrayImage::new(4, 4),
            prepared: GrayImage::new(4, 4),
        };
        let state = Arc::new(SharedState::new(
            params,
            ProcessingConfig::default(),
            background,
            Roi::full(4, 4),
        ));
        let camera_ring = Arc::new(FrameRing::new(32, params.frame_bytes));
        let ctx = DispatcherContext {
            state: Arc::clone(&state),
            camera_ring: Arc::clone(&camera_ring),
            display_ring: Arc::new(FrameRing::new(32, params.frame_bytes)),
            processing_ring: Arc::new(FrameRing::new(32, params.frame_bytes)),
        };
        (ctx, state, camera_ring)
    }

    #[test]
    fn forwards_each_published_frame_to_both_rings_and_queues() {
        let (ctx, state, camera_ring) = test_setup();
        let display_ring = Arc::clone(&ctx.display_ring);
        let processing_ring = Arc::clone(&ctx.processing_ring);
        let handle = spawn(ctx).unwrap();

        for value in 0..3u8 {
            let seq = camera_ring.push(&vec![value; 16]).unwrap();
            state.latest_frame_index.store(seq + 1, Ordering::Release);
            let start = Instant::now();
            while processing_ring.pushes() <= u64::from(value)
                && start.elapsed() < Duration::from_secs(1)
            {
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        state.request_stop();
        handle.join().unwrap();

        assert_eq!(display_ring.len(), 3);
        assert_eq!(processing_ring.len(), 3);
        assert_eq!(state.process_queue.len(), 3);
        assert_eq!(state.display_queue.len(), 3);
        // Frames arrive in publication order with matching bytes.
        assert_eq!(processing_ring.get(0).unwrap(), vec![2u8; 16]);
        assert_eq!(processing_ring.get(2).unwrap(), vec![0u8; 16]);
        assert_eq!(state.process_queue.wait_pop(|| false), Some(0));
    }

    #[test]
    fn ignores_stale_index_while_paused(){
        let (ctx, state, camera_ring) = test_setup();
        let processing_ring = Arc::clone(&ctx.processing_ring);
        state.paused.store(true, Ordering::Release);
        let handle = spawn(ctx).unwrap();

        let seq = camera_ring.push(&[1u8; 16]).unwrap();
        state.latest_frame_index.store(seq + 1, Ordering::Release);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(processing_ring.pushes(), 0);

        state.request_stop();
        handle.join().unwrap();
    }
}
