//! Observer fan-out: composed display frames and status/error events.
//!
//! Observers subscribe and unsubscribe at will. For every published valid
//! frame the publisher thread builds a BGR composite (grayscale original,
//! optional verdict-colored overlay, ROI rectangle) and delivers it as a
//! borrowed [`FrameView`]. The backing buffer remains valid only for the
//! synchronous duration of the callback; observers that retain must copy.
//! Observer callbacks must be non-blocking.

use crate::frame::{FrameView, PixelFormat, Roi};
use crate::processing::filter::FilterResult;
use crate::state::{lock_unpoisoned, SharedState};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Blend opacity for the processed-mask overlay.
pub const OVERLAY_OPACITY: f64 = 0.3;

/// Receiver of engine output. All callbacks have empty default bodies so an
/// observer implements only what it needs.
pub trait EngineObserver: Send + Sync {
    fn on_frame(&self, _frame: &FrameView<'_>) {}
    fn on_status(&self, _message: &str) {}
    fn on_error(&self, _code: i32, _message: &str) {}
}

/// Fan-out registry shared by the engine and the publisher thread.
#[derive(Default)]
pub struct ObserverHub {
    observers: Mutex<Vec<Arc<dyn EngineObserver>>>,
}

impl ObserverHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn EngineObserver>) {
        let mut observers = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        observers.push(observer);
    }

    pub fn unsubscribe(&self, observer: &Arc<dyn EngineObserver>) {
        let mut observers = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        observers.retain(|existing| !Arc::ptr_eq(existing, observer));
    }

    pub fn len(&self) -> usize {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn frame(&self, frame: &FrameView<'_>) {
        let observers = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for observer in observers.iter() {
            observer.on_frame(frame);
        }
    }

    pub fn status(&self, message: &str) {
        let observers = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for observer in observers.iter() {
            observer.on_status(message);
        }
    }

    pub fn error(&self, code: i32, message: &str) {
        let observers = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for observer in observers.iter() {
            observer.on_error(code, message);
        }
    }
}

/// Overlay color (BGR) for a verdict.
///
/// Red for border rejection, bright green for a valid single-inner-contour
/// frame, yellow for a valid frame without an inner contour, gray otherwise.
pub fn overlay_color(verdict: &FilterResult) -> [u8; 3] {
    if verdict.touches_border {
        [0, 0, 255]
    } else if verdict.has_single_inner_contour && verdict.is_valid {
        [0, 255, 0]
    } else if verdict.is_valid {
        [0, 255, 255]
    } else {
        [128, 128, 128]
    }
}

/// Compose the BGR display frame into `out`.
pub fn compose_bgr(
    original: &[u8],
    mask: &[u8],
    verdict: &FilterResult,
    roi: Roi,
    width: usize,
    height: usize,
    overlay: bool,
    out: &mut Vec<u8>,
) {
    out.resize(width * height * 3, 0);
    let color = overlay_color(verdict);
    for (i, &gray) in original.iter().enumerate() {
        let mut bgr = [gray, gray, gray];
        if overlay && mask[i] > 0 {
            for (channel, &c) in bgr.iter_mut().zip(&color) {
                let blended = f64::from(*channel) + OVERLAY_OPACITY * f64::from(c);
                *channel = blended.min(255.0) as u8;
            }
        }
        out[i * 3..i * 3 + 3].copy_from_slice(&bgr);
    }
    draw_roi_rect(out, width, height, roi);
}

/// 1-pixel green rectangle along the ROI border.
fn draw_roi_rect(out: &mut [u8], width: usize, height: usize, roi: Roi) {
    let clipped = roi.clip(width, height);
    if clipped.is_empty() {
        return;
    }
    let (x0, y0) = (clipped.x as usize, clipped.y as usize);
    let x1 = x0 + clipped.width as usize - 1;
    let y1 = y0 + clipped.height as usize - 1;
    let mut put = |x: usize, y: usize| {
        let i = (y * width + x) * 3;
        out[i..i + 3].copy_from_slice(&[0, 255, 0]);
    };
    for x in x0..=x1 {
        put(x, y0);
        put(x, y1);
    }
    for y in y0..=y1 {
        put(x0, y);
        put(x1, y);
    }
}

/// Thread entry point for the observer publisher.
///
/// Waits up to 50 ms for a new valid frame, composes the BGR view and fans it
/// out. Also drains the display queue so its depth gauge stays meaningful
/// when no interactive display is attached.
pub fn run_publisher(state: Arc<SharedState>, hub: Arc<ObserverHub>) {
    let mut buffer: Vec<u8> = Vec::new();
    tracing::debug!("publisher started");
    while !state.is_done() {
        let frame = {
            let guard = lock_unpoisoned(&state.valid_frame);
            let (mut guard, _timeout) = state
                .valid_frame_signal
                .wait_timeout_while(guard, Duration::from_millis(50), |slot| {
                    slot.is_none() && !state.is_done()
                })
                .unwrap_or_else(PoisonError::into_inner);
            guard.take()
        };

        state
            .metrics
            .display_queue_depth
            .store(state.display_queue.len(), Ordering::Relaxed);
        state.display_queue.drain_latest();

        let Some(frame) = frame else {
            continue;
        };
        let roi = *lock_unpoisoned(&state.roi);
        compose_bgr(
            &frame.original,
            &frame.mask,
            &frame.verdict,
            roi,
            state.params.width,
            state.params.height,
            state.overlay_mode.load(Ordering::Relaxed),
            &mut buffer,
        );
        let view = FrameView {
            data: &buffer,
            width: state.params.width as i32,
            height: state.params.height as i32,
            format: PixelFormat::Bgr8,
            timestamp_ns: frame.timestamp_ns,
        };
        hub.frame(&view);
    }
    tracing::debug!("publisher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingObserver {
        frames: AtomicUsize,
        errors: AtomicUsize,
    }

    impl EngineObserver for CountingObserver {
        fn on_frame(&self, _frame: &FrameView<'_>) {
            self.frames.fetch_add(1, Ordering::Relaxed);
        }
        fn on_error(&self, _code: i32, _message: &str) {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn subscribe_and_unsubscribe() {
        let hub = ObserverHub::new();
        let observer: Arc<CountingObserver> = Arc::new(CountingObserver::default());
        let as_dyn: Arc<dyn EngineObserver> = observer.clone();
        hub.subscribe(as_dyn.clone());
        assert_eq!(hub.len(), 1);

        hub.error(4, "disk full");
        assert_eq!(observer.errors.load(Ordering::Relaxed), 1);

        hub.unsubscribe(&as_dyn);
        assert!(hub.is_empty());
        hub.error(4, "unheard");
        assert_eq!(observer.errors.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn overlay_color_priorities() {
        let mut verdict = FilterResult {
            touches_border: true,
            is_valid: false,
            ..FilterResult::default()
        };
        assert_eq!(overlay_color(&verdict), [0, 0, 255]);

        verdict.touches_border = false;
        verdict.is_valid = true;
        verdict.has_single_inner_contour = true;
        assert_eq!(overlay_color(&verdict), [0, 255, 0]);

        verdict.has_single_inner_contour = false;
        assert_eq!(overlay_color(&verdict), [0, 255, 255]);

        verdict.is_valid = false;
        assert_eq!(overlay_color(&verdict), [128, 128, 128]);
    }

    #[test]
    fn compose_converts_gray_and_blends_overlay() {
        let original = vec![100u8; 16];
        let mut mask = vec![0u8; 16];
        mask[5] = 255;
        let verdict = FilterResult {
            is_valid: true,
            ..FilterResult::default()
        };
        let mut out = Vec::new();
        compose_bgr(
            &original,
            &mask,
            &verdict,
            Roi::new(0, 0, 4, 4),
            4,
            4,
            true,
            &mut out,
        );
        assert_eq!(out.len(), 16 * 3);
        // Pixel 5 is inside the mask: yellow blend raises G and R channels.
        assert_eq!(out[5 * 3], 100); // B untouched
        assert_eq!(out[5 * 3 + 1], 100 + 76); // G + 0.3*255
        assert_eq!(out[5 * 3 + 2], 100 + 76); // R + 0.3*255
        // Pixel 10 is interior and unmasked: pure gray.
        assert_eq!(&out[10 * 3..10 * 3 + 3], &[100, 100, 100]);
        // Corner pixel carries the green ROI rectangle.
        assert_eq!(&out[0..3], &[0, 255, 0]);
    }
}
