//! Mock frame source: replays a directory of grayscale images at a target
//! rate.
//!
//! Images are loaded once, in lexicographic order (optionally reversed), into
//! memory; the replay thread then pushes them cyclically into the camera ring
//! at the configured frame rate and publishes the ring sequence number. The
//! replay honors `paused` and reports a frames-per-second gauge every five
//! seconds.

use crate::error::{AppResult, EngineError};
use crate::frame::ImageParams;
use crate::ring::FrameRing;
use crate::state::SharedState;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Default ring capacity, in frames.
pub const RING_CAPACITY: usize = 5_000;

const EXTENSIONS: [&str; 5] = ["tif", "tiff", "png", "jpg", "jpeg"];

/// Loaded image sequence plus its geometry.
#[derive(Debug)]
pub struct MockSource {
    frames: Vec<Vec<u8>>,
    params: ImageParams,
}

impl MockSource {
    /// Load every supported image in `dir` as 8-bit grayscale.
    ///
    /// All images must share the dimensions of the first one. Fails when the
    /// directory holds no loadable image.
    pub fn load(dir: &Path, reverse: bool) -> AppResult<Self> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();
        if reverse {
            paths.reverse();
        }

        let mut frames = Vec::with_capacity(paths.len());
        let mut dims: Option<(u32, u32)> = None;
        for path in &paths {
            let image = match image::open(path) {
                Ok(image) => image.into_luma8(),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping unreadable image");
                    continue;
                }
            };
            match dims {
                None => dims = Some(image.dimensions()),
                Some(expected) if expected != image.dimensions() => {
                    return Err(EngineError::Source(format!(
                        "image {} is {:?}, expected {:?}",
                        path.display(),
                        image.dimensions(),
                        expected
                    )));
                }
                Some(_) => {}
            }
            frames.push(image.into_raw());
        }

        let Some((width, height)) = dims else {
            return Err(EngineError::NoImages(dir.to_path_buf()));
        };
        tracing::info!(
            count = frames.len(),
            width,
            height,
            "loaded images into camera buffer"
        );
        Ok(Self {
            frames,
            params: ImageParams::mono8(width as usize, height as usize, RING_CAPACITY),
        })
    }

    pub fn params(&self) -> ImageParams {
        self.params
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// The middle-index frame, used as the initial background.
    pub fn middle_frame(&self) -> &[u8] {
        &self.frames[self.frames.len() / 2]
    }

    /// Start the replay thread.
    pub fn spawn(
        self,
        state: Arc<SharedState>,
        camera_ring: Arc<FrameRing>,
        target_fps: u32,
    ) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("source".to_string())
            .spawn(move || self.run(state, camera_ring, target_fps))
    }

    fn run(self, state: Arc<SharedState>, camera_ring: Arc<FrameRing>, target_fps: u32) {
        let interval = Duration::from_nanos(1_000_000_000 / u64::from(target_fps.max(1)));
        let mut index = 0usize;
        let mut next_frame_time = Instant::now();
        let mut frame_count = 0u64;
        let mut fps_window = Instant::now();
        tracing::debug!(target_fps, "mock source started");

        while !state.is_done() {
            if state.is_paused() {
                std::thread::sleep(Duration::from_millis(1));
                next_frame_time = Instant::now();
                continue;
            }
            let now = Instant::now();
            if now >= next_frame_time {
                match camera_ring.push(&self.frames[index]) {
                    Ok(seq) => {
                        state
                            .latest_frame_index
                            .store(seq + 1, Ordering::Release);
                        index = (index + 1) % self.frames.len();
                        frame_count += 1;
                    }
                    Err(err) => tracing::error!(error = %err, "camera ring push failed"),
                }
                next_frame_time += interval;
                if next_frame_time < now {
                    // Fell behind; do not try to catch up with a burst.
                    next_frame_time = now + interval;
                }
            } else {
                std::hint::spin_loop();
            }

            if fps_window.elapsed() >= Duration::from_secs(5) {
                let fps = frame_count as f64 / fps_window.elapsed().as_secs_f64();
                state.metrics.set_fps(fps);
                frame_count = 0;
                fps_window = Instant::now();
            }
        }
        tracing::debug!("mock source stopped");
    }
}
