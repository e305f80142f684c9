//! Double-buffered collection of qualified results and batch persistence.
//!
//! The processor appends to whichever of two vectors is active, under the
//! batcher mutex. When the active vector reaches the flush threshold and no
//! save is in flight, the buffers flip and the persister thread is signalled.
//! The persister swaps the inactive vector out under the mutex and releases
//! it before touching the disk, so the processor never blocks on I/O.
//!
//! Each flush produces a self-contained `batch_<N>/` directory:
//! `batch_data.csv`, `images.bin`, `background_clean.tiff`, `roi.csv` and
//! `processing_config.json`. Batch numbers increase monotonically within a
//! run; result order within a batch equals qualification order. On shutdown,
//! anything left in both vectors is flushed as a final batch.

use crate::config::AppConfig;
use crate::error::AppResult;
use crate::observer::ObserverHub;
use crate::state::{lock_unpoisoned, SharedState};
use image::GrayImage;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// Type code written per `images.bin` record for single-channel 8-bit gray.
pub const IMAGE_TYPE_GRAY8: i32 = 0;

/// A frame that passed the filter, owned by the active buffer until its batch
/// flushes.
pub struct QualifiedResult {
    pub timestamp_us: i64,
    pub deformability: f64,
    pub area: f64,
    /// Clone of the original (unprocessed) frame.
    pub image: GrayImage,
}

/// The two qualified-result vectors and the active-buffer flag.
pub struct BatchBuffers {
    a: Vec<QualifiedResult>,
    b: Vec<QualifiedResult>,
    using_a: bool,
}

impl Default for BatchBuffers {
    fn default() -> Self {
        Self {
            a: Vec::new(),
            b: Vec::new(),
            using_a: true,
        }
    }
}

impl BatchBuffers {
    pub fn active(&self) -> &Vec<QualifiedResult> {
        if self.using_a {
            &self.a
        } else {
            &self.b
        }
    }

    pub fn active_mut(&mut self) -> &mut Vec<QualifiedResult> {
        if self.using_a {
            &mut self.a
        } else {
            &mut self.b
        }
    }

    pub fn flip(&mut self) {
        self.using_a = !self.using_a;
    }

    /// Swap the inactive vector out for flushing.
    pub fn take_inactive(&mut self) -> Vec<QualifiedResult> {
        if self.using_a {
            std::mem::take(&mut self.b)
        } else {
            std::mem::take(&mut self.a)
        }
    }

    /// Drain both vectors for the final flush, inactive (older) first.
    pub fn take_all(&mut self) -> Vec<QualifiedResult> {
        let mut all = self.take_inactive();
        all.append(self.active_mut());
        all
    }
}

/// Append a result to the active buffer, flipping and signalling the
/// persister when the threshold is reached and no save is in flight.
pub fn append_qualified(state: &SharedState, threshold: usize, result: QualifiedResult) {
    let mut buffers = lock_unpoisoned(&state.batches);
    buffers.active_mut().push(result);
    if buffers.active().len() >= threshold && !state.saving_in_progress.load(Ordering::Acquire) {
        buffers.flip();
        state.saving_in_progress.store(true, Ordering::Release);
        state.save_signal.notify_one();
    }
}

/// Everything the persister thread needs for one run.
pub struct PersisterContext {
    pub state: Arc<SharedState>,
    pub observers: Arc<ObserverHub>,
    pub save_dir: PathBuf,
    pub condition: String,
    /// Live configuration, shared with the engine so per-batch snapshots see
    /// `processing.*` edits.
    pub config: Arc<Mutex<AppConfig>>,
}

/// Thread entry point for the persister.
pub fn run(ctx: PersisterContext) {
    let state = Arc::clone(&ctx.state);
    tracing::debug!(dir = %ctx.save_dir.display(), "persister started");
    loop {
        let (batch, finishing) = {
            let mut buffers = lock_unpoisoned(&state.batches);
            loop {
                if state.saving_in_progress.load(Ordering::Acquire) {
                    break (buffers.take_inactive(), false);
                }
                if state.is_done() {
                    break (buffers.take_all(), true);
                }
                buffers = state
                    .save_signal
                    .wait(buffers)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            // Mutex released here; disk I/O happens without it.
        };

        if !batch.is_empty() {
            let number = state.batch_number.fetch_add(1, Ordering::Relaxed);
            let started = Instant::now();
            match write_batch(&ctx, number, &batch) {
                Ok(()) => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    state.metrics.disk_save_ms.store(elapsed_ms, Ordering::Relaxed);
                    state
                        .metrics
                        .total_saved
                        .fetch_add(batch.len(), Ordering::Relaxed);
                    tracing::info!(batch = number, results = batch.len(), elapsed_ms, "batch saved");
                }
                Err(err) => {
                    tracing::error!(batch = number, error = %err, "batch save failed; batch abandoned");
                    ctx.observers.error(err.code(), &err.to_string());
                }
            }
            state.metrics.mark_updated();
        }

        state.saving_in_progress.store(false, Ordering::Release);
        if finishing {
            break;
        }
    }
    tracing::debug!("persister stopped");
}

/// Write one self-contained batch directory.
pub fn write_batch(ctx: &PersisterContext, number: u64, batch: &[QualifiedResult]) -> AppResult<()> {
    let dir = ctx.save_dir.join(format!("batch_{number}"));
    fs::create_dir_all(&dir)?;

    let mut csv_writer = csv::Writer::from_path(dir.join("batch_data.csv"))?;
    csv_writer.write_record(["Condition", " Timestamp_us", "Deformability", "Area"])?;
    for result in batch {
        csv_writer.write_record([
            ctx.condition.clone(),
            result.timestamp_us.to_string(),
            result.deformability.to_string(),
            result.area.to_string(),
        ])?;
    }
    csv_writer.flush()?;

    let mut bin = BufWriter::new(File::create(dir.join("images.bin"))?);
    for result in batch {
        write_image_record(&mut bin, &result.image)?;
    }
    bin.flush()?;

    {
        let background = lock_unpoisoned(&ctx.state.background);
        write_tiff(&dir.join("background_clean.tiff"), &background.clean)?;
    }

    let roi = *lock_unpoisoned(&ctx.state.roi);
    let mut roi_writer = csv::Writer::from_path(dir.join("roi.csv"))?;
    roi_writer.write_record(["x", "y", "width", "height"])?;
    roi_writer.write_record([
        roi.x.to_string(),
        roi.y.to_string(),
        roi.width.to_string(),
        roi.height.to_string(),
    ])?;
    roi_writer.flush()?;

    let image_processing = lock_unpoisoned(&ctx.config).image_processing.clone();
    let config_file = File::create(dir.join("processing_config.json"))?;
    serde_json::to_writer_pretty(config_file, &image_processing)?;

    Ok(())
}

/// One `images.bin` record: three little-endian `i32` (rows, cols, type)
/// followed by the row-major payload.
fn write_image_record<W: Write>(writer: &mut W, image: &GrayImage) -> AppResult<()> {
    let rows = image.height() as i32;
    let cols = image.width() as i32;
    writer.write_all(&rows.to_le_bytes())?;
    writer.write_all(&cols.to_le_bytes())?;
    writer.write_all(&IMAGE_TYPE_GRAY8.to_le_bytes())?;
    writer.write_all(image.as_raw())?;
    Ok(())
}

/// 8-bit grayscale TIFF, encoded explicitly so the extension never decides
/// the format.
fn write_tiff(path: &Path, image: &GrayImage) -> AppResult<()> {
    let file = File::create(path)?;
    let writer = BufWriter::new(file);
    let encoder = image::codecs::tiff::TiffEncoder::new(writer);
    encoder.encode(
        image.as_raw(),
        image.width(),
        image.height(),
        image::ExtendedColorType::L8,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessingConfig;
    use crate::frame::{ImageParams, Roi};
    use crate::state::Background;
    use std::time::Duration;

    fn result_with_timestamp(timestamp_us: i64) -> QualifiedResult {
        QualifiedResult {
            timestamp_us,
            deformability: 0.05,
            area: 300.0,
            image: GrayImage::from_pixel(8, 4, image::Luma([42u8])),
        }
    }

    fn test_state() -> Arc<SharedState> {
        let params = ImageParams::mono8(8, 4, 8);
        let background = Background {
            clean: GrayImage::new(8, 4),
            prepared: GrayImage::new(8, 4),
        };
        Arc::new(SharedState::new(
            params,
            ProcessingConfig::default(),
            background,
            Roi::full(8, 4),
        ))
    }

    #[test]
    fn append_flips_at_threshold() {
        let state = test_state();
        append_qualified(&state, 2, result_with_timestamp(1));
        assert!(!state.saving_in_progress.load(Ordering::Acquire));
        append_qualified(&state, 2, result_with_timestamp(2));
        assert!(state.saving_in_progress.load(Ordering::Acquire));

        // The flipped-away buffer holds the two results; new appends go to
        // the other one.
        append_qualified(&state, 2, result_with_timestamp(3));
        let mut buffers = lock_unpoisoned(&state.batches);
        assert_eq!(buffers.active().len(), 1);
        assert_eq!(buffers.take_inactive().len(), 2);
    }

    #[test]
    fn no_second_flip_while_save_in_flight() {
        let state = test_state();
        for i in 0..2 {
            append_qualified(&state, 2, result_with_timestamp(i));
        }
        assert!(state.saving_in_progress.load(Ordering::Acquire));
        // Threshold reached again, but the save flag blocks the flip.
        for i in 2..6 {
            append_qualified(&state, 2, result_with_timestamp(i));
        }
        let buffers = lock_unpoisoned(&state.batches);
        assert_eq!(buffers.active().len(), 4);
    }

    #[test]
    fn take_all_returns_older_results_first() {
        let mut buffers = BatchBuffers::default();
        buffers.active_mut().push(result_with_timestamp(1));
        buffers.flip();
        buffers.active_mut().push(result_with_timestamp(2));
        let all = buffers.take_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].timestamp_us, 1);
        assert_eq!(all[1].timestamp_us, 2);
    }

    fn persister_ctx(state: &Arc<SharedState>, dir: &Path) -> PersisterContext {
        PersisterContext {
            state: Arc::clone(state),
            observers: Arc::new(ObserverHub::new()),
            save_dir: dir.to_path_buf(),
            condition: "test_condition".to_string(),
            config: Arc::new(Mutex::new(AppConfig::default())),
        }
    }

    #[test]
    fn batch_directory_layout() {
        let state = test_state();
        let dir = tempfile::tempdir().unwrap();
        let ctx = persister_ctx(&state, dir.path());
        let batch: Vec<QualifiedResult> = (0..3).map(result_with_timestamp).collect();

        write_batch(&ctx, 0, &batch).unwrap();

        let batch_dir = dir.path().join("batch_0");
        for name in [
            "batch_data.csv",
            "images.bin",
            "background_clean.tiff",
            "roi.csv",
            "processing_config.json",
        ] {
            assert!(batch_dir.join(name).exists(), "missing {name}");
        }

        let csv_text = std::fs::read_to_string(batch_dir.join("batch_data.csv")).unwrap();
        let mut lines = csv_text.lines();
        assert_eq!(lines.next().unwrap(), "Condition, Timestamp_us,Deformability,Area");
        assert_eq!(lines.clone().count(), 3);
        assert!(lines.next().unwrap().starts_with("test_condition,"));

        // images.bin: 3 records of (12-byte header + 32-byte payload).
        let bin = std::fs::read(batch_dir.join("images.bin")).unwrap();
        assert_eq!(bin.len(), 3 * (12 + 8 * 4));
        assert_eq!(i32::from_le_bytes(bin[0..4].try_into().unwrap()), 4); // rows
        assert_eq!(i32::from_le_bytes(bin[4..8].try_into().unwrap()), 8); // cols
        assert_eq!(i32::from_le_bytes(bin[8..12].try_into().unwrap()), 0); // type

        let cfg_text = std::fs::read_to_string(batch_dir.join("processing_config.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&cfg_text).unwrap();
        assert_eq!(value["gaussian_blur_size"], 3);
        assert!(value["filters"]["enable_border_check"].is_boolean());
    }

    #[test]
    fn persister_flushes_batches_and_final_remainder() {
        // Threshold 3, seven qualifying results: batch_0 and batch_1 hold
        // three rows each, the final flush holds one.
        let state = test_state();
        let dir = tempfile::tempdir().unwrap();
        let ctx = persister_ctx(&state, dir.path());
        let worker_state = Arc::clone(&state);
        let handle = std::thread::spawn(move || run(ctx));

        let mut pushed = 0i64;
        for _ in 0..2 {
            for _ in 0..3 {
                append_qualified(&state, 3, result_with_timestamp(pushed));
                pushed += 1;
            }
            // Wait for the in-flight save to finish before feeding more.
            let mut spins = 0;
            while state.saving_in_progress.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(5));
                spins += 1;
                assert!(spins < 1_000, "persister never finished");
            }
        }
        append_qualified(&state, 3, result_with_timestamp(pushed));

        worker_state.request_stop();
        handle.join().unwrap();

        let row_count = |n: u64| {
            let path = dir.path().join(format!("batch_{n}")).join("batch_data.csv");
            std::fs::read_to_string(path).unwrap().lines().count() - 1
        };
        assert_eq!(row_count(0), 3);
        assert_eq!(row_count(1), 3);
        assert_eq!(row_count(2), 1);
        assert!(!dir.path().join("batch_3").exists());
        assert_eq!(state.metrics.total_saved.load(Ordering::Relaxed), 7);
    }
}
