//! The engine: lifecycle, control surface and worker ownership.
//!
//! One [`Engine`] owns the configuration, the observer hub and, while
//! running, the shared state plus every worker thread. `start()` wires the
//! pipeline in order (source, processor, persister, trigger, dispatcher,
//! publisher); `stop()` is idempotent, cancels via the shared `done` flag and
//! joins the workers in reverse start order.

use crate::config::{AppConfig, ProcessingConfig};
use crate::error::{AppResult, EngineError};
use crate::frame::Roi;
use crate::observer::{self, EngineObserver, ObserverHub};
use crate::persist::{self, PersisterContext};
use crate::processing::ops;
use crate::processing::worker::{self, ProcessorContext};
use crate::ring::FrameRing;
use crate::source::MockSource;
use crate::state::{lock_unpoisoned, Background, SharedState};
use crate::trigger::{self, TriggerLine};
use crate::dispatch::{self, DispatcherContext};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Key codes understood by [`Engine::on_key`].
pub mod keys {
    pub const ESC: i32 = 27;
    pub const SPACE: i32 = 32;
    pub const OLDER: i32 = 97; // 'a'
    pub const NEWER: i32 = 100; // 'd'
    pub const CLEAR_SCATTER: i32 = 113; // 'q'
    pub const SNAPSHOT: i32 = 115; // 's'
}

struct RunHandles {
    state: Arc<SharedState>,
    display_ring: Arc<FrameRing>,
    workers: Vec<(&'static str, JoinHandle<()>)>,
    save_dir: PathBuf,
}

pub struct Engine {
    config: Arc<Mutex<AppConfig>>,
    config_path: PathBuf,
    image_dir: Option<PathBuf>,
    pending_roi: Option<Roi>,
    observers: Arc<ObserverHub>,
    trigger_line: Option<Box<dyn TriggerLine>>,
    run: Option<RunHandles>,
}

impl Engine {
    pub fn new(config: AppConfig, config_path: PathBuf) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
            config_path,
            image_dir: None,
            pending_roi: None,
            observers: Arc::new(ObserverHub::new()),
            trigger_line: None,
            run: None,
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn EngineObserver>) {
        self.observers.subscribe(observer);
    }

    pub fn unsubscribe(&self, observer: &Arc<dyn EngineObserver>) {
        self.observers.unsubscribe(observer);
    }

    /// Install the digital output line driven on qualifying frames. Takes
    /// effect at the next `start`.
    pub fn set_trigger_line(&mut self, line: Box<dyn TriggerLine>) {
        self.trigger_line = Some(line);
    }

    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    /// Shared state of the current run, for metrics readers.
    pub fn state(&self) -> Option<Arc<SharedState>> {
        self.run.as_ref().map(|run| Arc::clone(&run.state))
    }

    /// Save directory of the current run.
    pub fn save_dir(&self) -> Option<&Path> {
        self.run.as_ref().map(|run| run.save_dir.as_path())
    }

    pub fn config_snapshot(&self) -> AppConfig {
        lock_unpoisoned(&self.config).clone()
    }

    /// Apply a named parameter. Errors are also surfaced via `on_error`.
    pub fn set_param(&mut self, key: &str, value: &str) -> AppResult<()> {
        let result = self.set_param_inner(key, value);
        if let Err(err) = &result {
            self.observers.error(err.code(), &err.to_string());
        }
        result
    }

    fn set_param_inner(&mut self, key: &str, value: &str) -> AppResult<()> {
        match key {
            "image_dir" => {
                self.image_dir = Some(PathBuf::from(value));
                Ok(())
            }
            "roi" => {
                let roi: Roi = value
                    .parse()
                    .map_err(|msg: &str| EngineError::Config(format!("roi: {msg}")))?;
                if let Some(run) = &self.run {
                    *lock_unpoisoned(&run.state.roi) = roi;
                    run.state.display_needs_update.store(true, Ordering::Release);
                } else {
                    self.pending_roi = Some(roi);
                }
                Ok(())
            }
            "save_directory" => {
                if value.is_empty() {
                    return Err(EngineError::Config("save_directory is empty".to_string()));
                }
                let mut config = lock_unpoisoned(&self.config);
                config.save_directory = value.to_string();
                config.save(&self.config_path)
            }
            "condition" => {
                let mut config = lock_unpoisoned(&self.config);
                config.condition = Some(value.to_string());
                config.save(&self.config_path)
            }
            _ if key.starts_with("processing.") => {
                self.set_processing_param(&key["processing.".len()..], value)
            }
            other => Err(EngineError::UnknownParam(other.to_string())),
        }
    }

    fn set_processing_param(&mut self, field: &str, value: &str) -> AppResult<()> {
        let snapshot = {
            let mut config = lock_unpoisoned(&self.config);
            let mut updated = config.image_processing.clone();
            updated.set_field(field, value)?;
            updated.validate()?;
            config.image_processing = updated;
            let snapshot = ProcessingConfig::from(&config.image_processing);
            config.save(&self.config_path)?;
            snapshot
        };

        if let Some(run) = &self.run {
            *lock_unpoisoned(&run.state.processing) = snapshot;
            // The prepared background must always match the live parameters.
            let mut background = lock_unpoisoned(&run.state.background);
            background.prepared = ops::prepare_background(&background.clean, &snapshot);
            run.state.metrics.mark_updated();
        }
        tracing::info!(field, value, "processing parameter updated");
        Ok(())
    }

    /// Transition stopped→running. Refuses (and reports `on_error`) when the
    /// configuration is incomplete or the source cannot be initialized.
    pub fn start(&mut self) -> AppResult<()> {
        let result = self.start_inner();
        if let Err(err) = &result {
            self.observers.error(err.code(), &err.to_string());
        }
        result
    }

    fn start_inner(&mut self) -> AppResult<()> {
        if self.run.is_some() {
            return Err(EngineError::AlreadyRunning);
        }
        let Some(image_dir) = self.image_dir.clone() else {
            return Err(EngineError::Config(
                "image_dir not set; call set_param(\"image_dir\", <path>) before start".to_string(),
            ));
        };
        let config = self.config_snapshot();

        let source = MockSource::load(&image_dir, true)?;
        let params = source.params();
        let snapshot = ProcessingConfig::from(&config.image_processing);

        let clean = ops::gray_image_from(
            source.middle_frame(),
            params.width as u32,
            params.height as u32,
        );
        let prepared = ops::prepare_background(&clean, &snapshot);
        let background = Background { clean, prepared };

        let roi = self
            .pending_roi
            .unwrap_or_else(|| Roi::full(params.width, params.height));

        let state = Arc::new(SharedState::new(params, snapshot, background, roi));
        state.metrics.set_background_captured_at(format!(
            "{} (auto)",
            chrono::Local::now().format("%H:%M:%S")
        ));

        let camera_ring = Arc::new(FrameRing::new(params.ring_capacity, params.frame_bytes));
        let display_ring = Arc::new(FrameRing::new(params.ring_capacity, params.frame_bytes));
        let processing_ring = Arc::new(FrameRing::new(params.ring_capacity, params.frame_bytes));

        let save_dir = unique_save_dir(&config.save_directory)?;
        tracing::info!(dir = %save_dir.display(), "using save directory");

        let mut workers: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        let source_handle =
            source.spawn(Arc::clone(&state), Arc::clone(&camera_ring), config.target_fps)?;
        workers.push(("source", source_handle));

        let processor_ctx = ProcessorContext {
            state: Arc::clone(&state),
            processing_ring: Arc::clone(&processing_ring),
            buffer_threshold: config.buffer_threshold,
        };
        workers.push((
            "processor",
            std::thread::Builder::new()
                .name("processor".to_string())
                .spawn(move || worker::run(processor_ctx))?,
        ));

        let persister_ctx = PersisterContext {
            state: Arc::clone(&state),
            observers: Arc::clone(&self.observers),
            save_dir: save_dir.clone(),
            condition: config.condition_label(),
            config: Arc::clone(&self.config),
        };
        workers.push((
            "persister",
            std::thread::Builder::new()
                .name("persister".to_string())
                .spawn(move || persist::run(persister_ctx))?,
        ));

        if let Some(line) = self.trigger_line.take() {
            let trigger_state = Arc::clone(&state);
            workers.push((
                "trigger",
                std::thread::Builder::new()
                    .name("trigger".to_string())
                    .spawn(move || trigger::run(line, trigger_state))?,
            ));
        }

        let dispatcher_ctx = DispatcherContext {
            state: Arc::clone(&state),
            camera_ring: Arc::clone(&camera_ring),
            display_ring: Arc::clone(&display_ring),
            processing_ring: Arc::clone(&processing_ring),
        };
        workers.push(("dispatcher", dispatch::spawn(dispatcher_ctx)?));

        let publisher_state = Arc::clone(&state);
        let publisher_hub = Arc::clone(&self.observers);
        workers.push((
            "publisher",
            std::thread::Builder::new()
                .name("publisher".to_string())
                .spawn(move || observer::run_publisher(publisher_state, publisher_hub))?,
        ));

        self.run = Some(RunHandles {
            state,
            display_ring,
            workers,
            save_dir,
        });
        self.observers.status("started");
        Ok(())
    }

    /// Transition running→stopped. Idempotent.
    pub fn stop(&mut self) {
        let Some(run) = self.run.take() else {
            return;
        };
        run.state.request_stop();
        for (name, handle) in run.workers.into_iter().rev() {
            if handle.join().is_err() {
                tracing::error!(worker = name, "worker panicked");
            }
        }
        self.observers.status("stopped");
    }

    /// Handle a key-code event (see [`keys`]).
    pub fn on_key(&mut self, code: i32) {
        match code {
            keys::ESC => {
                if let Some(run) = &self.run {
                    tracing::info!("shutdown requested");
                    run.state.request_stop();
                }
            }
            keys::SPACE => self.toggle_pause(),
            keys::OLDER => self.navigate(1),
            keys::NEWER => self.navigate(-1),
            keys::CLEAR_SCATTER => {
                if let Some(run) = &self.run {
                    run.state.metrics.scatter.clear();
                    run.state.metrics.mark_updated();
                }
            }
            keys::SNAPSHOT => self.snapshot_stream(),
            other => tracing::debug!(code = other, "ignored key"),
        }
    }

    /// Toggle `paused`. On the transition into pause, the newest ring frame
    /// becomes the new background, with its blurred and enhanced forms
    /// rebuilt atomically.
    fn toggle_pause(&mut self) {
        let Some(run) = &self.run else {
            return;
        };
        let state = &run.state;
        let was_paused = state.paused.fetch_xor(true, Ordering::AcqRel);
        if was_paused {
            tracing::info!("resumed");
            state.metrics.mark_updated();
            return;
        }
        tracing::info!("paused");
        state.current_frame_index.store(0, Ordering::Relaxed);
        match run.display_ring.get(0) {
            Ok(bytes) => {
                let clean = ops::gray_image_from(
                    &bytes,
                    state.params.width as u32,
                    state.params.height as u32,
                );
                let cfg = *lock_unpoisoned(&state.processing);
                let prepared = ops::prepare_background(&clean, &cfg);
                {
                    let mut background = lock_unpoisoned(&state.background);
                    background.clean = clean;
                    background.prepared = prepared;
                }
                state.metrics.set_background_captured_at(
                    chrono::Local::now().format("%H:%M:%S").to_string(),
                );
                tracing::info!("background captured");
            }
            Err(err) => {
                tracing::warn!(error = %err, "no frame available for background capture");
            }
        }
        state.display_needs_update.store(true, Ordering::Release);
        state.metrics.mark_updated();
    }

    /// Step the paused-navigation index; positive deltas move toward older
    /// frames. Clamped to the frames the ring still holds.
    fn navigate(&mut self, delta: i64) {
        let Some(run) = &self.run else {
            return;
        };
        let state = &run.state;
        if !state.is_paused() {
            return;
        }
        let held = run.display_ring.len() as i64;
        if held == 0 {
            return;
        }
        let current = state.current_frame_index.load(Ordering::Relaxed).max(0);
        let next = (current + delta).clamp(0, held - 1);
        state.current_frame_index.store(next, Ordering::Relaxed);
        state.display_needs_update.store(true, Ordering::Release);
    }

    /// Save every frame the display ring holds as numbered PNGs under
    /// `stream_output/<n>/`, oldest first.
    fn snapshot_stream(&mut self) {
        let Some(run) = &self.run else {
            return;
        };
        let state = Arc::clone(&run.state);
        let result: AppResult<(PathBuf, usize)> = (|| {
            let base = Path::new("stream_output");
            fs::create_dir_all(base)?;
            let mut folder = 1u32;
            while base.join(folder.to_string()).exists() {
                folder += 1;
            }
            let dir = base.join(folder.to_string());
            fs::create_dir_all(&dir)?;

            let count = run.display_ring.len();
            for i in 0..count {
                let bytes = run.display_ring.get(count - 1 - i)?;
                let img = ops::gray_image_from(
                    &bytes,
                    state.params.width as u32,
                    state.params.height as u32,
                );
                img.save(dir.join(format!("frame_{i:05}.png")))?;
            }
            Ok((dir, count))
        })();
        match result {
            Ok((dir, count)) => {
                tracing::info!(count, dir = %dir.display(), "stream snapshot saved")
            }
            Err(err) => {
                tracing::error!(error = %err, "stream snapshot failed");
                self.observers.error(err.code(), &err.to_string());
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// `base`, or `base_1`, `base_2`, … when taken. The directory is created.
fn unique_save_dir(base: &str) -> AppResult<PathBuf> {
    let mut path = PathBuf::from(base);
    let mut suffix = 1u32;
    while path.exists() {
        path = PathBuf::from(format!("{base}_{suffix}"));
        suffix += 1;
    }
    fs::create_dir_all(&path)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct ErrorCollector {
        errors: AtomicUsize,
    }

    impl EngineObserver for ErrorCollector {
        fn on_error(&self, _code: i32, _message: &str) {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn engine_with_temp_config(dir: &Path) -> Engine {
        let mut config = AppConfig::default();
        config.save_directory = dir.join("results").to_string_lossy().into_owned();
        Engine::new(config, dir.join("config.json"))
    }

    #[test]
    fn start_without_image_dir_refuses_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_with_temp_config(dir.path());
        let collector = Arc::new(ErrorCollector::default());
        engine.subscribe(collector.clone());

        let err = engine.start().unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        assert!(!engine.is_running());
        assert_eq!(collector.errors.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn start_with_empty_image_dir_is_a_source_error() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("images");
        fs::create_dir_all(&images).unwrap();
        let mut engine = engine_with_temp_config(dir.path());
        engine
            .set_param("image_dir", images.to_string_lossy().as_ref())
            .unwrap();
        let err = engine.start().unwrap_err();
        assert_eq!(err.code(), 2);
        assert!(!engine.is_running());
    }

    #[test]
    fn unknown_param_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_with_temp_config(dir.path());
        let err = engine.set_param("frobnicate", "1").unwrap_err();
        assert!(matches!(err, EngineError::UnknownParam(_)));
    }

    #[test]
    fn roi_param_is_parsed_and_held_until_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_with_temp_config(dir.path());
        engine.set_param("roi", "2,3,40,40").unwrap();
        assert_eq!(engine.pending_roi, Some(Roi::new(2, 3, 40, 40)));
        assert!(engine.set_param("roi", "nope").is_err());
    }

    #[test]
    fn processing_param_updates_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_with_temp_config(dir.path());
        engine
            .set_param("processing.gaussian_blur_size", "5")
            .unwrap();
        let text = fs::read_to_string(dir.path().join("config.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["image_processing"]["gaussian_blur_size"], 5);

        // Invalid values leave the config untouched.
        assert!(engine
            .set_param("processing.gaussian_blur_size", "4")
            .is_err());
        assert_eq!(
            engine.config_snapshot().image_processing.gaussian_blur_size,
            5
        );
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_with_temp_config(dir.path());
        engine.stop();
        engine.stop();
        assert!(!engine.is_running());
    }

    #[test]
    fn unique_save_dir_appends_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("run").to_string_lossy().into_owned();
        assert_eq!(unique_save_dir(&base).unwrap(), PathBuf::from(&base));
        assert_eq!(
            unique_save_dir(&base).unwrap(),
            PathBuf::from(format!("{base}_1"))
        );
        assert_eq!(
            unique_save_dir(&base).unwrap(),
            PathBuf::from(format!("{base}_2"))
        );
    }
}
