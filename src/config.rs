//! Configuration management for the acquisition pipeline.
//!
//! The on-disk surface is a single `config.json` file. Missing fields are
//! filled with defaults and the completed file is written back on first read,
//! so an empty or partial file always round-trips to the full shape.
//!
//! ## Schema
//!
//! - **`save_directory`**: Base directory for saved batches. The engine
//!   appends `_1`, `_2`, … when the directory already exists.
//! - **`condition`**: Optional label written as the first CSV column of every
//!   batch. Falls back to the final component of `save_directory` when unset.
//! - **`buffer_threshold`**: Number of qualified results that triggers a
//!   batch flush.
//! - **`target_fps`**: Replay rate of the mock source.
//! - **`scatter_plot_enabled`**: Whether a scatter observer should be wired up
//!   by the frontend; the engine itself always maintains the scatter buffer.
//! - **`image_processing`**: The per-frame segmentation parameters, including
//!   the `filters` and `contrast_enhancement` subtrees.
//!
//! ## Validation
//!
//! [`AppConfig::validate`] checks the loaded values with the helpers in the
//! `validation` module: kernel sizes must be odd, the contrast gain positive,
//! the area window ordered, and paths non-empty. A configuration that fails
//! validation refuses `start`; the engine stays stopped.

use crate::error::{AppResult, EngineError};
use crate::validation::{is_odd_kernel, is_positive};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Default number of qualified results per batch.
pub const DEFAULT_BUFFER_THRESHOLD: usize = 1_000;

/// Default mock-source replay rate.
pub const DEFAULT_TARGET_FPS: u32 = 5_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub save_directory: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    pub buffer_threshold: usize,
    pub target_fps: u32,
    pub scatter_plot_enabled: bool,
    pub image_processing: ImageProcessingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            save_directory: "updated_results".to_string(),
            condition: None,
            buffer_threshold: DEFAULT_BUFFER_THRESHOLD,
            target_fps: DEFAULT_TARGET_FPS,
            scatter_plot_enabled: false,
            image_processing: ImageProcessingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ImageProcessingConfig {
    pub gaussian_blur_size: u32,
    pub bg_subtract_threshold: u8,
    pub morph_kernel_size: u32,
    pub morph_iterations: u32,
    pub area_threshold_min: i64,
    pub area_threshold_max: i64,
    pub filters: FilterToggles,
    pub contrast_enhancement: ContrastConfig,
}

impl Default for ImageProcessingConfig {
    fn default() -> Self {
        Self {
            gaussian_blur_size: 3,
            bg_subtract_threshold: 10,
            morph_kernel_size: 3,
            morph_iterations: 1,
            area_threshold_min: 100,
            area_threshold_max: 600,
            filters: FilterToggles::default(),
            contrast_enhancement: ContrastConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FilterToggles {
    pub enable_border_check: bool,
    pub enable_multiple_contours_check: bool,
    pub enable_area_range_check: bool,
    pub require_single_inner_contour: bool,
}

impl Default for FilterToggles {
    fn default() -> Self {
        Self {
            enable_border_check: true,
            enable_multiple_contours_check: true,
            enable_area_range_check: true,
            require_single_inner_contour: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContrastConfig {
    pub enable_contrast: bool,
    pub alpha: f64,
    pub beta: i32,
}

impl Default for ContrastConfig {
    fn default() -> Self {
        Self {
            enable_contrast: true,
            alpha: 1.2,
            beta: 10,
        }
    }
}

impl AppConfig {
    /// Load `path`, creating it with defaults when missing.
    ///
    /// Missing fields are filled with defaults and the completed file is
    /// rewritten, so downstream tools always see the full shape.
    pub fn load_or_init(path: &Path) -> AppResult<Self> {
        let config = if path.exists() {
            let text = fs::read_to_string(path)?;
            serde_json::from_str::<AppConfig>(&text)?
        } else {
            tracing::info!(path = %path.display(), "creating default config file");
            AppConfig::default()
        };
        config.validate()?;
        config.save(path)?;
        Ok(config)
    }

    /// Write the full configuration back to `path` as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> AppResult<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }

    /// The CSV condition label: the `condition` key when set, otherwise the
    /// final component of `save_directory`.
    pub fn condition_label(&self) -> String {
        if let Some(condition) = &self.condition {
            return condition.clone();
        }
        Path::new(&self.save_directory)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.save_directory.clone())
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.save_directory.is_empty() {
            return Err(EngineError::Config(
                "save_directory must not be empty".to_string(),
            ));
        }
        if self.target_fps == 0 {
            return Err(EngineError::Config(
                "target_fps must be at least 1 frame per second".to_string(),
            ));
        }
        if self.buffer_threshold == 0 {
            return Err(EngineError::Config(
                "buffer_threshold must be at least 1 result per batch".to_string(),
            ));
        }
        self.image_processing.validate()
    }
}

impl ImageProcessingConfig {
    pub fn validate(&self) -> AppResult<()> {
        let check = |result: Result<(), &'static str>, field: &str| -> AppResult<()> {
            result.map_err(|msg| EngineError::Config(format!("{field}: {msg}")))
        };
        check(is_odd_kernel(self.gaussian_blur_size, 3), "gaussian_blur_size")?;
        check(is_odd_kernel(self.morph_kernel_size, 1), "morph_kernel_size")?;
        check(
            is_positive(self.contrast_enhancement.alpha),
            "contrast_enhancement.alpha",
        )?;
        if self.area_threshold_min > self.area_threshold_max {
            return Err(EngineError::Config(
                "area_threshold_min exceeds area_threshold_max".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply a `processing.*` control-surface update, where `key` is the
    /// dotted path below `image_processing` (e.g. `filters.enable_border_check`).
    pub fn set_field(&mut self, key: &str, value: &str) -> AppResult<()> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> AppResult<T> {
            value
                .trim()
                .parse::<T>()
                .map_err(|_| EngineError::Config(format!("invalid value {value:?} for {key}")))
        }

        match key {
            "gaussian_blur_size" => self.gaussian_blur_size = parse(key, value)?,
            "bg_subtract_threshold" => self.bg_subtract_threshold = parse(key, value)?,
            "morph_kernel_size" => self.morph_kernel_size = parse(key, value)?,
            "morph_iterations" => self.morph_iterations = parse(key, value)?,
            "area_threshold_min" => self.area_threshold_min = parse(key, value)?,
            "area_threshold_max" => self.area_threshold_max = parse(key, value)?,
            "filters.enable_border_check" => self.filters.enable_border_check = parse(key, value)?,
            "filters.enable_multiple_contours_check" => {
                self.filters.enable_multiple_contours_check = parse(key, value)?;
            }
            "filters.enable_area_range_check" => {
                self.filters.enable_area_range_check = parse(key, value)?;
            }
            "filters.require_single_inner_contour" => {
                self.filters.require_single_inner_contour = parse(key, value)?;
            }
            "contrast_enhancement.enable_contrast" => {
                self.contrast_enhancement.enable_contrast = parse(key, value)?;
            }
            "contrast_enhancement.alpha" => self.contrast_enhancement.alpha = parse(key, value)?,
            "contrast_enhancement.beta" => self.contrast_enhancement.beta = parse(key, value)?,
            other => return Err(EngineError::UnknownParam(format!("processing.{other}"))),
        }
        Ok(())
    }
}

/// Immutable per-frame snapshot of the processing parameters.
///
/// The processor copies this under the config mutex once per frame; the copy
/// is then consumed without further locking.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessingConfig {
    pub gaussian_blur_size: u32,
    pub bg_subtract_threshold: u8,
    pub morph_kernel_size: u32,
    pub morph_iterations: u32,
    pub area_threshold_min: f64,
    pub area_threshold_max: f64,
    pub enable_border_check: bool,
    pub enable_area_range_check: bool,
    pub require_single_inner_contour: bool,
    pub enable_contrast_enhancement: bool,
    pub contrast_alpha: f64,
    pub contrast_beta: i32,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self::from(&ImageProcessingConfig::default())
    }
}

impl From<&ImageProcessingConfig> for ProcessingConfig {
    fn from(cfg: &ImageProcessingConfig) -> Self {
        Self {
            gaussian_blur_size: cfg.gaussian_blur_size,
            bg_subtract_threshold: cfg.bg_subtract_threshold,
            morph_kernel_size: cfg.morph_kernel_size,
            morph_iterations: cfg.morph_iterations,
            area_threshold_min: cfg.area_threshold_min as f64,
            area_threshold_max: cfg.area_threshold_max as f64,
            enable_border_check: cfg.filters.enable_border_check,
            enable_area_range_check: cfg.filters.enable_area_range_check,
            require_single_inner_contour: cfg.filters.require_single_inner_contour,
            enable_contrast_enhancement: cfg.contrast_enhancement.enable_contrast,
            contrast_alpha: cfg.contrast_enhancement.alpha,
            contrast_beta: cfg.contrast_enhancement.beta,
        }
    }
}
