//! Custom error types for the engine.
//!
//! This module defines the primary error type, `EngineError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and consistent
//! way to handle the different kinds of errors that can occur, from I/O and
//! configuration issues to per-frame processing problems.
//!
//! ## Error Hierarchy
//!
//! `EngineError` is an enum that consolidates the error sources of the pipeline:
//!
//! - **`Config`**: Semantic errors in the configuration, such as an even blur
//!   kernel or an empty save directory. These are caught during validation and
//!   refuse `start`.
//! - **`UnknownParam`**: A `set_param` key the control surface does not
//!   recognize.
//! - **`Source`**: Failures of the frame producer. Initialization failures
//!   (no images found, camera open failure) are fatal; per-frame failures are
//!   counted and dropped by the source loop itself.
//! - **`Processing`**: Per-frame analysis failures. These abort only the frame
//!   they occurred on; the processor logs them and continues.
//! - **`Persistence`**: Disk failures while flushing a batch. The current
//!   batch is abandoned and the pipeline continues.
//! - **`Trigger`**: Digital-output line failures.
//! - **`Ring`**: Out-of-window or mis-sized ring accesses, via `#[from]`.
//! - **`Io` / `Image` / `Json` / `Csv`**: wrapped library errors, so the `?`
//!   operator works throughout the crate.
//!
//! Workers never unwind past their thread entry point: every caught error is
//! converted to an `on_error(code, text)` observer event (see
//! [`EngineError::code`]) and the worker continues, unless the error is fatal
//! to that worker's resource.

use crate::ring::RingError;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown parameter key: {0}")]
    UnknownParam(String),

    #[error("source error: {0}")]
    Source(String),

    #[error("no loadable images found in {0}")]
    NoImages(PathBuf),

    #[error("processing error: {0}")]
    Processing(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("trigger line error: {0}")]
    Trigger(String),

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error(transparent)]
    Ring(#[from] RingError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl EngineError {
    /// Stable integer code delivered with `on_error(code, text)`.
    ///
    /// Codes follow the error taxonomy: 1 configuration, 2 source,
    /// 3 per-frame processing, 4 persistence, 5 trigger.
    pub fn code(&self) -> i32 {
        match self {
            EngineError::Config(_) | EngineError::UnknownParam(_) => 1,
            EngineError::Source(_) | EngineError::NoImages(_) => 2,
            EngineError::Processing(_) | EngineError::Ring(_) => 3,
            EngineError::Persistence(_)
            | EngineError::Io(_)
            | EngineError::Image(_)
            | EngineError::Json(_)
            | EngineError::Csv(_) => 4,
            EngineError::Trigger(_) => 5,
            EngineError::AlreadyRunning | EngineError::NotRunning => 1,
        }
    }
}
