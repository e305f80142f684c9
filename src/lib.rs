//! # cyto_daq
//!
//! A soft-real-time image acquisition and analysis pipeline for high-speed
//! microscopy of deformable objects (cells) flowing past a line-scan style
//! camera at ~5,000 frames per second. Each frame runs through
//! background-subtracted segmentation, contour and morphology analysis and a
//! qualification filter; qualifying frames raise a hardware trigger pulse and
//! are persisted to disk in self-contained binary batches together with
//! per-frame metrics.
//!
//! ## Crate Structure
//!
//! - **`engine`**: The `Engine` — lifecycle (`start`/`stop`), the
//!   `set_param`/`on_key` control surface, and ownership of every worker
//!   thread.
//! - **`ring`**: Fixed-capacity single-writer frame rings carrying payloads
//!   between source, dispatcher and consumers.
//! - **`source`**: Frame producers — the mock directory replayer and the
//!   live camera loop behind the `FrameGrabber` seam.
//! - **`dispatch`**: Copies each published source frame into the display and
//!   processing rings and enqueues its index.
//! - **`processing`**: Per-frame segmentation (`ops`), contour analysis
//!   (`contours`), the filter verdict (`filter`) and the processor thread
//!   (`worker`).
//! - **`trigger`**: The digital-output pulse emitter and its `TriggerLine`
//!   seam.
//! - **`persist`**: Double-buffered batching of qualified results and the
//!   on-disk batch layout.
//! - **`convert`**: Offline batch readers and the binary→TIFF converter.
//! - **`metrics`**: Processing-time statistics, the deformability/area
//!   scatter buffer and atomic gauges.
//! - **`observer`**: Observer fan-out with composed BGR display frames and
//!   status/error events.
//! - **`config`**: The `config.json` surface with defaults-fill-and-rewrite
//!   semantics.
//! - **`state`**: The shared run state handed to workers as reference-counted
//!   read handles.
//! - **`error`**: The central `EngineError` type.

pub mod config;
pub mod convert;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod frame;
pub mod logging;
pub mod metrics;
pub mod observer;
pub mod persist;
pub mod processing;
pub mod ring;
pub mod source;
pub mod state;
pub mod trigger;
pub mod validation;

pub use config::AppConfig;
pub use engine::Engine;
pub use error::{AppResult, EngineError};
pub use frame::{FrameView, PixelFormat, Roi};
pub use observer::EngineObserver;
