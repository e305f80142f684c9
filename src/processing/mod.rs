//! Per-frame segmentation, contour analysis and filter verdicts.
//!
//! The pipeline for each frame: ROI-local preprocessing (`ops`), contour
//! extraction and shape metrics (`contours`), and the qualification state
//! machine (`filter`). The `worker` module runs it all on the processor
//! thread.

pub mod contours;
pub mod filter;
pub mod ops;
pub mod worker;
