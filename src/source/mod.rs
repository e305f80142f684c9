//! Frame sources: the mock directory replayer and the live camera loop.
//!
//! Both implementations satisfy the same contract: push frames into the
//! camera ring they own as writer, and publish a monotone non-decreasing
//! `latest_frame_index` with release ordering after each frame.

pub mod live;
pub mod mock;

pub use live::{CameraTelemetry, FrameGrabber, GrabbedFrame};
pub use mock::MockSource;
