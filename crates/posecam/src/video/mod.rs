//! Live video capture.

mod feed;
pub mod webcam;

pub use feed::{FrameHook, LiveFeed};
