//! Live camera pose estimation with a synchronized keypoint overlay.
//!
//! The heart of this library is the [`PoseLoop`][driver::PoseLoop]: it repeatedly takes the
//! current frame from a [`FrameSource`][frame::FrameSource], hands it to a
//! [`PoseEstimator`][estimator::PoseEstimator], maps the resulting keypoints from the camera's
//! native pixel grid into the displayed pixel grid, redraws the overlay, and keeps a frames per
//! second readout up to date.
//!
//! # Coordinates
//!
//! 2D keypoint coordinates use image conventions: X points to the right, Y points *down*, and the
//! origin is the top left corner of the frame. Keypoints returned by an estimator are in *native*
//! frame coordinates (the camera's resolution); the [`mapper`] converts them to *display*
//! coordinates (the size the frame is shown at).
//!
//! # Environment Variables
//!
//! * `POSECAM_JPEG_BACKEND`: Configures the JPEG image decoder to use. Allowed values are:
//!   * `mozjpeg`: uses the [mozjpeg] library to decode JPEG images (the default).
//!   * `zune-jpeg`: uses the [zune-jpeg] crate.
//!   * `jpeg-decoder`: uses the [jpeg-decoder] crate.
//! * `POSECAM_WEBCAM_NAME`: Forces the device to use for [`Webcam`]s created without an explicit
//!   device name. If unset, the first device that supports a compatible image format will be used.
//! * `POSECAM_MODEL_DIR`: Directory that default model files are loaded from. Defaults to
//!   `models`.
//!
//! [mozjpeg]: https://github.com/mozilla/mozjpeg
//! [zune-jpeg]: https://github.com/etemesi254/zune-jpeg
//! [jpeg-decoder]: https://github.com/image-rs/jpeg-decoder/
//! [`Webcam`]: video::webcam::Webcam

use log::LevelFilter;

pub mod driver;
pub mod error;
pub mod estimator;
pub mod frame;
pub mod gui;
pub mod image;
pub mod mapper;
pub mod models;
pub mod nn;
pub mod overlay;
pub mod pose;
pub mod resolution;
pub mod termination;
pub mod throughput;
pub mod timer;
pub mod video;

pub use posecam_macros::main;

/// macro-use only, not part of public API.
#[doc(hidden)]
pub fn init_logger(calling_crate: &'static str) {
    let log_level = if cfg!(debug_assertions) {
        LevelFilter::Trace
    } else {
        LevelFilter::Debug
    };
    env_logger::Builder::new()
        .filter(Some(calling_crate), log_level)
        .filter(Some(env!("CARGO_CRATE_NAME")), log_level)
        .filter(Some("wgpu"), LevelFilter::Warn)
        .filter(Some("tract_onnx"), LevelFilter::Info)
        .parse_default_env()
        .try_init()
        .ok();
}

/// Initializes logging to *stderr*.
///
/// If `cfg!(debug_assertions)` is enabled, the calling crate and posecam will log at *trace* level.
/// Otherwise, they will log at *debug* level.
///
/// `wgpu` will always log at *warn* level.
///
/// If a global logger is already registered, this macro will do nothing.
#[macro_export]
macro_rules! init_logger {
    () => {
        $crate::init_logger(env!("CARGO_CRATE_NAME"))
    };
}

/// macro-use only, not part of public API.
#[doc(hidden)]
pub fn run<F, R>(cb: F) -> !
where
    F: FnOnce() -> R + Send + 'static,
    R: termination::Termination + Send,
{
    gui::run(cb)
}
