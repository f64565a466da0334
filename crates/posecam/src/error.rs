//! Error types that callers need to tell apart.
//!
//! Plumbing failures (file I/O, ONNX graph loading, JPEG decoding) are reported as
//! [`anyhow::Error`]s. The types here are the ones that either cross the boundary between the
//! pose loop and the embedding application, or that the loop itself branches on.

use thiserror::Error;

/// Failure to obtain a live camera stream.
#[derive(Error, Debug)]
pub enum CameraError {
    #[error("permission to access the camera was denied")]
    PermissionDenied,

    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Failure to load or initialize a pose estimation model.
#[derive(Error, Debug)]
#[error("failed to load pose model from {location}")]
pub struct AssetLoadError {
    location: String,
    #[source]
    source: anyhow::Error,
}

impl AssetLoadError {
    pub fn new(location: impl Into<String>, source: anyhow::Error) -> Self {
        Self {
            location: location.into(),
            source,
        }
    }

    /// Returns a human-readable description of where the model was loaded from.
    pub fn location(&self) -> &str {
        &self.location
    }
}

/// A pose loop failed before it reached its running state.
///
/// This is the only error a [`PoseLoop`][crate::driver::PoseLoop] ever returns to its caller.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error(transparent)]
    Camera(#[from] CameraError),

    #[error(transparent)]
    AssetLoad(#[from] AssetLoadError),
}

/// The frame source has no frame to hand out.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unavailable {
    /// The stream has not delivered its first frame yet.
    #[error("video stream is not attached yet")]
    NotAttached,

    /// The stream has ended and will not deliver any more frames.
    #[error("video stream was detached")]
    Detached,
}

/// A frame has a zero-sized native resolution, so coordinates cannot be scaled yet.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("frame dimensions are not known yet")]
pub struct NotReady;

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn asset_load_error_keeps_cause() {
        let err = AssetLoadError::new("models/movenet.onnx", anyhow::anyhow!("file not found"));
        assert_eq!(err.location(), "models/movenet.onnx");
        assert_eq!(
            err.to_string(),
            "failed to load pose model from models/movenet.onnx"
        );
        assert_eq!(err.source().unwrap().to_string(), "file not found");

        let startup = StartupError::from(err);
        assert!(matches!(startup, StartupError::AssetLoad(_)));
    }

    #[test]
    fn camera_error_messages() {
        let err = StartupError::from(CameraError::DeviceUnavailable("no webcam found".into()));
        assert_eq!(err.to_string(), "camera unavailable: no webcam found");
    }
}
