//! Frame sources: where the pose loop gets its images from.
//!
//! A [`Camera`] is acquired once, yielding a [`FrameSource`]. The loop then polls the source for
//! its [`current_frame`][FrameSource::current_frame] once per iteration. Sources never wait for a
//! new frame; they return the most recent one, even if it was already returned before.

use std::{
    io,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use crate::{
    error::{CameraError, Unavailable},
    image::Image,
    resolution::Resolution,
};

/// A captured camera frame, together with the size it is currently displayed at.
///
/// Frames are immutable. Cloning one only bumps a reference count.
#[derive(Debug, Clone)]
pub struct Frame {
    image: Arc<Image>,
    display: Resolution,
}

impl Frame {
    pub fn new(image: Arc<Image>, display: Resolution) -> Self {
        Self { image, display }
    }

    #[inline]
    pub fn image(&self) -> &Image {
        &self.image
    }

    /// Returns a shared handle to the frame's image, for handing it to another thread.
    #[inline]
    pub fn shared_image(&self) -> &Arc<Image> {
        &self.image
    }

    /// The frame's resolution, as delivered by the camera.
    #[inline]
    pub fn native(&self) -> Resolution {
        self.image.resolution()
    }

    /// The resolution the frame is shown at.
    #[inline]
    pub fn display(&self) -> Resolution {
        self.display
    }
}

/// A live stream of frames.
pub trait FrameSource {
    /// Returns the most recent frame.
    ///
    /// Fails with [`Unavailable::NotAttached`] before the first frame has arrived, and with
    /// [`Unavailable::Detached`] once the stream has ended.
    fn current_frame(&self) -> Result<Frame, Unavailable>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn current_frame(&self) -> Result<Frame, Unavailable> {
        (**self).current_frame()
    }
}

/// Something that can be turned into a live [`FrameSource`] after asking the platform for
/// access.
#[allow(async_fn_in_trait)]
pub trait Camera {
    type Source: FrameSource;

    async fn acquire(self) -> Result<Self::Source, CameraError>;
}

/// Shared handle to the size at which frames are displayed.
///
/// The host view updates it when its window is resized. Frame sources read it every time they
/// hand out a frame, so scale factors always reflect the current size.
#[derive(Debug, Clone, Default)]
pub struct DisplaySize(Arc<Mutex<Resolution>>);

impl DisplaySize {
    pub fn new(res: Resolution) -> Self {
        Self(Arc::new(Mutex::new(res)))
    }

    pub fn get(&self) -> Resolution {
        *self.0.lock().unwrap()
    }

    pub fn set(&self, res: Resolution) {
        *self.0.lock().unwrap() = res;
    }
}

/// Where a [`StillCamera`] gets its image from.
#[derive(Debug, Clone)]
enum Still {
    Path(PathBuf),
    Image(Arc<Image>),
}

/// A camera that shows a single still image forever.
///
/// Useful for demos, headless runs and tests. If no [`DisplaySize`] is configured, the image is
/// displayed at its native resolution.
#[derive(Debug, Clone)]
pub struct StillCamera {
    still: Still,
    display: Option<DisplaySize>,
}

impl StillCamera {
    /// Creates a camera that loads its image from `path` when acquired.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            still: Still::Path(path.into()),
            display: None,
        }
    }

    pub fn from_image(image: Image) -> Self {
        Self {
            still: Still::Image(Arc::new(image)),
            display: None,
        }
    }

    pub fn with_display_size(mut self, display: DisplaySize) -> Self {
        self.display = Some(display);
        self
    }
}

impl Camera for StillCamera {
    type Source = StillSource;

    async fn acquire(self) -> Result<StillSource, CameraError> {
        let image = match self.still {
            Still::Image(image) => image,
            Still::Path(path) => {
                log::debug!("loading still image from '{}'", path.display());
                let loaded = tokio::task::spawn_blocking(move || Image::load(&path))
                    .await
                    .map_err(|e| CameraError::DeviceUnavailable(e.to_string()))?;
                Arc::new(loaded.map_err(still_error)?)
            }
        };
        let display = self
            .display
            .unwrap_or_else(|| DisplaySize::new(image.resolution()));

        Ok(StillSource { image, display })
    }
}

fn still_error(error: anyhow::Error) -> CameraError {
    match error.downcast_ref::<io::Error>() {
        Some(io) if io.kind() == io::ErrorKind::PermissionDenied => CameraError::PermissionDenied,
        _ => CameraError::DeviceUnavailable(format!("{error:#}")),
    }
}

/// [`FrameSource`] of a [`StillCamera`].
#[derive(Debug)]
pub struct StillSource {
    image: Arc<Image>,
    display: DisplaySize,
}

impl StillSource {
    pub fn display_size(&self) -> &DisplaySize {
        &self.display
    }
}

impl FrameSource for StillSource {
    fn current_frame(&self) -> Result<Frame, Unavailable> {
        Ok(Frame::new(self.image.clone(), self.display.get()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn still_camera_tracks_display_size() {
        let display = DisplaySize::new(Resolution::new(320, 240));
        let source = StillCamera::from_image(Image::new(640, 480))
            .with_display_size(display.clone())
            .acquire()
            .await
            .unwrap();

        let frame = source.current_frame().unwrap();
        assert_eq!(frame.native(), Resolution::VGA);
        assert_eq!(frame.display(), Resolution::new(320, 240));

        display.set(Resolution::new(1280, 960));
        let frame = source.current_frame().unwrap();
        assert_eq!(frame.display(), Resolution::new(1280, 960));
    }

    #[tokio::test]
    async fn still_camera_defaults_to_native_size() {
        let source = StillCamera::from_image(Image::new(8, 6))
            .acquire()
            .await
            .unwrap();
        assert_eq!(source.current_frame().unwrap().display(), Resolution::new(8, 6));
    }

    #[tokio::test]
    async fn missing_still_image() {
        let err = StillCamera::open("/nonexistent/posecam/still.png")
            .acquire()
            .await
            .unwrap_err();
        assert!(matches!(err, CameraError::DeviceUnavailable(_)));
    }
}
