//! V4L2 webcam access.
//!
//! Currently, only V4L2 `VIDEO_CAPTURE` devices yielding JFIF JPEG or Motion JPEG frames are
//! supported.

use std::{cmp::Reverse, env, io};

use anyhow::{bail, Context};
use linuxvideo::{
    format::{FrameIntervals, FrameSizes, PixFormat, Pixelformat},
    stream::ReadStream,
    BufType, CapabilityFlags, Device, Fract,
};

use crate::{
    error::CameraError,
    frame::{Camera, DisplaySize},
    image::Image,
    resolution::Resolution,
    timer::Timer,
};

use super::{FrameHook, LiveFeed};

/// Indicates whether to prefer a higher resolution or frame rate.
///
/// By default, [`ParamPreference::Resolution`] is used, selecting the maximum resolution at the
/// desired frame rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum ParamPreference {
    /// Prefer increased resolution over higher frame rates.
    #[default]
    Resolution,
    /// Prefer higher frame rate over higher image resolution.
    Framerate,
}

#[derive(Debug, Default, Clone, Copy)]
struct FramePrefs {
    resolution: Option<Resolution>,
    fps: Option<u32>,
    pref: ParamPreference,
}

/// Format negotiation options.
#[derive(Debug, Default, Clone)]
pub struct WebcamOptions {
    name: Option<String>,
    frame: FramePrefs,
}

impl WebcamOptions {
    /// Sets the name of the webcam device to open.
    ///
    /// If no webcam with the given name can be found, opening the webcam will result in an error.
    #[inline]
    pub fn name(self, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Sets the desired image resolution.
    ///
    /// A lower resolution might be selected if the webcam cannot deliver the desired resolution.
    #[inline]
    pub fn resolution(mut self, resolution: Resolution) -> Self {
        self.frame.resolution = Some(resolution);
        self
    }

    /// Sets the desired frame rate.
    #[inline]
    pub fn fps(mut self, fps: u32) -> Self {
        self.frame.fps = Some(fps);
        self
    }

    /// Selects whether to prefer a higher resolution or frame rate.
    ///
    /// When the camera cannot deliver both, this controls which one is kept. When it can, this
    /// controls which one is maximized while the other stays at its desired value.
    #[inline]
    pub fn prefer(mut self, pref: ParamPreference) -> Self {
        self.frame.pref = pref;
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct FrameFormat {
    resolution: Resolution,
    frame_interval: Fract,
}

fn negotiate_format(device: &Device, mut prefs: FramePrefs) -> anyhow::Result<(PixFormat, Fract)> {
    let mut pixel_format = None;
    for format in device.formats(BufType::VIDEO_CAPTURE) {
        let format = format?;
        if format.pixelformat() == Pixelformat::JPEG || format.pixelformat() == Pixelformat::MJPG {
            pixel_format = Some(format.pixelformat());
            break;
        }
    }

    let Some(pixel_format) = pixel_format else {
        bail!("no supported pixel format found");
    };

    let mut formats = Vec::new();
    match device.frame_sizes(pixel_format)? {
        FrameSizes::Discrete(sizes) => {
            for size in sizes {
                let intervals =
                    match device.frame_intervals(pixel_format, size.width(), size.height())? {
                        FrameIntervals::Discrete(intervals) => intervals,
                        FrameIntervals::Stepwise(_) | FrameIntervals::Continuous(_) => {
                            bail!("stepwise or continuous frame rates are not supported")
                        }
                    };
                for rate in intervals {
                    formats.push(FrameFormat {
                        resolution: Resolution::new(size.width(), size.height()),
                        frame_interval: *rate.fract(),
                    });
                }
            }
        }
        FrameSizes::Stepwise(_) | FrameSizes::Continuous(_) => {
            bail!("stepwise or continuous resolutions are not supported");
        }
    }

    loop {
        if let Some(fmt) = negotiate_format_step(&formats, prefs) {
            return Ok((
                PixFormat::new(
                    fmt.resolution.width(),
                    fmt.resolution.height(),
                    pixel_format,
                ),
                fmt.frame_interval,
            ));
        }

        log::debug!("failed to negotiate format with prefs {:?}", prefs);
        if !relax(&mut prefs) {
            break;
        }
        log::debug!("retrying with new prefs {:?}", prefs);
    }

    bail!("failed to negotiate a webcam format")
}

/// Drops the least preferred constraint. Returns `false` when there was nothing left to drop.
fn relax(prefs: &mut FramePrefs) -> bool {
    match prefs.pref {
        ParamPreference::Resolution => {
            prefs.fps.take().is_some() || prefs.resolution.take().is_some()
        }
        ParamPreference::Framerate => {
            prefs.resolution.take().is_some() || prefs.fps.take().is_some()
        }
    }
}

fn negotiate_format_step(formats: &[FrameFormat], prefs: FramePrefs) -> Option<FrameFormat> {
    let mut eligible = formats
        .iter()
        .filter(|fmt| {
            prefs.resolution.map_or(true, |res| {
                fmt.resolution.width() >= res.width() && fmt.resolution.height() >= res.height()
            }) && prefs.fps.map_or(true, |fps| {
                (1.0 / fmt.frame_interval.as_f32()).round() >= fps as f32
            })
        })
        .copied()
        .collect::<Vec<_>>();
    match prefs.pref {
        ParamPreference::Resolution => {
            eligible.sort_by_key(|fmt| (fmt.resolution.num_pixels(), Reverse(fmt.frame_interval)))
        }
        ParamPreference::Framerate => {
            eligible.sort_by_key(|fmt| (Reverse(fmt.frame_interval), fmt.resolution.num_pixels()))
        }
    }
    eligible.last().copied()
}

/// A webcam yielding a stream of [`Image`]s.
pub struct Webcam {
    stream: ReadStream,
    resolution: Resolution,
    t_dequeue: Timer,
    t_decode: Timer,
}

/// Forces the device used by [`Webcam`]s opened without an explicit name.
pub const ENV_VAR_WEBCAM_NAME: &str = "POSECAM_WEBCAM_NAME";

impl Webcam {
    /// Opens the first supported webcam found.
    ///
    /// This function can block for a significant amount of time while the webcam initializes (on
    /// the order of hundreds of milliseconds).
    pub fn open(options: WebcamOptions) -> anyhow::Result<Self> {
        if let Ok(name) = env::var(ENV_VAR_WEBCAM_NAME) {
            log::debug!("webcam override: `{ENV_VAR_WEBCAM_NAME}` is set to '{name}'");
        }

        let mut denied = false;
        for res in linuxvideo::list()? {
            match res {
                Ok(dev) => match Self::open_impl(dev, &options) {
                    Ok(Some(webcam)) => return Ok(webcam),
                    Ok(None) => {}
                    Err(e) => {
                        denied |= is_permission_denied(&e);
                        log::debug!("{e:#}");
                    }
                },
                Err(e) => {
                    denied |= e.kind() == io::ErrorKind::PermissionDenied;
                    log::warn!("{e}");
                }
            }
        }

        if denied {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied))
                .context("no accessible webcam device found");
        }
        bail!("no supported webcam device found")
    }

    fn open_impl(dev: Device, options: &WebcamOptions) -> anyhow::Result<Option<Self>> {
        let caps = dev.capabilities()?;
        let cam_name_from_env = env::var(ENV_VAR_WEBCAM_NAME).ok();
        if let Some(name) = options.name.as_deref().or(cam_name_from_env.as_deref()) {
            if caps.card() != name {
                return Ok(None);
            }
        }

        let cap_flags = caps.device_capabilities();
        let path = dev.path()?;
        log::debug!(
            "device {} ({}) capabilities: {:?}",
            caps.card(),
            path.display(),
            cap_flags,
        );

        if !cap_flags.contains(CapabilityFlags::VIDEO_CAPTURE) {
            return Ok(None);
        }

        let (pixfmt, fract) = negotiate_format(&dev, options.frame)?;
        let capture = dev.video_capture(pixfmt)?;
        let format = capture.format();
        let resolution = Resolution::new(format.width(), format.height());
        let actual = capture.set_frame_interval(fract)?;

        log::info!(
            "opened {} ({}), {} @ {:.1}Hz",
            caps.card(),
            path.display(),
            resolution,
            1.0 / actual.as_f32(),
        );

        let stream = capture.into_stream(2)?;

        Ok(Some(Self {
            stream,
            resolution,
            t_dequeue: Timer::new("dequeue"),
            t_decode: Timer::new("decode"),
        }))
    }

    /// The negotiated capture resolution.
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Reads the next frame from the camera.
    ///
    /// If no frame is available, this method will block until one is.
    pub fn read(&mut self) -> anyhow::Result<Image> {
        let dequeue_guard = self.t_dequeue.start();
        let resolution = self.resolution;
        let t_decode = &self.t_decode;
        self.stream
            .dequeue(|buf| {
                drop(dequeue_guard);
                let image = match t_decode.time(|| Image::decode_jpeg(&buf)) {
                    Ok(image) => image,
                    Err(e) => {
                        // Webcams occasionally deliver corrupted MJPG frames. Skipping them would
                        // cause a latency spike, so a blank frame is handed out instead.
                        log::error!("webcam decode error: {e:#}");
                        Image::new(resolution.width(), resolution.height())
                    }
                };
                Ok(image)
            })
            .map_err(Into::into)
    }

    /// Returns profiling timers for webcam access and decoding.
    pub fn timers(&self) -> impl Iterator<Item = &Timer> + '_ {
        [&self.t_dequeue, &self.t_decode].into_iter()
    }
}

fn is_permission_denied(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        cause
            .downcast_ref::<io::Error>()
            .map_or(false, |io| io.kind() == io::ErrorKind::PermissionDenied)
    })
}

/// How many frames pass between two logs of the webcam timers.
const TIMER_LOG_INTERVAL: u32 = 300;

/// A [`Camera`] backed by a V4L2 [`Webcam`].
///
/// Acquiring it opens the device and starts a capture thread. Frames are displayed at the
/// capture resolution unless a [`DisplaySize`] is configured.
#[derive(Default)]
pub struct WebcamCamera {
    options: WebcamOptions,
    display: Option<DisplaySize>,
    on_frame: Option<FrameHook>,
}

impl WebcamCamera {
    pub fn new(options: WebcamOptions) -> Self {
        Self {
            options,
            display: None,
            on_frame: None,
        }
    }

    pub fn with_display_size(mut self, display: DisplaySize) -> Self {
        self.display = Some(display);
        self
    }

    /// Registers a callback that sees every captured frame, on the capture thread.
    ///
    /// This is how a viewer gets to show the live video independently of the pose loop's pace.
    pub fn on_frame(mut self, hook: impl FnMut(&std::sync::Arc<Image>) + Send + 'static) -> Self {
        self.on_frame = Some(Box::new(hook));
        self
    }
}

impl Camera for WebcamCamera {
    type Source = LiveFeed;

    async fn acquire(self) -> Result<LiveFeed, CameraError> {
        let options = self.options;
        let opened = tokio::task::spawn_blocking(move || Webcam::open(options))
            .await
            .map_err(|e| CameraError::DeviceUnavailable(e.to_string()))?;
        let mut webcam = opened.map_err(|e| {
            if is_permission_denied(&e) {
                CameraError::PermissionDenied
            } else {
                CameraError::DeviceUnavailable(format!("{e:#}"))
            }
        })?;

        let display = self
            .display
            .unwrap_or_else(|| DisplaySize::new(webcam.resolution()));

        let mut frames = 0;
        LiveFeed::spawn(
            "webcam",
            move || {
                let image = webcam.read()?;
                frames += 1;
                if frames % TIMER_LOG_INTERVAL == 0 {
                    log::trace!("webcam: {}", itertools::join(webcam.timers(), ", "));
                }
                Ok(image)
            },
            display,
            self.on_frame,
        )
        .map_err(|e| CameraError::DeviceUnavailable(format!("{e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(w: u32, h: u32, fps: u32) -> FrameFormat {
        FrameFormat {
            resolution: Resolution::new(w, h),
            frame_interval: Fract::new(1, fps),
        }
    }

    fn formats() -> Vec<FrameFormat> {
        vec![
            fmt(640, 480, 30),
            fmt(640, 480, 60),
            fmt(1280, 720, 30),
            fmt(1920, 1080, 15),
        ]
    }

    fn prefs(
        resolution: Option<Resolution>,
        fps: Option<u32>,
        pref: ParamPreference,
    ) -> FramePrefs {
        FramePrefs {
            resolution,
            fps,
            pref,
        }
    }

    #[test]
    fn prefers_resolution_at_desired_rate() {
        let chosen = negotiate_format_step(
            &formats(),
            prefs(None, Some(30), ParamPreference::Resolution),
        )
        .unwrap();
        assert_eq!(chosen.resolution, Resolution::RES_720P);
    }

    #[test]
    fn prefers_framerate() {
        let chosen =
            negotiate_format_step(&formats(), prefs(None, None, ParamPreference::Framerate))
                .unwrap();
        assert_eq!(chosen.resolution, Resolution::VGA);
        assert_eq!(chosen.frame_interval, Fract::new(1, 60));
    }

    #[test]
    fn unsatisfiable_prefs() {
        let p = prefs(
            Some(Resolution::new(1920, 1080)),
            Some(60),
            ParamPreference::Resolution,
        );
        assert!(negotiate_format_step(&formats(), p).is_none());
    }

    #[test]
    fn relax_drops_the_other_constraint_first() {
        let mut p = prefs(
            Some(Resolution::new(1920, 1080)),
            Some(60),
            ParamPreference::Resolution,
        );
        assert!(relax(&mut p));
        assert_eq!(p.fps, None);
        assert!(p.resolution.is_some());
        assert_eq!(
            negotiate_format_step(&formats(), p).unwrap().resolution,
            Resolution::new(1920, 1080)
        );

        assert!(relax(&mut p));
        assert!(!relax(&mut p));
    }

    #[test]
    fn permission_denied_in_error_chain() {
        let err = Err::<(), _>(io::Error::from(io::ErrorKind::PermissionDenied))
            .context("opening /dev/video0")
            .unwrap_err();
        assert!(is_permission_denied(&err));
        assert!(!is_permission_denied(&anyhow::anyhow!("no device")));
    }
}
