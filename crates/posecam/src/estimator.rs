//! The pose estimator interface used by the pose loop, and its neural network implementation.
//!
//! A [`ModelLoader`] is turned into a [`PoseEstimator`] exactly once per loop. The estimator is
//! then asked for the pose in each frame, one call at a time.

use std::{
    env,
    fmt,
    path::PathBuf,
    str::FromStr,
    sync::Arc,
};

use anyhow::{anyhow, bail, Context};

use crate::{
    error::AssetLoadError,
    frame::Frame,
    models::{
        landmark::{Complexity, LandmarkNetwork},
        movenet::{MoveNet, MoveNetType},
        posenet::PoseNet,
        PoseNetwork,
    },
    nn::{Cnn, ModelSource, NeuralNetwork},
    pose::Pose,
    resolution::Resolution,
    timer::Timer,
};

/// Environment variable naming the directory that default model files are loaded from.
pub const MODEL_DIR_VAR: &str = "POSECAM_MODEL_DIR";

const DEFAULT_MODEL_DIR: &str = "models";

/// Estimates the pose of a single subject in a frame.
///
/// Estimators are stateful, so calls take `&mut self` and can never overlap.
#[allow(async_fn_in_trait)]
pub trait PoseEstimator {
    /// Returns the pose in `frame`, in the frame's native coordinates, or `None` if no subject
    /// was found.
    ///
    /// Errors are per-frame failures; the estimator must remain usable afterwards.
    async fn estimate(&mut self, frame: &Frame) -> anyhow::Result<Option<Pose>>;

    /// Returns profiling timers for this estimator.
    fn timers(&self) -> impl Iterator<Item = &Timer> {
        std::iter::empty()
    }
}

/// Asynchronously creates a [`PoseEstimator`], for example by loading model weights.
#[allow(async_fn_in_trait)]
pub trait ModelLoader {
    type Estimator: PoseEstimator;

    async fn load(self) -> Result<Self::Estimator, AssetLoadError>;
}

/// The supported pose estimation networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// Dense 33-point landmark tracker, including world-space keypoints.
    Landmark(Complexity),
    /// PoseNet (MobileNet) single pose detector with 17 keypoints.
    PoseNet,
    /// MoveNet single pose detector with 17 keypoints.
    MoveNet(MoveNetType),
}

impl ModelKind {
    fn network(self) -> Arc<dyn PoseNetwork> {
        match self {
            Self::Landmark(complexity) => Arc::new(LandmarkNetwork::new(complexity)),
            Self::PoseNet => Arc::new(PoseNet),
            Self::MoveNet(ty) => Arc::new(MoveNet::new(ty)),
        }
    }

    /// Name of the ONNX file looked for in the model directory.
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Landmark(Complexity::Lite) => "pose_landmark_lite.onnx",
            Self::Landmark(Complexity::Full) => "pose_landmark_full.onnx",
            Self::PoseNet => "posenet_mobilenet.onnx",
            Self::MoveNet(MoveNetType::Lightning) => "movenet_singlepose_lightning.onnx",
            Self::MoveNet(MoveNetType::Thunder) => "movenet_singlepose_thunder.onnx",
        }
    }

    /// The network input size used unless configured otherwise.
    pub fn default_input_resolution(self) -> Resolution {
        match self {
            Self::Landmark(_) => Resolution::new(256, 256),
            Self::PoseNet => Resolution::new(257, 257),
            Self::MoveNet(ty) => ty.input_resolution(),
        }
    }

    /// Default `(detection, tracking)` confidence thresholds.
    pub fn default_thresholds(self) -> (f32, f32) {
        match self {
            Self::Landmark(_) => (0.5, 0.5),
            Self::PoseNet => (0.0, 0.0),
            Self::MoveNet(_) => (0.25, 0.25),
        }
    }

    fn fixed_input(self) -> bool {
        matches!(self, Self::MoveNet(_))
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Landmark(Complexity::Lite) => "landmark-lite",
            Self::Landmark(Complexity::Full) => "landmark-full",
            Self::PoseNet => "posenet",
            Self::MoveNet(MoveNetType::Lightning) => "movenet-lightning",
            Self::MoveNet(MoveNetType::Thunder) => "movenet-thunder",
        })
    }
}

impl FromStr for ModelKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "landmark" | "landmark-lite" => Self::Landmark(Complexity::Lite),
            "landmark-full" => Self::Landmark(Complexity::Full),
            "posenet" => Self::PoseNet,
            "movenet" | "movenet-lightning" => Self::MoveNet(MoveNetType::Lightning),
            "movenet-thunder" => Self::MoveNet(MoveNetType::Thunder),
            _ => bail!(
                "unknown model '{s}' (expected one of landmark-lite, landmark-full, posenet, \
                movenet-lightning, movenet-thunder)"
            ),
        })
    }
}

/// Where inference runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    #[default]
    Cpu,
    /// Requests GPU inference. No GPU inference backend is available for the supported networks,
    /// so this falls back to [`Backend::Cpu`] with a warning.
    GpuAccelerated,
}

/// Configuration of a [`NetworkEstimator`]. Loading the options creates the estimator.
#[derive(Debug, Clone)]
pub struct EstimatorOptions {
    model: ModelKind,
    source: Option<ModelSource>,
    backend: Backend,
    min_detection_confidence: Option<f32>,
    min_tracking_confidence: Option<f32>,
    input_resolution: Option<Resolution>,
}

impl Default for EstimatorOptions {
    fn default() -> Self {
        Self::new(ModelKind::MoveNet(MoveNetType::Lightning))
    }
}

impl EstimatorOptions {
    pub fn new(model: ModelKind) -> Self {
        Self {
            model,
            source: None,
            backend: Backend::Cpu,
            min_detection_confidence: None,
            min_tracking_confidence: None,
            input_resolution: None,
        }
    }

    /// Loads the model from `source` instead of the model directory.
    pub fn with_source(mut self, source: impl Into<ModelSource>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Minimum pose score required to report a pose when the previous frame had none.
    pub fn with_min_detection_confidence(mut self, confidence: f32) -> Self {
        self.min_detection_confidence = Some(confidence);
        self
    }

    /// Minimum pose score required to keep reporting a pose that was found in the previous frame.
    pub fn with_min_tracking_confidence(mut self, confidence: f32) -> Self {
        self.min_tracking_confidence = Some(confidence);
        self
    }

    /// Sets the network input resolution.
    ///
    /// Networks with a fixed input size only accept their own size here.
    pub fn with_input_resolution(mut self, res: Resolution) -> Self {
        self.input_resolution = Some(res);
        self
    }

    pub fn model(&self) -> ModelKind {
        self.model
    }

    /// Returns the configured model source, or the default file in the model directory.
    pub fn source(&self) -> ModelSource {
        self.source.clone().unwrap_or_else(|| {
            let dir = env::var_os(MODEL_DIR_VAR)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_DIR));
            ModelSource::Path(dir.join(self.model.file_name()))
        })
    }

    /// Returns the `(detection, tracking)` thresholds in effect.
    pub fn thresholds(&self) -> (f32, f32) {
        let (detection, tracking) = self.model.default_thresholds();
        (
            self.min_detection_confidence.unwrap_or(detection),
            self.min_tracking_confidence.unwrap_or(tracking),
        )
    }

    fn input_resolution(&self) -> anyhow::Result<Resolution> {
        let default = self.model.default_input_resolution();
        match self.input_resolution {
            None => Ok(default),
            Some(res) if res.is_empty() => bail!("invalid network input resolution {res}"),
            Some(res) if self.model.fixed_input() && res != default => bail!(
                "{} only supports an input resolution of {default} (got {res})",
                self.model
            ),
            Some(res) => Ok(res),
        }
    }

    fn load_blocking(&self, source: &ModelSource) -> anyhow::Result<NetworkEstimator> {
        if self.backend == Backend::GpuAccelerated {
            log::warn!(
                "GPU inference is not available for {}, running on the CPU instead",
                self.model
            );
        }

        let network = self.model.network();
        let input_res = self.input_resolution()?;
        let (datum_type, input_shape) =
            Cnn::input_fact_for(network.input_shape(), &network.color_mapper(), input_res);

        let data = source.fetch()?;
        let mut loader =
            NeuralNetwork::from_onnx(&data).with_input_shape(datum_type, &input_shape);
        if let Some(outputs) = network.output_selection() {
            loader = loader.with_output_selection(outputs);
        }
        let nn = loader
            .load()
            .with_context(|| format!("failed to load {} network", network.name()))?;
        let cnn = Cnn::new(nn, network.input_shape(), network.color_mapper())?;
        if cnn.input_resolution() != input_res {
            bail!(
                "network input resolution is {}, expected {input_res}",
                cnn.input_resolution()
            );
        }

        let (detection, tracking) = self.thresholds();
        log::debug!(
            "loaded {} network ({} input, detection threshold {detection}, tracking threshold {tracking})",
            network.name(),
            cnn.input_resolution(),
        );

        Ok(NetworkEstimator {
            network,
            cnn,
            detection,
            tracking,
            tracking_active: false,
            t_infer: Arc::new(Timer::new("infer")),
            t_decode: Arc::new(Timer::new("decode")),
        })
    }
}

impl ModelLoader for EstimatorOptions {
    type Estimator = NetworkEstimator;

    async fn load(self) -> Result<NetworkEstimator, AssetLoadError> {
        let source = self.source();
        let location = source.to_string();
        tokio::task::spawn_blocking(move || self.load_blocking(&source))
            .await
            .map_err(|e| anyhow!("model loading task failed: {e}"))
            .and_then(|result| result)
            .map_err(|e| AssetLoadError::new(location, e))
    }
}

/// [`PoseEstimator`] backed by one of the [`PoseNetwork`]s.
///
/// Inference runs on tokio's blocking thread pool, so the caller's runtime stays responsive.
pub struct NetworkEstimator {
    network: Arc<dyn PoseNetwork>,
    cnn: Cnn,
    detection: f32,
    tracking: f32,
    /// Whether the previous frame produced a pose.
    tracking_active: bool,
    t_infer: Arc<Timer>,
    t_decode: Arc<Timer>,
}

impl NetworkEstimator {
    /// Returns the network's input resolution.
    pub fn input_resolution(&self) -> Resolution {
        self.cnn.input_resolution()
    }

    fn threshold(&self) -> f32 {
        if self.tracking_active {
            self.tracking
        } else {
            self.detection
        }
    }
}

impl PoseEstimator for NetworkEstimator {
    async fn estimate(&mut self, frame: &Frame) -> anyhow::Result<Option<Pose>> {
        let image = frame.shared_image().clone();
        let cnn = self.cnn.clone();
        let network = self.network.clone();
        let (t_infer, t_decode) = (self.t_infer.clone(), self.t_decode.clone());

        let result = tokio::task::spawn_blocking(move || {
            let (outputs, letterbox) = t_infer.time(|| cnn.estimate(&image))?;
            t_decode.time(|| network.decode(&outputs, cnn.input_resolution(), &letterbox))
        })
        .await
        .context("inference task failed")
        .and_then(|result| result);

        let pose = match result {
            Ok(pose) => pose,
            Err(e) => {
                self.tracking_active = false;
                return Err(e);
            }
        };

        let score = pose.score.unwrap_or_else(|| pose.mean_confidence());
        let threshold = self.threshold();
        if score < threshold {
            if self.tracking_active {
                log::trace!("{}: lost pose (score {score} < {threshold})", self.network.name());
            }
            self.tracking_active = false;
            return Ok(None);
        }

        self.tracking_active = true;
        Ok(Some(pose))
    }

    fn timers(&self) -> impl Iterator<Item = &Timer> {
        [&*self.t_infer, &*self.t_decode].into_iter()
    }
}
