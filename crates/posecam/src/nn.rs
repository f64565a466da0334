//! Neural Network inference.
//!
//! Networks are ONNX files executed on the CPU by [`tract_onnx`]. The [`Cnn`] wrapper turns a
//! camera [`Image`] into the network's input tensor, letterboxing it to the network's aspect
//! ratio, and the returned [`Letterbox`] maps network-space coordinates back onto the frame.

use std::{
    borrow::Cow,
    fmt,
    ops::RangeInclusive,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context};
use tract_onnx::prelude::{
    tract_ndarray::Array4, tvec, Datum, DatumExt, DatumType, Framework, Graph,
    InferenceModelExt, IntoTensor, SimplePlan, TVec, TValue, Tensor, TypedFact, TypedOp,
};

use crate::{
    image::{Color, Image},
    resolution::Resolution,
};

type Model = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Where the bytes of an ONNX model come from.
#[derive(Clone)]
pub enum ModelSource {
    /// A file on the local file system. Must have an `.onnx` extension.
    Path(PathBuf),
    /// An `http(s)` URL that is downloaded when the model is loaded.
    Url(String),
    /// An in-memory ONNX file.
    Bytes(Arc<[u8]>),
}

impl ModelSource {
    /// Reads the model data. This performs blocking I/O.
    pub fn fetch(&self) -> anyhow::Result<Cow<'_, [u8]>> {
        match self {
            Self::Path(path) => {
                match path.extension() {
                    Some(ext) if ext == "onnx" => {}
                    _ => bail!("neural network file must have `.onnx` extension"),
                }
                let data = std::fs::read(path)
                    .with_context(|| format!("failed to read '{}'", path.display()))?;
                Ok(data.into())
            }
            Self::Url(url) => {
                log::info!("downloading model from {url}");
                let response = reqwest::blocking::get(url)?.error_for_status()?;
                let data = response.bytes()?;
                log::debug!("downloaded {} bytes from {url}", data.len());
                Ok(data.to_vec().into())
            }
            Self::Bytes(bytes) => Ok(Cow::Borrowed(bytes)),
        }
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "'{}'", path.display()),
            Self::Url(url) => f.write_str(url),
            Self::Bytes(bytes) => write!(f, "<{} bytes in memory>", bytes.len()),
        }
    }
}

impl fmt::Debug for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<&Path> for ModelSource {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

impl From<PathBuf> for ModelSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

/// Neural network loader.
pub struct Loader<'a> {
    model_data: Cow<'a, [u8]>,
    outputs: Option<Vec<usize>>,
    input_fact: Option<(DatumType, Vec<usize>)>,
}

impl<'a> Loader<'a> {
    fn new(data: Cow<'a, [u8]>) -> Self {
        Self {
            model_data: data,
            outputs: None,
            input_fact: None,
        }
    }

    /// Only compute the specified outputs during inference.
    ///
    /// This takes a list of [`usize`]s corresponding to network output indices. When called, the
    /// [`Outputs`] returned from [`NeuralNetwork::estimate`] will only contain the chosen output
    /// tensors, in the given order.
    pub fn with_output_selection<O>(mut self, outputs: O) -> Self
    where
        O: Into<Vec<usize>>,
    {
        self.outputs = Some(outputs.into());
        self
    }

    /// Fixes the type and shape of the network's (single) input.
    ///
    /// Required for networks exported with symbolic input dimensions.
    pub fn with_input_shape(mut self, datum_type: DatumType, shape: &[usize]) -> Self {
        self.input_fact = Some((datum_type, shape.to_vec()));
        self
    }

    /// Loads and optimizes the network.
    ///
    /// Returns an error if the network data is malformed, if the network data is incomplete, or if
    /// the network uses unimplemented operations.
    pub fn load(self) -> anyhow::Result<NeuralNetwork> {
        let mut graph = tract_onnx::onnx().model_for_read(&mut &*self.model_data)?;
        if let Some((datum_type, shape)) = &self.input_fact {
            let fact = match datum_type {
                DatumType::I32 => i32::fact(shape.iter().copied()),
                DatumType::F32 => f32::fact(shape.iter().copied()),
                other => bail!("unsupported network input type {other:?}"),
            };
            graph = graph.with_input_fact(0, fact.into())?;
        }
        let graph = graph.into_optimized()?;
        let outputs = graph.output_outlets()?;
        let selected_outputs = match self.outputs {
            Some(indices) => indices
                .iter()
                .map(|&i| {
                    outputs.get(i).copied().with_context(|| {
                        format!("network has {} outputs, cannot select #{i}", outputs.len())
                    })
                })
                .collect::<anyhow::Result<Vec<_>>>()?,
            None => outputs.to_vec(),
        };
        let model = SimplePlan::new_for_outputs(graph, &selected_outputs)?;

        Ok(NeuralNetwork(Arc::new(model)))
    }
}

/// A neural network that can be used for inference.
///
/// This is a cheaply [`Clone`]able handle to the underlying network structures.
#[derive(Clone)]
pub struct NeuralNetwork(Arc<Model>);

impl NeuralNetwork {
    /// Prepares loading a pre-trained model from an in-memory ONNX file.
    pub fn from_onnx(raw: &[u8]) -> Loader<'_> {
        Loader::new(raw.into())
    }

    /// Returns the number of input nodes of the network.
    pub fn num_inputs(&self) -> usize {
        self.0.model().inputs.len()
    }

    /// Returns the concrete type and shape of input `index`.
    pub fn input_fact(&self, index: usize) -> anyhow::Result<(DatumType, TVec<usize>)> {
        let fact = self.0.model().input_fact(index)?;
        let shape = fact.shape.as_concrete().with_context(|| {
            format!(
                "network input #{index} has symbolic shape {:?}; an explicit input resolution is needed",
                fact.shape
            )
        })?;
        Ok((fact.datum_type, shape.into()))
    }

    /// Runs the network on a set of input tensors, returning the estimated [`Outputs`].
    #[doc(alias = "infer")]
    pub fn estimate(&self, inputs: TVec<Tensor>) -> anyhow::Result<Outputs> {
        let outputs = self.0.run(
            inputs
                .into_iter()
                .map(|t| TValue::from_const(Arc::new(t)))
                .collect(),
        )?;
        Ok(Outputs {
            inner: outputs.into_iter().map(TValue::into_tensor).collect(),
        })
    }
}

/// The result of a neural network inference pass.
///
/// This is a list of tensors corresponding to the network's (selected) output nodes.
#[derive(Debug)]
pub struct Outputs {
    inner: TVec<Tensor>,
}

impl Outputs {
    fn get(&self, index: usize) -> anyhow::Result<&Tensor> {
        self.inner
            .get(index)
            .with_context(|| format!("network produced no output #{index}"))
    }

    /// Returns the shape of output `index`.
    pub fn shape(&self, index: usize) -> anyhow::Result<&[usize]> {
        Ok(self.get(index)?.shape())
    }

    /// Returns the `f32` data of output `index`, after checking its shape against `expected`.
    pub fn f32_with_shape(&self, index: usize, expected: &[usize]) -> anyhow::Result<&[f32]> {
        let tensor = self.get(index)?;
        if tensor.shape() != expected {
            bail!(
                "network output #{index} has shape {:?}, expected {:?}",
                tensor.shape(),
                expected
            );
        }
        Ok(tensor.as_slice::<f32>()?)
    }
}

/// Maps 8-bit sRGB colors to network input values.
#[derive(Debug, Clone, PartialEq)]
pub enum ColorMapper {
    /// Uniformly maps sRGB values to a floating-point range.
    ///
    /// Note that this operates on *non-linear* sRGB colors, but maps them linearly to the target
    /// range.
    Linear(RangeInclusive<f32>),
    /// Passes the 8-bit channel values through as `i32`s.
    Raw,
}

impl ColorMapper {
    pub fn linear(target_range: RangeInclusive<f32>) -> Self {
        assert!(target_range.end() > target_range.start());
        Self::Linear(target_range)
    }

    fn datum_type(&self) -> DatumType {
        match self {
            Self::Linear(_) => f32::datum_type(),
            Self::Raw => i32::datum_type(),
        }
    }

    fn map_f32(start: f32, end: f32, color: Color) -> [f32; 3] {
        let adjust_range = (end - start) / 255.0;
        [color.r(), color.g(), color.b()].map(|col| col as f32 * adjust_range + start)
    }

    fn map_i32(color: Color) -> [i32; 3] {
        [color.r(), color.g(), color.b()].map(i32::from)
    }
}

/// Describes in what order a CNN expects its input image data.
///
/// - `N` is the number of images, fixed at 1.
/// - `C` is the number of color channels, 3 for RGB inputs.
/// - `H` and `W` are the height and width of the input, respectively.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CnnInputShape {
    /// Shape is `[N, C, H, W]`.
    NCHW,
    /// Shape is `[N, H, W, C]`.
    NHWC,
}

impl CnnInputShape {
    fn dims(self, res: Resolution) -> [usize; 4] {
        let (w, h) = (res.width() as usize, res.height() as usize);
        match self {
            Self::NCHW => [1, 3, h, w],
            Self::NHWC => [1, h, w, 3],
        }
    }

    fn resolution(self, shape: &[usize]) -> Option<Resolution> {
        let (w, h) = match (self, shape) {
            (Self::NCHW, &[1, 3, h, w]) | (Self::NHWC, &[1, h, w, 3]) => (w, h),
            _ => return None,
        };
        Some(Resolution::new(w.try_into().ok()?, h.try_into().ok()?))
    }
}

/// Scales and pads a frame so that it fits a network input without distorting it.
///
/// The frame is scaled uniformly until it touches the input's borders, and centered. The
/// remaining area is filled with black.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    frame: Resolution,
}

impl Letterbox {
    /// Computes the letterbox placing `frame` inside `input`.
    ///
    /// # Panics
    ///
    /// Panics if `frame` has a zero dimension.
    pub fn new(frame: Resolution, input: Resolution) -> Self {
        assert!(!frame.is_empty(), "cannot letterbox empty {frame} frame");
        let scale = f32::min(
            input.width() as f32 / frame.width() as f32,
            input.height() as f32 / frame.height() as f32,
        );
        Self {
            scale,
            pad_x: (input.width() as f32 - frame.width() as f32 * scale) / 2.0,
            pad_y: (input.height() as f32 - frame.height() as f32 * scale) / 2.0,
            frame,
        }
    }

    /// Maps network input coordinates to frame coordinates.
    pub fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }

    /// Factor by which lengths in input space must be divided to get frame space lengths.
    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Samples the frame color seen by input pixel `(x, y)`.
    pub fn sample(&self, image: &Image, x: usize, y: usize) -> Color {
        let (fx, fy) = self.to_frame(x as f32 + 0.5, y as f32 + 0.5);
        if fx < 0.0 || fy < 0.0 {
            return Color::BLACK;
        }
        let (fx, fy) = (fx as u32, fy as u32);
        if fx >= self.frame.width() || fy >= self.frame.height() {
            return Color::BLACK;
        }
        image.get(fx, fy)
    }
}

/// A convolutional neural network (CNN) that operates on image data.
///
/// Like the underlying [`NeuralNetwork`], this is a cheaply [`Clone`]able handle to the underlying
/// data.
#[derive(Clone)]
pub struct Cnn {
    nn: NeuralNetwork,
    shape: CnnInputShape,
    input_res: Resolution,
    color_mapper: ColorMapper,
}

impl Cnn {
    /// Creates a CNN wrapper from a [`NeuralNetwork`].
    ///
    /// The network must have exactly one input with a shape that matches the given
    /// [`CnnInputShape`], and an element type matching the [`ColorMapper`].
    pub fn new(
        nn: NeuralNetwork,
        shape: CnnInputShape,
        color_mapper: ColorMapper,
    ) -> anyhow::Result<Self> {
        if nn.num_inputs() != 1 {
            bail!(
                "CNN network has to take exactly 1 input, this one takes {}",
                nn.num_inputs(),
            );
        }

        let (datum_type, tensor_shape) = nn.input_fact(0)?;
        let input_res = shape.resolution(&tensor_shape).with_context(|| {
            format!("invalid model input shape for {shape:?} CNN: {tensor_shape:?}")
        })?;
        if datum_type != color_mapper.datum_type() {
            bail!(
                "network input has element type {datum_type:?}, but color mapper produces {:?}",
                color_mapper.datum_type()
            );
        }

        Ok(Self {
            nn,
            shape,
            input_res,
            color_mapper,
        })
    }

    /// Returns the expected input image size.
    #[inline]
    pub fn input_resolution(&self) -> Resolution {
        self.input_res
    }

    /// Returns the type and shape of the input tensor needed for `res`-sized inputs.
    pub fn input_fact_for(
        shape: CnnInputShape,
        color_mapper: &ColorMapper,
        res: Resolution,
    ) -> (DatumType, [usize; 4]) {
        (color_mapper.datum_type(), shape.dims(res))
    }

    /// Runs the network on an input image, returning the estimated outputs and the letterbox that
    /// was applied to the image.
    pub fn estimate(&self, image: &Image) -> anyhow::Result<(Outputs, Letterbox)> {
        if image.resolution().is_empty() {
            bail!("cannot run network on empty {} image", image.resolution());
        }
        let letterbox = Letterbox::new(image.resolution(), self.input_res);
        let tensor = self.input_tensor(image, &letterbox);
        let outputs = self.nn.estimate(tvec![tensor])?;
        Ok((outputs, letterbox))
    }

    fn input_tensor(&self, image: &Image, letterbox: &Letterbox) -> Tensor {
        let dims = self.shape.dims(self.input_res);
        let shape = self.shape;
        // Channel, Y, X
        let index = move |[_, a, b, c]: [usize; 4]| match shape {
            CnnInputShape::NCHW => (a, b, c),
            CnnInputShape::NHWC => (c, a, b),
        };
        let dims = (dims[0], dims[1], dims[2], dims[3]);

        match &self.color_mapper {
            ColorMapper::Linear(range) => {
                let (start, end) = (*range.start(), *range.end());
                Array4::from_shape_fn(dims, |(n, a, b, c)| {
                    let (ch, y, x) = index([n, a, b, c]);
                    ColorMapper::map_f32(start, end, letterbox.sample(image, x, y))[ch]
                })
                .into_tensor()
            }
            ColorMapper::Raw => Array4::from_shape_fn(dims, |(n, a, b, c)| {
                let (ch, y, x) = index([n, a, b, c]);
                ColorMapper::map_i32(letterbox.sample(image, x, y))[ch]
            })
            .into_tensor(),
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn color_mapper() {
        assert_eq!(
            ColorMapper::map_f32(-1.0, 1.0, Color::BLACK),
            [-1.0, -1.0, -1.0]
        );
        assert_eq!(ColorMapper::map_f32(-1.0, 1.0, Color::WHITE), [1.0, 1.0, 1.0]);
        assert_eq!(ColorMapper::map_f32(1.0, 2.0, Color::WHITE), [2.0, 2.0, 2.0]);
        assert_eq!(ColorMapper::map_i32(Color::from_rgb8(1, 2, 3)), [1, 2, 3]);
    }

    #[test]
    fn input_shapes() {
        assert_eq!(
            CnnInputShape::NHWC.resolution(&[1, 192, 256, 3]),
            Some(Resolution::new(256, 192))
        );
        assert_eq!(
            CnnInputShape::NCHW.resolution(&[1, 3, 256, 256]),
            Some(Resolution::new(256, 256))
        );
        assert_eq!(CnnInputShape::NCHW.resolution(&[1, 256, 256, 3]), None);
        assert_eq!(CnnInputShape::NHWC.dims(Resolution::VGA), [1, 480, 640, 3]);
    }

    #[test]
    fn letterbox_wide_frame() {
        // 640x480 into 192x192: scale 0.3, content is 192x144, padded by 24 on top and bottom.
        let lb = Letterbox::new(Resolution::VGA, Resolution::new(192, 192));
        assert_relative_eq!(lb.scale(), 0.3);
        let (x, y) = lb.to_frame(96.0, 96.0);
        assert_relative_eq!(x, 320.0, epsilon = 1e-3);
        assert_relative_eq!(y, 240.0, epsilon = 1e-3);
        let (x, y) = lb.to_frame(0.0, 24.0);
        assert_relative_eq!(x, 0.0, epsilon = 1e-3);
        assert_relative_eq!(y, 0.0, epsilon = 1e-3);
    }

    #[test]
    fn letterbox_sampling_pads_with_black() {
        let mut image = Image::new(4, 2);
        image.clear(Color::WHITE);
        let lb = Letterbox::new(image.resolution(), Resolution::new(4, 4));
        assert_eq!(lb.sample(&image, 0, 0), Color::BLACK);
        assert_eq!(lb.sample(&image, 0, 1), Color::WHITE);
        assert_eq!(lb.sample(&image, 3, 2), Color::WHITE);
        assert_eq!(lb.sample(&image, 3, 3), Color::BLACK);
    }

    #[test]
    fn missing_model_file() {
        let source = ModelSource::Path("/nonexistent/posecam/model.onnx".into());
        assert!(source.fetch().is_err());

        let source = ModelSource::Path("model.tflite".into());
        let err = source.fetch().unwrap_err();
        assert!(err.to_string().contains(".onnx"));
    }

    #[test]
    fn in_memory_source() {
        let source = ModelSource::Bytes(Arc::from(&b"onnx"[..]));
        assert_eq!(&*source.fetch().unwrap(), b"onnx");
        assert_eq!(source.to_string(), "<4 bytes in memory>");
    }
}
