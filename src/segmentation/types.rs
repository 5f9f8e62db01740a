use anyhow::Result;
use image::RgbImage;
use ndarray::{Array2, Array4};
use std::sync::Arc;

/// Upper bound on a single inbound frame buffer (4 GiB)
pub const RECEIVE_BUFFER_BYTES: u64 = 1 << 32;

/// Normalized NCHW input tensor with shape [1, 3, height, width], values in [0, 1]
pub type InputTensor = Array4<f32>;

/// Per-pixel class indices, shape [height, width]
pub type PredictionMap = Array2<u32>;

/// Identity of the input that produced a result
///
/// Carried from a [`Frame`] to its [`ColorFrame`] untouched so consumers can
/// match outputs to inputs even when the channels drop frames.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Correlator {
    pub frame_id: String,
    pub seq: u64,
    pub stamp_ms: i64,
}

impl Correlator {
    pub fn new(frame_id: impl Into<String>, seq: u64, stamp_ms: i64) -> Self {
        Self {
            frame_id: frame_id.into(),
            seq,
            stamp_ms,
        }
    }
}

/// Byte order of the three channels in a frame buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelOrder {
    Rgb8,
    Bgr8,
}

/// One ingested image sample
///
/// The pixel buffer is shared and never mutated after construction.
#[derive(Debug, Clone)]
pub struct Frame {
    width: u32,
    height: u32,
    channels: u32,
    order: PixelOrder,
    data: Arc<[u8]>,
    correlator: Correlator,
}

impl Frame {
    /// Wrap a raw interleaved buffer (height x width x channels)
    pub fn new(
        width: u32,
        height: u32,
        channels: u32,
        order: PixelOrder,
        data: Vec<u8>,
        correlator: Correlator,
    ) -> Result<Self> {
        if data.len() as u64 > RECEIVE_BUFFER_BYTES {
            anyhow::bail!(
                "frame {} is {} bytes, above the {} byte receive bound",
                correlator.frame_id,
                data.len(),
                RECEIVE_BUFFER_BYTES
            );
        }

        Ok(Self {
            width,
            height,
            channels,
            order,
            data: data.into(),
            correlator,
        })
    }

    pub fn from_rgb(image: RgbImage, correlator: Correlator) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            channels: 3,
            order: PixelOrder::Rgb8,
            data: image.into_raw().into(),
            correlator,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    pub fn order(&self) -> PixelOrder {
        self.order
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }
}

/// Colorized prediction ready for publication
#[derive(Debug, Clone)]
pub struct ColorFrame {
    image: RgbImage,
    correlator: Correlator,
}

impl ColorFrame {
    pub fn new(image: RgbImage, correlator: Correlator) -> Self {
        Self { image, correlator }
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Interleaved bytes in the requested channel order
    pub fn to_bytes(&self, order: PixelOrder) -> Vec<u8> {
        match order {
            PixelOrder::Rgb8 => self.image.as_raw().clone(),
            PixelOrder::Bgr8 => self
                .image
                .pixels()
                .flat_map(|p| [p[2], p[1], p[0]])
                .collect(),
        }
    }
}

/// Trait for segmentation backends
/// Allows swapping the ONNX session for stubs in tests
pub trait SegmentationModel: Send {
    /// Run a forward pass and return the arg-max class per pixel
    ///
    /// # Arguments
    /// * `input` - Normalized NCHW tensor, never modified
    fn infer(&mut self, input: &InputTensor) -> Result<PredictionMap>;

    /// Switch the backend to inference-only execution
    ///
    /// Called exactly once by [`super::ModelRuntime`] before the first
    /// forward pass.
    fn enter_inference_mode(&mut self) {
        // Default implementation: no-op for graphs that are inference-only
    }

    /// Number of classes the model predicts, if the graph declares it
    fn num_classes(&self) -> Option<usize> {
        None
    }

    /// Fixed input dimensions (width, height), if the graph declares them
    fn input_size(&self) -> Option<(u32, u32)> {
        None
    }
}
