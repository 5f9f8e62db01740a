mod onnx;
mod palette;
mod preprocess;
mod runtime;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use onnx::OnnxSegmenter;
pub use palette::{ClassColor, Palette};
pub use preprocess::{FramePreprocessor, IGNORE_LABEL};
pub use runtime::{ModelMode, ModelRuntime, ModelState};
pub use types::{
    ColorFrame, Correlator, Frame, InputTensor, PixelOrder, PredictionMap, SegmentationModel,
};
