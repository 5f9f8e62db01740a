use super::types::{Frame, InputTensor, PixelOrder};
use crate::error::FrameError;
use ndarray::{Array3, ArrayView3};

/// Label value that never names a class and is skipped by accuracy bookkeeping
pub const IGNORE_LABEL: i64 = 255;

/// Converts frames into model input tensors
///
/// Models take RGB planes. Frames are expected at the model's resolution
/// already; nothing is resized here.
#[derive(Debug, Clone, Default)]
pub struct FramePreprocessor {
    expected_size: Option<(u32, u32)>,
}

impl FramePreprocessor {
    /// `expected_size` is the model's fixed (width, height), `None` for dynamic graphs
    pub fn new(expected_size: Option<(u32, u32)>) -> Self {
        Self { expected_size }
    }

    /// Preprocess a frame into a normalized NCHW tensor
    ///
    /// Steps:
    /// 1. Validate channel count, buffer length and resolution
    /// 2. Transpose from HWC to NCHW format, BGR frames land in RGB planes
    /// 3. Convert to float and normalize to [0, 1]
    ///
    /// Returns: Array4<f32> with shape [1, 3, height, width]
    pub fn prepare(&self, frame: &Frame) -> Result<InputTensor, FrameError> {
        let _span = tracing::debug_span!("prepare").entered();
        let frame_id = &frame.correlator().frame_id;

        if frame.channels() != 3 {
            return Err(FrameError::UnsupportedChannels {
                frame_id: frame_id.clone(),
                channels: frame.channels(),
            });
        }

        let (width, height) = (frame.width(), frame.height());
        if let Some(expected) = self.expected_size {
            if expected != (width, height) {
                return Err(FrameError::ResolutionMismatch {
                    frame_id: frame_id.clone(),
                    expected,
                    actual: (width, height),
                });
            }
        }

        let (w, h) = (width as usize, height as usize);
        let expected_len = w * h * 3;
        let malformed = || FrameError::MalformedBuffer {
            frame_id: frame_id.clone(),
            width,
            height,
            expected: expected_len,
            actual: frame.data().len(),
        };
        if frame.data().len() != expected_len {
            return Err(malformed());
        }
        let hwc = ArrayView3::from_shape((h, w, 3), frame.data()).map_err(|_| malformed())?;

        let order = frame.order();
        let mut tensor = InputTensor::zeros((1, 3, h, w));
        for ((y, x, c), &value) in hwc.indexed_iter() {
            let plane = match order {
                PixelOrder::Rgb8 => c,
                PixelOrder::Bgr8 => 2 - c,
            };
            tensor[[0, plane, y, x]] = value as f32 / 255.0;
        }

        Ok(tensor)
    }

    /// Ignore-filled label array shaped (1, height, width) for an input tensor
    ///
    /// Evaluation helper for models exported with a label input, such as
    /// accuracy runs over a folder. The live inference path never calls it.
    pub fn placeholder_labels(input: &InputTensor) -> Array3<i64> {
        let shape = input.shape();
        Array3::from_elem((shape[0], shape[2], shape[3]), IGNORE_LABEL)
    }
}
