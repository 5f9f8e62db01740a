use super::types::{InputTensor, PredictionMap, SegmentationModel};
use crate::config::{Device, Precision};
use crate::error::LoadError;
use anyhow::{bail, Context, Result};
use half::f16;
use ndarray::{Array2, ArrayViewD, Axis, Ix3, Ix4};
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, ExecutionProvider, ExecutionProviderDispatch,
    TensorRTExecutionProvider,
};
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::Session;
use ort::tensor::TensorElementType;
use ort::value::{DynValue, Tensor, ValueType};
use std::path::Path;

/// Semantic segmentation network exported to ONNX
///
/// The graph takes a [1, 3, H, W] image and returns either per-class logits
/// [1, C, H, W] or already reduced class indices [1, H, W].
pub struct OnnxSegmenter {
    session: Session,
    output_name: String,
    precision: Precision,
    num_classes: Option<usize>,
    input_size: Option<(u32, u32)>,
}

impl OnnxSegmenter {
    /// Load a checkpoint and place it on `device`
    ///
    /// # Arguments
    /// * `model_path` - Path to the ONNX checkpoint
    /// * `device` - Execution provider to bind; registration failure is fatal
    /// * `precision` - `Half` feeds f16 tensors to graphs exported in mixed precision
    /// * `intra_threads` - CPU threads available to a single forward pass
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        device: Device,
        precision: Precision,
        intra_threads: usize,
    ) -> Result<Self, LoadError> {
        let path = model_path.as_ref();

        tracing::info!("Loading segmentation model from {} on {}", path.display(), device);

        let builder = session_builder(device, intra_threads).map_err(|e| {
            LoadError::DeviceUnavailable {
                device: device.to_string(),
                reason: format!("{:#}", e),
            }
        })?;

        let session = builder
            .commit_from_file(path)
            .map_err(|e| LoadError::MalformedCheckpoint {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let shape_mismatch = |reason: String| LoadError::ShapeMismatch {
            path: path.to_path_buf(),
            reason,
        };

        let (input_type, input_dims) = session
            .inputs
            .first()
            .and_then(|input| tensor_info(&input.input_type))
            .ok_or_else(|| shape_mismatch("graph has no tensor input".into()))?;
        check_precision(input_type, precision).map_err(shape_mismatch)?;
        if input_dims.len() != 4 || (input_dims[1] > 0 && input_dims[1] != 3) {
            return Err(shape_mismatch(format!(
                "expected a [1, 3, H, W] input, found {:?}",
                input_dims
            )));
        }
        let input_size = (input_dims[2] > 0 && input_dims[3] > 0)
            .then(|| (input_dims[3] as u32, input_dims[2] as u32));

        let output = session
            .outputs
            .first()
            .ok_or_else(|| shape_mismatch("graph has no outputs".into()))?;
        let (_, output_dims) = tensor_info(&output.output_type)
            .ok_or_else(|| shape_mismatch("first output is not a tensor".into()))?;
        let num_classes = match output_dims.len() {
            4 => (output_dims[1] > 0).then(|| output_dims[1] as usize),
            3 => None,
            _ => {
                return Err(shape_mismatch(format!(
                    "expected [1, C, H, W] logits or [1, H, W] indices, found {:?}",
                    output_dims
                )))
            }
        };
        let output_name = output.name.clone();

        tracing::info!(
            "Segmentation model loaded (input {:?}, classes {:?}, precision {:?})",
            input_size,
            num_classes,
            precision
        );

        Ok(Self {
            session,
            output_name,
            precision,
            num_classes,
            input_size,
        })
    }
}

fn tensor_info(value_type: &ValueType) -> Option<(TensorElementType, Vec<i64>)> {
    match value_type {
        ValueType::Tensor { ty, shape, .. } => Some((*ty, shape.iter().copied().collect())),
        _ => None,
    }
}

/// The graph input must take the element type the configured precision feeds
fn check_precision(input_type: TensorElementType, precision: Precision) -> Result<(), String> {
    let expected = match precision {
        Precision::Full => TensorElementType::Float32,
        Precision::Half => TensorElementType::Float16,
    };
    if input_type != expected {
        return Err(format!(
            "precision {:?} feeds {:?} tensors but the graph input takes {:?}",
            precision, expected, input_type
        ));
    }
    Ok(())
}

fn session_builder(device: Device, intra_threads: usize) -> Result<SessionBuilder> {
    let provider = execution_provider(device)?;

    let builder = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(intra_threads)?
        .with_execution_providers([provider])?;

    Ok(builder)
}

fn execution_provider(device: Device) -> Result<ExecutionProviderDispatch> {
    match device {
        Device::Cpu => Ok(CPUExecutionProvider::default().build()),
        Device::Cuda(id) => {
            let provider = CUDAExecutionProvider::default().with_device_id(id);
            ensure_available(&provider, device)?;
            Ok(provider.build().error_on_failure())
        }
        Device::TensorRt(id) => {
            let provider = TensorRTExecutionProvider::default()
                .with_device_id(id)
                .with_engine_cache(true);
            ensure_available(&provider, device)?;
            Ok(provider.build().error_on_failure())
        }
    }
}

fn ensure_available(provider: &impl ExecutionProvider, device: Device) -> Result<()> {
    if !provider.is_available()? {
        bail!("execution provider for {} is not available in this build", device);
    }
    Ok(())
}

impl SegmentationModel for OnnxSegmenter {
    fn infer(&mut self, input: &InputTensor) -> Result<PredictionMap> {
        let _span = tracing::debug_span!("onnx_infer").entered();

        match self.precision {
            Precision::Full => {
                let tensor = Tensor::from_array(input.clone())?;
                let outputs = self
                    .session
                    .run(ort::inputs![tensor])
                    .context("Failed to run inference")?;
                decode_prediction(&outputs[self.output_name.as_str()])
            }
            Precision::Half => {
                let tensor = Tensor::from_array(input.mapv(f16::from_f32))?;
                let outputs = self
                    .session
                    .run(ort::inputs![tensor])
                    .context("Failed to run inference")?;
                decode_prediction(&outputs[self.output_name.as_str()])
            }
        }
    }

    fn enter_inference_mode(&mut self) {
        tracing::debug!("ONNX graph is inference-only, nothing to switch");
    }

    fn num_classes(&self) -> Option<usize> {
        self.num_classes
    }

    fn input_size(&self) -> Option<(u32, u32)> {
        self.input_size
    }
}

fn decode_prediction(value: &DynValue) -> Result<PredictionMap> {
    if let Ok(logits) = value.try_extract_array::<f32>() {
        return argmax_logits(logits);
    }
    if let Ok(logits) = value.try_extract_array::<f16>() {
        let logits = logits.mapv(f32::from);
        return argmax_logits(logits.view());
    }

    let indices = value
        .try_extract_array::<i64>()
        .context("Model output is neither f32/f16 logits nor i64 class indices")?;
    indices_to_prediction(indices)
}

/// Reduce [1, C, H, W] logits to the highest scoring class per pixel
///
/// Ties resolve to the lowest class index.
pub(crate) fn argmax_logits(logits: ArrayViewD<f32>) -> Result<PredictionMap> {
    let logits = logits
        .into_dimensionality::<Ix4>()
        .context("Expected logits shaped [1, C, H, W]")?;
    let (batch, classes, height, width) = logits.dim();
    if batch != 1 {
        bail!("expected a batch of 1, got {}", batch);
    }
    if classes == 0 {
        bail!("model returned zero classes");
    }

    let scores = logits.index_axis(Axis(0), 0);
    let mut prediction = Array2::<u32>::zeros((height, width));

    for ((y, x), class) in prediction.indexed_iter_mut() {
        let mut best = 0;
        let mut best_score = scores[[0, y, x]];
        for c in 1..classes {
            let score = scores[[c, y, x]];
            if score > best_score {
                best = c;
                best_score = score;
            }
        }
        *class = best as u32;
    }

    Ok(prediction)
}

/// Convert [1, H, W] class indices produced by graphs with a built-in arg-max
pub(crate) fn indices_to_prediction(indices: ArrayViewD<i64>) -> Result<PredictionMap> {
    let indices = indices
        .into_dimensionality::<Ix3>()
        .context("Expected class indices shaped [1, H, W]")?;
    if indices.dim().0 != 1 {
        bail!("expected a batch of 1, got {}", indices.dim().0);
    }

    let plane = indices.index_axis(Axis(0), 0);
    let mut prediction = Array2::<u32>::zeros(plane.dim());
    for (target, &class) in prediction.iter_mut().zip(plane.iter()) {
        *target = u32::try_from(class).with_context(|| format!("negative class index {}", class))?;
    }

    Ok(prediction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, Array4};

    #[test]
    fn argmax_picks_highest_logit_per_pixel() {
        // 3 classes over a 1x2 image
        let mut logits = Array4::<f32>::zeros((1, 3, 1, 2));
        logits[[0, 2, 0, 0]] = 5.0;
        logits[[0, 1, 0, 1]] = 0.5;
        logits[[0, 0, 0, 1]] = -1.0;

        let prediction = argmax_logits(logits.into_dyn().view()).unwrap();

        assert_eq!(prediction.dim(), (1, 2));
        assert_eq!(prediction[[0, 0]], 2);
        assert_eq!(prediction[[0, 1]], 1);
    }

    #[test]
    fn argmax_resolves_ties_to_lowest_class() {
        let logits = Array4::<f32>::ones((1, 4, 2, 2));
        let prediction = argmax_logits(logits.into_dyn().view()).unwrap();

        assert!(prediction.iter().all(|&c| c == 0));
    }

    #[test]
    fn precision_must_match_graph_input_type() {
        assert!(check_precision(TensorElementType::Float32, Precision::Full).is_ok());
        assert!(check_precision(TensorElementType::Float16, Precision::Half).is_ok());

        let err = check_precision(TensorElementType::Float32, Precision::Half).unwrap_err();
        assert!(err.contains("Float16"));
        assert!(check_precision(TensorElementType::Float16, Precision::Full).is_err());
        assert!(check_precision(TensorElementType::Uint8, Precision::Full).is_err());
    }

    #[test]
    fn argmax_rejects_batches() {
        let logits = Array4::<f32>::zeros((2, 3, 1, 1));
        assert!(argmax_logits(logits.into_dyn().view()).is_err());
    }

    #[test]
    fn indices_are_copied_and_negative_rejected() {
        let mut indices = Array3::<i64>::zeros((1, 2, 2));
        indices[[0, 1, 0]] = 7;
        let prediction = indices_to_prediction(indices.view().into_dyn()).unwrap();
        assert_eq!(prediction[[1, 0]], 7);

        indices[[0, 0, 1]] = -1;
        assert!(indices_to_prediction(indices.into_dyn().view()).is_err());
    }
}
