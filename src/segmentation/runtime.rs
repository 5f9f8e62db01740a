use super::onnx::OnnxSegmenter;
use super::types::{InputTensor, PredictionMap, SegmentationModel};
use crate::config::{Device, ModelSettings, Precision};
use crate::error::LoadError;
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Instant;

/// Execution mode of the loaded model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelMode {
    /// As loaded; the model has not served a frame yet
    TrainingCapable,
    /// Switched on the first forward pass, never reverts
    InferenceOnly,
}

/// Process-wide model state, read-only once loaded
#[derive(Debug)]
pub struct ModelState {
    device: Device,
    precision: Precision,
    checkpoint: PathBuf,
    inference_since: OnceLock<Instant>,
}

impl ModelState {
    pub fn new(device: Device, precision: Precision, checkpoint: PathBuf) -> Self {
        Self {
            device,
            precision,
            checkpoint,
            inference_since: OnceLock::new(),
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn checkpoint(&self) -> &Path {
        &self.checkpoint
    }

    pub fn mode(&self) -> ModelMode {
        if self.inference_since.get().is_some() {
            ModelMode::InferenceOnly
        } else {
            ModelMode::TrainingCapable
        }
    }

    /// When the model switched to inference-only mode
    pub fn inference_since(&self) -> Option<Instant> {
        self.inference_since.get().copied()
    }
}

/// Owns the segmentation model and its placement
pub struct ModelRuntime {
    model: Box<dyn SegmentationModel>,
    state: ModelState,
}

impl ModelRuntime {
    /// Resolve the checkpoint, load it and bind it to the configured device
    ///
    /// Every failure here is fatal: the caller must not start serving.
    pub fn initialize(settings: &ModelSettings) -> Result<Self, LoadError> {
        let checkpoint = settings.resolve_checkpoint()?;
        if !checkpoint.is_file() {
            return Err(LoadError::MissingCheckpoint(checkpoint));
        }

        let model = OnnxSegmenter::new(
            &checkpoint,
            settings.device,
            settings.precision,
            settings.intra_threads,
        )?;
        tracing::info!("Loaded weights from checkpoint={}", checkpoint.display());

        Ok(Self::with_model(
            Box::new(model),
            ModelState::new(settings.device, settings.precision, checkpoint),
        ))
    }

    pub fn with_model(model: Box<dyn SegmentationModel>, state: ModelState) -> Self {
        Self { model, state }
    }

    pub fn state(&self) -> &ModelState {
        &self.state
    }

    pub fn num_classes(&self) -> Option<usize> {
        self.model.num_classes()
    }

    pub fn input_size(&self) -> Option<(u32, u32)> {
        self.model.input_size()
    }

    /// Switch the model to inference-only mode
    ///
    /// Returns `true` only for the call that performed the switch; later calls
    /// are no-ops.
    pub fn enter_inference_mode(&mut self) -> bool {
        if self.state.inference_since.set(Instant::now()).is_err() {
            return false;
        }

        self.model.enter_inference_mode();
        tracing::info!("Model switched to inference-only mode");
        true
    }

    /// Run a forward pass, switching to inference-only mode first if needed
    pub fn infer(&mut self, input: &InputTensor) -> Result<PredictionMap> {
        self.enter_inference_mode();

        let _span = tracing::debug_span!("infer").entered();
        self.model.infer(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmentation::testing::ConstantModel;

    fn runtime(model: ConstantModel) -> ModelRuntime {
        ModelRuntime::with_model(
            Box::new(model),
            ModelState::new(Device::Cpu, Precision::Full, PathBuf::from("stub.onnx")),
        )
    }

    #[test]
    fn inference_mode_switches_once() {
        let model = ConstantModel::new(0, 3);
        let probe = model.probe();
        let mut runtime = runtime(model);

        assert_eq!(runtime.state().mode(), ModelMode::TrainingCapable);
        assert!(runtime.enter_inference_mode());
        let since = runtime.state().inference_since();

        for _ in 0..5 {
            assert!(!runtime.enter_inference_mode());
        }

        assert_eq!(runtime.state().mode(), ModelMode::InferenceOnly);
        assert_eq!(runtime.state().inference_since(), since);
        assert_eq!(probe.mode_switches(), 1);
    }

    #[test]
    fn infer_switches_before_first_pass() {
        let model = ConstantModel::new(2, 3);
        let probe = model.probe();
        let mut runtime = runtime(model);
        let input = InputTensor::zeros((1, 3, 2, 4));

        let prediction = runtime.infer(&input).unwrap();
        runtime.infer(&input).unwrap();

        assert_eq!(prediction.dim(), (2, 4));
        assert!(prediction.iter().all(|&c| c == 2));
        assert_eq!(probe.mode_switches(), 1);
        assert_eq!(probe.inferences(), 2);
        assert_eq!(probe.switched_before_first_inference(), Some(true));
    }

    #[test]
    fn infer_leaves_input_untouched() {
        let mut runtime = runtime(ConstantModel::new(0, 1));
        let input = InputTensor::from_elem((1, 3, 2, 2), 0.5);
        let before = input.clone();

        runtime.infer(&input).unwrap();

        assert_eq!(input, before);
    }

    #[test]
    fn initialize_fails_on_missing_resolved_checkpoint() {
        let settings = ModelSettings {
            checkpoint: "ASSETS_PATH/seg_weights/missing.onnx".to_string(),
            asset_root: Some(PathBuf::from("/assets")),
            device: Device::Cpu,
            precision: Precision::Full,
            intra_threads: 1,
        };

        match ModelRuntime::initialize(&settings) {
            Err(LoadError::MissingCheckpoint(path)) => {
                assert_eq!(path, PathBuf::from("/assets/seg_weights/missing.onnx"));
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("missing checkpoint must fail initialization"),
        }
    }
}
