//! Stub models for exercising the pipeline without weights or a GPU.

use super::types::{InputTensor, PredictionMap, SegmentationModel};
use anyhow::{bail, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Shared counters observing a stub model after it moved into a runtime
#[derive(Clone, Default)]
pub struct Probe {
    inner: Arc<ProbeState>,
}

#[derive(Default)]
struct ProbeState {
    mode_switches: AtomicUsize,
    inferences: AtomicUsize,
    switched_before_first_inference: OnceLock<bool>,
}

impl Probe {
    pub fn mode_switches(&self) -> usize {
        self.inner.mode_switches.load(Ordering::SeqCst)
    }

    pub fn inferences(&self) -> usize {
        self.inner.inferences.load(Ordering::SeqCst)
    }

    pub fn switched_before_first_inference(&self) -> Option<bool> {
        self.inner.switched_before_first_inference.get().copied()
    }
}

/// Predicts the same class for every pixel of the input
pub struct ConstantModel {
    class: u32,
    num_classes: usize,
    input_size: Option<(u32, u32)>,
    stride: usize,
    fail: bool,
    probe: Probe,
}

impl ConstantModel {
    pub fn new(class: u32, num_classes: usize) -> Self {
        Self {
            class,
            num_classes,
            input_size: None,
            stride: 1,
            fail: false,
            probe: Probe::default(),
        }
    }

    /// A model whose forward pass always errors
    pub fn failing(num_classes: usize) -> Self {
        Self {
            fail: true,
            ..Self::new(0, num_classes)
        }
    }

    pub fn with_input_size(mut self, width: u32, height: u32) -> Self {
        self.input_size = Some((width, height));
        self
    }

    /// Predict at 1/`stride` of the input resolution, like a strided output head
    pub fn with_output_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn probe(&self) -> Probe {
        self.probe.clone()
    }
}

impl SegmentationModel for ConstantModel {
    fn infer(&mut self, input: &InputTensor) -> Result<PredictionMap> {
        let state = &self.probe.inner;
        let _ = state
            .switched_before_first_inference
            .set(state.mode_switches.load(Ordering::SeqCst) > 0);
        state.inferences.fetch_add(1, Ordering::SeqCst);

        if self.fail {
            bail!("stub forward pass failure");
        }

        let shape = input.shape();
        Ok(PredictionMap::from_elem(
            (shape[2] / self.stride, shape[3] / self.stride),
            self.class,
        ))
    }

    fn enter_inference_mode(&mut self) {
        self.probe.inner.mode_switches.fetch_add(1, Ordering::SeqCst);
    }

    fn num_classes(&self) -> Option<usize> {
        Some(self.num_classes)
    }

    fn input_size(&self) -> Option<(u32, u32)> {
        self.input_size
    }
}
