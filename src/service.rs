use crate::channel::{FrameChannel, ResultChannel};
use crate::config::Settings;
use crate::error::{FrameError, LoadError};
use crate::output::persist_snapshot;
use crate::segmentation::{
    ColorFrame, Frame, FramePreprocessor, ModelMode, ModelRuntime, Palette, PredictionMap,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

const STATS_INTERVAL: u64 = 30;

/// Lifecycle of the inference service
///
/// Construction is the `Uninitialized -> Ready` edge: a service value only
/// exists once the model is loaded and bound. `Ready -> Serving` happens on
/// the first frame and is never undone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Ready,
    Serving,
}

/// Drives frames through prepare -> infer -> colorize -> emit
pub struct InferenceService {
    runtime: ModelRuntime,
    preprocessor: FramePreprocessor,
    palette: Palette,
    results: Arc<ResultChannel>,
    debug_snapshot: Option<PathBuf>,
    stats: PipelineStats,
}

impl InferenceService {
    /// Load the model described by `settings` and bind it to the result channel
    pub fn start(settings: &Settings, results: Arc<ResultChannel>) -> Result<Self, LoadError> {
        let runtime = ModelRuntime::initialize(&settings.model)?;
        let palette = settings.dataset.palette()?;

        Self::new(
            runtime,
            palette,
            results,
            settings.service.debug_snapshot().map(Path::to_path_buf),
        )
    }

    pub fn new(
        runtime: ModelRuntime,
        palette: Palette,
        results: Arc<ResultChannel>,
        debug_snapshot: Option<PathBuf>,
    ) -> Result<Self, LoadError> {
        if let Some(model_classes) = runtime.num_classes() {
            if model_classes != palette.len() {
                return Err(LoadError::ClassCountMismatch {
                    model: model_classes,
                    palette: palette.len(),
                });
            }
        }

        let preprocessor = FramePreprocessor::new(runtime.input_size());

        tracing::info!(
            "Service ready: device={}, precision={:?}, classes={}",
            runtime.state().device(),
            runtime.state().precision(),
            palette.len()
        );
        if let Some(path) = &debug_snapshot {
            tracing::info!("Debug snapshots go to {}", path.display());
        }

        Ok(Self {
            runtime,
            preprocessor,
            palette,
            results,
            debug_snapshot,
            stats: PipelineStats::default(),
        })
    }

    pub fn state(&self) -> ServiceState {
        match self.runtime.state().mode() {
            ModelMode::TrainingCapable => ServiceState::Ready,
            ModelMode::InferenceOnly => ServiceState::Serving,
        }
    }

    pub fn runtime(&self) -> &ModelRuntime {
        &self.runtime
    }

    /// Run one frame through the pipeline without emitting it
    pub fn process(&mut self, frame: &Frame) -> Result<ColorFrame, FrameError> {
        let correlator = frame.correlator().clone();

        let start = Instant::now();
        let input = self.preprocessor.prepare(frame)?;
        let prepared = Instant::now();

        let prediction = self
            .runtime
            .infer(&input)
            .map_err(|source| FrameError::Inference {
                frame_id: correlator.frame_id.clone(),
                source,
            })?;
        let extent = (frame.height() as usize, frame.width() as usize);
        let actual = prediction.dim();
        let prediction = restore_extent(prediction, extent).ok_or_else(|| {
            FrameError::ExtentMismatch {
                frame_id: correlator.frame_id.clone(),
                expected: extent,
                actual,
            }
        })?;
        let inferred = Instant::now();

        let image = self
            .palette
            .colorize(&prediction)
            .map_err(|source| FrameError::Colorize {
                frame_id: correlator.frame_id.clone(),
                source,
            })?;

        self.stats.prepare += prepared - start;
        self.stats.infer += inferred - prepared;
        self.stats.colorize += inferred.elapsed();

        Ok(ColorFrame::new(image, correlator))
    }

    /// Process a frame, publish the result and write the debug snapshot
    ///
    /// Snapshot failures are logged only; the result is already published.
    pub fn on_frame(&mut self, frame: &Frame) -> Result<(), FrameError> {
        let result = self.process(frame)?;

        let emit_start = Instant::now();
        {
            let _span = tracing::debug_span!("emit").entered();
            if let Some(stale) = self.results.post(result.clone()) {
                tracing::debug!(
                    "Result for frame {} replaced before it was consumed",
                    stale.correlator().frame_id
                );
            }
        }

        if let Some(path) = &self.debug_snapshot {
            if let Err(e) = persist_snapshot(path, result.image()) {
                tracing::warn!("Failed to write debug snapshot: {:#}", e);
            }
        }
        self.stats.emit += emit_start.elapsed();
        self.stats.frames += 1;

        Ok(())
    }

    /// Serve frames until the inbound channel closes, then close the results
    ///
    /// Returns the number of frames published.
    pub fn run(&mut self, frames: &FrameChannel) -> u64 {
        tracing::info!("Waiting for frames");

        while let Some(frame) = frames.take() {
            if let Err(e) = self.on_frame(&frame) {
                tracing::error!("Dropping frame: {:#}", e);
                continue;
            }

            if self.stats.frames % STATS_INTERVAL == 0 {
                self.stats.log(frames.dropped());
            }
        }

        self.results.close();
        tracing::info!(
            "Frame channel closed after {} frames ({} dropped upstream)",
            self.stats.frames,
            frames.dropped()
        );
        self.stats.frames
    }
}

/// Scale a class map to `(height, width)` with nearest-neighbour sampling
///
/// Models with a strided output head predict below the input resolution.
/// Returns `None` for an empty map that cannot be scaled.
fn restore_extent(prediction: PredictionMap, (height, width): (usize, usize)) -> Option<PredictionMap> {
    let (rows, cols) = prediction.dim();
    if (rows, cols) == (height, width) {
        return Some(prediction);
    }
    if rows == 0 || cols == 0 {
        return None;
    }

    tracing::debug!(
        "Scaling {}x{} prediction to {}x{}",
        cols,
        rows,
        width,
        height
    );
    Some(PredictionMap::from_shape_fn((height, width), |(y, x)| {
        prediction[[y * rows / height, x * cols / width]]
    }))
}

#[derive(Debug, Default)]
struct PipelineStats {
    frames: u64,
    prepare: Duration,
    infer: Duration,
    colorize: Duration,
    emit: Duration,
}

impl PipelineStats {
    fn log(&self, dropped: u64) {
        if self.frames == 0 {
            return;
        }

        let avg_ms = |total: Duration| total.as_secs_f64() * 1000.0 / self.frames as f64;
        let prepare_ms = avg_ms(self.prepare);
        let infer_ms = avg_ms(self.infer);
        let colorize_ms = avg_ms(self.colorize);
        let emit_ms = avg_ms(self.emit);
        let total_ms = prepare_ms + infer_ms + colorize_ms + emit_ms;

        tracing::info!(
            "Frame {}: prepare={:.1}ms, infer={:.1}ms, colorize={:.1}ms, emit={:.1}ms, total={:.1}ms, fps={:.1}, dropped={}",
            self.frames,
            prepare_ms,
            infer_ms,
            colorize_ms,
            emit_ms,
            total_ms,
            1000.0 / total_ms.max(f64::EPSILON),
            dropped
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Device, Precision};
    use crate::segmentation::testing::ConstantModel;
    use crate::segmentation::{ClassColor, Correlator, ModelState, PixelOrder};
    use image::{Rgb, RgbImage};

    fn palette(colors: &[[u8; 3]]) -> Palette {
        Palette::new(
            colors
                .iter()
                .enumerate()
                .map(|(i, &color)| ClassColor {
                    label: format!("class{}", i),
                    color,
                })
                .collect(),
        )
        .unwrap()
    }

    fn service(
        model: ConstantModel,
        palette: Palette,
        debug_snapshot: Option<PathBuf>,
    ) -> (InferenceService, Arc<ResultChannel>) {
        let results = Arc::new(ResultChannel::new());
        let runtime = ModelRuntime::with_model(
            Box::new(model),
            ModelState::new(Device::Cpu, Precision::Full, PathBuf::from("stub.onnx")),
        );
        let service = InferenceService::new(runtime, palette, results.clone(), debug_snapshot).unwrap();
        (service, results)
    }

    fn solid(width: u32, height: u32, color: [u8; 3], frame_id: &str, seq: u64) -> Frame {
        Frame::from_rgb(
            RgbImage::from_pixel(width, height, Rgb(color)),
            Correlator::new(frame_id, seq, 1_700_000_000_000),
        )
    }

    #[test]
    fn red_frame_becomes_palette_color_with_same_correlator() {
        let (mut service, results) = service(
            ConstantModel::new(0, 2),
            palette(&[[20, 20, 20], [200, 0, 0]]),
            None,
        );
        let frame = solid(2, 2, [255, 0, 0], "seq-7", 7);

        service.on_frame(&frame).unwrap();

        let published = results.try_take().unwrap();
        assert_eq!(published.correlator(), frame.correlator());
        assert_eq!(published.dimensions(), (2, 2));
        assert!(published.image().pixels().all(|p| p.0 == [20, 20, 20]));
    }

    #[test]
    fn output_keeps_spatial_extent() {
        let (mut service, _) = service(ConstantModel::new(1, 2), palette(&[[0; 3], [9; 3]]), None);

        let result = service.process(&solid(5, 3, [1, 2, 3], "wide", 1)).unwrap();

        assert_eq!(result.dimensions(), (5, 3));
        assert_eq!(result.correlator().seq, 1);
    }

    #[test]
    fn strided_prediction_is_scaled_back_to_frame_size() {
        let model = ConstantModel::new(1, 2).with_output_stride(2);
        let (mut service, results) = service(model, palette(&[[0; 3], [30, 60, 90]]), None);

        service.on_frame(&solid(8, 4, [0; 3], "half", 1)).unwrap();

        let published = results.try_take().unwrap();
        assert_eq!(published.dimensions(), (8, 4));
        assert!(published.image().pixels().all(|p| p.0 == [30, 60, 90]));
    }

    #[test]
    fn restore_extent_picks_nearest_class() {
        let prediction = PredictionMap::from_shape_vec((2, 2), vec![0, 1, 2, 3]).unwrap();

        let scaled = restore_extent(prediction, (4, 4)).unwrap();

        assert_eq!(scaled.dim(), (4, 4));
        assert_eq!(scaled[[0, 0]], 0);
        assert_eq!(scaled[[1, 3]], 1);
        assert_eq!(scaled[[3, 0]], 2);
        assert_eq!(scaled[[2, 2]], 3);
    }

    #[test]
    fn empty_prediction_is_an_extent_error() {
        let model = ConstantModel::new(0, 1).with_output_stride(4);
        let (mut service, results) = service(model, palette(&[[1, 1, 1]]), None);

        let err = service.on_frame(&solid(2, 2, [0; 3], "tiny", 1)).unwrap_err();

        assert!(matches!(
            err,
            FrameError::ExtentMismatch {
                expected: (2, 2),
                actual: (0, 0),
                ..
            }
        ));
        assert!(results.try_take().is_none());
    }

    #[test]
    fn first_frame_moves_service_to_serving() {
        let model = ConstantModel::new(0, 1);
        let probe = model.probe();
        let (mut service, _) = service(model, palette(&[[1, 1, 1]]), None);

        assert_eq!(service.state(), ServiceState::Ready);
        assert_eq!(service.runtime().state().mode(), ModelMode::TrainingCapable);

        for seq in 0..3 {
            service.on_frame(&solid(1, 1, [0; 3], "f", seq)).unwrap();
        }

        assert_eq!(service.state(), ServiceState::Serving);
        assert_eq!(probe.mode_switches(), 1);
        assert_eq!(probe.switched_before_first_inference(), Some(true));
    }

    #[test]
    fn only_latest_pending_frame_is_processed() {
        let model = ConstantModel::new(0, 1);
        let probe = model.probe();
        let (mut service, results) = service(model, palette(&[[5, 5, 5]]), None);
        let frames = FrameChannel::new();

        frames.post(solid(1, 1, [0; 3], "F1", 1));
        frames.post(solid(1, 1, [0; 3], "F2", 2));
        frames.close();

        assert_eq!(service.run(&frames), 1);
        assert_eq!(probe.inferences(), 1);
        assert_eq!(frames.dropped(), 1);
        assert_eq!(results.take().map(|r| r.correlator().frame_id.clone()), Some("F2".to_string()));
        assert!(results.take().is_none());
    }

    #[test]
    fn bad_frame_does_not_stop_serving() {
        let (mut service, results) = service(ConstantModel::new(0, 1), palette(&[[5, 5, 5]]), None);

        let short = Frame::new(2, 2, 3, PixelOrder::Rgb8, vec![0; 5], Correlator::new("short", 1, 0)).unwrap();
        assert!(matches!(
            service.on_frame(&short),
            Err(FrameError::MalformedBuffer { .. })
        ));

        let gray = Frame::new(1, 1, 1, PixelOrder::Rgb8, vec![0], Correlator::new("gray", 2, 0)).unwrap();
        assert!(matches!(
            service.on_frame(&gray),
            Err(FrameError::UnsupportedChannels { channels: 1, .. })
        ));

        service.on_frame(&solid(1, 1, [0; 3], "good", 3)).unwrap();
        assert_eq!(results.try_take().unwrap().correlator().frame_id, "good");
    }

    #[test]
    fn run_survives_failing_inference() {
        let (mut service, results) = service(ConstantModel::failing(1), palette(&[[5, 5, 5]]), None);
        let frames = FrameChannel::new();
        frames.post(solid(1, 1, [0; 3], "boom", 1));
        frames.close();

        assert_eq!(service.run(&frames), 0);
        assert!(results.is_closed());
        assert!(results.take().is_none());
    }

    #[test]
    fn out_of_range_class_fails_loudly() {
        let (mut service, results) = service(ConstantModel::new(3, 3), palette(&[[0; 3], [1; 3], [2; 3]]), None);

        let err = service.process(&solid(2, 1, [0; 3], "oob", 1)).unwrap_err();

        match err {
            FrameError::Colorize { frame_id, source } => {
                assert_eq!(frame_id, "oob");
                assert_eq!(
                    source,
                    crate::error::ColorizeError::ClassOutOfRange {
                        class: 3,
                        x: 0,
                        y: 0,
                        num_classes: 3,
                    }
                );
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(results.try_take().is_none());
    }

    #[test]
    fn class_count_mismatch_is_a_startup_error() {
        let runtime = ModelRuntime::with_model(
            Box::new(ConstantModel::new(0, 19)),
            ModelState::new(Device::Cpu, Precision::Full, PathBuf::from("stub.onnx")),
        );

        let err = InferenceService::new(runtime, Palette::camvid(), Arc::new(ResultChannel::new()), None)
            .err()
            .unwrap();

        assert!(matches!(
            err,
            LoadError::ClassCountMismatch {
                model: 19,
                palette: 11
            }
        ));
    }

    #[test]
    fn debug_snapshot_is_overwritten_per_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("debug").join("pred_img.png");
        let (mut service, _) = service(ConstantModel::new(1, 2), palette(&[[0; 3], [7, 8, 9]]), Some(path.clone()));

        service.on_frame(&solid(2, 2, [0; 3], "a", 1)).unwrap();
        service.on_frame(&solid(3, 1, [0; 3], "b", 2)).unwrap();

        let saved = image::open(&path).unwrap().to_rgb8();
        assert_eq!(saved.dimensions(), (3, 1));
        assert_eq!(saved.get_pixel(0, 0).0, [7, 8, 9]);
    }

    #[test]
    fn debug_write_failure_still_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let (mut service, results) = service(
            ConstantModel::new(0, 1),
            palette(&[[4, 4, 4]]),
            Some(blocker.join("pred_img.png")),
        );

        service.on_frame(&solid(1, 1, [0; 3], "kept", 1)).unwrap();

        assert_eq!(results.try_take().unwrap().correlator().frame_id, "kept");
    }
}
