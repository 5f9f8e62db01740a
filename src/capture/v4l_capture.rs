use super::{now_ms, CaptureSource};
use crate::segmentation::{Correlator, Frame};
use anyhow::{Context, Result};
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution};
use nokhwa::Camera;

pub struct WebcamCapture {
    camera: Camera,
    frame_id: String,
    seq: u64,
}

impl WebcamCapture {
    pub fn new(device_index: u32, width: u32, height: u32, fps: u32) -> Result<Self> {
        tracing::info!(
            "Initializing webcam {} at {}x{}@{}",
            device_index,
            width,
            height,
            fps
        );

        let index = CameraIndex::Index(device_index);
        let format = CameraFormat::new(Resolution::new(width, height), FrameFormat::MJPEG, fps);
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(format));

        let mut camera = Camera::new(index, requested).context("Failed to open camera")?;

        camera
            .open_stream()
            .context("Failed to open camera stream")?;

        tracing::info!("Webcam initialized with {}", camera.camera_format());

        Ok(Self {
            camera,
            frame_id: format!("camera{}", device_index),
            seq: 0,
        })
    }
}

impl CaptureSource for WebcamCapture {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let buffer = self.camera.frame().context("Failed to capture frame")?;
        let stamp_ms = now_ms();

        let decoded = buffer
            .decode_image::<RgbFormat>()
            .context("Failed to decode frame")?;

        self.seq += 1;
        let correlator = Correlator::new(self.frame_id.clone(), self.seq, stamp_ms);

        Ok(Some(Frame::from_rgb(decoded, correlator)))
    }
}
