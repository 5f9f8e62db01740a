mod folder;
mod v4l_capture;

pub use folder::ImageFolderSource;
pub use v4l_capture::WebcamCapture;

use crate::channel::FrameChannel;
use crate::segmentation::Frame;
use anyhow::Result;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Trait for inbound frame producers
pub trait CaptureSource {
    /// Capture the next frame, `None` once the source is exhausted
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Feed the frame channel from `source` at no more than `fps` frames per second
///
/// A frame that fails to capture or decode is skipped. The source is given up
/// after `max_consecutive_failures` failures in a row. The channel is closed
/// when the source ends or is given up.
pub fn run_source<C: CaptureSource + ?Sized>(
    source: &mut C,
    frames: &FrameChannel,
    fps: u32,
    max_consecutive_failures: u32,
) -> Result<()> {
    let frame_duration = Duration::from_secs_f32(1.0 / fps.max(1) as f32);
    let mut captured = 0u64;
    let mut failures = 0u32;

    let result = loop {
        let loop_start = Instant::now();

        match source.next_frame() {
            Ok(Some(frame)) => {
                failures = 0;
                if let Some(stale) = frames.post(frame) {
                    tracing::debug!("Dropped frame {} before processing", stale.correlator().seq);
                }
                captured += 1;
            }
            Ok(None) => break Ok(()),
            Err(e) => {
                failures += 1;
                if failures >= max_consecutive_failures.max(1) {
                    break Err(e.context(format!("{} consecutive capture failures", failures)));
                }
                tracing::warn!("Skipping frame: {:#}", e);
            }
        }

        let elapsed = loop_start.elapsed();
        if elapsed < frame_duration {
            std::thread::sleep(frame_duration - elapsed);
        }
    };

    frames.close();
    tracing::info!(
        "Capture stopped after {} frames ({} dropped by the pipeline)",
        captured,
        frames.dropped()
    );
    result
}
