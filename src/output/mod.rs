mod loopback;
mod raw_pipe;
mod snapshot;

pub use loopback::V4L2Output;
pub use raw_pipe::RawPipeSink;
pub use snapshot::{persist_snapshot, SnapshotSink};

use crate::channel::ResultChannel;
use crate::segmentation::ColorFrame;
use anyhow::Result;

/// Trait for consumers of the result stream
pub trait OutputSink: Send {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Write a frame to the output
    fn write_frame(&mut self, frame: &ColorFrame) -> Result<()>;
}

/// Drain the result channel into every sink until it closes
///
/// A failing sink is logged and skipped for that frame; the others still
/// receive it.
pub fn run_sinks(results: &ResultChannel, sinks: &mut [Box<dyn OutputSink>]) -> u64 {
    let mut published = 0;

    while let Some(frame) = results.take() {
        for sink in sinks.iter_mut() {
            if let Err(e) = sink.write_frame(&frame) {
                tracing::warn!(
                    "Sink {} failed on frame {}: {:#}",
                    sink.name(),
                    frame.correlator().frame_id,
                    e
                );
            }
        }
        published += 1;
    }

    tracing::info!("Result stream closed after {} frames", published);
    published
}
