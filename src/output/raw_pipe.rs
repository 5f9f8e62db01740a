use super::OutputSink;
use crate::segmentation::{ColorFrame, PixelOrder};
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Streams raw interleaved frames to a file or FIFO
///
/// The channel swap for BGR consumers happens here, at the transport edge.
pub struct RawPipeSink<W: Write = BufWriter<File>> {
    writer: W,
    order: PixelOrder,
}

impl RawPipeSink {
    pub fn open<P: AsRef<Path>>(path: P, order: PixelOrder) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!("Streaming {:?} frames to {}", order, path.display());

        let file = File::options()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to open raw output at {}", path.display()))?;

        Ok(Self::new(BufWriter::new(file), order))
    }
}

impl<W: Write> RawPipeSink<W> {
    pub fn new(writer: W, order: PixelOrder) -> Self {
        Self { writer, order }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> OutputSink for RawPipeSink<W> {
    fn name(&self) -> &str {
        "raw_pipe"
    }

    fn write_frame(&mut self, frame: &ColorFrame) -> Result<()> {
        self.writer
            .write_all(&frame.to_bytes(self.order))
            .context("Failed to write raw frame")?;
        self.writer.flush().context("Failed to flush raw frame")?;
        Ok(())
    }
}
