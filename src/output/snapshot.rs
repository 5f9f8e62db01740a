use super::OutputSink;
use crate::segmentation::ColorFrame;
use anyhow::{Context, Result};
use image::RgbImage;
use std::path::{Path, PathBuf};

/// Overwrite `path` with `image`, creating parent directories as needed
pub fn persist_snapshot(path: &Path, image: &RgbImage) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    image
        .save(path)
        .with_context(|| format!("Failed to save snapshot to {}", path.display()))
}

/// Keeps the most recent published frame on disk for manual inspection
pub struct SnapshotSink {
    path: PathBuf,
}

impl SnapshotSink {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        tracing::info!("Storing published frames at {}", path.display());
        Self { path }
    }
}

impl OutputSink for SnapshotSink {
    fn name(&self) -> &str {
        "snapshot"
    }

    fn write_frame(&mut self, frame: &ColorFrame) -> Result<()> {
        tracing::info!("storing image {}", frame.correlator().frame_id);
        persist_snapshot(&self.path, frame.image())
    }
}
