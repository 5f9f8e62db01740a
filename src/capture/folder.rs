use super::{now_ms, CaptureSource};
use crate::segmentation::{Correlator, Frame};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "ppm"];

/// Replays the images of a directory in file name order
pub struct ImageFolderSource {
    files: std::vec::IntoIter<PathBuf>,
    seq: u64,
}

impl ImageFolderSource {
    pub fn new<P: AsRef<Path>>(folder: P) -> Result<Self> {
        let folder = folder.as_ref();
        let mut files = Vec::new();

        for entry in std::fs::read_dir(folder)
            .with_context(|| format!("Failed to read frame folder {}", folder.display()))?
        {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
                .unwrap_or(false);
            if is_image {
                files.push(path);
            }
        }
        files.sort();

        tracing::info!("Found {} images in {}", files.len(), folder.display());

        Ok(Self {
            files: files.into_iter(),
            seq: 0,
        })
    }
}

impl CaptureSource for ImageFolderSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(path) = self.files.next() else {
            return Ok(None);
        };

        let image = image::open(&path)
            .with_context(|| format!("Failed to decode {}", path.display()))?
            .to_rgb8();

        self.seq += 1;
        let frame_id = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Some(Frame::from_rgb(
            image,
            Correlator::new(frame_id, self.seq, now_ms()),
        )))
    }
}
