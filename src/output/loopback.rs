use super::OutputSink;
use crate::segmentation::ColorFrame;
use anyhow::{Context, Result};
use image::RgbImage;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use v4l::video::Output;
use v4l::{Device, Format, FourCC};

/// Publishes colorized frames to a v4l2loopback device
pub struct V4L2Output {
    file: File,
    width: u32,
    height: u32,
}

impl V4L2Output {
    pub fn new<P: AsRef<Path>>(device_path: P, width: u32, height: u32) -> Result<Self> {
        let path = device_path.as_ref();
        tracing::info!(
            "Opening v4l2loopback device at {} ({}x{})",
            path.display(),
            width,
            height
        );

        // Announce YUYV at the output size so readers of the loopback device
        // see the right format before the first frame arrives
        match Device::with_path(path) {
            Ok(device) => {
                let format = Format::new(width, height, FourCC::new(b"YUYV"));
                if let Err(e) = Output::set_format(&device, &format) {
                    tracing::warn!("Could not set loopback format on {}: {}", path.display(), e);
                }
            }
            Err(e) => tracing::warn!("Could not query {}: {}", path.display(), e),
        }

        let file = File::options()
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open v4l2loopback device at {}", path.display()))?;

        tracing::info!("v4l2loopback device opened successfully");

        Ok(Self {
            file,
            width,
            height,
        })
    }

    /// Convert RGB frame to YUV422 (YUYV) format
    fn rgb_to_yuyv(rgb_image: &RgbImage) -> Vec<u8> {
        let (width, height) = rgb_image.dimensions();
        let mut yuyv = Vec::with_capacity((width * height * 2) as usize);

        for y in 0..height {
            for x in (0..width).step_by(2) {
                let pixel1 = rgb_image.get_pixel(x, y);
                let pixel2 = if x + 1 < width {
                    rgb_image.get_pixel(x + 1, y)
                } else {
                    pixel1
                };

                let (y1, u1, v1) = rgb_to_yuv(pixel1[0], pixel1[1], pixel1[2]);
                let (y2, u2, v2) = rgb_to_yuv(pixel2[0], pixel2[1], pixel2[2]);

                // Chroma is shared by the pixel pair
                let u = ((u1 as u16 + u2 as u16) / 2) as u8;
                let v = ((v1 as u16 + v2 as u16) / 2) as u8;

                yuyv.extend_from_slice(&[y1, u, y2, v]);
            }
        }

        yuyv
    }
}

fn rgb_to_yuv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let r = r as f32;
    let g = g as f32;
    let b = b as f32;

    let y = (0.299 * r + 0.587 * g + 0.114 * b).clamp(0.0, 255.0) as u8;
    let u = ((-0.147 * r - 0.289 * g + 0.436 * b) + 128.0).clamp(0.0, 255.0) as u8;
    let v = ((0.615 * r - 0.515 * g - 0.100 * b) + 128.0).clamp(0.0, 255.0) as u8;

    (y, u, v)
}

impl OutputSink for V4L2Output {
    fn name(&self) -> &str {
        "v4l2loopback"
    }

    fn write_frame(&mut self, frame: &ColorFrame) -> Result<()> {
        // Nearest keeps class colors exact; other filters blend palette entries
        let resized;
        let image = if frame.dimensions() != (self.width, self.height) {
            resized = image::imageops::resize(
                frame.image(),
                self.width,
                self.height,
                image::imageops::FilterType::Nearest,
            );
            &resized
        } else {
            frame.image()
        };

        let yuyv_data = Self::rgb_to_yuyv(image);

        self.file
            .write_all(&yuyv_data)
            .context("Failed to write frame to v4l2loopback device")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuyv_packs_two_pixels_per_four_bytes() {
        let image = RgbImage::from_pixel(4, 2, image::Rgb([0, 0, 0]));
        let yuyv = V4L2Output::rgb_to_yuyv(&image);

        assert_eq!(yuyv.len(), 4 * 2 * 2);
        assert_eq!(&yuyv[..4], &[0, 128, 0, 128]);
    }

    #[test]
    fn red_carries_high_v_chroma() {
        let (_, u, v) = rgb_to_yuv(255, 0, 0);
        assert!(v > 200);
        assert!(u < 128);
    }
}
