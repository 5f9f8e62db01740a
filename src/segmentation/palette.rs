use super::preprocess::IGNORE_LABEL;
use super::types::PredictionMap;
use crate::error::{ColorizeError, PaletteError};
use image::{Rgb, RgbImage};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Class names and colors for the Cityscapes train ids
const CITYSCAPES: [(&str, [u8; 3]); 19] = [
    ("road", [128, 64, 128]),
    ("sidewalk", [244, 35, 232]),
    ("building", [70, 70, 70]),
    ("wall", [102, 102, 156]),
    ("fence", [190, 153, 153]),
    ("pole", [153, 153, 153]),
    ("traffic light", [250, 170, 30]),
    ("traffic sign", [220, 220, 0]),
    ("vegetation", [107, 142, 35]),
    ("terrain", [152, 251, 152]),
    ("sky", [70, 130, 180]),
    ("person", [220, 20, 60]),
    ("rider", [255, 0, 0]),
    ("car", [0, 0, 142]),
    ("truck", [0, 0, 70]),
    ("bus", [0, 60, 100]),
    ("train", [0, 80, 100]),
    ("motorcycle", [0, 0, 230]),
    ("bicycle", [119, 11, 32]),
];

const CAMVID: [(&str, [u8; 3]); 11] = [
    ("sky", [128, 128, 128]),
    ("building", [128, 0, 0]),
    ("pole", [192, 192, 128]),
    ("road", [128, 64, 128]),
    ("pavement", [60, 40, 222]),
    ("tree", [128, 128, 0]),
    ("sign symbol", [192, 128, 128]),
    ("fence", [64, 64, 128]),
    ("car", [64, 0, 128]),
    ("pedestrian", [64, 64, 0]),
    ("bicyclist", [0, 128, 192]),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassColor {
    pub label: String,
    pub color: [u8; 3],
}

/// Fixed class -> RGB lookup for one dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palette {
    classes: Vec<ClassColor>,
}

impl Palette {
    pub fn new(classes: Vec<ClassColor>) -> Result<Self, PaletteError> {
        if classes.is_empty() {
            return Err(PaletteError::Empty);
        }
        if classes.len() as i64 >= IGNORE_LABEL {
            return Err(PaletteError::TooLarge(classes.len()));
        }
        Ok(Self { classes })
    }

    pub fn cityscapes() -> Self {
        Self::from_table(&CITYSCAPES)
    }

    pub fn camvid() -> Self {
        Self::from_table(&CAMVID)
    }

    fn from_table(table: &[(&str, [u8; 3])]) -> Self {
        Self {
            classes: table
                .iter()
                .map(|(label, color)| ClassColor {
                    label: label.to_string(),
                    color: *color,
                })
                .collect(),
        }
    }

    /// Load a palette from a file with one `label,r,g,b` line per class
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, PaletteError> {
        let reader = BufReader::new(File::open(path)?);
        let mut classes = Vec::new();

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let parts: Vec<&str> = line.split(',').map(str::trim).collect();
            if parts.len() != 4 {
                return Err(PaletteError::InvalidLine {
                    line: index + 1,
                    reason: format!("expected `label,r,g,b`, got `{}`", line),
                });
            }

            let mut color = [0u8; 3];
            for (channel, value) in color.iter_mut().zip(&parts[1..]) {
                *channel = value.parse().map_err(|_| PaletteError::InvalidLine {
                    line: index + 1,
                    reason: format!("`{}` is not a color component", value),
                })?;
            }

            classes.push(ClassColor {
                label: parts[0].to_string(),
                color,
            });
        }

        Self::new(classes)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn classes(&self) -> &[ClassColor] {
        &self.classes
    }

    /// Color for a class index, `None` when the palette does not cover it
    pub fn color(&self, class: u32) -> Option<[u8; 3]> {
        self.classes.get(class as usize).map(|c| c.color)
    }

    /// Map every pixel of a prediction to its class color
    ///
    /// Any index outside the palette is an error rather than clamped: it means
    /// the palette and the model disagree.
    pub fn colorize(&self, prediction: &PredictionMap) -> Result<RgbImage, ColorizeError> {
        let _span = tracing::debug_span!("colorize").entered();

        let (height, width) = prediction.dim();
        let mut image = RgbImage::new(width as u32, height as u32);

        for ((y, x), &class) in prediction.indexed_iter() {
            let color = self.color(class).ok_or(ColorizeError::ClassOutOfRange {
                class,
                x,
                y,
                num_classes: self.classes.len(),
            })?;
            image.put_pixel(x as u32, y as u32, Rgb(color));
        }

        Ok(image)
    }
}
