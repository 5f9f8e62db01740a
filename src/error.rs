use std::path::PathBuf;
use thiserror::Error;

/// Startup failures; the service never reaches `Ready` when one occurs
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("checkpoint not found at {}", .0.display())]
    MissingCheckpoint(PathBuf),
    #[error("failed to load checkpoint {}: {reason}", .path.display())]
    MalformedCheckpoint { path: PathBuf, reason: String },
    #[error("checkpoint {} does not fit the configured architecture: {reason}", .path.display())]
    ShapeMismatch { path: PathBuf, reason: String },
    #[error("model predicts {model} classes but the palette has {palette}")]
    ClassCountMismatch { model: usize, palette: usize },
    #[error("device {device} is unavailable: {reason}")]
    DeviceUnavailable { device: String, reason: String },
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Failures isolated to a single frame
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame {frame_id}: expected {expected} bytes for {width}x{height}x3, got {actual}")]
    MalformedBuffer {
        frame_id: String,
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("frame {frame_id}: unsupported channel count {channels}, expected 3")]
    UnsupportedChannels { frame_id: String, channels: u32 },
    #[error("frame {frame_id}: resolution {actual:?} does not match model input {expected:?}")]
    ResolutionMismatch {
        frame_id: String,
        expected: (u32, u32),
        actual: (u32, u32),
    },
    #[error("frame {frame_id}: model returned an empty {actual:?} class map for a {expected:?} frame")]
    ExtentMismatch {
        frame_id: String,
        expected: (usize, usize),
        actual: (usize, usize),
    },
    #[error("frame {frame_id}: inference failed: {source:#}")]
    Inference {
        frame_id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("frame {frame_id}: {source}")]
    Colorize {
        frame_id: String,
        #[source]
        source: ColorizeError,
    },
}

/// Palette lookups that indicate a palette/model mismatch
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ColorizeError {
    #[error("class {class} at ({x}, {y}) is outside the {num_classes}-class palette")]
    ClassOutOfRange {
        class: u32,
        x: usize,
        y: usize,
        num_classes: usize,
    },
}

#[derive(Error, Debug)]
pub enum PaletteError {
    #[error("failed to read palette file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid palette line {line}: {reason}")]
    InvalidLine { line: usize, reason: String },
    #[error("palette is empty")]
    Empty,
    #[error("palette has {0} classes, must stay below the ignore label")]
    TooLarge(usize),
}
