use crate::error::LoadError;
use crate::segmentation::{Palette, PixelOrder};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// Token in checkpoint paths replaced by the configured asset root
pub const ASSETS_TOKEN: &str = "ASSETS_PATH";

/// Immutable service configuration, resolved once before serving starts
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub log_level: LogLevel,
    pub model: ModelSettings,
    #[serde(default)]
    pub dataset: DatasetSettings,
    #[serde(default)]
    pub input: InputSettings,
    #[serde(default)]
    pub output: OutputSettings,
    #[serde(default)]
    pub service: ServiceSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelSettings {
    pub checkpoint: String,
    #[serde(default)]
    pub asset_root: Option<PathBuf>,
    #[serde(default)]
    pub device: Device,
    #[serde(default)]
    pub precision: Precision,
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
}

fn default_intra_threads() -> usize {
    4
}

impl ModelSettings {
    /// Checkpoint path with the asset token substituted
    pub fn resolve_checkpoint(&self) -> Result<PathBuf, LoadError> {
        if !self.checkpoint.contains(ASSETS_TOKEN) {
            return Ok(PathBuf::from(&self.checkpoint));
        }

        let root = self.asset_root.as_ref().ok_or_else(|| {
            LoadError::Config(format!(
                "checkpoint {} uses {} but no asset_root is configured",
                self.checkpoint, ASSETS_TOKEN
            ))
        })?;
        let root = root.to_string_lossy();
        let root = root.trim_end_matches('/');

        Ok(PathBuf::from(self.checkpoint.replace(ASSETS_TOKEN, root)))
    }
}

/// Compute device the model is placed on
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(try_from = "String")]
pub enum Device {
    #[default]
    Cpu,
    Cuda(i32),
    TensorRt(i32),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(id) => write!(f, "cuda:{}", id),
            Device::TensorRt(id) => write!(f, "tensorrt:{}", id),
        }
    }
}

impl TryFrom<String> for Device {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let lowered = s.to_lowercase();
        let (kind, id) = match lowered.split_once(':') {
            Some((kind, id)) => {
                let id = id
                    .parse::<i32>()
                    .map_err(|_| format!("{} has an invalid device id", s))?;
                (kind, id)
            }
            None => (lowered.as_str(), 0),
        };

        match kind {
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda(id)),
            "tensorrt" | "trt" => Ok(Self::TensorRt(id)),
            other => Err(format!(
                "{} is not a supported device. Use `cpu`, `cuda:<id>` or `tensorrt:<id>`.",
                other
            )),
        }
    }
}

/// Numeric precision of the forward pass
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(try_from = "String")]
pub enum Precision {
    #[default]
    Full,
    Half,
}

impl TryFrom<String> for Precision {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "fp32" | "full" => Ok(Self::Full),
            "fp16" | "half" => Ok(Self::Half),
            other => Err(format!(
                "{} is not a supported precision. Use either `fp32` or `fp16`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(try_from = "String")]
pub enum Dataset {
    #[default]
    Cityscapes,
    Camvid,
}

impl TryFrom<String> for Dataset {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "cityscapes" => Ok(Self::Cityscapes),
            "camvid" => Ok(Self::Camvid),
            other => Err(format!(
                "{} has no built-in palette. Use `cityscapes`, `camvid` or a palette_file.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DatasetSettings {
    #[serde(default)]
    pub name: Dataset,
    #[serde(default)]
    pub palette_file: Option<PathBuf>,
}

impl DatasetSettings {
    pub fn palette(&self) -> Result<Palette, LoadError> {
        if let Some(path) = &self.palette_file {
            return Palette::load(path).map_err(|e| {
                LoadError::Config(format!("palette file {}: {}", path.display(), e))
            });
        }

        Ok(match self.name {
            Dataset::Cityscapes => Palette::cityscapes(),
            Dataset::Camvid => Palette::camvid(),
        })
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(try_from = "String")]
pub enum SourceKind {
    #[default]
    Camera,
    Folder,
}

impl TryFrom<String> for SourceKind {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "camera" => Ok(Self::Camera),
            "folder" => Ok(Self::Folder),
            other => Err(format!(
                "{} is not a supported input source. Use either `camera` or `folder`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct InputSettings {
    #[serde(default)]
    pub source: SourceKind,
    #[serde(default)]
    pub camera_index: u32,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default)]
    pub folder: Option<PathBuf>,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

fn default_fps() -> u32 {
    30
}

fn default_max_consecutive_failures() -> u32 {
    30
}

impl Default for InputSettings {
    fn default() -> Self {
        Self {
            source: SourceKind::default(),
            camera_index: 0,
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            folder: None,
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(try_from = "String")]
pub enum Encoding {
    Rgb8,
    #[default]
    Bgr8,
}

impl From<Encoding> for PixelOrder {
    fn from(encoding: Encoding) -> Self {
        match encoding {
            Encoding::Rgb8 => PixelOrder::Rgb8,
            Encoding::Bgr8 => PixelOrder::Bgr8,
        }
    }
}

impl TryFrom<String> for Encoding {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "rgb8" => Ok(Self::Rgb8),
            "bgr8" => Ok(Self::Bgr8),
            other => Err(format!(
                "{} is not a supported encoding. Use either `rgb8` or `bgr8`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct OutputSettings {
    #[serde(default)]
    pub loopback: Option<PathBuf>,
    #[serde(default)]
    pub raw_pipe: Option<PathBuf>,
    #[serde(default)]
    pub encoding: Encoding,
    #[serde(default)]
    pub snapshot: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceSettings {
    #[serde(default = "default_debug_snapshot")]
    pub debug_snapshot: Option<PathBuf>,
}

fn default_debug_snapshot() -> Option<PathBuf> {
    Some(PathBuf::from("../debug/pred_img.png"))
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            debug_snapshot: default_debug_snapshot(),
        }
    }
}

impl ServiceSettings {
    /// Debug snapshot path; an empty string in the configuration disables it
    pub fn debug_snapshot(&self) -> Option<&Path> {
        self.debug_snapshot
            .as_deref()
            .filter(|path| !path.as_os_str().is_empty())
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(try_from = "String")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

/// Load settings from `base_file`, an optional `<environment>.yaml` next to
/// it, and `SEGCAST_`-prefixed environment variables
pub fn get_configuration(base_file: &Path) -> Result<Settings, config::ConfigError> {
    let environment: Environment = std::env::var("SEGCAST_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let overlay = base_file
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!("{}.yaml", environment.as_str()));

    let settings = config::Config::builder()
        .add_source(config::File::from(base_file.to_path_buf()))
        .add_source(config::File::from(overlay).required(false))
        .add_source(
            config::Environment::with_prefix("SEGCAST")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    settings.try_deserialize::<Settings>()
}
