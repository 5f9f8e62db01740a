pub mod capture;
pub mod channel;
pub mod config;
pub mod error;
pub mod output;
pub mod segmentation;
pub mod service;

pub use channel::{FrameChannel, Mailbox, ResultChannel};
pub use error::{ColorizeError, FrameError, LoadError, PaletteError};
pub use service::{InferenceService, ServiceState};
