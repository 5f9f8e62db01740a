use anyhow::{Context, Result};
use clap::Parser;
use segcast::capture::{run_source, CaptureSource, ImageFolderSource, WebcamCapture};
use segcast::config::{get_configuration, Device, LogLevel, Settings, SourceKind};
use segcast::output::{run_sinks, OutputSink, RawPipeSink, SnapshotSink, V4L2Output};
use segcast::{FrameChannel, InferenceService, ResultChannel};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base configuration file
    #[arg(short, long, default_value = "configuration/base.yaml")]
    config: PathBuf,

    /// Checkpoint path, may contain ASSETS_PATH
    #[arg(long)]
    checkpoint: Option<String>,

    /// Directory substituted for ASSETS_PATH in the checkpoint path
    #[arg(long)]
    asset_root: Option<PathBuf>,

    /// Compute device: cpu, cuda:<id> or tensorrt:<id>
    #[arg(long)]
    device: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings = get_configuration(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;
    apply_overrides(&mut settings, &args)?;

    let level = if args.debug || settings.log_level == LogLevel::Debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    tracing::info!("segcast starting");
    tracing::info!("Checkpoint: {}", settings.model.checkpoint);
    tracing::info!("Device: {}", settings.model.device);
    tracing::info!(
        "Input: {:?} {}x{}@{}",
        settings.input.source,
        settings.input.width,
        settings.input.height,
        settings.input.fps
    );

    let frames = Arc::new(FrameChannel::new());
    let results = Arc::new(ResultChannel::new());

    // Nothing is consumed until the model is loaded and bound
    let mut service = InferenceService::start(&settings, results.clone())
        .context("Failed to initialize inference service")?;

    let mut sinks = open_sinks(&settings)?;
    if sinks.is_empty() {
        tracing::warn!("No output sinks configured, results are only kept in memory");
    }

    // Camera handles are not Send; the source is opened on the capture thread
    let capture = {
        let frames = frames.clone();
        let settings = settings.clone();
        thread::Builder::new()
            .name("capture".into())
            .spawn(move || {
                let result = open_source(&settings).and_then(|mut source| {
                    run_source(
                        source.as_mut(),
                        &frames,
                        settings.input.fps,
                        settings.input.max_consecutive_failures,
                    )
                });
                frames.close();
                result
            })
            .context("Failed to spawn capture thread")?
    };

    let publisher = {
        let results = results.clone();
        thread::Builder::new()
            .name("publish".into())
            .spawn(move || run_sinks(&results, &mut sinks))
            .context("Failed to spawn output thread")?
    };

    tracing::info!("Press Ctrl+C to stop");
    service.run(&frames);

    let captured = capture
        .join()
        .map_err(|_| anyhow::anyhow!("Capture thread panicked"))?;
    publisher
        .join()
        .map_err(|_| anyhow::anyhow!("Output thread panicked"))?;

    captured.context("Capture failed")
}

fn apply_overrides(settings: &mut Settings, args: &Args) -> Result<()> {
    if let Some(checkpoint) = &args.checkpoint {
        settings.model.checkpoint = checkpoint.clone();
    }
    if let Some(root) = &args.asset_root {
        settings.model.asset_root = Some(root.clone());
    }
    if let Some(device) = &args.device {
        settings.model.device = Device::try_from(device.clone()).map_err(anyhow::Error::msg)?;
    }
    Ok(())
}

fn open_source(settings: &Settings) -> Result<Box<dyn CaptureSource>> {
    let input = &settings.input;
    Ok(match input.source {
        SourceKind::Camera => Box::new(
            WebcamCapture::new(input.camera_index, input.width, input.height, input.fps)
                .context("Failed to initialize webcam capture")?,
        ),
        SourceKind::Folder => {
            let folder = input
                .folder
                .as_ref()
                .context("input.folder is required for the folder source")?;
            Box::new(ImageFolderSource::new(folder)?)
        }
    })
}

fn open_sinks(settings: &Settings) -> Result<Vec<Box<dyn OutputSink>>> {
    let output = &settings.output;
    let mut sinks: Vec<Box<dyn OutputSink>> = Vec::new();

    if let Some(device) = &output.loopback {
        sinks.push(Box::new(
            V4L2Output::new(device, settings.input.width, settings.input.height)
                .context("Failed to initialize v4l2loopback output")?,
        ));
    }
    if let Some(path) = &output.raw_pipe {
        sinks.push(Box::new(RawPipeSink::open(path, output.encoding.into())?));
    }
    if let Some(path) = &output.snapshot {
        sinks.push(Box::new(SnapshotSink::new(path)));
    }

    Ok(sinks)
}
