//! Flashcam - Main Entry Point
//!
//! Runs the camera effects pipeline headless until Ctrl-C, a frame limit, or
//! a capture failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use flashcam::capture::{CaptureSource, NokhwaSource, TestPatternSource};
use flashcam::config::{FlashcamConfig, InferenceConfig};
use flashcam::devices::DeviceId;
use flashcam::inference::{onnx, InferenceGateway, OnnxFaceMesh, OnnxSegmenter};
use flashcam::present::HeadlessPresenter;
use flashcam::FrameScheduler;

const TEST_PATTERN_FPS: u32 = 30;

#[derive(Parser, Debug)]
#[command(name = "flashcam", version, about = "Real-time camera effects with adaptive flash")]
struct Args {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Capture device id (see --list-devices), overrides the config
    #[arg(long)]
    device: Option<String>,

    /// Print available capture devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Use a synthetic test pattern instead of a camera
    #[arg(long)]
    test_pattern: bool,

    /// Run without segmentation and landmark models
    #[arg(long)]
    no_ml: bool,

    /// Stop after this many frames
    #[arg(long)]
    frames: Option<u64>,
}

/// Load whichever models are enabled and present; missing ones are skipped
fn build_gateway(config: &InferenceConfig, ml_enabled: bool) -> InferenceGateway {
    let gateway = InferenceGateway::new(config.timeout());
    if !ml_enabled {
        log::info!("ML disabled, running without segmentation or landmarks");
        return gateway;
    }

    let model_dir = match onnx::find_model_dir(config.models_dir.as_deref()) {
        Ok(dir) => dir,
        Err(e) => {
            log::warn!("{}. ML features disabled.", e);
            return gateway;
        }
    };
    log::info!("Model directory: {:?}", model_dir);

    let mut gateway = gateway;
    if config.segmentation_enabled {
        match OnnxSegmenter::load(&model_dir, config.segmentation_threshold) {
            Ok(segmenter) => gateway = gateway.with_segmenter(Arc::new(segmenter)),
            Err(e) => log::warn!("Segmentation disabled: {}", e),
        }
    }
    if config.landmarks_enabled {
        match OnnxFaceMesh::load(&model_dir, config.face_presence_threshold) {
            Ok(face_mesh) => gateway = gateway.with_face_detector(Arc::new(face_mesh)),
            Err(e) => log::warn!("Face landmarks disabled: {}", e),
        }
    }
    gateway
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => FlashcamConfig::load(path)?,
        None => FlashcamConfig::default(),
    };

    let (width, height) = (config.capture.width, config.capture.height);
    let source: Box<dyn CaptureSource> = if args.test_pattern {
        Box::new(TestPatternSource::new(width, height, TEST_PATTERN_FPS))
    } else {
        Box::new(NokhwaSource::new(width, height))
    };

    if args.list_devices {
        for device in source.enumerate()? {
            println!("{}\t{}", device.id, device.label);
        }
        return Ok(());
    }

    let gateway = build_gateway(&config.inference, !args.no_ml);
    let presenter = HeadlessPresenter::new(config.present.refresh_hz);

    let mut scheduler = FrameScheduler::new(
        source,
        gateway,
        config.effects.compositor(),
        config.effects.flash_controller(),
        Box::new(presenter),
    );
    if let Some(frames) = args.frames {
        scheduler = scheduler.with_max_cycles(frames);
    }

    let handle = scheduler.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Ctrl-C received, stopping...");
            handle.stop();
        }
    });

    let device = DeviceId::new(args.device.unwrap_or(config.capture.device));
    let summary = scheduler.run(&device).await?;

    log::info!(
        "Processed {} frames ({} with flash, {} dropped, {} segmentation / {} landmark failures)",
        summary.cycles,
        summary.flash_cycles,
        summary.dropped_frames,
        summary.segmentation_failures,
        summary.landmark_failures
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("Flashcam v{}", env!("CARGO_PKG_VERSION"));

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
