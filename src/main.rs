//! `pixis-capture` command line.
//!
//! Without a subcommand, runs one acquisition with the effective
//! configuration and writes the FITS image.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use pixis_capture::acquisition::SequenceController;
use pixis_capture::config::{CaptureConfig, DEFAULT_CONFIG_PATH};
use pixis_capture::device::mock::MockPvcam;
use pixis_capture::device::PvcamDevice;
use pixis_capture::logging;
use pixis_capture::session::{CameraSelector, DeviceSession};

#[derive(Parser, Debug)]
#[command(name = "pixis-capture", version, about = "Timed CCD exposures over PVCAM, saved as FITS")]
struct Cli {
    /// Configuration file (missing is fine)
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use the simulated camera instead of the PVCAM library
    #[arg(long, global = true)]
    mock: bool,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Acquire and save one image
    Capture(CaptureArgs),
    /// Initialise and uninitialise the PVCAM library
    LibraryTest,
    /// Print the name of a camera
    FindCamera(CameraArgs),
    /// Open and close a camera
    OpenCamera(CameraArgs),
    /// Print the effective configuration
    ShowConfig,
}

#[derive(Args, Debug, Default)]
struct CaptureArgs {
    /// FITS file to write
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Exposure time in seconds
    #[arg(short, long)]
    exposure: Option<u32>,
    /// Number of exposures to run
    #[arg(short, long)]
    frames: Option<u16>,
}

#[derive(Args, Debug)]
struct CameraArgs {
    /// Camera index
    #[arg(short, long)]
    index: Option<i16>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = CaptureConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    if let Some(level) = &cli.log_level {
        config.application.log_level = level.clone();
    }
    logging::init(&config.application.log_level);

    match cli.command.unwrap_or(Command::Capture(CaptureArgs::default())) {
        Command::Capture(args) => capture(config, args, cli.mock),
        Command::LibraryTest => library_test(cli.mock),
        Command::FindCamera(args) => {
            let index = args.index.unwrap_or(config.camera.index);
            find_camera(index, cli.mock)
        }
        Command::OpenCamera(args) => {
            let selector = match args.index {
                Some(index) => CameraSelector::Index(index),
                None => config.camera_selector(),
            };
            open_camera(&selector, cli.mock)
        }
        Command::ShowConfig => {
            print!("{}", config.to_toml().context("rendering configuration")?);
            Ok(())
        }
    }
}

fn device(mock: bool) -> Result<Arc<dyn PvcamDevice>> {
    if mock {
        tracing::info!("Using simulated camera");
        return Ok(Arc::new(MockPvcam::new()));
    }
    hardware_device()
}

#[cfg(feature = "pvcam_hardware")]
fn hardware_device() -> Result<Arc<dyn PvcamDevice>> {
    Ok(Arc::new(pixis_capture::device::pvcam::PvcamSdk::new()))
}

#[cfg(not(feature = "pvcam_hardware"))]
fn hardware_device() -> Result<Arc<dyn PvcamDevice>> {
    anyhow::bail!(
        "PVCAM support is not compiled in; rebuild with `--features pvcam_hardware` or pass --mock"
    )
}

fn capture(mut config: CaptureConfig, args: CaptureArgs, mock: bool) -> Result<()> {
    if let Some(output) = args.output {
        config.output.path = output;
    }
    if let Some(seconds) = args.exposure {
        config.exposure.seconds = seconds;
    }
    if let Some(frames) = args.frames {
        config.exposure.frames = frames;
    }
    config.validate().context("invalid capture settings")?;

    let region = config.region_descriptor()?;
    let exposure = config.exposure_config()?;

    let session = DeviceSession::open(device(mock)?, &config.camera_selector())
        .context("opening camera")?;
    let mut controller = SequenceController::new(&session, &config.output.path)
        .with_poll_policy(config.poll_policy());

    let frame = controller
        .run_acquisition(exposure, region)
        .context("acquisition failed")?;
    let path = frame.encoded.context("writing FITS image")?;

    println!(
        "{} exposure(s) of {} s, {}x{} pixels, {} bytes, saved to {} at {}",
        frame.frames_acquired,
        frame.metadata.exposure_secs,
        frame.metadata.width,
        frame.metadata.height,
        frame.bytes_arrived,
        path.display(),
        frame.completed_at.to_rfc3339(),
    );
    drop(controller);
    session.close();
    Ok(())
}

fn library_test(mock: bool) -> Result<()> {
    let session = DeviceSession::initialize(device(mock)?).context("initialising PVCAM")?;
    println!("PVCAM library initialised");
    session.close();
    Ok(())
}

fn find_camera(index: i16, mock: bool) -> Result<()> {
    let session = DeviceSession::initialize(device(mock)?).context("initialising PVCAM")?;
    let name = session
        .lookup_name(index)
        .with_context(|| format!("looking up camera {}", index))?;
    println!("Camera {}: {}", index, name);
    session.close();
    Ok(())
}

fn open_camera(selector: &CameraSelector, mock: bool) -> Result<()> {
    let session = DeviceSession::open(device(mock)?, selector).context("opening camera")?;
    println!(
        "Opened '{}' (handle {})",
        session.camera_name(),
        session.handle().map_or(-1, |h| h.0)
    );
    session.close();
    Ok(())
}
