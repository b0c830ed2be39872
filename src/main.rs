//! strobe: burst capture, export and timing diagnostics

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use strobe::capture::{CameraDriver, SimulatedCamera};
use strobe::diagnostics::TimingReport;
use strobe::display::ConsoleDisplay;
use strobe::export::avi::read_mjpeg_avi;
use strobe::export::sidecar::Sidecar;
use strobe::{Config, ExportFormat, Exporter, Session};

#[derive(Parser, Debug)]
#[command(
    name = "strobe",
    version,
    about = "Burst capture with video / TIFF export and timing diagnostics"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Preview, capture one burst, export it and print timing diagnostics
    Capture(CaptureArgs),

    /// Compute timing diagnostics from a metadata sidecar
    Diagnose {
        sidecar: PathBuf,
        /// Also write the interval / exposure / ideal series as CSV
        #[arg(long)]
        csv: Option<PathBuf>,
    },

    /// Summarize an exported video or image stack
    Inspect { artifact: PathBuf },
}

#[derive(Args, Debug)]
struct CaptureArgs {
    /// TOML configuration file, layered over defaults and under STROBE__* variables
    #[arg(short, long, env = "STROBE_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, value_enum)]
    export: Option<ExportChoice>,

    /// Number of frames in the burst
    #[arg(short = 'n', long)]
    frames: Option<usize>,

    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Live view duration before the burst starts
    #[arg(long, default_value_t = 2.0)]
    preview_secs: f64,

    #[arg(long, value_enum, default_value_t = DriverChoice::Sim)]
    driver: DriverChoice,

    /// V4L2 node; auto-detected when omitted
    #[arg(long)]
    device: Option<PathBuf>,

    /// Abort the burst if it takes longer than this
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ExportChoice {
    Video,
    Stack,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum DriverChoice {
    Sim,
    V4l2,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("strobe=info"));
    let registry = tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime()),
    );
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();

    match Cli::parse().command {
        Command::Capture(args) => capture(args).await,
        Command::Diagnose { sidecar, csv } => diagnose(&sidecar, csv.as_deref()),
        Command::Inspect { artifact } => inspect(&artifact),
    }
}

async fn capture(args: CaptureArgs) -> Result<()> {
    info!("strobe launching...");

    let mut config = Config::load(args.config.as_deref())?;
    apply_overrides(&args, &mut config);

    let driver = open_driver(&args, &config)?;
    let exporter = Exporter::from_config(&config.export, config.acquisition.playback_fps);
    let mut session = Session::open(driver, config.acquisition.clone(), config.session.clone())?;

    // Spawn display task
    let console = ConsoleDisplay::new(Duration::from_secs(1));
    let display = tokio::spawn(console.run(session.subscribe()));

    session.start_preview()?;
    let mut refresh = tokio::time::interval(Duration::from_millis(100));
    let preview_for = Duration::from_secs_f64(args.preview_secs.max(0.0));
    let preview_until = tokio::time::Instant::now() + preview_for;
    loop {
        tokio::select! {
            _ = refresh.tick() => {
                session.preview_tick()?;
                if tokio::time::Instant::now() >= preview_until {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted during preview");
                session.close()?;
                return Ok(());
            }
        }
    }

    let snapshot = session.acquire().await?;
    let sidecar_path = snapshot.sidecar_path.clone();
    let report = session.export(&exporter)?;
    info!("Artifact: {}", report.path.display());
    drop(session);

    if let Err(e) = display.await {
        warn!("display task failed: {e}");
    }
    diagnose(&sidecar_path, None)
}

/// Command-line flags win over the file and the environment
fn apply_overrides(args: &CaptureArgs, config: &mut Config) {
    if let Some(frames) = args.frames {
        config.acquisition.target_frames = frames;
    }
    if let Some(output) = &args.output {
        config.session.output_dir = output.clone();
    }
    if let Some(timeout) = args.timeout_ms {
        config.session.acquisition_timeout_ms = Some(timeout);
    }
    match args.export {
        Some(ExportChoice::Video) => config.export.format = ExportFormat::Video,
        Some(ExportChoice::Stack) => config.export.format = ExportFormat::ImageStack,
        None => {}
    }
}

fn open_driver(args: &CaptureArgs, config: &Config) -> Result<Box<dyn CameraDriver>> {
    match args.driver {
        DriverChoice::Sim => Ok(Box::new(SimulatedCamera::new(config.simulator.clone()))),
        #[cfg(feature = "v4l2")]
        DriverChoice::V4l2 => {
            let path = match &args.device {
                Some(path) => path.clone(),
                None => PathBuf::from(strobe::utils::auto_detect_device()?.path),
            };
            info!("Using capture device: {}", path.display());
            Ok(Box::new(strobe::capture::V4l2Camera::open(path)?))
        }
        #[cfg(not(feature = "v4l2"))]
        DriverChoice::V4l2 => Err(eyre!(
            "built without the v4l2 feature, cannot open {}",
            args.device.as_deref().unwrap_or(Path::new("a V4L2 device")).display()
        )),
    }
}

fn diagnose(sidecar: &Path, csv: Option<&Path>) -> Result<()> {
    let sidecar = Sidecar::read(sidecar)?;
    let report = TimingReport::from_sidecar(&sidecar)?;
    let summary = &report.summary;

    info!(
        "{} frames, color space {}, ROI {:?}, ISP {}",
        summary.frames, sidecar.color_space, sidecar.effective_roi, sidecar.isp_enabled
    );
    info!(
        "Interval: ideal {:.3} ms, median {:.3} ms, mean {:.3} ms, stddev {:.3} ms, range [{:.3}, {:.3}] ms",
        summary.ideal_interval_ms,
        summary.median_interval_ms,
        summary.mean_interval_ms,
        summary.stddev_interval_ms,
        summary.min_interval_ms,
        summary.max_interval_ms
    );
    match summary.mean_exposure_ms {
        Some(exposure) => info!("Exposure: mean {:.3} ms", exposure),
        None => warn!("No exposure readings in sidecar"),
    }
    info!(
        "Effective rate {:.2} fps (measured {:.2} fps)",
        summary.effective_fps, summary.frame_rate
    );
    if summary.long_intervals > 0 || summary.frame_id_gaps > 0 {
        warn!(
            "Suspected drops: {} long intervals, {} missing frame ids",
            summary.long_intervals, summary.frame_id_gaps
        );
    }
    if !sidecar.metadata_errors.is_empty() {
        warn!("{} malformed metadata records", sidecar.metadata_errors.len());
    }

    if let Some(csv) = csv {
        report.write_csv(BufWriter::new(File::create(csv)?))?;
        info!("Series written to {}", csv.display());
    }
    Ok(())
}

fn inspect(artifact: &Path) -> Result<()> {
    match artifact.extension().and_then(|ext| ext.to_str()) {
        Some("avi") => {
            let avi = read_mjpeg_avi(artifact)?;
            info!(
                "{}: {}x{} MJPEG, {} frames ({} declared) at {} fps",
                artifact.display(),
                avi.width,
                avi.height,
                avi.frames.len(),
                avi.declared_frames,
                avi.fps
            );
        }
        #[cfg(feature = "gstreamer-pipeline")]
        Some("mp4") => {
            let clip = strobe::export::gst_video::read_h264_mp4(artifact)?;
            info!(
                "{}: {}x{} H.264, {} frames ({} keyframes) at {} fps",
                artifact.display(),
                clip.width,
                clip.height,
                clip.frames,
                clip.keyframes,
                clip.fps
            );
        }
        Some("tif" | "tiff") => {
            let mut decoder = tiff::decoder::Decoder::new(File::open(artifact)?)?;
            let (width, height) = decoder.dimensions()?;
            let color = decoder.colortype()?;
            let mut pages = 1;
            while decoder.more_images() {
                decoder.next_image()?;
                pages += 1;
            }
            info!("{}: {} pages of {}x{} {:?}", artifact.display(), pages, width, height, color);
        }
        _ => return Err(eyre!("don't know how to inspect {}", artifact.display())),
    }
    Ok(())
}
