use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rouge_core::{FaceMeshDetector, Finish, Frame, KeypointSet, LipRenderer, LipTopology, RenderOutcome, Rgb};
use rouge_hw::Camera;
use rouge_session::{Config, FrameSink, SessionError, SessionState, SinkError, TrackingStatus};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod sinks;

#[derive(Parser)]
#[command(name = "rouge", about = "Rouge virtual lipstick try-on")]
struct Cli {
    /// TOML config file (ROUGE_* environment variables still override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct StyleArgs {
    /// Lipstick shade, e.g. "#DC2626" or "c26"
    #[arg(long)]
    color: Option<Rgb>,
    /// matte or gloss
    #[arg(long)]
    finish: Option<Finish>,
    /// Lip topology TOML (defaults to the built-in Face Mesh table)
    #[arg(long)]
    topology: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a live try-on session from the camera
    Live {
        #[command(flatten)]
        style: StyleArgs,
        /// V4L2 device path
        #[arg(short, long)]
        device: Option<String>,
        /// Face Mesh ONNX model
        #[arg(short, long)]
        model: Option<PathBuf>,
        /// Write frames as PNG files into this directory
        #[arg(long, conflicts_with = "stdout")]
        output_dir: Option<PathBuf>,
        /// Stream raw RGBA frames to stdout
        #[arg(long)]
        stdout: bool,
        /// Stop after writing this many PNG frames
        #[arg(long, requires = "output_dir")]
        max_frames: Option<u64>,
        /// Stop after this many seconds (default: until Ctrl-C)
        #[arg(long)]
        duration: Option<u64>,
    },
    /// Apply lipstick to a still image using landmarks from a JSON file
    Render {
        #[command(flatten)]
        style: StyleArgs,
        /// Input image (any format the image crate reads)
        #[arg(short, long)]
        input: PathBuf,
        /// JSON array of {"x": .., "y": ..} keypoints in image pixels
        #[arg(short, long)]
        landmarks: PathBuf,
        /// Output PNG
        #[arg(short, long)]
        output: PathBuf,
    },
    /// List V4L2 capture devices
    Devices,
    /// Show a shade in RGB, HSV and HSL
    Color {
        /// Hex color, 3 or 6 digits, '#' optional
        hex: String,
    },
}

/// Lightness step for the lighter/darker swatches printed by `rouge color`.
const SWATCH_LIGHTNESS_STEP: f32 = 0.1;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Live {
            style,
            device,
            model,
            output_dir,
            stdout,
            max_frames,
            duration,
        } => {
            let mut config = load_config(cli.config, &style)?;
            if let Some(device) = device {
                config.camera_device = device;
            }
            if let Some(model) = model {
                config.model_path = model;
            }
            let sink: Box<dyn FrameSink> = match (output_dir, stdout) {
                (Some(dir), false) => Box::new(
                    sinks::PngDirSink::create(dir.clone(), max_frames)
                        .with_context(|| format!("creating output directory {}", dir.display()))?,
                ),
                (None, true) => Box::new(sinks::RawStdoutSink::default()),
                _ => bail!("choose an output: --output-dir DIR or --stdout"),
            };
            run_live(config, sink, duration.map(Duration::from_secs)).await?;
        }
        Commands::Render {
            style,
            input,
            landmarks,
            output,
        } => {
            let config = load_config(cli.config, &style)?;
            let outcome = render_still(&config, &input, &landmarks, &output)?;
            let summary = match outcome {
                RenderOutcome::NoLips => serde_json::json!({ "applied": false }),
                RenderOutcome::Applied {
                    covered_pixels,
                    target_value,
                } => serde_json::json!({
                    "applied": true,
                    "covered_pixels": covered_pixels,
                    "target_value": target_value,
                }),
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                tracing::warn!("no V4L2 capture devices found");
            }
            println!("{}", serde_json::to_string_pretty(&devices)?);
        }
        Commands::Color { hex } => {
            let rgb = Rgb::from_hex(&hex)?;
            let hsl = rgb.to_hsl();
            let info = serde_json::json!({
                "hex": rgb.to_hex(),
                "rgb": { "r": rgb.r, "g": rgb.g, "b": rgb.b },
                "hsv": rgb.to_hsv(),
                "hsl": hsl,
                "lighter": hsl.with_lightness(hsl.l + SWATCH_LIGHTNESS_STEP).to_rgb().to_hex(),
                "darker": hsl.with_lightness(hsl.l - SWATCH_LIGHTNESS_STEP).to_rgb().to_hex(),
            });
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
    }

    Ok(())
}

/// Config file + environment, then command-line flags on top.
fn load_config(path: Option<PathBuf>, style: &StyleArgs) -> Result<Config> {
    let mut config = Config::load(path.as_deref()).context("loading configuration")?;
    if let Some(color) = style.color {
        config.color = color;
    }
    if let Some(finish) = style.finish {
        config.finish = finish;
    }
    if let Some(topology) = &style.topology {
        config.topology_path = Some(topology.clone());
    }
    Ok(config)
}

async fn run_live(config: Config, sink: Box<dyn FrameSink>, duration: Option<Duration>) -> Result<()> {
    let (device, width, height) = (config.camera_device.clone(), config.camera_width, config.camera_height);
    let model_path = config.model_path_string();
    tracing::info!(device = %device, model = %model_path, color = %config.color, finish = %config.finish, "starting live session");

    let mut session = rouge_session::start_try_on(
        config,
        move || Camera::open(&device, width, height).map_err(Into::into),
        move || FaceMeshDetector::load(&model_path),
        sink,
    )
    .await?;

    let mut tracking = session.tracking();
    let mut state = session.state_updates();
    let deadline = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
            _ = &mut deadline => break,
            _ = state.wait_for(|s| *s == SessionState::Failed) => {
                tracing::warn!("session ended on its own");
                break;
            }
            changed = tracking.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = *tracking.borrow_and_update();
                match status {
                    TrackingStatus::Tracking => eprintln!("face tracked"),
                    TrackingStatus::FaceLost => eprintln!("face not detected"),
                    TrackingStatus::Searching => {}
                }
            }
        }
    }

    let result = session.stop().await;
    let stats = session.stats();
    eprintln!(
        "presented {} frames ({} with lipstick), {} detections, {} misses",
        stats.frames_presented, stats.frames_composited, stats.detections, stats.misses
    );
    match result {
        // Downstream reader went away (e.g. the player was closed)
        Err(SessionError::Sink(SinkError::Closed)) => Ok(()),
        other => other.map_err(Into::into),
    }
}

fn render_still(config: &Config, input: &Path, landmarks: &Path, output: &Path) -> Result<RenderOutcome> {
    let img = image::open(input)
        .with_context(|| format!("reading image {}", input.display()))?
        .to_rgba8();
    let mut frame = Frame::from(img);

    let text = std::fs::read_to_string(landmarks).with_context(|| format!("reading {}", landmarks.display()))?;
    let keypoints: KeypointSet =
        serde_json::from_str(&text).with_context(|| format!("parsing landmarks {}", landmarks.display()))?;

    let topology: LipTopology = config.topology()?;
    if keypoints.len() != topology.keypoint_count {
        tracing::warn!(
            expected = topology.keypoint_count,
            actual = keypoints.len(),
            "landmark count does not match the topology"
        );
    }

    let renderer = LipRenderer::new(topology, config.render_style());
    let outcome = renderer.render(&mut frame, &keypoints);

    let out = frame
        .into_image()
        .context("rendered frame has inconsistent dimensions")?;
    out.save(output)
        .with_context(|| format!("writing {}", output.display()))?;
    tracing::info!(output = %output.display(), ?outcome, "still rendered");
    Ok(outcome)
}
