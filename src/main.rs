use class_attendance::{
    camera::Camera,
    cli::{AsciiPreview, SnapshotPreview},
    core::pipeline::PreviewRenderer,
    core::session::{Collaborators, SessionLoop, StopReason},
    core::{OnnxFaceEncoder, OnnxFaceLocator},
    Config, DetectionModel, DistanceComparator, EncodingModel, Paths, ServerEndpoint, Session,
    SessionSettings, StopSignal,
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, reload, Registry};

type LogHandle = reload::Handle<LevelFilter, Registry>;

#[derive(Parser)]
#[command(name = "attendance-client")]
#[command(about = "Classroom attendance by face recognition")]
struct Cli {
    /// Enable development mode (local ./dev_data config, snapshots, debug logs)
    #[arg(long, global = true)]
    dev: bool,

    /// Config file to use instead of the default location
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an attendance session until quit, end of stream or Ctrl-C
    Run(RunArgs),
    /// Download the face database and print a summary
    FetchDatabase {
        /// Server address (overrides server.address)
        #[arg(short, long)]
        server: Option<String>,
    },
    /// List video devices
    ListCameras,
}

#[derive(Args)]
struct RunArgs {
    /// Server address (overrides server.address)
    #[arg(short, long)]
    server: Option<String>,
    /// Camera device index
    #[arg(long)]
    camera: Option<u32>,
    /// Run without the terminal preview
    #[arg(long)]
    no_preview: bool,
    /// Preview frame rate
    #[arg(long)]
    fps: Option<u32>,
    /// Detection frame scale in (0, 1]
    #[arg(long)]
    scale: Option<f32>,
    #[arg(long, value_enum)]
    detection_model: Option<DetectionModel>,
    #[arg(long, value_enum)]
    encoding_model: Option<EncodingModel>,
    /// Euclidean match tolerance
    #[arg(long)]
    tolerance: Option<f32>,
}

impl RunArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(server) = &self.server {
            config.server.address = Some(server.clone());
        }
        if let Some(camera) = self.camera {
            config.camera.device_index = camera;
        }
        if self.no_preview {
            config.session.show_preview = false;
        }
        if let Some(fps) = self.fps {
            config.session.desired_fps = fps;
        }
        if let Some(scale) = self.scale {
            config.session.scale_frame = scale;
        }
        if let Some(model) = self.detection_model {
            config.session.detection_model = model;
        }
        if let Some(model) = self.encoding_model {
            config.session.encoding_model = model;
        }
        if let Some(tolerance) = self.tolerance {
            config.session.match_tolerance = tolerance;
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log = setup_logging(cli.dev);

    let paths = Paths::new(cli.dev)?;
    let mut config = load_config(cli.config.as_deref(), &paths)?;

    match cli.command {
        Commands::Run(args) => {
            args.apply(&mut config);
            config.validate()?;
            run_session(&config, &paths, &log, cli.dev)?;
        }
        Commands::FetchDatabase { server } => {
            if let Some(server) = server {
                config.server.address = Some(server);
            }
            let endpoint = ServerEndpoint::from_config(&config.server)?;
            let database = endpoint.fetch_database()?;

            println!("Received {} known face(s) from {}", database.len(), endpoint.host());
            if let Some(dim) = database.dim() {
                println!("Encoding dimension: {}", dim);
            }
            for (_, student) in database.iter() {
                println!("  {}", student);
            }
        }
        Commands::ListCameras => {
            let cameras = Camera::list_all_cameras()?;
            if cameras.is_empty() {
                println!("No cameras found. Check that /dev/video* exists and is readable.");
                return Ok(());
            }
            for camera in cameras {
                let marker = if camera.supported { "" } else { "  (no supported format)" };
                println!("/dev/video{}: {}{}", camera.index, camera.name, marker);
                println!("    formats: {}", camera.formats.join(", "));
            }
        }
    }

    Ok(())
}

fn load_config(explicit: Option<&std::path::Path>, paths: &Paths) -> Result<Config> {
    if let Some(path) = explicit {
        return Ok(Config::load_from_path(path)?);
    }

    let default_path = paths.config_file();
    if default_path.exists() {
        Ok(Config::load_from_path(&default_path)?)
    } else {
        tracing::debug!("No config at {}, using defaults", default_path.display());
        Ok(Config::default())
    }
}

fn run_session(config: &Config, paths: &Paths, log: &LogHandle, dev: bool) -> Result<()> {
    let settings = SessionSettings {
        scale_frame: config.session.scale_frame,
        detection_model: config.session.detection_model,
        encoding_model: config.session.encoding_model,
    };

    let models_dir = paths.models_dir();
    let locator = OnnxFaceLocator::new(config, &models_dir, settings.detection_model)?;
    let encoder = OnnxFaceEncoder::new(config, &models_dir, settings.encoding_model)?;
    let comparator = DistanceComparator::new(config.session.match_tolerance);

    let endpoint = ServerEndpoint::from_config(&config.server)?;
    let session = Session::start(endpoint, settings).context("Failed to load the face database")?;

    let stop = StopSignal::new();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || handler_stop.request()).context("Failed to install Ctrl-C handler")?;

    let mut camera = Camera::new(&config.camera)?;
    let mut source = camera.start_session()?;

    let mut preview: Option<Box<dyn PreviewRenderer>> = if config.session.show_preview {
        Some(Box::new(AsciiPreview::new(Duration::from_millis(config.session.frame_delay_ms()))))
    } else if let Some(dir) = paths.captures_dir() {
        Some(Box::new(SnapshotPreview::new(dir)?))
    } else {
        None
    };

    let parts = Collaborators {
        source: &mut source,
        locator: &locator,
        encoder: &encoder,
        comparator: &comparator,
        preview: preview.as_mut().map(|p| p.as_mut() as &mut dyn PreviewRenderer),
    };

    // Log lines would tear through the raw-mode preview
    let normal_level = base_log_level(dev);
    if config.session.show_preview {
        set_log_level(log, preview_log_level(normal_level));
    }
    let result = SessionLoop::new(&session, parts, stop).run();
    set_log_level(log, normal_level);

    let summary = result?;
    match summary.stop_reason {
        StopReason::QuitRequested => println!("Session ended by user."),
        StopReason::Interrupted => println!("Session interrupted."),
        StopReason::StreamEnded => println!("Video stream ended."),
    }
    println!(
        "{} frames, {} faces, {} identified, {} attendance records sent",
        summary.frames, summary.faces, summary.identified, summary.flushes
    );

    Ok(())
}

fn base_log_level(dev: bool) -> LevelFilter {
    if dev {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    }
}

/// Only warnings and errors reach stderr while the terminal preview is drawn.
fn preview_log_level(normal: LevelFilter) -> LevelFilter {
    normal.min(LevelFilter::WARN)
}

fn set_log_level(log: &LogHandle, level: LevelFilter) {
    if let Err(e) = log.reload(level) {
        tracing::warn!("Failed to change log level to {}: {}", level, e);
    }
}

fn setup_logging(dev: bool) -> LogHandle {
    let (filter, handle) = reload::Layer::new(base_log_level(dev));
    let registry = tracing_subscriber::registry().with(filter);

    if dev {
        registry
            .with(
                fmt::layer()
                    .with_file(true)
                    .with_line_number(true)
                    .with_thread_ids(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }

    handle
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_caps_logging_at_warn() {
        assert_eq!(preview_log_level(base_log_level(false)), LevelFilter::WARN);
        assert_eq!(preview_log_level(base_log_level(true)), LevelFilter::WARN);
        assert_eq!(preview_log_level(LevelFilter::ERROR), LevelFilter::ERROR);
    }

    #[test]
    fn test_no_preview_flag_disables_preview() {
        let cli = Cli::parse_from(["attendance-client", "run", "--no-preview", "--scale", "0.25"]);
        let mut config = Config::default();
        match cli.command {
            Commands::Run(args) => args.apply(&mut config),
            _ => panic!("expected run"),
        }
        assert!(!config.session.show_preview);
        assert_eq!(config.session.scale_frame, 0.25);
    }
}
