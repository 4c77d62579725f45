use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UnixListener;
use tracing::{error, info};

use ocular_engine::{
    ConsoleRegistry, EncoderCommand, Engine, EngineConfig, NullBackendHandle, NullConsole,
    NullDriver,
};
use ocular_needle::{JsonNeedleDir, MemoryNeedles, NeedleRepo, NeedleSet};

/// Ocular worker -- drives one SUT console, streams screenshots and video,
/// and answers runner commands (assert_screen, wait_serial, input).
#[derive(Parser, Debug)]
#[command(name = "ocular", version, about)]
struct Args {
    /// Unix socket the runner connects to
    #[arg(long)]
    socket: PathBuf,

    /// Directory for shot-*.png frames and the last.png symlink
    #[arg(long, default_value = "screenshots")]
    screenshot_dir: PathBuf,

    /// Directory for heartbeat, crash marker and control files
    #[arg(long, default_value = ".")]
    run_dir: PathBuf,

    /// Needle database directory (<name>.json + <name>.png pairs)
    #[arg(long)]
    needle_dir: Option<PathBuf>,

    /// Append-only serial log of the SUT
    #[arg(long, default_value = "serial0")]
    serial_file: PathBuf,

    /// Screenshot cadence in seconds (env: SCREENSHOTINTERVAL)
    #[arg(long, default_value_t = 0.5)]
    screenshot_interval: f64,

    /// Default assert_screen timeout in seconds
    #[arg(long, default_value_t = 30.0)]
    default_timeout: f64,

    /// Disable the video encoder (env: NOVIDEO)
    #[arg(long)]
    novideo: bool,

    /// Encoder invocation, e.g. "videoenc -o video.ogv"; runs in the
    /// screenshot dir and reads directives on stdin
    #[arg(long)]
    encoder_cmd: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let worker_id = hostname::get()
        .context("Failed to get hostname")?
        .to_string_lossy()
        .to_string();
    info!(
        worker = %worker_id,
        socket = %args.socket.display(),
        screenshot_dir = %args.screenshot_dir.display(),
        "Starting ocular worker"
    );

    let mut cfg = EngineConfig::new(&args.screenshot_dir, &args.run_dir, &args.serial_file);
    cfg.screenshot_interval = Duration::from_secs_f64(args.screenshot_interval);
    cfg.default_timeout = Duration::from_secs_f64(args.default_timeout);
    cfg.novideo = args.novideo;
    cfg.encoder = args.encoder_cmd.as_deref().and_then(EncoderCommand::parse);
    let cfg = cfg.with_env_overrides();

    let repo: Box<dyn NeedleRepo> = match &args.needle_dir {
        Some(dir) => Box::new(JsonNeedleDir::new(dir)),
        None => Box::new(MemoryNeedles::default()),
    };
    let needles = NeedleSet::new(repo).context("Failed to load needles")?;
    info!(needles = needles.len(), "Needle database ready");

    // The null backend serves until a real hypervisor driver is wired in.
    let backend = NullBackendHandle::new();
    let mut consoles = ConsoleRegistry::new();
    consoles.register("sut", Box::new(NullConsole::new("sut", backend.clone())));
    let driver = Box::new(NullDriver::new(backend));

    let listener = UnixListener::bind(&args.socket)
        .with_context(|| format!("Failed to bind socket: {}", args.socket.display()))?;
    info!("Waiting for the runner to connect");
    let (stream, _) = listener
        .accept()
        .await
        .context("Failed to accept runner connection")?;
    let (reader, writer) = stream.into_split();

    let mut engine = Engine::new(cfg, driver, consoles, needles, reader, writer)?;
    if let Err(e) = engine.run().await {
        // Single crash hook: release the SUT and pipes so the runner
        // reliably observes the worker going away.
        error!("Worker failed: {e:#}");
        engine.emergency_stop().await;
        std::process::exit(1);
    }

    info!("Worker finished");
    Ok(())
}
