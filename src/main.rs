//! Command-line front end for the camera bridge.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axis_bridge::bridge::{
    DetectionStateMachine, OutputProtocol, StreamSession, WorkerKind, WorkerSpec,
};
use axis_bridge::config::{load_config, BridgeConfig, DEFAULT_CONFIG_FILE};
use axis_bridge::logging::setup_logging;
use axis_bridge::types::{StreamSettings, WorkerEvent};
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, LevelFilter};

#[derive(Parser)]
#[command(name = "axis_bridge")]
#[command(author, version, about = "Camera worker bridge", long_about = None)]
struct Cli {
    /// Config file (JSON)
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Directory searched first for worker scripts
    #[arg(long, value_name = "DIR")]
    scripts_dir: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe for a camera and print the result as JSON
    Detect,

    /// Stream frames from the camera until Ctrl-C
    Stream {
        /// Which streaming worker to run
        #[arg(long, value_enum)]
        worker: Option<WorkerArg>,

        /// Stop after this many frames
        #[arg(long)]
        frames: Option<u64>,

        /// Write every received frame here as a numbered .jpg
        #[arg(long, value_name = "DIR")]
        out_dir: Option<PathBuf>,

        #[arg(long)]
        width: Option<u32>,

        #[arg(long)]
        height: Option<u32>,

        #[arg(long)]
        fps: Option<u32>,
    },

    /// Run a worker script and print its events
    Run {
        /// Script name, resolved like the built-in workers
        script: String,

        #[arg(long, value_enum, default_value = "line-tagged")]
        protocol: ProtocolArg,

        /// Arguments passed to the script
        #[arg(last = true)]
        args: Vec<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum WorkerArg {
    StreamCamera,
    CameraController,
}

impl From<WorkerArg> for WorkerKind {
    fn from(arg: WorkerArg) -> Self {
        match arg {
            WorkerArg::StreamCamera => WorkerKind::StreamCamera,
            WorkerArg::CameraController => WorkerKind::CameraController,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ProtocolArg {
    LineTagged,
    RawBinary,
}

impl From<ProtocolArg> for OutputProtocol {
    fn from(arg: ProtocolArg) -> Self {
        match arg {
            ProtocolArg::LineTagged => OutputProtocol::LineTagged,
            ProtocolArg::RawBinary => OutputProtocol::RawBinary,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(&cli.config);
    if let Some(dir) = cli.scripts_dir {
        config.scripts_dir = Some(dir);
    }

    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        config.log_level()
    };
    let log_path = setup_logging(Path::new(&config.log_dir), level)
        .map_err(|e| anyhow!("Failed to set up logging: {e}"))?;
    info!("[MAIN] Logging to {}", log_path.display());

    match cli.command {
        Commands::Detect => detect(&config).await,
        Commands::Stream {
            worker,
            frames,
            out_dir,
            width,
            height,
            fps,
        } => {
            if let Some(worker) = worker {
                config.worker = worker.into();
            }
            let defaults = config.stream;
            config.stream = StreamSettings {
                width: width.unwrap_or(defaults.width),
                height: height.unwrap_or(defaults.height),
                fps: fps.unwrap_or(defaults.fps),
            };
            stream(&config, frames, out_dir).await
        }
        Commands::Run {
            script,
            protocol,
            args,
        } => run(&config, script, protocol.into(), args).await,
    }
}

async fn detect(config: &BridgeConfig) -> Result<()> {
    let registry = config.registry();
    let outcome = DetectionStateMachine::standard(registry.clone(), config.interpreter.clone())
        .with_probe_timeout(config.probe_timeout())
        .run()
        .await;
    registry.stop_all().await;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

async fn stream(config: &BridgeConfig, limit: Option<u64>, out_dir: Option<PathBuf>) -> Result<()> {
    if let Some(dir) = &out_dir {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let registry = config.registry();
    let session = Arc::new(StreamSession::new(registry.clone(), config.session_options()));
    let mut frames = session.start().await?;
    info!("[MAIN] Session {} streaming", session.id());

    let mut received: u64 = 0;
    let result = loop {
        tokio::select! {
            frame = frames.next() => {
                let Some(frame) = frame else {
                    info!("[MAIN] Stream ended");
                    break Ok(());
                };
                received += 1;
                if let Some(dir) = &out_dir {
                    let path = dir.join(format!("frame_{received:06}.jpg"));
                    if let Err(e) = tokio::fs::write(&path, &frame).await {
                        break Err(anyhow!("Failed to write {}: {e}", path.display()));
                    }
                }
                if limit.is_some_and(|limit| received >= limit) {
                    break Ok(());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("[MAIN] Interrupted");
                break Ok(());
            }
        }
    };

    session.stop().await;
    registry.stop_all().await;
    println!(
        "{received} frames received, {} dropped",
        session.dropped_frames()
    );
    result
}

async fn run(
    config: &BridgeConfig,
    script: String,
    protocol: OutputProtocol,
    args: Vec<String>,
) -> Result<()> {
    let registry = config.registry();
    let spec = WorkerSpec::new(script.clone(), protocol)
        .args(args)
        .interpreter(config.interpreter.clone())
        .max_frame_bytes(config.max_frame_bytes);

    let mut events = registry.start(&script, &spec).into_subscription();
    let mut exit_code = None;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(WorkerEvent::Frame(frame)) => println!("frame: {} bytes", frame.len()),
                Some(WorkerEvent::Exited(code)) => {
                    exit_code = code;
                    println!("exited: {code:?}");
                }
                Some(event) => println!("{}", serde_json::to_string(&event)?),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                registry.stop(&script).await;
            }
        }
    }

    if events.lagged() > 0 {
        println!("{} events skipped", events.lagged());
    }
    match exit_code {
        Some(0) | None => Ok(()),
        Some(code) => Err(anyhow!("{script} exited with code {code}")),
    }
}
