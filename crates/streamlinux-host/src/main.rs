use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

mod certs;
mod config;
mod settings;
mod supervisor;

use stream_capture::BackendChoice;
use stream_transport::control::QualityPreset;

/// Desktop streaming host for streamlinux.
///
/// Captures the screen and system audio, encodes them, and streams to a
/// paired viewer over an encrypted peer connection.
#[derive(Parser, Debug)]
#[command(name = "streamlinux-host", version, about)]
struct Cli {
    /// Capture backend.
    #[arg(long, value_parser = ["auto", "server", "compositor"], default_value = "auto")]
    backend: String,

    /// Audio source.
    #[arg(long, value_parser = ["system", "mic", "mixed", "none"])]
    audio: Option<String>,

    /// Video codec.
    #[arg(long, value_parser = ["h264", "h265", "vp8", "vp9", "av1"])]
    codec: Option<String>,

    /// Target video bitrate in bits per second, or "auto".
    #[arg(long)]
    bitrate: Option<String>,

    /// Target frame rate.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=240))]
    fps: Option<u32>,

    /// Quality preset; overrides bitrate/fps.
    #[arg(long, value_parser = ["auto", "low", "medium", "high", "ultra"])]
    quality: Option<String>,

    /// Monitor id to capture.
    #[arg(long)]
    monitor: Option<u32>,

    /// Broker port (used when no broker URL is configured).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the configuration file.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Do not composite the cursor into the stream.
    #[arg(long)]
    no_cursor: bool,

    /// Verbose logging.
    #[arg(long, short)]
    verbose: bool,

    /// List monitors and exit.
    #[arg(long)]
    list_monitors: bool,

    /// List audio capture devices and exit.
    #[arg(long)]
    list_audio_devices: bool,

    /// Token to present to the broker.
    #[arg(long)]
    token: Option<String>,
}

fn main() -> ExitCode {
    // Argument errors exit with code 2 through clap.
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = config::load(cli.config.as_deref())?;
    apply_cli_overrides(&mut config, &cli)?;
    config.validate()?;

    // First run: write the effective defaults so users have a file to
    // edit.
    if cli.config.is_none() {
        if let Some(path) = config::default_config_path() {
            if !path.exists() {
                if let Err(e) = config::save(&config, &path) {
                    tracing::debug!("Could not write default config: {e:#}");
                }
            }
        }
    }

    let backend_choice = match config.display.backend.as_str() {
        "server" => BackendChoice::Server,
        "compositor" => BackendChoice::Compositor,
        _ => BackendChoice::Auto,
    };

    if cli.list_monitors {
        return list_monitors(backend_choice);
    }
    if cli.list_audio_devices {
        return list_audio_devices();
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    runtime.block_on(async move {
        let host_cert = certs::ensure_host_certificate()?;
        tracing::info!(fingerprint = %host_cert.fingerprint, "Host certificate ready");

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT, shutting down"),
                _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
            }
            let _ = shutdown_tx.send(true);
        });

        let host_name = hostname_or_default();
        let options = supervisor::SessionOptions {
            config,
            backend_choice,
            token: cli.token,
            host_name,
        };

        supervisor::run_session(options, shutdown_rx).await
    })
}

/// Fold CLI flags into the loaded configuration.
fn apply_cli_overrides(config: &mut config::HostConfig, cli: &Cli) -> Result<()> {
    config.display.backend = cli.backend.clone();
    if let Some(audio) = &cli.audio {
        config.audio.source = audio.clone();
    }
    if let Some(codec) = &cli.codec {
        config.video.codec = codec.clone();
    }
    if let Some(fps) = cli.fps {
        config.display.fps = fps;
    }
    if let Some(monitor) = cli.monitor {
        config.display.monitor = monitor;
    }
    if let Some(port) = cli.port {
        config.network.port = port;
    }
    if cli.no_cursor {
        config.display.cursor = false;
    }

    if let Some(bitrate) = &cli.bitrate {
        if bitrate != "auto" {
            config.video.bitrate = bitrate
                .parse()
                .with_context(|| format!("--bitrate must be 'auto' or a number, got '{bitrate}'"))?;
        }
    }

    if let Some(quality) = &cli.quality {
        let preset: QualityPreset = quality.parse().map_err(|e| anyhow::anyhow!("{e}"))?;
        let (_scale, bitrate, fps) = preset.parameters();
        config.video.bitrate = bitrate;
        config.display.fps = fps;
    }

    Ok(())
}

fn hostname_or_default() -> String {
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_owned())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "streamlinux-host".to_owned())
}

/// `--list-monitors`: print a table and exit cleanly.
fn list_monitors(choice: BackendChoice) -> Result<()> {
    let mut backend = stream_capture::select_backend(choice)?;
    let monitors = backend.list_monitors()?;

    println!("{:>4}  {:<24} {:>11} {:>12} {:>8}  primary", "id", "name", "geometry", "position", "rate");
    for m in &monitors {
        println!(
            "{:>4}  {:<24} {:>6}x{:<4} {:>5},{:<5} {:>5.1}Hz  {}",
            m.id,
            m.name,
            m.width,
            m.height,
            m.x,
            m.y,
            f64::from(m.refresh_mhz) / 1000.0,
            if m.primary { "yes" } else { "" },
        );
    }
    Ok(())
}

/// `--list-audio-devices`: print the capture devices and exit cleanly.
fn list_audio_devices() -> Result<()> {
    let mut backend = stream_capture::select_audio_backend();
    let devices = backend.list_devices().context("audio enumeration failed")?;

    println!("audio backend: {}", backend.name());
    for device in &devices {
        let kind = if device.monitor { "monitor" } else { "input" };
        println!("  [{kind:<7}] {}", device.name);
    }
    if devices.is_empty() {
        println!("  (no capture devices found)");
    }
    Ok(())
}
