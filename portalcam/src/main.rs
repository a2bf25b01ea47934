//! portalcam: entry point.
//!
//! ```text
//! portalcam [DEVICE]             Stream the desktop to DEVICE (default /dev/video0)
//! portalcam -c [DEVICE]          Write colour bars instead
//! portalcam -v                   Debug logging (also DEBUG=1 or PORTALCAM_DEBUG=1)
//! portalcam --config <path>      Load a custom config TOML
//! portalcam --gen-config         Write default config to stdout
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use portalcam::config::CamConfig;
use portalcam::service::CamService;
use portalcam_core::ShutdownReason;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "portalcam", about = "Expose a desktop screencast as a V4L2 loopback camera")]
struct Cli {
    /// Loopback device node. Overrides `device.path` from the config.
    device: Option<String>,

    /// Write SMPTE-style colour bars instead of capturing the desktop.
    #[arg(short = 'c', long)]
    color_bars: bool,

    /// Verbose logging.
    #[arg(short = 'v', long)]
    debug: bool,

    /// Path to configuration TOML file.
    #[arg(long, default_value = "portalcam.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

/// `DEBUG` or `PORTALCAM_DEBUG` set to anything but empty, `0` or `false`.
fn debug_from_env() -> bool {
    ["DEBUG", "PORTALCAM_DEBUG"].iter().any(|name| {
        std::env::var(name).is_ok_and(|v| !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false"))
    })
}

async fn terminate() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut signal) => {
            signal.recv().await;
        }
        Err(_) => std::future::pending::<()>().await,
    }
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        return match CamConfig::default_toml() {
            Ok(text) => {
                println!("{text}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("failed to render default config: {e}");
                ExitCode::FAILURE
            }
        };
    }

    // Load config.
    let mut config = CamConfig::load(&cli.config);
    if let Some(device) = cli.device {
        config.device.path = device;
    }

    // Init tracing.
    let level = if cli.debug || debug_from_env() {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("portalcam v{}", env!("CARGO_PKG_VERSION"));
    info!("output device: {}", config.device.path);

    let color_bars = cli.color_bars;
    let service = CamService::new(config);
    let stop = service.stop_handle();

    // Ctrl-C / SIGTERM handler.
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Ctrl-C received; shutting down"),
            _ = terminate() => info!("SIGTERM received; shutting down"),
        }
        stop.request(ShutdownReason::Interrupted);
    });

    let result = if color_bars {
        service.run_pattern().await
    } else {
        service.run_capture().await
    };

    match result {
        Ok(reason) if reason.is_clean() => {
            info!("stopped: {reason}");
            ExitCode::SUCCESS
        }
        Ok(reason) => {
            error!("stopped: {reason}");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
