//! Audio Receiver Application
//!
//! Accepts one sender at a time and plays its stream on an output device.

use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;

use pcm_relay::{
    app::{self, StreamArgs},
    audio::CpalBackend,
    Role, SessionController, SessionOutcome,
};

/// Play audio streamed by a pcm-relay sender
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Address to listen on: ip:port, :port or port (all interfaces on the
    /// last used port if omitted)
    address: Option<String>,

    #[command(flatten)]
    stream: StreamArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.stream.list_devices {
        return app::print_devices(false, cli.stream.json);
    }

    let config = app::prepare(Role::Receiver, cli.address.as_deref(), &cli.stream)?;
    tracing::info!(
        "Starting audio receiver: {} Hz, {} frames per chunk, listening on {}",
        config.sample_rate,
        config.chunk_frames,
        config.address
    );

    let controller = Arc::new(SessionController::new(Arc::new(CpalBackend)));
    let report = app::run_until_stopped(controller, config, cli.stream.json).await?;
    app::print_report(&report, cli.stream.json);

    if let SessionOutcome::Failed { reason } = report.outcome {
        bail!(reason);
    }
    Ok(())
}
