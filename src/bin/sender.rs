//! Audio Sender Application
//!
//! Captures from an input device and streams raw PCM to a receiver over TCP.

use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;

use pcm_relay::{
    app::{self, StreamArgs},
    audio::CpalBackend,
    Role, SessionController, SessionOutcome,
};

/// Stream an input device to a pcm-relay receiver
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Receiver to connect to as host:port (last used if omitted)
    address: Option<String>,

    #[command(flatten)]
    stream: StreamArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.stream.list_devices {
        return app::print_devices(true, cli.stream.json);
    }

    let config = app::prepare(Role::Sender, cli.address.as_deref(), &cli.stream)?;
    tracing::info!(
        "Starting audio sender: {} Hz, {} frames per chunk, target {}",
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
