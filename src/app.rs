//! Command-line front end shared by the `sender` and `receiver` binaries

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Args;
use crossbeam_channel::Receiver;

use crate::config::{join_host_port, split_host_port, Role, Settings, StreamConfig};
use crate::logging;
use crate::session::{SessionController, SessionReport, StatusEvent};

/// Options common to both binaries. Anything left unset comes from the
/// settings file.
#[derive(Args, Debug, Clone, Default)]
pub struct StreamArgs {
    /// Audio device id as printed by --list-devices (system default if omitted)
    #[arg(long = "device")]
    pub device: Option<String>,

    /// Sample rate in Hz (44100 or 48000)
    #[arg(long = "sample-rate")]
    pub sample_rate: Option<u32>,

    /// Use small chunks for lower latency
    #[arg(long = "low-latency")]
    pub low_latency: bool,

    /// Frames per chunk, overriding the latency preset
    #[arg(long = "chunk-frames")]
    pub chunk_frames: Option<u32>,

    /// Print the available devices and exit
    #[arg(long = "list-devices")]
    pub list_devices: bool,

    /// Print status events as JSON lines on stdout
    #[arg(long = "json")]
    pub json: bool,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long = "log-level")]
    pub log_level: Option<String>,

    /// Settings file to use instead of the per-user one
    #[arg(long = "settings")]
    pub settings: Option<PathBuf>,

    /// Do not write the chosen options back to the settings file
    #[arg(long = "no-save")]
    pub no_save: bool,
}

impl StreamArgs {
    pub fn settings_path(&self) -> Option<PathBuf> {
        self.settings.clone().or_else(Settings::default_path)
    }

    pub fn load_settings(&self) -> Settings {
        match self.settings_path() {
            Some(path) => Settings::load_or_default(&path),
            None => Settings::default(),
        }
    }

    /// Persist `settings` unless `--no-save` was given. Failures only warn.
    pub fn save_settings(&self, settings: &Settings) {
        if self.no_save {
            return;
        }
        let Some(path) = self.settings_path() else {
            return;
        };
        match settings.save(&path) {
            Ok(()) => tracing::debug!("Settings saved to {}", path.display()),
            Err(e) => tracing::warn!("Failed to save settings: {}", e),
        }
    }
}

/// Fold the command line into `settings` and build the session configuration.
///
/// For the sender `address` is the receiver to connect to; for the receiver it
/// is the local address to bind, defaulting to every interface on the stored
/// port.
pub fn resolve_config(
    role: Role,
    address: Option<&str>,
    args: &StreamArgs,
    settings: &mut Settings,
) -> anyhow::Result<StreamConfig> {
    settings.role = role;
    if let Some(address) = address {
        let (host, port) = split_host_port(address)?;
        if role == Role::Sender {
            settings.host = host.to_string();
        }
        settings.port = port;
    }
    if let Some(rate) = args.sample_rate {
        settings.sample_rate = rate;
    }
    if args.low_latency {
        settings.low_latency = true;
    }
    if let Some(device) = &args.device {
        match role {
            Role::Sender => settings.input_device = Some(device.clone()),
            Role::Receiver => settings.output_device = Some(device.clone()),
        }
    }
    if let Some(level) = &args.log_level {
        if !logging::level_is_valid(level) {
            bail!("Unknown log level: {}", level);
        }
        settings.log_level = level.to_lowercase();
    }

    let mut config = settings.to_stream_config();
    if role == Role::Receiver {
        config.address = match address {
            Some(address) => address.to_string(),
            None => join_host_port("0.0.0.0", settings.port),
        };
    }
    if let Some(frames) = args.chunk_frames {
        config = config.with_chunk_frames(frames);
    }
    config.validate()?;
    Ok(config)
}

/// Start `config` and block until the session ends or Ctrl+C is pressed.
pub async fn run_until_stopped(
    controller: Arc<SessionController>,
    config: StreamConfig,
    json: bool,
) -> anyhow::Result<SessionReport> {
    let events = controller.events();
    controller.start(config).context("Failed to start session")?;

    let relay = tokio::task::spawn_blocking(move || relay_events(&events, json));
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            tracing::info!("Stopping...");
        }
        result = relay => {
            if let Err(e) = result {
                tracing::warn!("Event relay ended abnormally: {}", e);
            }
        }
    }

    let stopper = controller.clone();
    let report = tokio::task::spawn_blocking(move || stopper.stop()).await?;
    match report.or_else(|| controller.last_report()) {
        Some(report) => Ok(report),
        None => bail!("Session ended without a report"),
    }
}

/// Forward events until the session's terminal one, printing JSON lines if
/// asked to. Returns the number of events seen.
pub fn relay_events(events: &Receiver<StatusEvent>, json: bool) -> usize {
    let mut seen = 0;
    while let Ok(event) = events.recv() {
        seen += 1;
        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!("Cannot serialize event: {}", e),
            }
        }
        if event.event.is_terminal() {
            break;
        }
    }
    seen
}

/// Print the report of a finished session
pub fn print_report(report: &SessionReport, json: bool) {
    if json {
        match serde_json::to_string(report) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!("Cannot serialize report: {}", e),
        }
        return;
    }
    tracing::info!(
        "Session {} finished after {:.1}s: {} chunks, {:.1} KB, {} connection(s)",
        report.id,
        report.duration.as_secs_f64(),
        report.stats.chunks,
        report.stats.bytes as f64 / 1024.0,
        report.stats.connections
    );
}

/// Print input (`inputs`) or output devices
#[cfg(feature = "cpal-backend")]
pub fn print_devices(inputs: bool, json: bool) -> anyhow::Result<()> {
    let devices: Vec<_> = crate::audio::list_devices()
        .into_iter()
        .filter(|d| if inputs { d.is_input } else { d.is_output })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    let kind = if inputs { "Input" } else { "Output" };
    println!("\n=== Available {} Devices ===", kind);
    for device in &devices {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}:", device.name, default_marker);
        println!("    ID: {}", device.id);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();
    Ok(())
}

/// Settings, logging and configuration for one binary run
pub fn prepare(
    role: Role,
    address: Option<&str>,
    args: &StreamArgs,
) -> anyhow::Result<StreamConfig> {
    let mut settings = args.load_settings();
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| settings.log_level.clone());
    if let Err(e) = logging::init(&level) {
        eprintln!("Logging unavailable: {}", e);
    }

    let config = resolve_config(role, address, args, &mut settings)?;
    args.save_settings(&settings);
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::DeviceSelector;
    use crate::error::ConfigError;
    use crate::session::SessionEvent;
    use chrono::Utc;
    use crossbeam_channel::unbounded;
    use uuid::Uuid;

    #[test]
    fn test_sender_overrides_settings() {
        let mut settings = Settings::default();
        let args = StreamArgs {
            device: Some("input:Line In".to_string()),
            sample_rate: Some(48000),
            low_latency: true,
            ..Default::default()
        };

        let config =
            resolve_config(Role::Sender, Some("192.168.0.7:7000"), &args, &mut settings).unwrap();
        assert_eq!(config.address, "192.168.0.7:7000");
        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.chunk_frames, 128);
        assert_eq!(config.device, DeviceSelector::Id("input:Line In".to_string()));

        assert_eq!(settings.host, "192.168.0.7");
        assert_eq!(settings.port, 7000);
        assert_eq!(settings.input_device.as_deref(), Some("input:Line In"));
        assert_eq!(settings.output_device, None);
    }

    #[test]
    fn test_receiver_binds_all_interfaces_by_default() {
        let mut settings = Settings {
            port: 7100,
            ..Default::default()
        };
        let args = StreamArgs {
            chunk_frames: Some(256),
            ..Default::default()
        };

        let config = resolve_config(Role::Receiver, None, &args, &mut settings).unwrap();
        assert_eq!(config.address, "0.0.0.0:7100");
        assert_eq!(config.chunk_frames, 256);
        assert_eq!(settings.role, Role::Receiver);
        // The remote host remembered for the sender is left alone
        assert_eq!(settings.host, "127.0.0.1");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let args = StreamArgs {
            sample_rate: Some(8000),
            ..Default::default()
        };
        let err = resolve_config(Role::Sender, None, &args, &mut Settings::default()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::UnsupportedSampleRate(8000))
        );

        let args = StreamArgs {
            log_level: Some("loud".to_string()),
            ..Default::default()
        };
        assert!(resolve_config(Role::Sender, None, &args, &mut Settings::default()).is_err());

        assert!(resolve_config(
            Role::Sender,
            Some("host:notaport"),
            &StreamArgs::default(),
            &mut Settings::default()
        )
        .is_err());
    }

    #[test]
    fn test_relay_stops_at_terminal_event() {
        let (tx, rx) = unbounded();
        for event in [
            SessionEvent::Waiting,
            SessionEvent::Stopped,
            SessionEvent::Waiting,
        ] {
            tx.send(StatusEvent {
                session: Uuid::new_v4(),
                role: Role::Receiver,
                at: Utc::now(),
                event,
            })
            .unwrap();
        }
        assert_eq!(relay_events(&rx, false), 2);
        assert_eq!(rx.len(), 1);
    }
}
