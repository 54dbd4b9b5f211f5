//! Stream configuration, validation and persisted settings

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::audio::{DeviceSelector, StreamParams};
use crate::constants::*;
use crate::error::ConfigError;

/// Operating mode of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Captures from an input device and connects out to a receiver
    Sender,
    /// Listens for a sender and plays what it receives
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sender => f.write_str("sender"),
            Role::Receiver => f.write_str("receiver"),
        }
    }
}

/// Chunk size presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyProfile {
    /// Larger chunks, more stable on busy networks
    #[default]
    Normal,
    /// Small chunks for lower end-to-end delay
    Low,
}

impl LatencyProfile {
    pub fn chunk_frames(self) -> u32 {
        match self {
            LatencyProfile::Normal => DEFAULT_CHUNK_FRAMES,
            LatencyProfile::Low => LOW_LATENCY_CHUNK_FRAMES,
        }
    }
}

/// Exponential backoff used while the receiver's port is still in use.
///
/// The first retry waits `initial_delay`, every following retry waits twice as
/// long as the previous one. After `max_attempts` failed binds the receiver gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn new(initial_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay,
            max_attempts,
        }
    }

    /// Delay to wait after the `retry`-th failed attempt (zero based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        match 1u32.checked_shl(retry) {
            Some(factor) => self.initial_delay.checked_mul(factor).unwrap_or(Duration::MAX),
            None => Duration::MAX,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BIND_RETRY_DELAY, DEFAULT_BIND_ATTEMPTS)
    }
}

/// Everything a session needs to run one role.
///
/// Built by the caller before `SessionController::start` and never modified once
/// the session runs.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub role: Role,
    /// `host:port` to connect to (sender) or `ip:port` to bind (receiver)
    pub address: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub chunk_frames: u32,
    pub device: DeviceSelector,
    pub connect_timeout: Duration,
    pub bind_backoff: BackoffPolicy,
}

impl StreamConfig {
    fn new(role: Role, address: impl Into<String>) -> Self {
        Self {
            role,
            address: address.into(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            chunk_frames: DEFAULT_CHUNK_FRAMES,
            device: DeviceSelector::Default,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            bind_backoff: BackoffPolicy::default(),
        }
    }

    /// Sender connecting to `address` (`host:port`)
    pub fn sender(address: impl Into<String>) -> Self {
        Self::new(Role::Sender, address)
    }

    /// Receiver binding `address` (`ip:port`, `:port` or `port`)
    pub fn receiver(address: impl Into<String>) -> Self {
        Self::new(Role::Receiver, address)
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_chunk_frames(mut self, chunk_frames: u32) -> Self {
        self.chunk_frames = chunk_frames;
        self
    }

    pub fn with_latency(mut self, profile: LatencyProfile) -> Self {
        self.chunk_frames = profile.chunk_frames();
        self
    }

    pub fn with_device(mut self, device: DeviceSelector) -> Self {
        self.device = device;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_bind_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.bind_backoff = policy;
        self
    }

    /// Check the configuration without touching the network or any device.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(ConfigError::UnsupportedSampleRate(self.sample_rate));
        }
        if self.channels != DEFAULT_CHANNELS {
            return Err(ConfigError::UnsupportedChannels(self.channels));
        }
        if self.chunk_frames == 0 || self.chunk_frames > MAX_CHUNK_FRAMES {
            return Err(ConfigError::InvalidChunkSize(self.chunk_frames));
        }
        match self.role {
            Role::Sender => {
                let (host, port) = split_host_port(&self.address)?;
                if host.is_empty() {
                    return Err(ConfigError::InvalidAddress(self.address.clone()));
                }
                if port == 0 {
                    return Err(ConfigError::InvalidPort(self.address.clone()));
                }
            }
            Role::Receiver => {
                self.bind_addr()?;
            }
        }
        Ok(())
    }

    /// Socket address the receiver binds. An empty host binds every interface.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let (host, port) = split_host_port(&self.address)?;
        let ip = if host.is_empty() {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            host.parse::<IpAddr>()
                .map_err(|_| ConfigError::InvalidAddress(self.address.clone()))?
        };
        Ok(SocketAddr::new(ip, port))
    }

    pub fn stream_params(&self) -> StreamParams {
        StreamParams {
            sample_rate: self.sample_rate,
            channels: self.channels,
            chunk_frames: self.chunk_frames,
        }
    }
}

/// Split `host:port`, `[v6]:port`, `:port` or a bare `port`.
pub fn split_host_port(address: &str) -> Result<(&str, u16), ConfigError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(ConfigError::InvalidAddress(address.to_string()));
    }

    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, port) = rest
            .split_once("]:")
            .ok_or_else(|| ConfigError::InvalidAddress(address.to_string()))?;
        (host, port)
    } else {
        match address.rsplit_once(':') {
            Some((host, _)) if host.contains(':') => {
                return Err(ConfigError::InvalidAddress(address.to_string()))
            }
            Some((host, port)) => (host, port),
            None => ("", address),
        }
    };

    let port = port
        .parse::<u16>()
        .map_err(|_| ConfigError::InvalidPort(port.to_string()))?;
    Ok((host, port))
}

/// Inverse of [`split_host_port`], bracketing IPv6 hosts.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Last-used values, persisted between runs of the binaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub role: Role,
    pub host: String,
    pub port: u16,
    pub sample_rate: u32,
    pub low_latency: bool,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            role: Role::Sender,
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            sample_rate: DEFAULT_SAMPLE_RATE,
            low_latency: false,
            input_device: None,
            output_device: None,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// `settings.toml` inside the platform configuration directory
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "pcm-relay").map(|dirs| dirs.config_dir().join("settings.toml"))
    }

    /// Load settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text).map_err(|e| ConfigError::Settings(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::Settings(format!("{}: {}", path.display(), e))),
        }
    }

    /// Like [`Settings::load`] but falls back to defaults on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Ignoring unreadable settings: {}", e);
            Self::default()
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| ConfigError::Settings(format!("{}: {}", dir.display(), e)))?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| ConfigError::Settings(e.to_string()))?;
        std::fs::write(path, text)
            .map_err(|e| ConfigError::Settings(format!("{}: {}", path.display(), e)))
    }

    pub fn latency(&self) -> LatencyProfile {
        if self.low_latency {
            LatencyProfile::Low
        } else {
            LatencyProfile::Normal
        }
    }

    /// Stream configuration for this role built from the stored values
    pub fn to_stream_config(&self) -> StreamConfig {
        let address = join_host_port(&self.host, self.port);
        let (config, device) = match self.role {
            Role::Sender => (StreamConfig::sender(address), &self.input_device),
            Role::Receiver => (StreamConfig::receiver(address), &self.output_device),
        };
        config
            .with_sample_rate(self.sample_rate)
            .with_latency(self.latency())
            .with_device(DeviceSelector::from_option(device.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StreamConfig::sender("192.168.1.20:65432");
        assert_eq!(config.sample_rate, 44100);
        assert_eq!(config.channels, 2);
        assert_eq!(config.chunk_frames, 1024);
        assert!(config.validate().is_ok());
        assert!(StreamConfig::receiver(":65432").validate().is_ok());
    }

    #[test]
    fn test_low_latency_profile() {
        let config = StreamConfig::sender("host:1").with_latency(LatencyProfile::Low);
        assert_eq!(config.chunk_frames, 128);
        assert_eq!(config.stream_params().chunk_bytes(), 512);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert_eq!(
            StreamConfig::sender("h:1").with_sample_rate(22050).validate(),
            Err(ConfigError::UnsupportedSampleRate(22050))
        );
        assert_eq!(
            StreamConfig::sender("h:1").with_chunk_frames(0).validate(),
            Err(ConfigError::InvalidChunkSize(0))
        );
        let mut mono = StreamConfig::sender("h:1");
        mono.channels = 1;
        assert_eq!(mono.validate(), Err(ConfigError::UnsupportedChannels(1)));

        assert!(matches!(
            StreamConfig::sender("65432").validate(),
            Err(ConfigError::InvalidAddress(_))
        ));
        assert!(matches!(
            StreamConfig::sender("localhost:0").validate(),
            Err(ConfigError::InvalidPort(_))
        ));
        assert!(matches!(
            StreamConfig::sender("localhost:http").validate(),
            Err(ConfigError::InvalidPort(_))
        ));
        assert!(matches!(
            StreamConfig::receiver("not-an-ip:5000").validate(),
            Err(ConfigError::InvalidAddress(_))
        ));
        assert!(matches!(
            StreamConfig::receiver("::1:5000").validate(),
            Err(ConfigError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_bind_addr_forms() {
        let all = StreamConfig::receiver("65432").bind_addr().unwrap();
        assert_eq!(all, "0.0.0.0:65432".parse().unwrap());

        let colon = StreamConfig::receiver(":7000").bind_addr().unwrap();
        assert_eq!(colon, "0.0.0.0:7000".parse().unwrap());

        let v6 = StreamConfig::receiver("[::1]:7000").bind_addr().unwrap();
        assert_eq!(v6, "[::1]:7000".parse().unwrap());

        let ephemeral = StreamConfig::receiver("127.0.0.1:0");
        assert!(ephemeral.validate().is_ok());
    }

    #[test]
    fn test_host_port_join() {
        assert_eq!(join_host_port("10.0.0.5", 9000), "10.0.0.5:9000");
        assert_eq!(join_host_port("::1", 9000), "[::1]:9000");
        let joined = join_host_port("fe80::2", 65432);
        assert_eq!(split_host_port(&joined).unwrap(), ("fe80::2", 65432));
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), 10);
        let delays: Vec<u64> = (0..10).map(|i| policy.delay_for(i).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 512]);
        assert_eq!(policy.delay_for(64), Duration::MAX);
    }

    #[test]
    fn test_settings_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.toml");

        assert_eq!(Settings::load(&path).unwrap(), Settings::default());

        let settings = Settings {
            role: Role::Receiver,
            host: "0.0.0.0".to_string(),
            port: 7001,
            sample_rate: 48000,
            low_latency: true,
            input_device: None,
            output_device: Some("output:Speakers".to_string()),
            log_level: "debug".to_string(),
        };
        settings.save(&path).unwrap();
        assert_eq!(Settings::load(&path).unwrap(), settings);

        let config = settings.to_stream_config();
        assert_eq!(config.role, Role::Receiver);
        assert_eq!(config.chunk_frames, 128);
        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.device, DeviceSelector::Id("output:Speakers".to_string()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_corrupt_settings_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "port = \"not a number\"").unwrap();
        assert!(Settings::load(&path).is_err());
        assert_eq!(Settings::load_or_default(&path), Settings::default());
    }

    proptest! {
        #[test]
        fn sender_accepts_any_nonzero_port(port in 1u16..=u16::MAX, chunk in 1u32..=MAX_CHUNK_FRAMES) {
            let config = StreamConfig::sender(format!("10.0.0.5:{}", port)).with_chunk_frames(chunk);
            prop_assert!(config.validate().is_ok());
        }

        #[test]
        fn unsupported_rates_are_rejected(rate in any::<u32>()) {
            prop_assume!(!SUPPORTED_SAMPLE_RATES.contains(&rate));
            let config = StreamConfig::receiver(":65432").with_sample_rate(rate);
            prop_assert_eq!(config.validate(), Err(ConfigError::UnsupportedSampleRate(rate)));
        }
    }
}
