//! Error types for the streaming engine

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("A session is already running")]
    AlreadyRunning,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// True when the error is the result of a Stop request rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Error::Transport(TransportError::Cancelled) | Error::Audio(AudioError::Cancelled)
        )
    }
}

/// Invalid stream configuration, rejected before any I/O happens
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid port: {0}")]
    InvalidPort(String),

    #[error("Unsupported sample rate: {0} Hz")]
    UnsupportedSampleRate(u32),

    #[error("Unsupported channel count: {0}")]
    UnsupportedChannels(u16),

    #[error("Invalid chunk size: {0} frames")]
    InvalidChunkSize(u32),

    #[error("Settings error: {0}")]
    Settings(String),
}

/// TCP transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Cannot resolve {address}: {source}")]
    Resolve {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Connection to {address} failed: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Connection to {address} timed out after {timeout:?}")]
    ConnectTimeout { address: String, timeout: Duration },

    #[error("Bind to {address} failed: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Address {address} still in use after {attempts} attempts")]
    BindExhausted { address: SocketAddr, attempts: u32 },

    #[error("Accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("Socket IO failed: {0}")]
    Io(#[from] io::Error),

    #[error("Cancelled")]
    Cancelled,
}

/// Audio collaborator errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to open stream: {0}")]
    Open(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Capture source ended")]
    EndOfStream,

    #[error("Cancelled")]
    Cancelled,

    #[error("Failed to close stream: {0}")]
    Close(String),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
