//! # pcm-relay
//!
//! Live, uncompressed audio over a single TCP connection between two machines.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────── SENDER ─────────────────────────┐
//! │                                                          │
//! │  ┌──────────────┐  chunks  ┌────────────┐                │
//! │  │ Capture      │ ───────► │ Sender     │ connect_sender │
//! │  │ (audio)      │          │ loop       │ ───────────┐   │
//! │  └──────────────┘          └────────────┘            │   │
//! └──────────────────────────────────────────────────────┼───┘
//!                                                        │ TCP, raw i16 LE stereo
//!                                                        ▼
//! ┌──────────────────────── RECEIVER ────────────────────┼───┐
//! │                                                      │   │
//! │  ┌──────────────┐  chunks  ┌────────────┐  accept    │   │
//! │  │ Playback     │ ◄─────── │ Receiver   │ ◄──────────┘   │
//! │  │ (audio)      │          │ loop       │ listen_receiver│
//! │  └──────────────┘          └────────────┘ (bind+backoff) │
//! └──────────────────────────────────────────────────────────┘
//!
//!  SessionController ── start/stop ──► worker thread (one session)
//!                    ◄── StatusEvent ─┘
//! ```
//!
//! The wire carries nothing but interleaved little-endian 16-bit samples: no
//! header, no framing, no compression.

pub mod app;
pub mod audio;
pub mod config;
pub mod error;
pub mod logging;
pub mod network;
pub mod session;

pub use config::{BackoffPolicy, LatencyProfile, Role, Settings, StreamConfig};
pub use error::{Error, Result};
pub use session::{SessionController, SessionEvent, SessionOutcome, SessionReport, StatusEvent};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

    /// Sample rates a session may be configured with
    pub const SUPPORTED_SAMPLE_RATES: [u32; 2] = [44100, 48000];

    /// Channel count (stereo, the only layout on the wire)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Bytes per sample (16-bit PCM)
    pub const BYTES_PER_SAMPLE: usize = 2;

    /// Frames per chunk
    pub const DEFAULT_CHUNK_FRAMES: u32 = 1024;

    /// Frames per chunk with the low latency preset
    pub const LOW_LATENCY_CHUNK_FRAMES: u32 = 128;

    pub const MAX_CHUNK_FRAMES: u32 = 16384;

    /// Default TCP port
    pub const DEFAULT_PORT: u16 = 65432;

    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// First wait after the receiver finds its port in use
    pub const DEFAULT_BIND_RETRY_DELAY: Duration = Duration::from_secs(1);

    /// Binds attempted before the receiver gives up
    pub const DEFAULT_BIND_ATTEMPTS: u32 = 10;

    /// Pending connections the receiver's listener queues
    pub const LISTEN_BACKLOG: i32 = 1;

    /// Pause after a failed accept before waiting again
    pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

    /// Chunks buffered between a device callback and the session thread
    pub const DEVICE_QUEUE_BUFFERS: usize = 64;
}
