//! Audio device contract used by the streaming sessions
//!
//! The session engine never talks to an audio API directly. It opens streams
//! through an [`AudioBackend`] and moves fixed-size chunks of interleaved
//! little-endian 16-bit samples through them.

use std::fmt;

use crate::constants::BYTES_PER_SAMPLE;
use crate::error::AudioError;
use crate::session::CancelToken;

/// Which device a stream should be opened on
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeviceSelector {
    /// The host's default input or output device
    #[default]
    Default,
    /// Backend-specific identifier, e.g. `input:USB Audio`
    Id(String),
}

impl DeviceSelector {
    pub fn from_option(id: Option<String>) -> Self {
        match id {
            Some(id) if !id.trim().is_empty() => DeviceSelector::Id(id),
            _ => DeviceSelector::Default,
        }
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelector::Default => f.write_str("default device"),
            DeviceSelector::Id(id) => f.write_str(id),
        }
    }
}

/// Shape of the audio moved through a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub sample_rate: u32,
    pub channels: u16,
    pub chunk_frames: u32,
}

impl StreamParams {
    /// Bytes in one frame (one sample per channel)
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * BYTES_PER_SAMPLE
    }

    /// Interleaved samples in one chunk
    pub fn chunk_samples(&self) -> usize {
        self.chunk_frames as usize * self.channels as usize
    }

    /// Bytes in one chunk, the unit of every device read and socket write
    pub fn chunk_bytes(&self) -> usize {
        self.chunk_frames as usize * self.bytes_per_frame()
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.bytes_per_frame() as u64
    }
}

/// Common part of capture and playback streams
pub trait DeviceStream: Send {
    /// Stop the stream and release the device. Calling it twice is harmless.
    fn close(&mut self) -> Result<(), AudioError>;
}

/// An open input stream
pub trait CaptureStream: DeviceStream {
    /// Fill `buf` completely with the next captured samples.
    ///
    /// Blocks until enough audio is available. Returns [`AudioError::Cancelled`]
    /// as soon as `cancel` fires.
    fn read_chunk(&mut self, buf: &mut [u8], cancel: &CancelToken) -> Result<(), AudioError>;
}

/// An open output stream
pub trait PlaybackStream: DeviceStream {
    /// Queue `data` for playback, blocking while the device is behind.
    fn write(&mut self, data: &[u8], cancel: &CancelToken) -> Result<(), AudioError>;
}

/// Opens capture and playback streams on local devices
pub trait AudioBackend: Send + Sync {
    fn open_capture(
        &self,
        device: &DeviceSelector,
        params: &StreamParams,
    ) -> Result<Box<dyn CaptureStream>, AudioError>;

    fn open_playback(
        &self,
        device: &DeviceSelector,
        params: &StreamParams,
    ) -> Result<Box<dyn PlaybackStream>, AudioError>;
}

/// Write `samples` into `out` as little-endian bytes. `out` must hold exactly
/// two bytes per sample.
pub fn encode_samples(samples: impl IntoIterator<Item = i16>, out: &mut [u8]) {
    for (bytes, sample) in out.chunks_exact_mut(BYTES_PER_SAMPLE).zip(samples) {
        bytes.copy_from_slice(&sample.to_le_bytes());
    }
}

/// Decode little-endian 16-bit samples. A trailing odd byte is ignored.
pub fn decode_samples(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(BYTES_PER_SAMPLE)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}
