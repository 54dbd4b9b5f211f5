//! In-memory audio backend
//!
//! Capture streams replay a scripted list of chunks; playback streams record
//! every write. Used for headless runs and for exercising sessions without
//! audio hardware.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::audio::{
    AudioBackend, CaptureStream, DeviceSelector, DeviceStream, PlaybackStream, StreamParams,
};
use crate::error::AudioError;
use crate::session::CancelToken;

/// What a capture stream does once its scripted chunks are used up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrainBehavior {
    /// Report [`AudioError::EndOfStream`]
    #[default]
    EndOfStream,
    /// Block like a silent live device until the session is cancelled
    Block,
    /// Keep producing zeroed chunks
    Silence,
}

#[derive(Default)]
struct LogInner {
    captures_opened: usize,
    captures_closed: usize,
    playbacks_opened: usize,
    playbacks_closed: usize,
    writes: Vec<Vec<u8>>,
}

/// Record of everything done to the in-memory devices
#[derive(Default)]
pub struct DeviceLog {
    inner: Mutex<LogInner>,
}

impl DeviceLog {
    pub fn captures_opened(&self) -> usize {
        self.inner.lock().captures_opened
    }

    pub fn captures_closed(&self) -> usize {
        self.inner.lock().captures_closed
    }

    pub fn playbacks_opened(&self) -> usize {
        self.inner.lock().playbacks_opened
    }

    pub fn playbacks_closed(&self) -> usize {
        self.inner.lock().playbacks_closed
    }

    /// Streams opened and not yet closed
    pub fn open_streams(&self) -> usize {
        let inner = self.inner.lock();
        inner.captures_opened + inner.playbacks_opened
            - inner.captures_closed
            - inner.playbacks_closed
    }

    /// Every playback write, in order
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.inner.lock().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.inner.lock().writes.len()
    }

    pub fn bytes_written(&self) -> usize {
        self.inner.lock().writes.iter().map(Vec::len).sum()
    }

    /// All played bytes concatenated
    pub fn played(&self) -> Vec<u8> {
        self.inner.lock().writes.concat()
    }
}

/// Audio backend that never touches real hardware
#[derive(Default)]
pub struct MemoryBackend {
    script: Arc<Mutex<VecDeque<Vec<u8>>>>,
    drain: DrainBehavior,
    fail_capture_open: bool,
    fail_playback_open: bool,
    fail_writes_after: Option<usize>,
    log: Arc<DeviceLog>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chunks handed out by capture streams, shared across every stream opened
    pub fn with_capture_chunks(self, chunks: impl IntoIterator<Item = Vec<u8>>) -> Self {
        self.script.lock().extend(chunks);
        self
    }

    pub fn when_drained(mut self, drain: DrainBehavior) -> Self {
        self.drain = drain;
        self
    }

    pub fn failing_capture_open(mut self) -> Self {
        self.fail_capture_open = true;
        self
    }

    pub fn failing_playback_open(mut self) -> Self {
        self.fail_playback_open = true;
        self
    }

    /// Every playback write after the first `count` fails
    pub fn failing_writes_after(mut self, count: usize) -> Self {
        self.fail_writes_after = Some(count);
        self
    }

    pub fn log(&self) -> Arc<DeviceLog> {
        self.log.clone()
    }
}

impl AudioBackend for MemoryBackend {
    fn open_capture(
        &self,
        device: &DeviceSelector,
        _params: &StreamParams,
    ) -> Result<Box<dyn CaptureStream>, AudioError> {
        if self.fail_capture_open {
            return Err(AudioError::DeviceNotFound(device.to_string()));
        }
        self.log.inner.lock().captures_opened += 1;
        Ok(Box::new(MemoryCapture {
            script: self.script.clone(),
            drain: self.drain,
            log: self.log.clone(),
            closed: false,
        }))
    }

    fn open_playback(
        &self,
        device: &DeviceSelector,
        _params: &StreamParams,
    ) -> Result<Box<dyn PlaybackStream>, AudioError> {
        if self.fail_playback_open {
            return Err(AudioError::DeviceNotFound(device.to_string()));
        }
        self.log.inner.lock().playbacks_opened += 1;
        Ok(Box::new(MemoryPlayback {
            fail_writes_after: self.fail_writes_after,
            writes: 0,
            log: self.log.clone(),
            closed: false,
        }))
    }
}

struct MemoryCapture {
    script: Arc<Mutex<VecDeque<Vec<u8>>>>,
    drain: DrainBehavior,
    log: Arc<DeviceLog>,
    closed: bool,
}

impl CaptureStream for MemoryCapture {
    fn read_chunk(&mut self, buf: &mut [u8], cancel: &CancelToken) -> Result<(), AudioError> {
        if self.closed {
            return Err(AudioError::Stream("capture stream closed".to_string()));
        }
        if cancel.is_cancelled() {
            return Err(AudioError::Cancelled);
        }

        let next = self.script.lock().pop_front();
        match (next, self.drain) {
            (Some(chunk), _) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                buf[n..].fill(0);
                Ok(())
            }
            (None, DrainBehavior::Silence) => {
                buf.fill(0);
                Ok(())
            }
            (None, DrainBehavior::Block) => {
                let _ = cancel.signal().recv();
                Err(AudioError::Cancelled)
            }
            (None, DrainBehavior::EndOfStream) => Err(AudioError::EndOfStream),
        }
    }
}

impl DeviceStream for MemoryCapture {
    fn close(&mut self) -> Result<(), AudioError> {
        if !self.closed {
            self.closed = true;
            self.log.inner.lock().captures_closed += 1;
        }
        Ok(())
    }
}

struct MemoryPlayback {
    fail_writes_after: Option<usize>,
    writes: usize,
    log: Arc<DeviceLog>,
    closed: bool,
}

impl PlaybackStream for MemoryPlayback {
    fn write(&mut self, data: &[u8], cancel: &CancelToken) -> Result<(), AudioError> {
        if self.closed {
            return Err(AudioError::Stream("playback stream closed".to_string()));
        }
        if cancel.is_cancelled() {
            return Err(AudioError::Cancelled);
        }
        if matches!(self.fail_writes_after, Some(limit) if self.writes >= limit) {
            return Err(AudioError::Stream("injected write failure".to_string()));
        }
        self.writes += 1;
        self.log.inner.lock().writes.push(data.to_vec());
        Ok(())
    }
}

impl DeviceStream for MemoryPlayback {
    fn close(&mut self) -> Result<(), AudioError> {
        if !self.closed {
            self.closed = true;
            self.log.inner.lock().playbacks_closed += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> StreamParams {
        StreamParams {
            sample_rate: 48000,
            channels: 2,
            chunk_frames: 2,
        }
    }

    #[test]
    fn test_capture_replays_script_then_ends() {
        let backend = MemoryBackend::new().with_capture_chunks(vec![vec![1u8; 8], vec![2u8; 4]]);
        let cancel = CancelToken::new();
        let mut capture = backend.open_capture(&DeviceSelector::Default, &params()).unwrap();

        let mut buf = [0u8; 8];
        capture.read_chunk(&mut buf, &cancel).unwrap();
        assert_eq!(buf, [1u8; 8]);

        // Short chunks are zero padded
        capture.read_chunk(&mut buf, &cancel).unwrap();
        assert_eq!(buf, [2, 2, 2, 2, 0, 0, 0, 0]);

        assert!(matches!(
            capture.read_chunk(&mut buf, &cancel),
            Err(AudioError::EndOfStream)
        ));

        capture.close().unwrap();
        capture.close().unwrap();
        assert_eq!(backend.log().captures_closed(), 1);
        assert_eq!(backend.log().open_streams(), 0);
    }

    #[test]
    fn test_blocking_capture_wakes_on_cancel() {
        let backend = MemoryBackend::new().when_drained(DrainBehavior::Block);
        let cancel = CancelToken::new();
        let mut capture = backend.open_capture(&DeviceSelector::Default, &params()).unwrap();

        let canceller = cancel.clone();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            canceller.cancel();
        });

        let mut buf = [0u8; 8];
        assert!(matches!(
            capture.read_chunk(&mut buf, &cancel),
            Err(AudioError::Cancelled)
        ));
        waker.join().unwrap();
    }

    #[test]
    fn test_playback_records_and_fails_on_demand() {
        let backend = MemoryBackend::new().failing_writes_after(2);
        let cancel = CancelToken::new();
        let mut playback = backend.open_playback(&DeviceSelector::Default, &params()).unwrap();

        playback.write(&[1, 2, 3, 4], &cancel).unwrap();
        playback.write(&[5, 6], &cancel).unwrap();
        assert!(playback.write(&[7, 8], &cancel).is_err());

        let log = backend.log();
        assert_eq!(log.write_count(), 2);
        assert_eq!(log.bytes_written(), 6);
        assert_eq!(log.played(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(log.open_streams(), 1);
        playback.close().unwrap();
        assert_eq!(log.open_streams(), 0);
    }

    #[test]
    fn test_open_failures() {
        let backend = MemoryBackend::new().failing_capture_open().failing_playback_open();
        assert!(backend.open_capture(&DeviceSelector::Default, &params()).is_err());
        assert!(backend.open_playback(&DeviceSelector::Default, &params()).is_err());
        assert_eq!(backend.log().captures_opened(), 0);
        assert_eq!(backend.log().playbacks_opened(), 0);
    }
}
