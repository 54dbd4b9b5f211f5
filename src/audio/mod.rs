//! Audio subsystem module

pub mod backend;
pub mod memory;

#[cfg(feature = "cpal-backend")]
pub mod capture;
#[cfg(feature = "cpal-backend")]
pub mod device;
#[cfg(feature = "cpal-backend")]
pub mod playback;

pub use backend::{
    decode_samples, encode_samples, AudioBackend, CaptureStream, DeviceSelector, DeviceStream,
    PlaybackStream, StreamParams,
};
pub use memory::{DeviceLog, DrainBehavior, MemoryBackend};

#[cfg(feature = "cpal-backend")]
pub use capture::AudioCapture;
#[cfg(feature = "cpal-backend")]
pub use device::{list_devices, AudioDevice, AudioDeviceInfo};
#[cfg(feature = "cpal-backend")]
pub use playback::AudioPlayback;

#[cfg(feature = "cpal-backend")]
use crate::error::AudioError;

/// Backend opening streams on the host's real devices through cpal
#[cfg(feature = "cpal-backend")]
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

#[cfg(feature = "cpal-backend")]
impl AudioBackend for CpalBackend {
    fn open_capture(
        &self,
        device: &DeviceSelector,
        params: &StreamParams,
    ) -> Result<Box<dyn CaptureStream>, AudioError> {
        Ok(Box::new(AudioCapture::open(device, params)?))
    }

    fn open_playback(
        &self,
        device: &DeviceSelector,
        params: &StreamParams,
    ) -> Result<Box<dyn PlaybackStream>, AudioError> {
        Ok(Box::new(AudioPlayback::open(device, params)?))
    }
}
