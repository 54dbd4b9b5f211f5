//! Audio playback on output devices

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError};

use crate::audio::device::resolve_output;
use crate::audio::{decode_samples, DeviceSelector, DeviceStream, PlaybackStream, StreamParams};
use crate::constants::DEVICE_QUEUE_BUFFERS;
use crate::error::AudioError;
use crate::session::CancelToken;

/// Open playback stream on a cpal output device
pub struct AudioPlayback {
    device_name: String,
    data_tx: Option<Sender<Vec<i16>>>,
    error_rx: Receiver<AudioError>,
    shutdown_tx: Option<Sender<()>>,
    thread_handle: Option<JoinHandle<()>>,
    /// Callbacks that ran out of queued audio and played silence
    underruns: Arc<AtomicU64>,
}

impl AudioPlayback {
    /// Open and start the selected output device
    pub fn open(selector: &DeviceSelector, params: &StreamParams) -> Result<Self, AudioError> {
        let device = resolve_output(selector)?;
        let device_name = device.name.clone();
        let sample_format = device.default_output_config()?.sample_format();

        let config = cpal::StreamConfig {
            channels: params.channels,
            sample_rate: cpal::SampleRate(params.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(params.chunk_frames),
        };

        let (data_tx, data_rx) = bounded::<Vec<i16>>(DEVICE_QUEUE_BUFFERS);
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let underruns = Arc::new(AtomicU64::new(0));
        let underruns_cb = underruns.clone();

        let handle = thread::Builder::new()
            .name("playback".to_string())
            .spawn(move || {
                let cpal_device = device.into_inner();

                let stream = build_stream(
                    &cpal_device,
                    &config,
                    sample_format,
                    &data_rx,
                    &error_tx,
                    &underruns_cb,
                )
                .or_else(|e| {
                    tracing::warn!("Fixed buffer size rejected ({}), using device default", e);
                    let config = cpal::StreamConfig {
                        buffer_size: cpal::BufferSize::Default,
                        ..config.clone()
                    };
                    build_stream(
                        &cpal_device,
                        &config,
                        sample_format,
                        &data_rx,
                        &error_tx,
                        &underruns_cb,
                    )
                });

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::Open(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                let _ = shutdown_rx.recv();
                drop(stream);
            })
            .map_err(|e| AudioError::Open(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(AudioError::Open("playback thread exited".to_string()));
            }
        }

        tracing::debug!(
            "Playing on {} at {} Hz ({:?} samples)",
            device_name,
            params.sample_rate,
            sample_format
        );

        Ok(Self {
            device_name,
            data_tx: Some(data_tx),
            error_rx,
            shutdown_tx: Some(shutdown_tx),
            thread_handle: Some(handle),
            underruns,
        })
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }
}

fn build_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    format: SampleFormat,
    data_rx: &Receiver<Vec<i16>>,
    error_tx: &Sender<AudioError>,
    underruns: &Arc<AtomicU64>,
) -> Result<cpal::Stream, AudioError> {
    match format {
        SampleFormat::I16 => build_output::<i16>(device, config, data_rx, error_tx, underruns),
        SampleFormat::F32 => build_output::<f32>(device, config, data_rx, error_tx, underruns),
        SampleFormat::U16 => build_output::<u16>(device, config, data_rx, error_tx, underruns),
        other => Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
    }
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    data_rx: &Receiver<Vec<i16>>,
    error_tx: &Sender<AudioError>,
    underruns: &Arc<AtomicU64>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<i16>,
{
    let data_rx = data_rx.clone();
    let error_tx = error_tx.clone();
    let underruns = underruns.clone();
    let mut pending: VecDeque<i16> = VecDeque::new();

    device
        .build_output_stream(
            config,
            move |out: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut starved = false;
                for slot in out.iter_mut() {
                    while pending.is_empty() {
                        match data_rx.try_recv() {
                            Ok(samples) => pending.extend(samples),
                            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                        }
                    }
                    *slot = match pending.pop_front() {
                        Some(sample) => T::from_sample(sample),
                        None => {
                            starved = true;
                            T::EQUILIBRIUM
                        }
                    };
                }
                if starved {
                    underruns.fetch_add(1, Ordering::Relaxed);
                }
            },
            move |err| match err {
                cpal::StreamError::DeviceNotAvailable => {
                    let _ = error_tx.try_send(AudioError::Stream(err.to_string()));
                }
                other => tracing::warn!("Playback stream: {}", other),
            },
            None,
        )
        .map_err(|e| AudioError::Open(e.to_string()))
}

impl PlaybackStream for AudioPlayback {
    fn write(&mut self, data: &[u8], cancel: &CancelToken) -> Result<(), AudioError> {
        if let Ok(err) = self.error_rx.try_recv() {
            return Err(err);
        }
        let data_tx = self
            .data_tx
            .as_ref()
            .ok_or_else(|| AudioError::Stream("playback stream closed".to_string()))?;

        let samples = decode_samples(data);
        select! {
            send(data_tx, samples) -> res => {
                res.map_err(|_| AudioError::Stream("playback stream closed".to_string()))
            }
            recv(cancel.signal()) -> _ => Err(AudioError::Cancelled),
        }
    }
}

impl DeviceStream for AudioPlayback {
    fn close(&mut self) -> Result<(), AudioError> {
        drop(self.data_tx.take());
        drop(self.shutdown_tx.take());

        if let Some(handle) = self.thread_handle.take() {
            handle
                .join()
                .map_err(|_| AudioError::Close(format!("{}: playback thread panicked", self.device_name)))?;
            tracing::debug!(
                "Closed playback on {} ({} underruns)",
                self.device_name,
                self.underruns()
            );
        }
        Ok(())
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
