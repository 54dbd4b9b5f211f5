//! Audio capture from input devices
//!
//! The cpal stream lives on its own thread for its whole lifetime; captured
//! buffers are converted to 16-bit samples in the callback and handed to the
//! session through a bounded channel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use crossbeam_channel::{bounded, select, Receiver, Sender};

use crate::audio::device::resolve_input;
use crate::audio::{encode_samples, CaptureStream, DeviceSelector, DeviceStream, StreamParams};
use crate::constants::{BYTES_PER_SAMPLE, DEVICE_QUEUE_BUFFERS};
use crate::error::AudioError;
use crate::session::CancelToken;

/// Open capture stream on a cpal input device
pub struct AudioCapture {
    device_name: String,

    /// Captured buffers, filled by the cpal callback
    data_rx: Receiver<Vec<i16>>,

    /// Fatal stream errors reported by cpal
    error_rx: Receiver<AudioError>,

    /// Samples received but not yet handed out
    pending: VecDeque<i16>,

    /// Dropping this ends the stream thread
    shutdown_tx: Option<Sender<()>>,

    thread_handle: Option<JoinHandle<()>>,

    /// Buffers dropped because the session fell behind
    overruns: Arc<AtomicU64>,
}

impl AudioCapture {
    /// Open and start capturing on the selected input device
    pub fn open(selector: &DeviceSelector, params: &StreamParams) -> Result<Self, AudioError> {
        let device = resolve_input(selector)?;
        let device_name = device.name.clone();
        let sample_format = device.default_input_config()?.sample_format();

        let config = cpal::StreamConfig {
            channels: params.channels,
            sample_rate: cpal::SampleRate(params.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(params.chunk_frames),
        };

        let (data_tx, data_rx) = bounded::<Vec<i16>>(DEVICE_QUEUE_BUFFERS);
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let overruns = Arc::new(AtomicU64::new(0));
        let overruns_cb = overruns.clone();

        let handle = thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || {
                let cpal_device = device.into_inner();

                let stream = build_stream(
                    &cpal_device,
                    &config,
                    sample_format,
                    &data_tx,
                    &error_tx,
                    &overruns_cb,
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
                        &data_tx,
                        &error_tx,
                        &overruns_cb,
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

                // Returns once the owner drops its sender
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
                return Err(AudioError::Open("capture thread exited".to_string()));
            }
        }

        tracing::debug!(
            "Capturing from {} at {} Hz ({:?} samples)",
            device_name,
            params.sample_rate,
            sample_format
        );

        Ok(Self {
            device_name,
            data_rx,
            error_rx,
            pending: VecDeque::with_capacity(params.chunk_samples() * 2),
            shutdown_tx: Some(shutdown_tx),
            thread_handle: Some(handle),
            overruns,
        })
    }

    /// Buffers dropped because nobody read them in time
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }
}

fn build_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    format: SampleFormat,
    data_tx: &Sender<Vec<i16>>,
    error_tx: &Sender<AudioError>,
    overruns: &Arc<AtomicU64>,
) -> Result<cpal::Stream, AudioError> {
    match format {
        SampleFormat::I16 => build_input::<i16>(device, config, data_tx, error_tx, overruns),
        SampleFormat::F32 => build_input::<f32>(device, config, data_tx, error_tx, overruns),
        SampleFormat::U16 => build_input::<u16>(device, config, data_tx, error_tx, overruns),
        other => Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    data_tx: &Sender<Vec<i16>>,
    error_tx: &Sender<AudioError>,
    overruns: &Arc<AtomicU64>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample,
    i16: FromSample<T>,
{
    let data_tx = data_tx.clone();
    let error_tx = error_tx.clone();
    let overruns = overruns.clone();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let samples: Vec<i16> = data.iter().map(|&s| i16::from_sample(s)).collect();
                if data_tx.try_send(samples).is_err() {
                    overruns.fetch_add(1, Ordering::Relaxed);
                }
            },
            move |err| match err {
                cpal::StreamError::DeviceNotAvailable => {
                    let _ = error_tx.try_send(AudioError::Stream(err.to_string()));
                }
                other => tracing::warn!("Capture stream: {}", other),
            },
            None,
        )
        .map_err(|e| AudioError::Open(e.to_string()))
}

impl CaptureStream for AudioCapture {
    fn read_chunk(&mut self, buf: &mut [u8], cancel: &CancelToken) -> Result<(), AudioError> {
        let needed = buf.len() / BYTES_PER_SAMPLE;

        while self.pending.len() < needed {
            select! {
                recv(self.data_rx) -> msg => match msg {
                    Ok(samples) => self.pending.extend(samples),
                    Err(_) => return Err(AudioError::Stream("capture stream closed".to_string())),
                },
                recv(self.error_rx) -> err => {
                    return Err(err.unwrap_or_else(|_| {
                        AudioError::Stream("capture stream closed".to_string())
                    }));
                }
                recv(cancel.signal()) -> _ => return Err(AudioError::Cancelled),
            }
        }

        encode_samples(self.pending.drain(..needed), buf);
        Ok(())
    }
}

impl DeviceStream for AudioCapture {
    fn close(&mut self) -> Result<(), AudioError> {
        drop(self.shutdown_tx.take());

        if let Some(handle) = self.thread_handle.take() {
            handle
                .join()
                .map_err(|_| AudioError::Close(format!("{}: capture thread panicked", self.device_name)))?;
            tracing::debug!(
                "Closed capture on {} ({} overruns)",
                self.device_name,
                self.overruns()
            );
        }
        Ok(())
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
