//! cpal-based sound device backend.
//!
//! [`CpalAudioDevice`] opens a named device through the platform audio
//! host (ALSA, CoreAudio, WASAPI) and bridges cpal's callback model to
//! tokio channels:
//!
//! - **capture**: cpal callback -> `mpsc::Sender<Bytes>` -> [`read()`](AudioDevice::read)
//! - **playback**: [`write()`](AudioDevice::write) -> `mpsc::Sender<Bytes>` -> cpal callback
//!
//! Streams are opened mono at the configured rate; the configured channel
//! count and sample encoding are applied on the byte side so the rest of
//! phonepatch sees the same raw PCM as from an OSS device.
//!
//! cpal streams are not `Send` on every platform, so they live on a
//! dedicated thread for the lifetime of the device.
//!
//! # Feature flag
//!
//! Only compiled with the `audio` feature:
//!
//! ```toml
//! [dependencies]
//! phonepatch-transport = { version = "0.1", features = ["audio"] }
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use phonepatch_core::audio::{AudioDevice, PcmFormat};
use phonepatch_core::error::{Error, Result};
use tokio::sync::mpsc;

/// Channel buffer capacity for audio streams, in callback buffers.
const CHANNEL_BUFFER_SIZE: usize = 32;

/// Interval at which [`drain()`](AudioDevice::drain) checks the playback queue.
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Fragment size reported when the host does not expose one.
const DEFAULT_FRAGMENT: usize = 512;

/// Names of every device able to capture or play audio.
pub fn list_audio_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .devices()
        .map_err(|e| Error::Transport(format!("failed to enumerate audio devices: {e}")))?;
    let mut names: Vec<String> = devices
        .filter_map(|d| d.description().ok().map(|desc| desc.name().to_string()))
        .collect();
    names.sort();
    names.dedup();
    Ok(names)
}

/// Find a device by name; `"default"` picks the host default.
fn find_device(name: &str, for_input: bool) -> Result<cpal::Device> {
    let host = cpal::default_host();
    if name.is_empty() || name == "default" {
        let device = if for_input {
            host.default_input_device()
        } else {
            host.default_output_device()
        };
        return device.ok_or_else(|| Error::Transport("no default audio device".into()));
    }
    let devices = if for_input {
        host.input_devices()
            .map_err(|e| Error::Transport(format!("failed to enumerate input devices: {e}")))?
    } else {
        host.output_devices()
            .map_err(|e| Error::Transport(format!("failed to enumerate output devices: {e}")))?
    };
    for device in devices {
        if let Ok(desc) = device.description() {
            if desc.name() == name {
                return Ok(device);
            }
        }
    }
    Err(Error::Transport(format!("audio device not found: {name}")))
}

/// State shared with the playback callback.
struct PlaybackQueue {
    rx: mpsc::Receiver<Bytes>,
    samples: VecDeque<f32>,
    format: PcmFormat,
    queued: Arc<AtomicUsize>,
}

impl PlaybackQueue {
    /// Next sample to play, silence on underrun.
    fn next(&mut self) -> f32 {
        if self.samples.is_empty() {
            if let Ok(data) = self.rx.try_recv() {
                self.samples.extend(self.format.decode_mono(&data));
            }
        }
        match self.samples.pop_front() {
            Some(s) => {
                let played = self.format.frame_bytes();
                let _ = self
                    .queued
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |q| {
                        Some(q.saturating_sub(played))
                    });
                s
            }
            None => 0.0,
        }
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    format: PcmFormat,
    tx: mpsc::Sender<Bytes>,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _info: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|s| s.to_sample::<f32>()).collect();
                let mut out = Vec::with_capacity(samples.len() * format.frame_bytes());
                format.encode_mono(&samples, &mut out);
                // Never block the audio thread.
                let _ = tx.try_send(Bytes::from(out));
            },
            |err| {
                tracing::error!("cpal input stream error: {}", err);
            },
            None,
        )
        .map_err(|e| Error::Transport(format!("failed to build input stream: {e}")))
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut queue: PlaybackQueue,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _info: &cpal::OutputCallbackInfo| {
                for out in data.iter_mut() {
                    *out = T::from_sample(queue.next());
                }
            },
            |err| {
                tracing::error!("cpal output stream error: {}", err);
            },
            None,
        )
        .map_err(|e| Error::Transport(format!("failed to build output stream: {e}")))
}

fn start_streams(
    name: &str,
    format: PcmFormat,
    capture: mpsc::Sender<Bytes>,
    playback: PlaybackQueue,
) -> Result<(cpal::Stream, cpal::Stream)> {
    let config = cpal::StreamConfig {
        channels: 1,
        sample_rate: format.sample_rate(),
        buffer_size: cpal::BufferSize::Default,
    };

    let input = find_device(name, true)?;
    let input_format = input
        .default_input_config()
        .map_err(|e| Error::Transport(format!("no default input config: {e}")))?
        .sample_format();
    let input_stream = match input_format {
        SampleFormat::I16 => build_input::<i16>(&input, &config, format, capture)?,
        SampleFormat::F32 => build_input::<f32>(&input, &config, format, capture)?,
        other => {
            return Err(Error::Unsupported(format!(
                "unsupported input sample format: {other}"
            )))
        }
    };

    let output = find_device(name, false)?;
    let output_format = output
        .default_output_config()
        .map_err(|e| Error::Transport(format!("no default output config: {e}")))?
        .sample_format();
    let output_stream = match output_format {
        SampleFormat::I16 => build_output::<i16>(&output, &config, playback)?,
        SampleFormat::F32 => build_output::<f32>(&output, &config, playback)?,
        other => {
            return Err(Error::Unsupported(format!(
                "unsupported output sample format: {other}"
            )))
        }
    };

    input_stream
        .play()
        .map_err(|e| Error::Transport(format!("failed to start input stream: {e}")))?;
    output_stream
        .play()
        .map_err(|e| Error::Transport(format!("failed to start output stream: {e}")))?;
    Ok((input_stream, output_stream))
}

/// A full-duplex sound device opened through cpal.
pub struct CpalAudioDevice {
    name: String,
    format: PcmFormat,
    fragment_size: usize,
    capture: Option<mpsc::Receiver<Bytes>>,
    playback: Option<mpsc::Sender<Bytes>>,
    leftover: Bytes,
    queued: Arc<AtomicUsize>,
    stop: Option<std::sync::mpsc::Sender<()>>,
}

impl CpalAudioDevice {
    /// Open `name` (or `"default"`) for capture and playback in `format`.
    pub fn open(name: &str, format: PcmFormat, fragment_size: usize) -> Result<Self> {
        let (capture_tx, capture_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let (playback_tx, playback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let queued = Arc::new(AtomicUsize::new(0));
        let queue = PlaybackQueue {
            rx: playback_rx,
            samples: VecDeque::new(),
            format,
            queued: Arc::clone(&queued),
        };

        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let device_name = name.to_string();
        thread::Builder::new()
            .name("cpal-streams".into())
            .spawn(move || match start_streams(&device_name, format, capture_tx, queue) {
                Ok(streams) => {
                    let _ = ready_tx.send(Ok(()));
                    // Dropping the streams stops capture and playback.
                    let _ = stop_rx.recv();
                    drop(streams);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(Error::Io)?;
        ready_rx
            .recv()
            .map_err(|_| Error::Transport(format!("audio thread for {name} exited")))??;

        tracing::info!(device = %name, rate = format.sample_rate(), "Sound device opened");
        Ok(CpalAudioDevice {
            name: name.to_string(),
            format,
            fragment_size: if fragment_size > 0 { fragment_size } else { DEFAULT_FRAGMENT },
            capture: Some(capture_rx),
            playback: Some(playback_tx),
            leftover: Bytes::new(),
            queued,
            stop: Some(stop_tx),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl AudioDevice for CpalAudioDevice {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    fn pending_output(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    async fn read(&mut self, max: usize, timeout: Duration) -> Result<Option<Bytes>> {
        if self.leftover.is_empty() {
            let capture = self.capture.as_mut().ok_or(Error::NotConnected)?;
            match tokio::time::timeout(timeout, capture.recv()).await {
                Ok(Some(data)) => self.leftover = data,
                Ok(None) => return Err(Error::StreamClosed),
                Err(_) => return Ok(None),
            }
        }
        let take = max.min(self.leftover.len());
        Ok(Some(self.leftover.split_to(take)))
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let playback = self.playback.as_ref().ok_or(Error::NotConnected)?;
        self.queued.fetch_add(data.len(), Ordering::Relaxed);
        playback
            .send(Bytes::copy_from_slice(data))
            .await
            .map_err(|_| Error::StreamClosed)
    }

    async fn drain(&mut self) -> Result<()> {
        if self.playback.is_none() {
            return Err(Error::NotConnected);
        }
        while self.queued.load(Ordering::Relaxed) > 0 {
            tokio::time::sleep(DRAIN_POLL).await;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let stop = self.stop.take().ok_or(Error::NotConnected)?;
        let _ = stop.send(());
        self.capture = None;
        self.playback = None;
        self.leftover = Bytes::new();
        tracing::info!(device = %self.name, "Sound device closed");
        Ok(())
    }
}
