//! Raw PCM formats and the [`AudioDevice`] trait.
//!
//! The radio side of a phonepatch is a sound device carrying raw
//! interleaved PCM. Unlike the telephony peer, which is just a byte stream,
//! the radio device needs a known format so tones can be synthesized,
//! decoded, mixed and gain-adjusted in place.
//!
//! All sample math happens in `f32` normalized to `[-1.0, 1.0]`. Bytes are
//! decoded on the way in and re-quantized on the way out by [`PcmFormat`].
//!
//! Device backends (OSS, cpal) live in `phonepatch-transport`; a scripted
//! mock lives in `phonepatch-test-harness`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Lowest sample rate the tone codecs are specified for.
pub const MIN_SAMPLE_RATE: u32 = 8000;

// ---------------------------------------------------------------------------
// SampleFormat
// ---------------------------------------------------------------------------

/// Width, signedness and byte order of one PCM sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum SampleFormat {
    S8,
    U8,
    S16Le,
    U16Le,
    S16Be,
    U16Be,
}

impl SampleFormat {
    /// Bytes per sample.
    pub fn width(self) -> usize {
        match self {
            SampleFormat::S8 | SampleFormat::U8 => 1,
            _ => 2,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            SampleFormat::S8 | SampleFormat::S16Le | SampleFormat::S16Be
        )
    }

    /// Half of the integer range: 128 for 8-bit, 32768 for 16-bit.
    fn half_scale(self) -> f32 {
        if self.width() == 1 {
            128.0
        } else {
            32768.0
        }
    }

    /// ALSA-style name, e.g. `S16_LE`.
    pub fn name(self) -> &'static str {
        match self {
            SampleFormat::S8 => "S8",
            SampleFormat::U8 => "U8",
            SampleFormat::S16Le => "S16_LE",
            SampleFormat::U16Le => "U16_LE",
            SampleFormat::S16Be => "S16_BE",
            SampleFormat::U16Be => "U16_BE",
        }
    }

    fn read_raw(self, bytes: &[u8]) -> i32 {
        match self {
            SampleFormat::S8 => bytes[0] as i8 as i32,
            SampleFormat::U8 => bytes[0] as i32,
            SampleFormat::S16Le => i16::from_le_bytes([bytes[0], bytes[1]]) as i32,
            SampleFormat::U16Le => u16::from_le_bytes([bytes[0], bytes[1]]) as i32,
            SampleFormat::S16Be => i16::from_be_bytes([bytes[0], bytes[1]]) as i32,
            SampleFormat::U16Be => u16::from_be_bytes([bytes[0], bytes[1]]) as i32,
        }
    }

    fn write_raw(self, value: i32, out: &mut [u8]) {
        match self {
            SampleFormat::S8 | SampleFormat::U8 => out[0] = value as u8,
            SampleFormat::S16Le | SampleFormat::U16Le => {
                out.copy_from_slice(&(value as u16).to_le_bytes())
            }
            SampleFormat::S16Be | SampleFormat::U16Be => {
                out.copy_from_slice(&(value as u16).to_be_bytes())
            }
        }
    }

    /// Decode one sample to `[-1.0, 1.0)`.
    fn decode(self, bytes: &[u8]) -> f32 {
        let half = self.half_scale();
        let raw = self.read_raw(bytes) as f32;
        if self.is_signed() {
            raw / half
        } else {
            (raw - half) / half
        }
    }

    /// Quantize one sample, clipping to the representable range.
    fn encode(self, value: f32, out: &mut [u8]) {
        let half = self.half_scale();
        let offset = if self.is_signed() { 0.0 } else { half };
        let low = -half + offset;
        let high = half - 1.0 + offset;
        let q = (value * half + offset).round().clamp(low, high);
        self.write_raw(q as i32, out);
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SampleFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "S8" => Ok(SampleFormat::S8),
            "U8" => Ok(SampleFormat::U8),
            "S16_LE" => Ok(SampleFormat::S16Le),
            "U16_LE" => Ok(SampleFormat::U16Le),
            "S16_BE" => Ok(SampleFormat::S16Be),
            "U16_BE" => Ok(SampleFormat::U16Be),
            _ => Err(Error::InvalidParameter(format!(
                "unsupported sample format: {s}"
            ))),
        }
    }
}

impl TryFrom<String> for SampleFormat {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

// ---------------------------------------------------------------------------
// PcmFormat
// ---------------------------------------------------------------------------

/// Complete description of a raw PCM stream.
///
/// Construction validates the sample rate and channel count, so any
/// `PcmFormat` in hand is one the codecs can work with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    sample_format: SampleFormat,
    channels: u16,
    sample_rate: u32,
}

impl PcmFormat {
    /// Build a format, rejecting rates below 8000 Hz and anything but
    /// mono or stereo.
    pub fn new(sample_format: SampleFormat, channels: u16, sample_rate: u32) -> Result<Self> {
        if sample_rate < MIN_SAMPLE_RATE {
            return Err(Error::InvalidParameter(format!(
                "sample rate {sample_rate} below {MIN_SAMPLE_RATE} Hz"
            )));
        }
        if !(1..=2).contains(&channels) {
            return Err(Error::InvalidParameter(format!(
                "unsupported channel count: {channels}"
            )));
        }
        Ok(PcmFormat {
            sample_format,
            channels,
            sample_rate,
        })
    }

    /// 8 kHz, 16-bit little-endian mono: what telephony peers speak.
    pub fn telephony() -> Self {
        PcmFormat {
            sample_format: SampleFormat::S16Le,
            channels: 1,
            sample_rate: 8000,
        }
    }

    pub fn sample_format(&self) -> SampleFormat {
        self.sample_format
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Bytes in one frame (one sample per channel).
    pub fn frame_bytes(&self) -> usize {
        self.sample_format.width() * self.channels as usize
    }

    /// Number of whole frames in `len` bytes.
    pub fn frames_in(&self, len: usize) -> usize {
        len / self.frame_bytes()
    }

    /// Byte length of `duration` worth of audio, rounded down to a frame.
    pub fn bytes_for(&self, duration: Duration) -> usize {
        let frames = (duration.as_secs_f64() * self.sample_rate as f64) as usize;
        frames * self.frame_bytes()
    }

    /// Playback time of `len` bytes.
    pub fn duration_of(&self, len: usize) -> Duration {
        Duration::from_secs_f64(self.frames_in(len) as f64 / self.sample_rate as f64)
    }

    /// Decode whole frames to mono samples, averaging stereo channels.
    ///
    /// A trailing partial frame is ignored.
    pub fn decode_mono(&self, bytes: &[u8]) -> Vec<f32> {
        let width = self.sample_format.width();
        bytes
            .chunks_exact(self.frame_bytes())
            .map(|frame| {
                let sum: f32 = frame
                    .chunks_exact(width)
                    .map(|s| self.sample_format.decode(s))
                    .sum();
                sum / self.channels as f32
            })
            .collect()
    }

    /// Quantize mono samples, duplicating each into every channel.
    pub fn encode_mono(&self, samples: &[f32], out: &mut Vec<u8>) {
        let width = self.sample_format.width();
        let start = out.len();
        out.resize(start + samples.len() * self.frame_bytes(), 0);
        let mut chunks = out[start..].chunks_exact_mut(width);
        for &sample in samples {
            for _ in 0..self.channels {
                if let Some(slot) = chunks.next() {
                    self.sample_format.encode(sample, slot);
                }
            }
        }
    }

    /// `frames` frames at the format's zero level.
    pub fn silence(&self, frames: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(frames * self.frame_bytes());
        self.encode_mono(&vec![0.0; frames], &mut out);
        out
    }

    /// Rewrite every sample in place. The closure receives the frame index
    /// and the decoded sample, and returns the new sample value.
    pub fn map_samples<F>(&self, bytes: &mut [u8], mut f: F)
    where
        F: FnMut(usize, f32) -> f32,
    {
        let width = self.sample_format.width();
        let channels = self.channels as usize;
        let whole = self.frames_in(bytes.len()) * self.frame_bytes();
        for (i, slot) in bytes[..whole].chunks_exact_mut(width).enumerate() {
            let value = f(i / channels, self.sample_format.decode(slot));
            self.sample_format.encode(value, slot);
        }
    }

    /// Multiply every sample by `gain`, clipping at full scale.
    pub fn apply_gain(&self, bytes: &mut [u8], gain: f32) {
        if (gain - 1.0).abs() > f32::EPSILON {
            self.map_samples(bytes, |_, s| s * gain);
        }
    }

    /// Clip every sample to `[-ceiling, ceiling]`.
    pub fn limit(&self, bytes: &mut [u8], ceiling: f32) {
        if ceiling < 1.0 {
            self.map_samples(bytes, |_, s| s.clamp(-ceiling, ceiling));
        }
    }

    /// Largest absolute sample value in `bytes`.
    pub fn peak(&self, bytes: &[u8]) -> f32 {
        let width = self.sample_format.width();
        let whole = self.frames_in(bytes.len()) * self.frame_bytes();
        bytes[..whole]
            .chunks_exact(width)
            .map(|s| self.sample_format.decode(s).abs())
            .fold(0.0, f32::max)
    }
}

impl fmt::Display for PcmFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} Hz {}ch",
            self.sample_format, self.sample_rate, self.channels
        )
    }
}

// ---------------------------------------------------------------------------
// AudioDevice trait
// ---------------------------------------------------------------------------

/// A full-duplex radio sound device carrying raw PCM in a fixed format.
///
/// Reads and writes move raw bytes in [`format()`](AudioDevice::format).
/// Writes are queued for playback; [`pending_output()`](AudioDevice::pending_output)
/// reports how much is still queued so callers can apply an anti-overflow
/// policy instead of letting latency grow without bound.
#[async_trait]
pub trait AudioDevice: Send {
    /// The PCM format of both directions.
    fn format(&self) -> PcmFormat;

    /// Hardware fragment size in bytes.
    fn fragment_size(&self) -> usize;

    /// Bytes written but not yet played.
    fn pending_output(&self) -> usize;

    /// Read up to `max` bytes of captured audio.
    ///
    /// Waits up to `timeout` for data and returns `Ok(None)` if none
    /// arrived. Returns [`Error::StreamClosed`] once the device stops
    /// delivering for good.
    async fn read(&mut self, max: usize, timeout: Duration) -> Result<Option<Bytes>>;

    /// Queue audio for playback, waiting if the device queue is full.
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Wait until all queued output has been played.
    async fn drain(&mut self) -> Result<()>;

    /// Release the device. Later calls fail with [`Error::NotConnected`].
    async fn close(&mut self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
