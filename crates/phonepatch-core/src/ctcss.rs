//! CTCSS (sub-audible tone) helpers.
//!
//! - [`lookup_frequency`] resolves a Motorola PL code or a numeric string.
//! - [`CtcssDetector`] locks onto one of a set of receive tones once it has
//!   been present for a minimum time.
//! - [`CtcssEncoder`] mixes a continuous transmit tone into outgoing PCM.

use std::time::Duration;

use tracing::{debug, trace};

use crate::audio::PcmFormat;
use crate::error::{Error, Result};

/// Analysis block length of the detector.
///
/// Long enough to separate the closest table entries (67.0 / 69.3 Hz).
pub const DETECTOR_BLOCK_TIME: Duration = Duration::from_millis(250);

/// Default fraction of block power the tone must carry to count.
pub const DEFAULT_DETECTOR_THRESHOLD: f32 = 0.05;

const MIN_BLOCK_POWER: f32 = 1e-6;

/// Motorola PL codes.
pub const PL_CODES: [(&str, f32); 42] = [
    ("XZ", 67.0),
    ("WZ", 69.3),
    ("XA", 71.9),
    ("WA", 74.4),
    ("XB", 77.0),
    ("SP", 79.7),
    ("YZ", 82.5),
    ("YA", 85.4),
    ("YB", 88.5),
    ("ZZ", 91.5),
    ("ZA", 94.8),
    ("ZB", 97.4),
    ("1Z", 100.0),
    ("1A", 103.5),
    ("1B", 107.2),
    ("2Z", 110.9),
    ("2A", 114.8),
    ("2B", 118.8),
    ("3Z", 123.0),
    ("3A", 127.3),
    ("3B", 131.8),
    ("4Z", 136.5),
    ("4A", 141.3),
    ("4B", 146.2),
    ("5Z", 151.4),
    ("5A", 156.7),
    ("5B", 162.2),
    ("6Z", 167.9),
    ("6A", 173.8),
    ("6B", 179.9),
    ("7Z", 186.2),
    ("7A", 192.8),
    ("M1", 203.5),
    ("8Z", 206.5),
    ("M2", 210.7),
    ("M3", 218.1),
    ("M4", 225.7),
    ("9Z", 229.2),
    ("M5", 233.6),
    ("M6", 241.8),
    ("M7", 250.3),
    ("0Z", 254.1),
];

/// Resolve a tone id to Hz.
///
/// Accepts a PL code (`"1Z"`), a number (`"100"`, `"100.0"`), or `"off"` /
/// an empty string for no tone.
pub fn lookup_frequency(id: &str) -> Result<Option<f32>> {
    let id = id.trim();
    if id.is_empty() || id.eq_ignore_ascii_case("off") {
        return Ok(None);
    }
    let code = id.to_ascii_uppercase();
    if let Some(&(_, freq)) = PL_CODES.iter().find(|(c, _)| *c == code) {
        return Ok(Some(freq));
    }
    match id.parse::<f32>() {
        Ok(freq) if freq.is_finite() && freq > 0.0 => Ok(Some(freq)),
        _ => Err(Error::InvalidParameter(format!(
            "invalid CTCSS frequency: {id}"
        ))),
    }
}

/// Two tones are the same when they agree to a tenth of a hertz.
pub fn same_tone(a: f32, b: f32) -> bool {
    (a - b).abs() < 0.05
}

// ---------------------------------------------------------------------------
// CtcssDetector
// ---------------------------------------------------------------------------

/// Receive-tone detector.
///
/// Every [`DETECTOR_BLOCK_TIME`] of audio it measures the power at each
/// candidate frequency with a Goertzel filter. The strongest candidate
/// counts as present when it carries more than `threshold` of the block
/// power. A candidate present for `min_lock` worth of consecutive blocks
/// becomes the locked tone; a block without it clears the lock.
#[derive(Debug, Clone)]
pub struct CtcssDetector {
    candidates: Vec<f32>,
    coefficients: Vec<f32>,
    block_size: usize,
    min_blocks: u32,
    threshold: f32,
    block: Vec<f32>,
    streak: Option<(usize, u32)>,
    locked: Option<f32>,
}

impl CtcssDetector {
    pub fn new(
        sample_rate: u32,
        candidates: Vec<f32>,
        min_lock: Duration,
        threshold: f32,
    ) -> Self {
        let rate = sample_rate as f32;
        let coefficients = candidates
            .iter()
            .map(|f| 2.0 * (2.0 * std::f32::consts::PI * f / rate).cos())
            .collect();
        let block_size = (DETECTOR_BLOCK_TIME.as_secs_f32() * rate) as usize;
        let min_blocks = (min_lock.as_secs_f32() / DETECTOR_BLOCK_TIME.as_secs_f32())
            .ceil()
            .max(1.0) as u32;
        CtcssDetector {
            candidates,
            coefficients,
            block_size,
            min_blocks,
            threshold,
            block: Vec::with_capacity(block_size),
            streak: None,
            locked: None,
        }
    }

    /// A detector with nothing to listen for. Never locks.
    pub fn disabled(sample_rate: u32) -> Self {
        Self::new(sample_rate, Vec::new(), Duration::ZERO, DEFAULT_DETECTOR_THRESHOLD)
    }

    pub fn is_enabled(&self) -> bool {
        !self.candidates.is_empty()
    }

    /// The currently locked tone.
    pub fn locked(&self) -> Option<f32> {
        self.locked
    }

    /// Forget any partial block, streak and lock.
    pub fn clear(&mut self) {
        self.block.clear();
        self.streak = None;
        self.locked = None;
    }

    /// Feed mono samples; returns the lock state after them.
    pub fn feed(&mut self, samples: &[f32]) -> Option<f32> {
        if !self.is_enabled() {
            return None;
        }
        let mut rest = samples;
        while !rest.is_empty() {
            let take = (self.block_size - self.block.len()).min(rest.len());
            self.block.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.block.len() == self.block_size {
                let present = self.strongest();
                self.block.clear();
                self.integrate(present);
            }
        }
        self.locked
    }

    /// Index of the candidate carrying enough of the block's power.
    fn strongest(&self) -> Option<usize> {
        let n = self.block.len() as f32;
        let mean_square = self.block.iter().map(|x| x * x).sum::<f32>() / n;
        if mean_square < MIN_BLOCK_POWER {
            return None;
        }
        let (index, power) = self
            .coefficients
            .iter()
            .map(|&coeff| {
                let (mut s1, mut s2) = (0.0f32, 0.0f32);
                for &x in &self.block {
                    let s = x + coeff * s1 - s2;
                    s2 = s1;
                    s1 = s;
                }
                let magnitude = s1 * s1 + s2 * s2 - coeff * s1 * s2;
                // Amplitude^2 / 2 of a sinusoid at this frequency.
                2.0 * magnitude / (n * n)
            })
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))?;
        let fraction = power / mean_square;
        trace!(freq = self.candidates[index], fraction, "CTCSS block");
        (fraction > self.threshold).then_some(index)
    }

    fn integrate(&mut self, present: Option<usize>) {
        let Some(index) = present else {
            if self.locked.take().is_some() {
                debug!("CTCSS tone lost");
            }
            self.streak = None;
            return;
        };
        let count = match self.streak {
            Some((i, c)) if i == index => c + 1,
            _ => 1,
        };
        self.streak = Some((index, count));
        if count >= self.min_blocks {
            let freq = self.candidates[index];
            if self.locked != Some(freq) {
                debug!(freq, "CTCSS tone locked");
            }
            self.locked = Some(freq);
        } else if self.locked.is_some_and(|f| f != self.candidates[index]) {
            self.locked = None;
        }
    }
}

// ---------------------------------------------------------------------------
// CtcssEncoder
// ---------------------------------------------------------------------------

/// Phase-continuous transmit tone mixer.
#[derive(Debug, Clone, PartialEq)]
pub struct CtcssEncoder {
    frequency: f32,
    amplitude: f32,
    phase: f64,
}

impl CtcssEncoder {
    pub fn new(frequency: f32, amplitude: f32) -> Self {
        CtcssEncoder {
            frequency,
            amplitude,
            phase: 0.0,
        }
    }

    pub fn frequency(&self) -> f32 {
        self.frequency
    }

    pub fn amplitude(&self) -> f32 {
        self.amplitude
    }

    /// Add the tone to every sample of `bytes`, continuing from the phase
    /// the previous buffer ended on.
    pub fn mix(&mut self, format: &PcmFormat, bytes: &mut [u8]) {
        let step = 2.0 * std::f64::consts::PI * self.frequency as f64 / format.sample_rate() as f64;
        let phase = self.phase;
        let amplitude = self.amplitude as f64;
        format.map_samples(bytes, |frame, s| {
            s + (amplitude * (phase + step * frame as f64).sin()) as f32
        });
        let frames = format.frames_in(bytes.len()) as f64;
        self.phase = (phase + step * frames) % (2.0 * std::f64::consts::PI);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SampleFormat;

    fn sine(freq: f32, amplitude: f32, seconds: f32, rate: u32) -> Vec<f32> {
        let n = (seconds * rate as f32) as usize;
        (0..n)
            .map(|i| amplitude * (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin())
            .collect()
    }

    #[test]
    fn lookup_code_and_numeric_agree() {
        assert_eq!(lookup_frequency("1Z").unwrap(), Some(100.0));
        assert_eq!(lookup_frequency("100").unwrap(), Some(100.0));
        assert_eq!(lookup_frequency("xa").unwrap(), lookup_frequency("71.9").unwrap());
        assert_eq!(lookup_frequency("0Z").unwrap(), Some(254.1));
    }

    #[test]
    fn lookup_off_and_invalid() {
        assert_eq!(lookup_frequency("").unwrap(), None);
        assert_eq!(lookup_frequency("OFF").unwrap(), None);
        assert!(lookup_frequency("QQ").is_err());
        assert!(lookup_frequency("-5").is_err());
    }

    #[test]
    fn table_is_ascending() {
        assert!(PL_CODES.windows(2).all(|w| w[0].1 < w[1].1));
    }

    #[test]
    fn detector_locks_after_min_time() {
        let mut detector =
            CtcssDetector::new(8000, vec![67.0, 69.3, 100.0], Duration::from_millis(500), 0.05);
        let tone = sine(69.3, 0.2, 0.25, 8000);
        assert_eq!(detector.feed(&tone), None);
        assert_eq!(detector.feed(&sine(69.3, 0.2, 0.25, 8000)), Some(69.3));
        assert_eq!(detector.locked(), Some(69.3));
    }

    #[test]
    fn detector_finds_tone_under_voice() {
        let mut detector =
            CtcssDetector::new(8000, vec![88.5, 100.0, 123.0], Duration::from_millis(250), 0.05);
        let voice = sine(1000.0, 0.3, 1.0, 8000);
        let tone = sine(100.0, 0.1, 1.0, 8000);
        let mixed: Vec<f32> = voice.iter().zip(&tone).map(|(a, b)| a + b).collect();
        assert_eq!(detector.feed(&mixed), Some(100.0));
    }

    #[test]
    fn detector_releases_on_silence() {
        let mut detector = CtcssDetector::new(8000, vec![100.0], Duration::from_millis(250), 0.05);
        assert_eq!(detector.feed(&sine(100.0, 0.2, 0.5, 8000)), Some(100.0));
        assert_eq!(detector.feed(&vec![0.0; 2000]), None);
    }

    #[test]
    fn detector_ignores_voice_only() {
        let mut detector = CtcssDetector::new(8000, vec![100.0], Duration::from_millis(250), 0.05);
        assert_eq!(detector.feed(&sine(1000.0, 0.5, 1.0, 8000)), None);
    }

    #[test]
    fn disabled_detector_never_locks() {
        let mut detector = CtcssDetector::disabled(8000);
        assert!(!detector.is_enabled());
        assert_eq!(detector.feed(&sine(100.0, 0.5, 1.0, 8000)), None);
    }

    #[test]
    fn encoder_is_phase_continuous() {
        let fmt = PcmFormat::new(SampleFormat::S16Le, 1, 8000).unwrap();
        let mut split = CtcssEncoder::new(100.0, 0.1);
        let mut whole = CtcssEncoder::new(100.0, 0.1);

        let mut a = fmt.silence(300);
        let mut b = fmt.silence(300);
        split.mix(&fmt, &mut a);
        split.mix(&fmt, &mut b);
        a.extend_from_slice(&b);

        let mut c = fmt.silence(600);
        whole.mix(&fmt, &mut c);
        assert_eq!(a, c);
        assert!((fmt.peak(&c) - 0.1).abs() < 0.01);
    }

    #[test]
    fn encoded_tone_is_detected() {
        let fmt = PcmFormat::new(SampleFormat::S16Le, 1, 8000).unwrap();
        let mut encoder = CtcssEncoder::new(127.3, 0.15);
        let mut detector =
            CtcssDetector::new(8000, vec![123.0, 127.3, 131.8], Duration::from_millis(500), 0.05);
        let mut locked = None;
        for _ in 0..8 {
            let mut buf = fmt.silence(1000);
            encoder.mix(&fmt, &mut buf);
            locked = detector.feed(&fmt.decode_mono(&buf));
        }
        assert_eq!(locked, Some(127.3));
    }
}
