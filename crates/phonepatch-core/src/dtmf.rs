//! DTMF tone codec.
//!
//! [`DtmfDecoder`] classifies fixed-size analysis windows with a
//! Goertzel-style sine/cosine correlation at the eight DTMF frequencies
//! and debounces the result. [`DtmfGenerator`] synthesizes symbol
//! sequences as lazily produced PCM buffers.
//!
//! # Decoding
//!
//! The window is `round(MIN_TONE_TIME * rate / SUB_WINDOW)` samples, so a
//! tone of the minimum duration spans two windows. A symbol has to win
//! [`SUB_WINDOW`] windows before it is committed, and a committed symbol
//! is only emitted again after it has decayed back to zero.

use std::f32::consts::PI;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, trace};

use crate::audio::PcmFormat;
use crate::error::{Error, Result};

/// Low-group frequencies (rows of the keypad).
pub const LOW_FREQS: [f32; 4] = [697.0, 770.0, 852.0, 941.0];

/// High-group frequencies (columns of the keypad).
pub const HIGH_FREQS: [f32; 4] = [1209.0, 1336.0, 1477.0, 1633.0];

/// Shortest tone the decoder is tuned to recognise, in seconds.
pub const MIN_TONE_TIME: f32 = 0.05;

/// Windows per minimum tone; also the debounce counter ceiling.
pub const SUB_WINDOW: u8 = 2;

const PEAK_UP: u8 = 1;
const PEAK_DOWN: u8 = 1;

const DEFAULT_MIN_F1_POWER: f32 = 0.05;
const DEFAULT_OVER_POWER: f32 = 20.0;
const DEFAULT_MAX_PAIR_DEVIATION: f32 = 10.0;
const DEFAULT_MIN_THIRD_RATIO: f32 = 20.0;

// ---------------------------------------------------------------------------
// DtmfSymbol
// ---------------------------------------------------------------------------

/// One of the sixteen DTMF keys.
///
/// Variants are declared in keypad order `123A 456B 789C *0#D`, so the
/// discriminant is `row * 4 + column`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum DtmfSymbol {
    One,
    Two,
    Three,
    A,
    Four,
    Five,
    Six,
    B,
    Seven,
    Eight,
    Nine,
    C,
    Star,
    Zero,
    Hash,
    D,
}

impl DtmfSymbol {
    /// All symbols in keypad order. Debounce iterates in this order.
    pub const ALL: [DtmfSymbol; 16] = [
        DtmfSymbol::One,
        DtmfSymbol::Two,
        DtmfSymbol::Three,
        DtmfSymbol::A,
        DtmfSymbol::Four,
        DtmfSymbol::Five,
        DtmfSymbol::Six,
        DtmfSymbol::B,
        DtmfSymbol::Seven,
        DtmfSymbol::Eight,
        DtmfSymbol::Nine,
        DtmfSymbol::C,
        DtmfSymbol::Star,
        DtmfSymbol::Zero,
        DtmfSymbol::Hash,
        DtmfSymbol::D,
    ];

    const CHARS: [char; 16] = [
        '1', '2', '3', 'A', '4', '5', '6', 'B', '7', '8', '9', 'C', '*', '0', '#', 'D',
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Keypad character for this symbol.
    pub fn as_char(self) -> char {
        Self::CHARS[self.index()]
    }

    pub fn from_char(c: char) -> Option<DtmfSymbol> {
        let c = c.to_ascii_uppercase();
        Self::CHARS
            .iter()
            .position(|&k| k == c)
            .map(|i| Self::ALL[i])
    }

    /// The symbol at keypad `row` and `column`.
    pub fn from_position(row: usize, column: usize) -> Option<DtmfSymbol> {
        if row < 4 && column < 4 {
            Some(Self::ALL[row * 4 + column])
        } else {
            None
        }
    }

    /// `(low, high)` tone pair in Hz.
    pub fn frequencies(self) -> (f32, f32) {
        let i = self.index();
        (LOW_FREQS[i / 4], HIGH_FREQS[i % 4])
    }

    /// Parse a string of keypad characters.
    pub fn parse_sequence(keys: &str) -> Result<Vec<DtmfSymbol>> {
        keys.chars()
            .map(|c| {
                DtmfSymbol::from_char(c)
                    .ok_or_else(|| Error::InvalidParameter(format!("unknown DTMF symbol: {c:?}")))
            })
            .collect()
    }

    pub fn is_digit(self) -> bool {
        self.as_char().is_ascii_digit()
    }
}

impl fmt::Display for DtmfSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

impl FromStr for DtmfSymbol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => DtmfSymbol::from_char(c)
                .ok_or_else(|| Error::InvalidParameter(format!("unknown DTMF symbol: {s}"))),
            _ => Err(Error::InvalidParameter(format!(
                "DTMF symbol must be one character: {s:?}"
            ))),
        }
    }
}

impl TryFrom<String> for DtmfSymbol {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

/// Render symbols as a keypad string.
pub fn symbols_to_string(symbols: &[DtmfSymbol]) -> String {
    symbols.iter().map(|s| s.as_char()).collect()
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// Acceptance thresholds for a candidate symbol.
///
/// Sensitivity above 1.0 loosens every test, below 1.0 tightens them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecoderThresholds {
    /// Floor for the strongest bin, normalized by window length.
    pub min_f1_power: f32,
    /// Second bin must exceed the noise floor times this.
    pub over_power: f32,
    /// Strongest bin must stay below the second times this.
    pub max_pair_deviation: f32,
    /// Second bin must exceed the third times this.
    pub min_third_ratio: f32,
}

impl DecoderThresholds {
    pub fn with_sensitivity(sensitivity: f32) -> Self {
        DecoderThresholds {
            min_f1_power: DEFAULT_MIN_F1_POWER * sensitivity,
            over_power: DEFAULT_OVER_POWER / sensitivity,
            max_pair_deviation: DEFAULT_MAX_PAIR_DEVIATION * sensitivity,
            min_third_ratio: DEFAULT_MIN_THIRD_RATIO / sensitivity,
        }
    }
}

impl Default for DecoderThresholds {
    fn default() -> Self {
        Self::with_sensitivity(1.0)
    }
}

// ---------------------------------------------------------------------------
// DtmfDecoder
// ---------------------------------------------------------------------------

/// Debounce state: one counter per symbol plus the committed symbol.
#[derive(Debug, Clone, Default)]
struct DecoderState {
    counters: [u8; 16],
    current: Option<DtmfSymbol>,
}

/// Streaming DTMF detector.
///
/// Feed it PCM of any length with [`decode()`](DtmfDecoder::decode); whole
/// windows are analysed and the remainder is kept for the next call.
pub struct DtmfDecoder {
    format: PcmFormat,
    window_size: usize,
    thresholds: DecoderThresholds,
    sin_table: Vec<Vec<f32>>,
    cos_table: Vec<Vec<f32>>,
    pending_bytes: Vec<u8>,
    samples: Vec<f32>,
    state: DecoderState,
}

impl DtmfDecoder {
    /// Create a decoder for `format`. `sensitivity` must be positive.
    pub fn new(format: PcmFormat, sensitivity: f32) -> Result<Self> {
        if !(sensitivity.is_finite() && sensitivity > 0.0) {
            return Err(Error::InvalidParameter(format!(
                "DTMF sensitivity must be positive: {sensitivity}"
            )));
        }
        let rate = format.sample_rate() as f32;
        let window_size = (MIN_TONE_TIME * rate / SUB_WINDOW as f32).round() as usize;

        let freqs = LOW_FREQS.iter().chain(HIGH_FREQS.iter());
        let (sin_table, cos_table): (Vec<Vec<f32>>, Vec<Vec<f32>>) = freqs
            .map(|&freq| {
                let w = 2.0 * PI * freq / rate;
                let sin: Vec<f32> = (0..window_size).map(|n| (w * n as f32).sin()).collect();
                let cos: Vec<f32> = (0..window_size).map(|n| (w * n as f32).cos()).collect();
                (sin, cos)
            })
            .unzip();

        let thresholds = DecoderThresholds::with_sensitivity(sensitivity);
        debug!(
            format = %format,
            window_size,
            ?thresholds,
            "DTMF decoder ready"
        );

        Ok(DtmfDecoder {
            format,
            window_size,
            thresholds,
            sin_table,
            cos_table,
            pending_bytes: Vec::new(),
            samples: Vec::new(),
            state: DecoderState::default(),
        })
    }

    pub fn format(&self) -> PcmFormat {
        self.format
    }

    /// Samples per analysis window.
    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn thresholds(&self) -> DecoderThresholds {
        self.thresholds
    }

    /// The committed symbol that is still being held, if any.
    pub fn current(&self) -> Option<DtmfSymbol> {
        self.state.current
    }

    /// Decode raw PCM in the decoder's format.
    ///
    /// Returns the symbols newly committed while draining whole windows.
    pub fn decode(&mut self, bytes: &[u8]) -> Vec<DtmfSymbol> {
        let frame = self.format.frame_bytes();
        self.pending_bytes.extend_from_slice(bytes);
        let whole = self.pending_bytes.len() / frame * frame;
        let samples = self.format.decode_mono(&self.pending_bytes[..whole]);
        self.pending_bytes.drain(..whole);
        self.decode_samples(&samples)
    }

    /// Decode mono samples normalized to `[-1.0, 1.0]`.
    pub fn decode_samples(&mut self, samples: &[f32]) -> Vec<DtmfSymbol> {
        self.samples.extend_from_slice(samples);
        let mut output = Vec::new();
        let mut consumed = 0;
        while self.samples.len() - consumed >= self.window_size {
            let window = &self.samples[consumed..consumed + self.window_size];
            let candidate = self.classify(window);
            consumed += self.window_size;
            if let Some(symbol) = self.debounce(candidate) {
                output.push(symbol);
            }
        }
        self.samples.drain(..consumed);
        output
    }

    /// Squared correlation at each of the eight frequencies, low group first.
    fn energies(&self, window: &[f32]) -> [f32; 8] {
        let mut out = [0.0; 8];
        for (i, slot) in out.iter_mut().enumerate() {
            let s: f32 = window.iter().zip(&self.sin_table[i]).map(|(x, t)| x * t).sum();
            let c: f32 = window.iter().zip(&self.cos_table[i]).map(|(x, t)| x * t).sum();
            *slot = s * s + c * c;
        }
        out
    }

    /// Accepted candidate symbol for one window, if any.
    fn classify(&self, window: &[f32]) -> Option<DtmfSymbol> {
        let energies = self.energies(window);
        let mut order: [usize; 8] = [0, 1, 2, 3, 4, 5, 6, 7];
        order.sort_by(|&a, &b| energies[b].total_cmp(&energies[a]));
        let (i1, i2) = (order[0], order[1]);
        let (f1, f2, f3) = (energies[i1], energies[i2], energies[order[2]]);

        // One bin from each group, order-normalized to (low, high).
        let (low, high) = match (i1 < 4, i2 < 4) {
            (true, false) => (i1, i2 - 4),
            (false, true) => (i2, i1 - 4),
            _ => return None,
        };
        let candidate = DtmfSymbol::from_position(low, high)?;

        let noise_floor = order[2..].iter().map(|&i| energies[i]).sum::<f32>() / 6.0;
        let ws = self.window_size as f32;
        let f1_real = 1_000_000.0 * f1 / (ws * ws);
        let t = &self.thresholds;

        let accepted = f1_real > t.min_f1_power
            && f2 > noise_floor * t.over_power
            && f1 < f2 * t.max_pair_deviation
            && f2 > f3 * t.min_third_ratio;

        trace!(
            symbol = %candidate,
            f1, f2, f3, noise_floor, accepted,
            "DTMF window"
        );
        accepted.then_some(candidate)
    }

    /// Advance the debounce counters by one window.
    ///
    /// Symbols are visited in keypad order and the first one to commit
    /// ends the pass, so at most one symbol commits per window.
    fn debounce(&mut self, candidate: Option<DtmfSymbol>) -> Option<DtmfSymbol> {
        let state = &mut self.state;
        for symbol in DtmfSymbol::ALL {
            let i = symbol.index();
            if Some(symbol) == candidate {
                if state.counters[i] < SUB_WINDOW {
                    state.counters[i] += PEAK_UP;
                }
                if state.counters[i] >= SUB_WINDOW && state.current != Some(symbol) {
                    for (j, counter) in state.counters.iter_mut().enumerate() {
                        if j != i {
                            *counter = 0;
                        }
                    }
                    state.current = Some(symbol);
                    debug!(symbol = %symbol, "DTMF symbol committed");
                    return Some(symbol);
                }
            } else if state.current == Some(symbol) && state.counters[i] > 0 {
                state.counters[i] = state.counters[i].saturating_sub(PEAK_DOWN);
                if state.counters[i] == 0 {
                    trace!(symbol = %symbol, "DTMF symbol released");
                    state.current = None;
                }
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// DtmfGenerator
// ---------------------------------------------------------------------------

/// DTMF tone synthesizer for a fixed PCM format.
#[derive(Debug, Clone)]
pub struct DtmfGenerator {
    format: PcmFormat,
    buffer_size: usize,
}

impl DtmfGenerator {
    /// `buffer_size` caps each produced buffer in bytes (rounded down to
    /// whole frames); zero yields one buffer per tone or gap.
    pub fn new(format: PcmFormat, buffer_size: usize) -> Self {
        DtmfGenerator {
            format,
            buffer_size,
        }
    }

    pub fn format(&self) -> PcmFormat {
        self.format
    }

    /// Synthesize `symbols`, each lasting `tone`, separated by `gap` of
    /// silence. No silence follows the last symbol.
    pub fn encode(
        &self,
        symbols: &[DtmfSymbol],
        tone: Duration,
        gap: Duration,
        gain: f32,
    ) -> ToneBuffers {
        let rate = self.format.sample_rate() as f64;
        let chunk_frames = match self.buffer_size {
            0 => usize::MAX,
            n => (n / self.format.frame_bytes()).max(1),
        };
        ToneBuffers {
            format: self.format,
            chunk_frames,
            symbols: symbols.to_vec(),
            tone_frames: (tone.as_secs_f64() * rate) as usize,
            gap_frames: (gap.as_secs_f64() * rate) as usize,
            gain,
            position: 0,
            in_gap: false,
            offset: 0,
        }
    }

    /// Like [`encode()`](DtmfGenerator::encode) for a keypad string.
    /// Fails on the first unknown character before producing anything.
    pub fn encode_str(
        &self,
        keys: &str,
        tone: Duration,
        gap: Duration,
        gain: f32,
    ) -> Result<ToneBuffers> {
        let symbols = DtmfSymbol::parse_sequence(keys)?;
        Ok(self.encode(&symbols, tone, gap, gain))
    }
}

/// Lazily produced PCM buffers for a symbol sequence.
///
/// Cloning before iterating, or calling [`restart()`](ToneBuffers::restart),
/// replays the sequence from the start.
#[derive(Debug, Clone)]
pub struct ToneBuffers {
    format: PcmFormat,
    chunk_frames: usize,
    symbols: Vec<DtmfSymbol>,
    tone_frames: usize,
    gap_frames: usize,
    gain: f32,
    position: usize,
    in_gap: bool,
    offset: usize,
}

impl ToneBuffers {
    pub fn restart(&mut self) {
        self.position = 0;
        self.in_gap = false;
        self.offset = 0;
    }

    /// Total byte length of the whole sequence.
    pub fn total_bytes(&self) -> usize {
        let n = self.symbols.len();
        let frames = n * self.tone_frames + n.saturating_sub(1) * self.gap_frames;
        frames * self.format.frame_bytes()
    }

    fn synth(&self, symbol: DtmfSymbol, start: usize, frames: usize) -> Vec<u8> {
        let (low, high) = symbol.frequencies();
        let rate = self.format.sample_rate() as f64;
        let c1 = 2.0 * std::f64::consts::PI * low as f64 / rate;
        let c2 = 2.0 * std::f64::consts::PI * high as f64 / rate;
        let gain = self.gain as f64;
        let samples: Vec<f32> = (start..start + frames)
            .map(|n| {
                let t = n as f64;
                (gain * (0.5 * (c1 * t).sin() + 0.5 * (c2 * t).sin())) as f32
            })
            .collect();
        let mut out = Vec::with_capacity(frames * self.format.frame_bytes());
        self.format.encode_mono(&samples, &mut out);
        out
    }
}

impl Iterator for ToneBuffers {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        loop {
            let symbol = *self.symbols.get(self.position)?;
            if self.in_gap {
                if self.offset < self.gap_frames {
                    let n = self.chunk_frames.min(self.gap_frames - self.offset);
                    self.offset += n;
                    return Some(self.format.silence(n));
                }
                self.in_gap = false;
                self.offset = 0;
                self.position += 1;
                continue;
            }
            if self.offset < self.tone_frames {
                let n = self.chunk_frames.min(self.tone_frames - self.offset);
                let buffer = self.synth(symbol, self.offset, n);
                self.offset += n;
                return Some(buffer);
            }
            self.offset = 0;
            if self.position + 1 < self.symbols.len() {
                self.in_gap = true;
            } else {
                self.position += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SampleFormat;
    use rand::Rng;

    fn format(sample_format: SampleFormat, channels: u16, rate: u32) -> PcmFormat {
        PcmFormat::new(sample_format, channels, rate).unwrap()
    }

    fn tone_samples(symbol: DtmfSymbol, frames: usize, rate: u32) -> Vec<f32> {
        let (low, high) = symbol.frequencies();
        (0..frames)
            .map(|n| {
                let t = n as f32 / rate as f32;
                0.5 * (2.0 * PI * low * t).sin() + 0.5 * (2.0 * PI * high * t).sin()
            })
            .collect()
    }

    fn round_trip(fmt: PcmFormat, keys: &str) -> String {
        let generator = DtmfGenerator::new(fmt, 512);
        let buffers = generator
            .encode_str(keys, Duration::from_millis(100), Duration::from_millis(100), 1.0)
            .unwrap();
        let mut decoder = DtmfDecoder::new(fmt, 1.0).unwrap();
        let mut out = Vec::new();
        for buffer in buffers {
            out.extend(decoder.decode(&buffer));
        }
        out.extend(decoder.decode(&fmt.silence(800)));
        symbols_to_string(&out)
    }

    // -- symbols ------------------------------------------------------------

    #[test]
    fn symbol_table_layout() {
        let keypad: String = DtmfSymbol::ALL.iter().map(|s| s.as_char()).collect();
        assert_eq!(keypad, "123A456B789C*0#D");
        assert_eq!(DtmfSymbol::Five.frequencies(), (770.0, 1336.0));
        assert_eq!(DtmfSymbol::Star.frequencies(), (941.0, 1209.0));
        assert_eq!(DtmfSymbol::D.frequencies(), (941.0, 1633.0));
    }

    #[test]
    fn symbol_parse() {
        assert_eq!("#".parse::<DtmfSymbol>().unwrap(), DtmfSymbol::Hash);
        assert_eq!("b".parse::<DtmfSymbol>().unwrap(), DtmfSymbol::B);
        assert!("E".parse::<DtmfSymbol>().is_err());
        assert!("12".parse::<DtmfSymbol>().is_err());
        assert!(DtmfSymbol::parse_sequence("12x").is_err());
    }

    #[test]
    fn thresholds_scale_with_sensitivity() {
        let base = DecoderThresholds::default();
        let loose = DecoderThresholds::with_sensitivity(2.0);
        assert!((loose.min_f1_power - base.min_f1_power * 2.0).abs() < 1e-6);
        assert!((loose.over_power - base.over_power / 2.0).abs() < 1e-6);
        assert!((loose.max_pair_deviation - base.max_pair_deviation * 2.0).abs() < 1e-6);
        assert!((loose.min_third_ratio - base.min_third_ratio / 2.0).abs() < 1e-6);
    }

    // -- decoder --------------------------------------------------------------

    #[test]
    fn window_size_follows_rate() {
        let d8 = DtmfDecoder::new(format(SampleFormat::S16Le, 1, 8000), 1.0).unwrap();
        assert_eq!(d8.window_size(), 200);
        let d11 = DtmfDecoder::new(format(SampleFormat::S16Le, 1, 11025), 1.0).unwrap();
        assert_eq!(d11.window_size(), 276);
    }

    #[test]
    fn decoder_rejects_bad_sensitivity() {
        let fmt = format(SampleFormat::S16Le, 1, 8000);
        assert!(DtmfDecoder::new(fmt, 0.0).is_err());
        assert!(DtmfDecoder::new(fmt, -1.0).is_err());
    }

    #[test]
    fn single_window_does_not_emit() {
        let mut decoder = DtmfDecoder::new(format(SampleFormat::S16Le, 1, 8000), 1.0).unwrap();
        let w = decoder.window_size();
        let tone = tone_samples(DtmfSymbol::Seven, w, 8000);
        assert!(decoder.decode_samples(&tone).is_empty());
        assert!(decoder.decode_samples(&vec![0.0; w * 4]).is_empty());
        assert_eq!(decoder.current(), None);
    }

    #[test]
    fn two_windows_emit_once() {
        let mut decoder = DtmfDecoder::new(format(SampleFormat::S16Le, 1, 8000), 1.0).unwrap();
        let w = decoder.window_size();
        let tone = tone_samples(DtmfSymbol::Seven, w * 2, 8000);
        assert_eq!(decoder.decode_samples(&tone), vec![DtmfSymbol::Seven]);
        assert_eq!(decoder.current(), Some(DtmfSymbol::Seven));
    }

    #[test]
    fn held_tone_emits_once_then_releases() {
        let mut decoder = DtmfDecoder::new(format(SampleFormat::S16Le, 1, 8000), 1.0).unwrap();
        let w = decoder.window_size();
        let tone = tone_samples(DtmfSymbol::Five, w * 10, 8000);
        let mut out = Vec::new();
        // Odd-sized chunks exercise the leftover queue.
        for chunk in tone.chunks(137) {
            out.extend(decoder.decode_samples(chunk));
        }
        assert_eq!(out, vec![DtmfSymbol::Five]);
        assert_eq!(decoder.current(), Some(DtmfSymbol::Five));

        // Counter 2 decays one step per window.
        assert!(decoder.decode_samples(&vec![0.0; w * 2]).is_empty());
        assert_eq!(decoder.current(), None);

        let again = tone_samples(DtmfSymbol::Five, w * 3, 8000);
        assert_eq!(decoder.decode_samples(&again), vec![DtmfSymbol::Five]);
    }

    #[test]
    fn silence_and_noise_emit_nothing() {
        let mut decoder = DtmfDecoder::new(format(SampleFormat::S16Le, 1, 8000), 1.0).unwrap();
        assert!(decoder.decode_samples(&vec![0.0; 8000]).is_empty());

        let mut rng = rand::thread_rng();
        let noise: Vec<f32> = (0..8000).map(|_| rng.gen_range(-0.3..0.3)).collect();
        assert!(decoder.decode_samples(&noise).is_empty());
    }

    #[test]
    fn round_trip_s16_le() {
        let fmt = format(SampleFormat::S16Le, 1, 8000);
        assert_eq!(round_trip(fmt, "123A456B789C*0#D"), "123A456B789C*0#D");
    }

    #[test]
    fn round_trip_repeated_symbol() {
        let fmt = format(SampleFormat::S16Le, 1, 8000);
        assert_eq!(round_trip(fmt, "5500"), "5500");
    }

    #[test]
    fn round_trip_unsigned_stereo() {
        let fmt = format(SampleFormat::U8, 2, 8000);
        assert_eq!(round_trip(fmt, "*159#"), "*159#");
    }

    #[test]
    fn round_trip_big_endian_high_rate() {
        let fmt = format(SampleFormat::U16Be, 1, 16000);
        assert_eq!(round_trip(fmt, "0D"), "0D");
    }

    // -- generator ------------------------------------------------------------

    #[test]
    fn generator_lengths_and_chunking() {
        let fmt = format(SampleFormat::S16Le, 1, 8000);
        let generator = DtmfGenerator::new(fmt, 300);
        let buffers = generator
            .encode_str("12", Duration::from_millis(100), Duration::from_millis(50), 0.8)
            .unwrap();
        // 800 + 400 + 800 frames of 2 bytes; no trailing gap.
        assert_eq!(buffers.total_bytes(), 4000);
        let all: Vec<Vec<u8>> = buffers.collect();
        assert!(all.iter().all(|b| b.len() <= 300 && b.len() % 2 == 0));
        assert_eq!(all.iter().map(Vec::len).sum::<usize>(), 4000);
    }

    #[test]
    fn generator_unchunked() {
        let fmt = format(SampleFormat::U8, 1, 8000);
        let generator = DtmfGenerator::new(fmt, 0);
        let all: Vec<Vec<u8>> = generator
            .encode_str("1#", Duration::from_millis(100), Duration::from_millis(100), 1.0)
            .unwrap()
            .collect();
        assert_eq!(all.len(), 3);
        assert!(all[1].iter().all(|&b| b == 128));
    }

    #[test]
    fn generator_restart_replays() {
        let fmt = format(SampleFormat::S16Le, 1, 8000);
        let generator = DtmfGenerator::new(fmt, 256);
        let mut buffers = generator.encode(
            &[DtmfSymbol::Nine],
            Duration::from_millis(60),
            Duration::ZERO,
            1.0,
        );
        let first: Vec<Vec<u8>> = buffers.by_ref().collect();
        assert!(buffers.next().is_none());
        buffers.restart();
        let second: Vec<Vec<u8>> = buffers.collect();
        assert_eq!(first, second);
    }

    #[test]
    fn generator_rejects_unknown_symbol() {
        let generator = DtmfGenerator::new(format(SampleFormat::S16Le, 1, 8000), 0);
        let e = generator
            .encode_str("12Z", Duration::from_millis(50), Duration::from_millis(50), 1.0)
            .unwrap_err();
        assert!(matches!(e, Error::InvalidParameter(_)));
    }
}
