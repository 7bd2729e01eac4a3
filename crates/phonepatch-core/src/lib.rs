//! phonepatch-core: shared types, traits and tone codecs for phonepatch.
//!
//! This crate holds everything that does not touch a device: the PCM
//! format model, the DTMF and CTCSS codecs, the control-line binding
//! rules, and the traits the transports and test mocks implement.
//!
//! # Key types
//!
//! - [`PcmFormat`] -- raw PCM layout with decode/encode helpers
//! - [`DtmfDecoder`] / [`DtmfGenerator`] -- DTMF codec
//! - [`CtcssDetector`] / [`CtcssEncoder`] -- sub-audible tone codec
//! - [`RadioControl`] -- PTT and carrier control of a radio
//! - [`AudioDevice`] -- the radio's sound device
//! - [`Error`] / [`Result`] -- error handling

pub mod audio;
pub mod ctcss;
pub mod dtmf;
pub mod error;
pub mod lines;
pub mod radio;

pub use audio::{AudioDevice, PcmFormat, SampleFormat, MIN_SAMPLE_RATE};
pub use ctcss::{lookup_frequency, CtcssDetector, CtcssEncoder};
pub use dtmf::{DtmfDecoder, DtmfGenerator, DtmfSymbol, ToneBuffers};
pub use error::{Error, Result};
pub use lines::{BoundLine, LineBinding, LineDriver, LineRole, PhysicalLine};
pub use radio::{RadioControl, DEFAULT_CARRIER_TIMEOUT};
