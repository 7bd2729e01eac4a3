//! phonepatch-test-harness: mock radios and sound devices for phonepatch.
//!
//! Every mock is a cheap `Clone` over shared state. Hand one clone to the
//! code under test (usually boxed as a trait object) and keep another to
//! script inputs and inspect what happened.

pub mod mock_audio;
pub mod mock_lines;
pub mod mock_radio;

pub use mock_audio::{IdleInput, MockAudioDevice};
pub use mock_lines::MockLines;
pub use mock_radio::MockRadioControl;
