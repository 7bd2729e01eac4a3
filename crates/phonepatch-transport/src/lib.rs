//! Radio control and sound device transports for phonepatch.
//!
//! This crate provides the concrete implementations of the
//! [`RadioControl`](phonepatch_core::RadioControl) and
//! [`AudioDevice`](phonepatch_core::AudioDevice) traits from
//! `phonepatch-core`:
//!
//! - [`SerialLines`]: modem control lines of a serial port
//! - [`ParallelLines`]: data, control and status lines of a parallel port
//! - [`LinePort`]: PTT/carrier/power roles over either of the above
//! - [`CommandRadio`]: a helper process speaking a line protocol
//! - [`RadioPort`]: the tagged variant selected from configuration
//! - [`OssAudioDevice`]: raw PCM through `/dev/dsp`
//! - `CpalAudioDevice`: any host audio device (`audio` feature)
//!
//! # Example
//!
//! ```no_run
//! use phonepatch_core::RadioControl;
//! use phonepatch_transport::{RadioPort, RadioSpec};
//! use std::time::Duration;
//!
//! # async fn example() -> phonepatch_core::Result<()> {
//! let spec = RadioSpec::Serial {
//!     device: "/dev/ttyS0".into(),
//!     lines: vec!["rts".into(), "dcd".into(), "dtr".into()],
//!     on_open_wait: Duration::from_millis(50),
//! };
//! let mut radio = RadioPort::open(&spec).await?;
//! radio.set_ptt(true).await?;
//! let carrier = radio.get_carrier(Duration::from_millis(500)).await?;
//! radio.set_ptt(false).await?;
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod lines;
pub mod oss;
pub mod parallel;
pub mod radio;
pub mod serial;

#[cfg(feature = "audio")]
pub mod audio;

pub use command::{serve, CommandOptions, CommandRadio, ServerCommand};
pub use lines::{LinePort, DEFAULT_ON_OPEN_WAIT};
pub use oss::OssAudioDevice;
pub use parallel::{ParallelLine, ParallelLines};
pub use radio::{RadioPort, RadioSpec};
pub use serial::{SerialLine, SerialLines};

#[cfg(feature = "audio")]
pub use audio::{list_audio_devices, CpalAudioDevice};
