//! phonepatch: bridge a two-way radio to a telephone line.
//!
//! The daemon listens to the radio for DTMF and CTCSS triggers, places
//! outcalls through a PBX spool directory, takes call legs from the PBX
//! on a local control socket, and moves audio between the radio and the
//! call while keying the transmitter.
//!
//! # Key types
//!
//! - [`Config`] -- the TOML configuration
//! - [`Station`] -- the radio interface and sound device with their gates
//! - [`SessionController`] -- the call state machine and idle loop
//! - [`ControlPlane`] -- the control socket
//! - [`run_bridge`] -- the audio bridge of an active call

pub mod bridge;
pub mod claim;
pub mod config;
pub mod control;
pub mod dialing;
pub mod error;
pub mod gates;
pub mod lifecycle;
pub mod peer;
pub mod prompt;
pub mod session;
pub mod shell;
pub mod spool;
pub mod station;

pub use bridge::{run_bridge, BreakReason};
pub use config::Config;
pub use control::{ControlPlane, Handshake};
pub use error::{Error, Result};
pub use peer::Peer;
pub use session::{CallSession, SessionController, SessionEvent, SessionState};
pub use station::Station;
