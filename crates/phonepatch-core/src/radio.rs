//! The [`RadioControl`] trait: PTT and carrier sense, whatever the wiring.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Default time allowed for a carrier query.
pub const DEFAULT_CARRIER_TIMEOUT: Duration = Duration::from_millis(500);

/// Keying and squelch control of one radio.
///
/// Implemented by `RadioPort` in `phonepatch-transport` for serial,
/// parallel and external-command interfaces, and by a mock in
/// `phonepatch-test-harness`.
///
/// After [`close()`](RadioControl::close) every method fails with
/// [`Error::NotConnected`](crate::error::Error::NotConnected).
#[async_trait]
pub trait RadioControl: Send + Sync {
    /// Key or unkey the transmitter. Repeating the current state is harmless.
    async fn set_ptt(&mut self, on: bool) -> Result<()>;

    /// The last state requested through [`set_ptt()`](RadioControl::set_ptt).
    /// No hardware round trip.
    fn get_ptt(&self) -> Result<bool>;

    /// Whether the receiver reports a carrier. Waits up to `timeout`.
    ///
    /// Interfaces with no carrier line report `false`.
    async fn get_carrier(&mut self, timeout: Duration) -> Result<bool>;

    /// Release the interface.
    async fn close(&mut self) -> Result<()>;
}
