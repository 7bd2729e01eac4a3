//! PTT (VOX) and carrier gates.
//!
//! Both gates are driven by the bridge once per buffer with the buffer's
//! peak level and the current time, so they run the same on a paused test
//! clock as on the wall clock.

use std::time::Duration;

use phonepatch_core::{Error, PcmFormat, RadioControl, DEFAULT_CARRIER_TIMEOUT};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{secs, CarrierConfig, CarrierMode, PttConfig};

/// Keys the transmitter while telephony audio is loud enough.
///
/// Opens when a buffer's peak exceeds the threshold and stays open for the
/// tail time after the last loud buffer. After `max_time` of continuous
/// keying the gate is forced shut for `wait_time`.
#[derive(Debug, Clone)]
pub struct VoxGate {
    threshold: f32,
    tail: Duration,
    max_time: Option<Duration>,
    wait_time: Duration,
    last_loud: Option<Instant>,
    open_since: Option<Instant>,
    resting_until: Option<Instant>,
}

impl VoxGate {
    pub fn new(config: &PttConfig) -> Self {
        let max_time = secs(config.max_time);
        VoxGate {
            threshold: config.threshold,
            tail: secs(config.tail_time),
            max_time: (!max_time.is_zero()).then_some(max_time),
            wait_time: secs(config.wait_time),
            last_loud: None,
            open_since: None,
            resting_until: None,
        }
    }

    /// Feed one buffer's peak level; returns whether PTT should be on.
    pub fn update(&mut self, peak: f32, now: Instant) -> bool {
        if let Some(until) = self.resting_until {
            if now < until {
                return false;
            }
            self.resting_until = None;
        }
        if self.threshold <= 0.0 || peak > self.threshold {
            self.last_loud = Some(now);
        }
        let open = self
            .last_loud
            .is_some_and(|t| now.duration_since(t) <= self.tail);
        if !open {
            self.open_since = None;
            return false;
        }
        let since = *self.open_since.get_or_insert(now);
        if let Some(max) = self.max_time {
            if now.duration_since(since) >= max {
                debug!(?max, "PTT held too long, resting");
                self.last_loud = None;
                self.open_since = None;
                self.resting_until = Some(now + self.wait_time);
                return false;
            }
        }
        true
    }
}

/// Decides whether the radio receiver is hearing something worth passing
/// on.
#[derive(Debug, Clone)]
pub struct CarrierGate {
    mode: CarrierMode,
    threshold: f32,
    tail: Duration,
    polling: Duration,
    last_poll: Option<Instant>,
    line: bool,
    last_loud: Option<Instant>,
}

impl CarrierGate {
    pub fn new(config: &CarrierConfig) -> Self {
        CarrierGate {
            mode: config.mode,
            threshold: config.threshold,
            tail: secs(config.tail_time),
            polling: secs(config.polling_time),
            last_poll: None,
            line: false,
            last_loud: None,
        }
    }

    pub fn mode(&self) -> CarrierMode {
        self.mode
    }

    /// Evaluate the gate for one radio buffer.
    ///
    /// In `line` mode the carrier line is polled at most once per polling
    /// interval; a query that times out keeps the previous state.
    pub async fn update(
        &mut self,
        radio: &mut dyn RadioControl,
        format: &PcmFormat,
        data: &[u8],
        now: Instant,
    ) -> phonepatch_core::Result<bool> {
        match self.mode {
            CarrierMode::Off => Ok(true),
            CarrierMode::Line => {
                let due = self
                    .last_poll
                    .map_or(true, |t| now.duration_since(t) >= self.polling);
                if due {
                    self.last_poll = Some(now);
                    match radio.get_carrier(DEFAULT_CARRIER_TIMEOUT).await {
                        Ok(state) => {
                            if state != self.line {
                                debug!(carrier = state, "Carrier line changed");
                            }
                            self.line = state;
                        }
                        Err(Error::Timeout) => warn!("Carrier query timed out"),
                        Err(e) => return Err(e),
                    }
                }
                Ok(self.line)
            }
            CarrierMode::Audio => {
                if format.peak(data) > self.threshold {
                    self.last_loud = Some(now);
                }
                Ok(self
                    .last_loud
                    .is_some_and(|t| now.duration_since(t) <= self.tail))
            }
        }
    }

    /// Forget the carrier history, e.g. after transmitting.
    pub fn reset(&mut self) {
        self.last_poll = None;
        self.line = false;
        self.last_loud = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phonepatch_test_harness::MockRadioControl;

    fn ptt(max_time: f64) -> PttConfig {
        PttConfig {
            threshold: 0.1,
            tail_time: 0.5,
            max_time,
            wait_time: 1.0,
            txdelay: 0.0,
        }
    }

    #[test]
    fn vox_opens_on_loud_and_holds_for_tail() {
        let mut gate = VoxGate::new(&ptt(0.0));
        let t0 = Instant::now();
        assert!(!gate.update(0.05, t0));
        assert!(gate.update(0.5, t0));
        assert!(gate.update(0.0, t0 + Duration::from_millis(400)));
        assert!(!gate.update(0.0, t0 + Duration::from_millis(600)));
    }

    #[test]
    fn vox_rests_after_max_time() {
        let mut gate = VoxGate::new(&ptt(2.0));
        let t0 = Instant::now();
        assert!(gate.update(0.5, t0));
        assert!(gate.update(0.5, t0 + Duration::from_secs(1)));
        assert!(!gate.update(0.5, t0 + Duration::from_secs(2)));
        assert!(!gate.update(0.5, t0 + Duration::from_millis(2500)));
        assert!(gate.update(0.5, t0 + Duration::from_secs(3)));
    }

    #[test]
    fn zero_threshold_always_keys() {
        let mut gate = VoxGate::new(&PttConfig {
            threshold: 0.0,
            ..ptt(0.0)
        });
        assert!(gate.update(0.0, Instant::now()));
    }

    fn carrier(mode: CarrierMode) -> CarrierConfig {
        CarrierConfig {
            mode,
            threshold: 0.1,
            tail_time: 0.5,
            polling_time: 0.1,
        }
    }

    #[tokio::test]
    async fn carrier_off_is_always_open() {
        let mut gate = CarrierGate::new(&carrier(CarrierMode::Off));
        let mut radio = MockRadioControl::new();
        let format = PcmFormat::telephony();
        assert!(gate
            .update(&mut radio, &format, &[0; 16], Instant::now())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn carrier_line_polls_at_interval() {
        let mut gate = CarrierGate::new(&carrier(CarrierMode::Line));
        let mock = MockRadioControl::new();
        let mut radio = mock.clone();
        let format = PcmFormat::telephony();
        let t0 = Instant::now();

        mock.set_carrier(true);
        assert!(gate.update(&mut radio, &format, &[], t0).await.unwrap());
        mock.set_carrier(false);
        // Within the polling interval the cached state stands.
        let t1 = t0 + Duration::from_millis(50);
        assert!(gate.update(&mut radio, &format, &[], t1).await.unwrap());
        let t2 = t0 + Duration::from_millis(100);
        assert!(!gate.update(&mut radio, &format, &[], t2).await.unwrap());
    }

    #[tokio::test]
    async fn carrier_audio_follows_level_with_tail() {
        let mut gate = CarrierGate::new(&carrier(CarrierMode::Audio));
        let mut radio = MockRadioControl::new();
        let format = PcmFormat::telephony();
        let mut loud = Vec::new();
        format.encode_mono(&[0.5; 8], &mut loud);
        let quiet = format.silence(8);
        let t0 = Instant::now();

        assert!(!gate.update(&mut radio, &format, &quiet, t0).await.unwrap());
        assert!(gate.update(&mut radio, &format, &loud, t0).await.unwrap());
        let later = t0 + Duration::from_millis(300);
        assert!(gate.update(&mut radio, &format, &quiet, later).await.unwrap());
        let much_later = t0 + Duration::from_secs(1);
        assert!(!gate
            .update(&mut radio, &format, &quiet, much_later)
            .await
            .unwrap());
    }
}
