//! Mock [`RadioControl`] that records PTT transitions.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use phonepatch_core::error::{Error, Result};
use phonepatch_core::radio::RadioControl;

#[derive(Debug, Default)]
struct RadioState {
    ptt: bool,
    ptt_history: Vec<bool>,
    carrier: bool,
    closed: bool,
}

/// A radio whose carrier is scripted and whose PTT is only recorded.
#[derive(Debug, Clone, Default)]
pub struct MockRadioControl {
    state: Arc<Mutex<RadioState>>,
}

impl MockRadioControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RadioState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_carrier(&self, carrier: bool) {
        self.lock().carrier = carrier;
    }

    /// Current PTT state.
    pub fn ptt(&self) -> bool {
        self.lock().ptt
    }

    /// Every `set_ptt` argument so far, in order.
    pub fn ptt_history(&self) -> Vec<bool> {
        self.lock().ptt_history.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[async_trait]
impl RadioControl for MockRadioControl {
    async fn set_ptt(&mut self, on: bool) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::NotConnected);
        }
        state.ptt = on;
        state.ptt_history.push(on);
        Ok(())
    }

    fn get_ptt(&self) -> Result<bool> {
        let state = self.lock();
        if state.closed {
            return Err(Error::NotConnected);
        }
        Ok(state.ptt)
    }

    async fn get_carrier(&mut self, _timeout: Duration) -> Result<bool> {
        let state = self.lock();
        if state.closed {
            return Err(Error::NotConnected);
        }
        Ok(state.carrier)
    }

    async fn close(&mut self) -> Result<()> {
        self.lock().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_radio_records_ptt() {
        let mock = MockRadioControl::new();
        let mut radio: Box<dyn RadioControl> = Box::new(mock.clone());
        radio.set_ptt(true).await.unwrap();
        radio.set_ptt(false).await.unwrap();
        assert_eq!(mock.ptt_history(), vec![true, false]);
        assert!(!radio.get_ptt().unwrap());
    }

    #[tokio::test]
    async fn mock_radio_closed() {
        let mock = MockRadioControl::new();
        let mut radio = mock.clone();
        radio.close().await.unwrap();
        assert!(mock.is_closed());
        assert!(matches!(radio.set_ptt(true).await, Err(Error::NotConnected)));
        assert!(matches!(radio.get_ptt(), Err(Error::NotConnected)));
    }
}
