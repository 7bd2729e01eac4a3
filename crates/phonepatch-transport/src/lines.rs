//! Line-based radio control.
//!
//! [`LinePort`] maps the PTT, carrier and power roles of a
//! [`LineBinding`] onto any [`LineDriver`]. The serial and parallel
//! transports both use it; only their driver differs.

use std::time::Duration;

use async_trait::async_trait;
use phonepatch_core::error::{Error, Result};
use phonepatch_core::lines::{LineBinding, LineDriver, LineRole};
use phonepatch_core::radio::RadioControl;

/// Settling time between powering the interface and releasing PTT.
pub const DEFAULT_ON_OPEN_WAIT: Duration = Duration::from_millis(50);

/// A radio keyed and sensed through control lines.
pub struct LinePort<D: LineDriver> {
    driver: Option<D>,
    binding: LineBinding<D::Line>,
    ptt: bool,
}

impl<D: LineDriver> LinePort<D> {
    /// Take over an open driver.
    ///
    /// The power line, if bound, is driven active immediately. After
    /// `on_open_wait` the PTT line is driven off so the radio starts
    /// unkeyed whatever state the port came up in.
    pub async fn open(
        mut driver: D,
        binding: LineBinding<D::Line>,
        on_open_wait: Duration,
    ) -> Result<Self> {
        if let Some(power) = binding.get(LineRole::Power) {
            tracing::debug!(line = %power.line, "Powering radio interface");
            driver.set_line(power.line, power.translate(true)).await?;
        }
        if !on_open_wait.is_zero() {
            tokio::time::sleep(on_open_wait).await;
        }
        let mut port = LinePort {
            driver: Some(driver),
            binding,
            ptt: true,
        };
        port.set_ptt(false).await?;
        Ok(port)
    }

    pub fn binding(&self) -> &LineBinding<D::Line> {
        &self.binding
    }

    fn driver(&mut self) -> Result<&mut D> {
        self.driver.as_mut().ok_or(Error::NotConnected)
    }
}

#[async_trait]
impl<D: LineDriver> RadioControl for LinePort<D> {
    async fn set_ptt(&mut self, on: bool) -> Result<()> {
        let bound = self.binding.get(LineRole::Ptt);
        let driver = self.driver()?;
        if let Some(ptt) = bound {
            driver.set_line(ptt.line, ptt.translate(on)).await?;
        }
        if self.ptt != on {
            tracing::debug!(ptt = on, "PTT");
        }
        self.ptt = on;
        Ok(())
    }

    fn get_ptt(&self) -> Result<bool> {
        if self.driver.is_none() {
            return Err(Error::NotConnected);
        }
        Ok(self.ptt)
    }

    async fn get_carrier(&mut self, _timeout: Duration) -> Result<bool> {
        let bound = self.binding.get(LineRole::Carrier);
        let driver = self.driver()?;
        match bound {
            Some(carrier) => {
                let level = driver.get_line(carrier.line).await?;
                Ok(carrier.translate(level))
            }
            None => Ok(false),
        }
    }

    async fn close(&mut self) -> Result<()> {
        let Some(mut driver) = self.driver.take() else {
            return Err(Error::NotConnected);
        };
        if let Some(ptt) = self.binding.get(LineRole::Ptt) {
            if let Err(e) = driver.set_line(ptt.line, ptt.translate(false)).await {
                tracing::warn!(error = %e, "Failed to release PTT on close");
            }
        }
        self.ptt = false;
        driver.close().await
    }
}
