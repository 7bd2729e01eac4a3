//! The [`RadioPort`] tagged variant over the three control transports.

use std::time::Duration;

use async_trait::async_trait;
use phonepatch_core::error::Result;
use phonepatch_core::lines::LineBinding;
use phonepatch_core::radio::RadioControl;

use crate::command::{CommandOptions, CommandRadio};
use crate::lines::LinePort;
use crate::parallel::{ParallelLine, ParallelLines};
use crate::serial::{SerialLine, SerialLines};

/// How to reach the radio's control interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioSpec {
    /// Modem control lines of a serial port.
    Serial {
        device: String,
        lines: Vec<String>,
        on_open_wait: Duration,
    },
    /// Data, control and status lines of a parallel port.
    Parallel {
        device: String,
        lines: Vec<String>,
        on_open_wait: Duration,
    },
    /// A helper process speaking a line protocol.
    Command {
        command: String,
        options: CommandOptions,
    },
}

/// An open radio control interface.
pub enum RadioPort {
    Serial(LinePort<SerialLines>),
    Parallel(LinePort<ParallelLines>),
    Command(CommandRadio),
}

impl RadioPort {
    /// Open the interface described by `spec`.
    ///
    /// Line bindings are validated before the device is touched, so a
    /// duplicate or unknown line fails without side effects.
    pub async fn open(spec: &RadioSpec) -> Result<RadioPort> {
        match spec {
            RadioSpec::Serial {
                device,
                lines,
                on_open_wait,
            } => {
                let binding = LineBinding::<SerialLine>::parse(lines)?;
                let driver = SerialLines::open(device).await?;
                tracing::info!(device = %device, "Serial radio control opened");
                Ok(RadioPort::Serial(
                    LinePort::open(driver, binding, *on_open_wait).await?,
                ))
            }
            RadioSpec::Parallel {
                device,
                lines,
                on_open_wait,
            } => {
                let binding = LineBinding::<ParallelLine>::parse(lines)?;
                let driver = ParallelLines::open(device).await?;
                tracing::info!(device = %device, "Parallel radio control opened");
                Ok(RadioPort::Parallel(
                    LinePort::open(driver, binding, *on_open_wait).await?,
                ))
            }
            RadioSpec::Command { command, options } => Ok(RadioPort::Command(
                CommandRadio::spawn(command, options.clone()).await?,
            )),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RadioPort::Serial(_) => "serial",
            RadioPort::Parallel(_) => "parallel",
            RadioPort::Command(_) => "command",
        }
    }

    fn inner(&mut self) -> &mut dyn RadioControl {
        match self {
            RadioPort::Serial(p) => p,
            RadioPort::Parallel(p) => p,
            RadioPort::Command(p) => p,
        }
    }
}

#[async_trait]
impl RadioControl for RadioPort {
    async fn set_ptt(&mut self, on: bool) -> Result<()> {
        self.inner().set_ptt(on).await
    }

    fn get_ptt(&self) -> Result<bool> {
        match self {
            RadioPort::Serial(p) => p.get_ptt(),
            RadioPort::Parallel(p) => p.get_ptt(),
            RadioPort::Command(p) => p.get_ptt(),
        }
    }

    async fn get_carrier(&mut self, timeout: Duration) -> Result<bool> {
        self.inner().get_carrier(timeout).await
    }

    async fn close(&mut self) -> Result<()> {
        tracing::debug!(kind = self.kind(), "Closing radio control");
        self.inner().close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phonepatch_core::error::Error;

    #[tokio::test]
    async fn duplicate_serial_lines_rejected_before_open() {
        let spec = RadioSpec::Serial {
            device: "/nonexistent/ttyS99".into(),
            lines: vec!["rts".into(), "dcd".into(), "rts".into()],
            on_open_wait: Duration::ZERO,
        };
        match RadioPort::open(&spec).await {
            Err(Error::InvalidParameter(msg)) => assert_eq!(msg, "line already used: rts"),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("duplicate binding accepted"),
        }
    }

    #[tokio::test]
    async fn unknown_parallel_line_rejected() {
        let spec = RadioSpec::Parallel {
            device: "/nonexistent/parport9".into(),
            lines: vec!["rts".into()],
            on_open_wait: Duration::ZERO,
        };
        assert!(matches!(
            RadioPort::open(&spec).await,
            Err(Error::InvalidParameter(_))
        ));
    }

    #[tokio::test]
    async fn command_port_dispatches() {
        let spec = RadioSpec::Command {
            command: "while read line; do echo \"get carrier: 1\"; done".into(),
            options: CommandOptions::default(),
        };
        let mut port = RadioPort::open(&spec).await.unwrap();
        assert_eq!(port.kind(), "command");
        port.set_ptt(true).await.unwrap();
        assert!(port.get_ptt().unwrap());
        port.close().await.unwrap();
        assert!(port.set_ptt(false).await.is_err());
    }
}
