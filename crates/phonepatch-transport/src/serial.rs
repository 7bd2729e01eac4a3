//! Serial port control lines.
//!
//! [`SerialLines`] drives a radio interface wired to the modem control
//! lines of an RS-232 port or USB serial adapter. No data is exchanged on
//! the port; only RTS/DTR are driven and DCD/DSR/CTS sensed.
//!
//! | name          | line | direction |
//! |---------------|------|-----------|
//! | `rts`         | RTS  | output    |
//! | `dtr`         | DTR  | output    |
//! | `dcd` or `cd` | DCD  | input     |
//! | `dsr`         | DSR  | input     |
//! | `cts`         | CTS  | input     |

use std::fmt;

use async_trait::async_trait;
use phonepatch_core::error::{Error, Result};
use phonepatch_core::lines::{LineDriver, PhysicalLine};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

/// Baud rate used to open the port. Irrelevant for line control.
const OPEN_BAUD_RATE: u32 = 9600;

/// A modem control line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SerialLine {
    Rts,
    Dtr,
    Dcd,
    Dsr,
    Cts,
}

impl fmt::Display for SerialLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SerialLine::Rts => "rts",
            SerialLine::Dtr => "dtr",
            SerialLine::Dcd => "dcd",
            SerialLine::Dsr => "dsr",
            SerialLine::Cts => "cts",
        };
        f.write_str(s)
    }
}

impl PhysicalLine for SerialLine {
    const DEFAULTS: [&'static str; 3] = ["rts", "dcd", "dtr"];

    fn output(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "rts" => Some(SerialLine::Rts),
            "dtr" => Some(SerialLine::Dtr),
            _ => None,
        }
    }

    fn input(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "dcd" | "cd" => Some(SerialLine::Dcd),
            "dsr" => Some(SerialLine::Dsr),
            "cts" => Some(SerialLine::Cts),
            _ => None,
        }
    }
}

/// Control-line access to a serial port.
pub struct SerialLines {
    port: Option<SerialStream>,
    port_name: String,
}

impl SerialLines {
    /// Open `port` and de-assert both outputs.
    pub async fn open(port: &str) -> Result<Self> {
        tracing::debug!(port = %port, "Opening serial port for line control");

        let mut stream = tokio_serial::new(port, OPEN_BAUD_RATE)
            .open_native_async()
            .map_err(|e| {
                tracing::error!(port = %port, error = %e, "Failed to open serial port");
                Error::Transport(format!("Failed to open serial port {port}: {e}"))
            })?;

        // The OS usually raises DTR on open; a radio wired for PTT on DTR
        // would key up until the binding sets its initial state.
        if let Err(e) = stream.write_data_terminal_ready(false) {
            tracing::warn!(port = %port, error = %e, "Failed to de-assert DTR");
        }
        if let Err(e) = stream.write_request_to_send(false) {
            tracing::warn!(port = %port, error = %e, "Failed to de-assert RTS");
        }

        tracing::info!(port = %port, "Serial port opened");
        Ok(SerialLines {
            port: Some(stream),
            port_name: port.to_string(),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

fn line_error(port: &str, line: SerialLine, e: tokio_serial::Error) -> Error {
    tracing::error!(port = %port, line = %line, error = %e, "Serial line access failed");
    Error::Transport(format!("{port}: {line}: {e}"))
}

#[async_trait]
impl LineDriver for SerialLines {
    type Line = SerialLine;

    async fn set_line(&mut self, line: SerialLine, level: bool) -> Result<()> {
        let port = self.port.as_mut().ok_or(Error::NotConnected)?;
        tracing::trace!(port = %self.port_name, line = %line, level, "Setting serial line");
        let result = match line {
            SerialLine::Rts => port.write_request_to_send(level),
            SerialLine::Dtr => port.write_data_terminal_ready(level),
            other => {
                return Err(Error::InvalidParameter(format!(
                    "{other} is not an output line"
                )))
            }
        };
        result.map_err(|e| line_error(&self.port_name, line, e))
    }

    async fn get_line(&mut self, line: SerialLine) -> Result<bool> {
        let port = self.port.as_mut().ok_or(Error::NotConnected)?;
        let result = match line {
            SerialLine::Dcd => port.read_carrier_detect(),
            SerialLine::Dsr => port.read_data_set_ready(),
            SerialLine::Cts => port.read_clear_to_send(),
            other => {
                return Err(Error::InvalidParameter(format!(
                    "{other} is not an input line"
                )))
            }
        };
        result.map_err(|e| line_error(&self.port_name, line, e))
    }

    async fn close(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            tracing::info!(port = %self.port_name, "Serial port closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phonepatch_core::lines::{LineBinding, LineRole};

    #[test]
    fn serial_vocabulary() {
        assert_eq!(SerialLine::output("RTS"), Some(SerialLine::Rts));
        assert_eq!(SerialLine::input("cd"), Some(SerialLine::Dcd));
        assert_eq!(SerialLine::input("dcd"), Some(SerialLine::Dcd));
        assert_eq!(SerialLine::output("cts"), None);
        assert_eq!(SerialLine::input("dtr"), None);
    }

    #[test]
    fn serial_default_binding() {
        let binding = LineBinding::<SerialLine>::defaults().unwrap();
        assert_eq!(binding.get(LineRole::Ptt).unwrap().line, SerialLine::Rts);
        assert_eq!(binding.get(LineRole::Carrier).unwrap().line, SerialLine::Dcd);
        assert_eq!(binding.get(LineRole::Power).unwrap().line, SerialLine::Dtr);
    }

    #[test]
    fn serial_binding_rejects_shared_line() {
        assert!(LineBinding::<SerialLine>::parse(&["dtr", "dsr", "-dtr"]).is_err());
    }

    #[tokio::test]
    async fn open_missing_port_fails() {
        let result = SerialLines::open("/dev/phonepatch-no-such-port").await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }
}
