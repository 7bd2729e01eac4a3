//! Parallel port control lines through the Linux `ppdev` driver.
//!
//! | name         | signal     | direction |
//! |--------------|------------|-----------|
//! | `data`       | D0         | output    |
//! | `strobe`     | nStrobe    | output    |
//! | `autofeed`   | nAutoFd    | output    |
//! | `initialize` | nInit      | output    |
//! | `ack`        | nAck       | input     |
//! | `busy`       | Busy       | input     |
//! | `paperout`   | PaperOut   | input     |
//! | `select`     | Select     | input     |
//! | `error`      | nError     | input     |
//!
//! Levels are the logical values seen at the connector: the hardware
//! inversion of nStrobe, nAutoFd and Busy is undone here.

use std::fmt;

use async_trait::async_trait;
use phonepatch_core::error::{Error, Result};
use phonepatch_core::lines::{LineDriver, PhysicalLine};

/// A parallel port signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParallelLine {
    Data,
    Strobe,
    AutoFeed,
    Initialize,
    Ack,
    Busy,
    PaperOut,
    Select,
    Error,
}

impl fmt::Display for ParallelLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParallelLine::Data => "data",
            ParallelLine::Strobe => "strobe",
            ParallelLine::AutoFeed => "autofeed",
            ParallelLine::Initialize => "initialize",
            ParallelLine::Ack => "ack",
            ParallelLine::Busy => "busy",
            ParallelLine::PaperOut => "paperout",
            ParallelLine::Select => "select",
            ParallelLine::Error => "error",
        };
        f.write_str(s)
    }
}

impl PhysicalLine for ParallelLine {
    const DEFAULTS: [&'static str; 3] = ["data", "busy", "strobe"];

    fn output(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "data" => Some(ParallelLine::Data),
            "strobe" => Some(ParallelLine::Strobe),
            "autofeed" => Some(ParallelLine::AutoFeed),
            "initialize" => Some(ParallelLine::Initialize),
            _ => None,
        }
    }

    fn input(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "ack" => Some(ParallelLine::Ack),
            "busy" => Some(ParallelLine::Busy),
            "paperout" => Some(ParallelLine::PaperOut),
            "select" => Some(ParallelLine::Select),
            "error" => Some(ParallelLine::Error),
            _ => None,
        }
    }
}

// Status register bits.
const STATUS_ERROR: u8 = 0x08;
const STATUS_SELECT: u8 = 0x10;
const STATUS_PAPEROUT: u8 = 0x20;
const STATUS_ACK: u8 = 0x40;
const STATUS_BUSY: u8 = 0x80;

// Control register bits.
const CONTROL_STROBE: u8 = 0x01;
const CONTROL_AUTOFD: u8 = 0x02;
const CONTROL_INIT: u8 = 0x04;

/// Status register mask and whether the pin is inverted in hardware.
fn status_bit(line: ParallelLine) -> Option<(u8, bool)> {
    match line {
        ParallelLine::Ack => Some((STATUS_ACK, false)),
        ParallelLine::Busy => Some((STATUS_BUSY, true)),
        ParallelLine::PaperOut => Some((STATUS_PAPEROUT, false)),
        ParallelLine::Select => Some((STATUS_SELECT, false)),
        ParallelLine::Error => Some((STATUS_ERROR, false)),
        _ => None,
    }
}

/// Control register mask and whether the pin is inverted in hardware.
fn control_bit(line: ParallelLine) -> Option<(u8, bool)> {
    match line {
        ParallelLine::Strobe => Some((CONTROL_STROBE, true)),
        ParallelLine::AutoFeed => Some((CONTROL_AUTOFD, true)),
        ParallelLine::Initialize => Some((CONTROL_INIT, false)),
        _ => None,
    }
}

/// Compute the control register after driving `line` to `level`.
fn apply_control(register: u8, line: ParallelLine, level: bool) -> Option<u8> {
    let (mask, inverted) = control_bit(line)?;
    Some(if level != inverted {
        register | mask
    } else {
        register & !mask
    })
}

/// Read `line` out of a status register value.
fn read_status(register: u8, line: ParallelLine) -> Option<bool> {
    let (mask, inverted) = status_bit(line)?;
    Some((register & mask != 0) != inverted)
}

#[cfg(target_os = "linux")]
mod ppdev {
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::os::fd::AsRawFd;

    // _IO / _IOR / _IOW('p', nr, unsigned char) from <linux/ppdev.h>.
    const PPCLAIM: libc::c_ulong = 0x708b;
    const PPRELEASE: libc::c_ulong = 0x708c;
    const PPRSTATUS: libc::c_ulong = 0x8001_7081;
    const PPRCONTROL: libc::c_ulong = 0x8001_7083;
    const PPWCONTROL: libc::c_ulong = 0x4001_7084;
    const PPWDATA: libc::c_ulong = 0x4001_7086;

    pub struct Port {
        file: File,
    }

    fn check(rc: libc::c_int) -> io::Result<()> {
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    impl Port {
        pub fn open(path: &str) -> io::Result<Port> {
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            // SAFETY: PPCLAIM takes no argument; fd is valid for the call.
            check(unsafe { libc::ioctl(file.as_raw_fd(), PPCLAIM as _) })?;
            Ok(Port { file })
        }

        fn read_register(&self, request: libc::c_ulong) -> io::Result<u8> {
            let mut value: u8 = 0;
            // SAFETY: the request writes exactly one byte into `value`.
            check(unsafe { libc::ioctl(self.file.as_raw_fd(), request as _, &mut value as *mut u8) })?;
            Ok(value)
        }

        fn write_register(&self, request: libc::c_ulong, value: u8) -> io::Result<()> {
            // SAFETY: the request reads exactly one byte from `value`.
            check(unsafe { libc::ioctl(self.file.as_raw_fd(), request as _, &value as *const u8) })
        }

        pub fn status(&self) -> io::Result<u8> {
            self.read_register(PPRSTATUS)
        }

        pub fn control(&self) -> io::Result<u8> {
            self.read_register(PPRCONTROL)
        }

        pub fn set_control(&self, value: u8) -> io::Result<()> {
            self.write_register(PPWCONTROL, value)
        }

        pub fn set_data(&self, value: u8) -> io::Result<()> {
            self.write_register(PPWDATA, value)
        }
    }

    impl Drop for Port {
        fn drop(&mut self) {
            // SAFETY: PPRELEASE takes no argument; fd is still open here.
            unsafe {
                libc::ioctl(self.file.as_raw_fd(), PPRELEASE as _);
            }
        }
    }
}

/// Control-line access to a parallel port (`/dev/parportN`).
pub struct ParallelLines {
    #[cfg(target_os = "linux")]
    port: Option<ppdev::Port>,
    device: String,
}

impl ParallelLines {
    #[cfg(target_os = "linux")]
    pub async fn open(device: &str) -> Result<Self> {
        tracing::debug!(device = %device, "Opening parallel port");
        let port = ppdev::Port::open(device).map_err(|e| {
            tracing::error!(device = %device, error = %e, "Failed to open parallel port");
            Error::Transport(format!("Failed to open parallel port {device}: {e}"))
        })?;
        tracing::info!(device = %device, "Parallel port claimed");
        Ok(ParallelLines {
            port: Some(port),
            device: device.to_string(),
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub async fn open(device: &str) -> Result<Self> {
        Err(Error::Unsupported(format!(
            "parallel port control needs Linux ppdev: {device}"
        )))
    }

    pub fn device(&self) -> &str {
        &self.device
    }
}

#[cfg(target_os = "linux")]
#[async_trait]
impl LineDriver for ParallelLines {
    type Line = ParallelLine;

    async fn set_line(&mut self, line: ParallelLine, level: bool) -> Result<()> {
        let port = self.port.as_ref().ok_or(Error::NotConnected)?;
        tracing::trace!(device = %self.device, line = %line, level, "Setting parallel line");
        if line == ParallelLine::Data {
            return Ok(port.set_data(u8::from(level))?);
        }
        let current = port.control()?;
        let next = apply_control(current, line, level)
            .ok_or_else(|| Error::InvalidParameter(format!("{line} is not an output line")))?;
        Ok(port.set_control(next)?)
    }

    async fn get_line(&mut self, line: ParallelLine) -> Result<bool> {
        let port = self.port.as_ref().ok_or(Error::NotConnected)?;
        let status = port.status()?;
        read_status(status, line)
            .ok_or_else(|| Error::InvalidParameter(format!("{line} is not an input line")))
    }

    async fn close(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            tracing::info!(device = %self.device, "Parallel port released");
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
#[async_trait]
impl LineDriver for ParallelLines {
    type Line = ParallelLine;

    async fn set_line(&mut self, _line: ParallelLine, _level: bool) -> Result<()> {
        Err(Error::NotConnected)
    }

    async fn get_line(&mut self, _line: ParallelLine) -> Result<bool> {
        Err(Error::NotConnected)
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phonepatch_core::lines::{LineBinding, LineRole};

    #[test]
    fn parallel_default_binding() {
        let binding = LineBinding::<ParallelLine>::defaults().unwrap();
        assert_eq!(binding.get(LineRole::Ptt).unwrap().line, ParallelLine::Data);
        assert_eq!(binding.get(LineRole::Carrier).unwrap().line, ParallelLine::Busy);
        assert_eq!(binding.get(LineRole::Power).unwrap().line, ParallelLine::Strobe);
    }

    #[test]
    fn strobe_is_inverted_in_register() {
        assert_eq!(apply_control(0x00, ParallelLine::Strobe, true), Some(0x00));
        assert_eq!(apply_control(0x00, ParallelLine::Strobe, false), Some(CONTROL_STROBE));
        assert_eq!(apply_control(0x00, ParallelLine::Initialize, true), Some(CONTROL_INIT));
        assert_eq!(apply_control(0xff, ParallelLine::AutoFeed, true), Some(0xff));
        assert_eq!(apply_control(0x00, ParallelLine::Busy, true), None);
    }

    #[test]
    fn busy_is_inverted_in_status() {
        assert_eq!(read_status(0x00, ParallelLine::Busy), Some(true));
        assert_eq!(read_status(STATUS_BUSY, ParallelLine::Busy), Some(false));
        assert_eq!(read_status(STATUS_ACK, ParallelLine::Ack), Some(true));
        assert_eq!(read_status(0x00, ParallelLine::Select), Some(false));
        assert_eq!(read_status(0xff, ParallelLine::Data), None);
    }

    #[tokio::test]
    async fn open_missing_port_fails() {
        assert!(ParallelLines::open("/dev/phonepatch-no-such-parport").await.is_err());
    }
}
