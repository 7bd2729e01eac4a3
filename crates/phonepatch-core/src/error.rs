//! Error types for phonepatch.
//!
//! Every fallible operation in the library crates returns [`Result<T>`].
//! Device failures, protocol mismatches with an external radio control
//! process, and rejected configuration values all land here.

/// The error type for radio, audio and codec operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A device-level failure (serial port, parallel port, sound device).
    #[error("transport error: {0}")]
    Transport(String),

    /// A radio control process answered with something unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Timed out waiting for the radio or an external process.
    #[error("timeout waiting for response")]
    Timeout,

    /// The operation is not available on this platform or transport.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// A configuration value or argument was rejected.
    ///
    /// Raised at construction time: bad sample formats, unknown DTMF
    /// symbols, unknown line names, a physical line bound to two roles.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The device was closed, or never opened.
    #[error("not connected")]
    NotConnected,

    /// The radio control process exited or the device vanished.
    #[error("connection lost")]
    ConnectionLost,

    /// An audio stream was closed by its producer or consumer.
    #[error("stream closed")]
    StreamClosed,

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_transport() {
        let e = Error::Transport("/dev/ttyS0 busy".into());
        assert_eq!(e.to_string(), "transport error: /dev/ttyS0 busy");
    }

    #[test]
    fn error_display_protocol() {
        let e = Error::Protocol("no carrier answer".into());
        assert_eq!(e.to_string(), "protocol error: no carrier answer");
    }

    #[test]
    fn error_display_timeout() {
        assert_eq!(Error::Timeout.to_string(), "timeout waiting for response");
    }

    #[test]
    fn error_display_invalid_parameter() {
        let e = Error::InvalidParameter("line already used: rts".into());
        assert_eq!(e.to_string(), "invalid parameter: line already used: rts");
    }

    #[test]
    fn error_display_not_connected() {
        assert_eq!(Error::NotConnected.to_string(), "not connected");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broken");
        let e: Error = io_err.into();
        assert!(matches!(e, Error::Io(_)));
        assert!(e.to_string().contains("pipe broken"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
