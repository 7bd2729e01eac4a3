//! Daemon-level errors.

/// Errors raised by the phonepatch daemon.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A rejected configuration option. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Radio control or sound device failure.
    #[error(transparent)]
    Radio(#[from] phonepatch_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration syntax: {0}")]
    Toml(#[from] toml::de::Error),

    /// The idle loop did not hand over the radio in time.
    #[error("radio busy")]
    Busy,

    /// Sessions are not being accepted right now.
    #[error("sessions not accepted")]
    Refused,

    /// A malformed control-plane handshake.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Another daemon holds the pidfile.
    #[error("already running with pid {0}")]
    AlreadyRunning(u32),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn radio_errors_display_transparently() {
        let e: Error = phonepatch_core::Error::Timeout.into();
        assert_eq!(e.to_string(), "timeout waiting for response");
    }

    #[test]
    fn config_error_display() {
        let e = Error::Config("sample_rate must be at least 8000".into());
        assert_eq!(
            e.to_string(),
            "configuration error: sample_rate must be at least 8000"
        );
    }

    #[test]
    fn already_running_display() {
        assert_eq!(Error::AlreadyRunning(42).to_string(), "already running with pid 42");
    }
}
