//! Radio control through an external line-oriented process.
//!
//! [`CommandRadio`] keeps one helper process running and talks to it over
//! its stdin/stdout: PTT changes are single command lines, and a carrier
//! query is a command line followed by waiting for a response line that
//! matches a pattern.
//!
//! The pattern's first parenthesized group lists the possible answers;
//! the first alternative is the "carrier on" token. With the default
//! pattern `get carrier: (1|0)`, a response `get carrier: 1` means carrier.
//!
//! The other half of the protocol, [`serve()`], answers those same
//! commands on behalf of any [`RadioControl`], so `phonepatch radio serve`
//! can act as the helper process of another phonepatch.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use phonepatch_core::error::{Error, Result};
use phonepatch_core::radio::{RadioControl, DEFAULT_CARRIER_TIMEOUT};
use regex::Regex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

/// Time allowed for the helper to fail at startup.
const STARTUP_PROBE: Duration = Duration::from_millis(100);

/// Time the helper gets to exit on close before it is killed.
const KILL_TIME: Duration = Duration::from_secs(1);

/// Lines exchanged with the helper process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOptions {
    pub ptt_on: String,
    pub ptt_off: String,
    /// Empty disables carrier queries.
    pub carrier_query: String,
    pub carrier_pattern: String,
}

impl Default for CommandOptions {
    fn default() -> Self {
        CommandOptions {
            ptt_on: "set ptt on".into(),
            ptt_off: "set ptt off".into(),
            carrier_query: "get carrier".into(),
            carrier_pattern: "get carrier: (1|0)".into(),
        }
    }
}

/// Extract the "on" token: first alternative of the first group.
fn on_token(pattern: &str) -> Result<String> {
    let group = Regex::new(r"\((.*)\)").map_err(|e| Error::InvalidParameter(e.to_string()))?;
    group
        .captures(pattern)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().split('|').next())
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidParameter(format!("carrier pattern has no group: {pattern}")))
}

/// Interpret one response line: `Some(carrier)` if it matches.
fn match_response(pattern: &Regex, on: &str, line: &str) -> Option<bool> {
    let caps = pattern.captures(line)?;
    let value = caps.get(1).or_else(|| caps.get(0))?;
    Some(value.as_str() == on)
}

/// A radio controlled through a helper process.
pub struct CommandRadio {
    command: String,
    options: CommandOptions,
    pattern: Option<(Regex, String)>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    ptt: bool,
}

impl CommandRadio {
    /// Start `command` under `sh -c` and check it stays up.
    pub async fn spawn(command: &str, options: CommandOptions) -> Result<Self> {
        let pattern = if options.carrier_query.is_empty() {
            None
        } else {
            let token = on_token(&options.carrier_pattern)?;
            let regex = Regex::new(&options.carrier_pattern).map_err(|e| {
                Error::InvalidParameter(format!("carrier pattern {}: {e}", options.carrier_pattern))
            })?;
            Some((regex, token))
        };

        tracing::debug!(command = %command, "Starting radio control command");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Transport(format!("Command could not be started: {command}: {e}")))?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport(format!("no stdout for command: {command}")))?;
        let mut stdout = BufReader::new(stdout).lines();

        match tokio::time::timeout(STARTUP_PROBE, stdout.next_line()).await {
            Ok(Ok(None)) | Ok(Err(_)) => {
                let _ = child.kill().await;
                return Err(Error::Transport(format!(
                    "Command exited at startup: {command}"
                )));
            }
            Ok(Ok(Some(banner))) => {
                tracing::debug!(command = %command, line = %banner, "Radio control banner");
            }
            Err(_) => {
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(Error::Transport(format!(
                        "Command exited at startup: {command}: {status}"
                    )));
                }
            }
        }

        tracing::info!(command = %command, "Radio control command running");
        Ok(CommandRadio {
            command: command.to_string(),
            options,
            pattern,
            child: Some(child),
            stdin,
            stdout,
            ptt: false,
        })
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        let stdin = self.stdin.as_mut().ok_or(Error::NotConnected)?;
        tracing::trace!(command = %self.command, line = %line, "Writing to radio control command");
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        let result = async {
            stdin.write_all(&data).await?;
            stdin.flush().await
        }
        .await;
        result.map_err(|e| {
            tracing::error!(command = %self.command, error = %e, "Radio control command write failed");
            Error::ConnectionLost
        })
    }
}

#[async_trait]
impl RadioControl for CommandRadio {
    async fn set_ptt(&mut self, on: bool) -> Result<()> {
        let line = if on {
            self.options.ptt_on.clone()
        } else {
            self.options.ptt_off.clone()
        };
        self.send_line(&line).await?;
        self.ptt = on;
        Ok(())
    }

    fn get_ptt(&self) -> Result<bool> {
        if self.child.is_none() {
            return Err(Error::NotConnected);
        }
        Ok(self.ptt)
    }

    async fn get_carrier(&mut self, timeout: Duration) -> Result<bool> {
        if self.child.is_none() {
            return Err(Error::NotConnected);
        }
        let Some((regex, on)) = self.pattern.clone() else {
            return Ok(false);
        };
        let query = self.options.carrier_query.clone();
        self.send_line(&query).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.stdout.next_line()).await {
                Ok(Ok(Some(line))) => {
                    if let Some(carrier) = match_response(&regex, &on, &line) {
                        return Ok(carrier);
                    }
                    tracing::trace!(line = %line, "Ignoring radio control output");
                }
                Ok(Ok(None)) | Ok(Err(_)) => {
                    tracing::error!(command = %self.command, "Radio control command closed its output");
                    return Err(Error::ConnectionLost);
                }
                Err(_) => {
                    tracing::warn!(command = %self.command, ?timeout, "No carrier answer");
                    return Err(Error::Timeout);
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Err(Error::NotConnected);
        };
        // Closing stdin is the helper's cue to exit.
        self.stdin = None;
        match tokio::time::timeout(KILL_TIME, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(command = %self.command, %status, "Radio control command exited")
            }
            _ => {
                tracing::warn!(command = %self.command, "Radio control command did not exit, killing");
                child.kill().await?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

/// A request understood by [`serve()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCommand {
    SetPtt(bool),
    GetCarrier,
}

impl ServerCommand {
    /// Parse a request line, or produce the error reply for it.
    pub fn parse(line: &str) -> std::result::Result<ServerCommand, String> {
        if let Some(state) = line.strip_prefix("set ptt ") {
            return match state {
                "on" => Ok(ServerCommand::SetPtt(true)),
                "off" => Ok(ServerCommand::SetPtt(false)),
                _ => Err(format!("syntax error: {line}")),
            };
        }
        if line == "get carrier" {
            return Ok(ServerCommand::GetCarrier);
        }
        Err(format!("unknown command: {line}"))
    }
}

/// Answer radio control requests from `input` on `output` until EOF.
pub async fn serve<R, W>(radio: &mut dyn RadioControl, input: R, mut output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tracing::debug!("radio control server started");
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let reply = match ServerCommand::parse(line) {
            Ok(ServerCommand::SetPtt(on)) => {
                radio.set_ptt(on).await?;
                format!("done: {line}")
            }
            Ok(ServerCommand::GetCarrier) => {
                let carrier = radio.get_carrier(DEFAULT_CARRIER_TIMEOUT).await?;
                format!("get carrier: {}", u8::from(carrier))
            }
            Err(reply) => reply,
        };
        output.write_all(reply.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
    }
    tracing::debug!("radio control server finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use phonepatch_test_harness::MockRadioControl;

    const HELPER: &str = r#"while read l; do case "$l" in "get carrier") echo "noise"; echo "get carrier: 1";; "quit") exit 0;; esac; done"#;

    #[test]
    fn on_token_from_pattern() {
        assert_eq!(on_token("get carrier: (1|0)").unwrap(), "1");
        assert_eq!(on_token("SQL=(OPEN|CLOSED)").unwrap(), "OPEN");
        assert!(on_token("no group").is_err());
    }

    #[test]
    fn response_matching() {
        let re = Regex::new("get carrier: (1|0)").unwrap();
        assert_eq!(match_response(&re, "1", "get carrier: 1"), Some(true));
        assert_eq!(match_response(&re, "1", "get carrier: 0"), Some(false));
        assert_eq!(match_response(&re, "1", "hello"), None);
    }

    #[test]
    fn server_command_parse() {
        assert_eq!(ServerCommand::parse("set ptt on"), Ok(ServerCommand::SetPtt(true)));
        assert_eq!(ServerCommand::parse("set ptt off"), Ok(ServerCommand::SetPtt(false)));
        assert_eq!(ServerCommand::parse("get carrier"), Ok(ServerCommand::GetCarrier));
        assert_eq!(
            ServerCommand::parse("set ptt maybe"),
            Err("syntax error: set ptt maybe".into())
        );
        assert_eq!(ServerCommand::parse("reboot"), Err("unknown command: reboot".into()));
    }

    #[tokio::test]
    async fn server_answers_requests() {
        let mock = MockRadioControl::new();
        mock.set_carrier(true);
        let mut radio = mock.clone();
        let input: &[u8] = b"set ptt on\n\nget carrier\nfoo\nset ptt off\n";
        let mut output = Vec::new();
        serve(&mut radio, input, &mut output).await.unwrap();
        let text = String::from_utf8(output).unwrap();
        assert_eq!(
            text,
            "done: set ptt on\nget carrier: 1\nunknown command: foo\ndone: set ptt off\n"
        );
        assert_eq!(mock.ptt_history(), vec![true, false]);
    }

    #[tokio::test]
    async fn command_radio_queries_helper() {
        let mut radio = CommandRadio::spawn(HELPER, CommandOptions::default())
            .await
            .unwrap();
        assert!(radio.get_carrier(Duration::from_secs(2)).await.unwrap());
        radio.set_ptt(true).await.unwrap();
        assert!(radio.get_ptt().unwrap());
        radio.close().await.unwrap();
        assert!(matches!(radio.get_ptt(), Err(Error::NotConnected)));
        assert!(radio.get_carrier(DEFAULT_CARRIER_TIMEOUT).await.is_err());
    }

    #[tokio::test]
    async fn command_radio_rejects_dead_helper() {
        let result = CommandRadio::spawn("exit 0", CommandOptions::default()).await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }

    #[tokio::test]
    async fn command_radio_carrier_timeout() {
        let mut radio = CommandRadio::spawn("cat > /dev/null", CommandOptions::default())
            .await
            .unwrap();
        let result = radio.get_carrier(Duration::from_millis(200)).await;
        assert!(matches!(result, Err(Error::Timeout)));
        radio.close().await.unwrap();
    }
}
