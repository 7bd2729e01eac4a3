//! The control plane: a local socket where the PBX side hands over call
//! legs.
//!
//! A connection starts with one line, `incall|<extension>` or `outcall`.
//! The daemon answers `ok` and the connection becomes the call's audio
//! stream, or answers `ko` (not taking calls, unknown extension),
//! `busy` (the radio was not free in time) or `syntax error`, and closes.
//! Connections are served one at a time.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::peer::Peer;
use crate::session::SessionController;

/// Longest a client may take to send its handshake line.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// The first line of a control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    Incall(String),
    Outcall,
}

impl Handshake {
    pub fn parse(line: &str) -> Result<Handshake> {
        let line = line.trim();
        if line == "outcall" {
            return Ok(Handshake::Outcall);
        }
        match line.split_once('|') {
            Some(("incall", id)) if !id.is_empty() => Ok(Handshake::Incall(id.to_owned())),
            _ => Err(Error::Protocol(format!("bad handshake: {line:?}"))),
        }
    }
}

/// Unix socket listener handing legs to a [`SessionController`].
#[derive(Debug)]
pub struct ControlPlane {
    listener: UnixListener,
    path: PathBuf,
    controller: SessionController,
}

impl ControlPlane {
    /// Bind `path`, replacing a socket left over by an earlier run.
    pub fn bind(path: &Path, controller: SessionController) -> Result<ControlPlane> {
        if path.exists() {
            debug!(path = %path.display(), "Removing stale control socket");
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        info!(path = %path.display(), "Control socket listening");
        Ok(ControlPlane {
            listener,
            path: path.to_path_buf(),
            controller,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept and run legs until `cancel` fires. A leg in progress is run
    /// to completion first.
    pub async fn serve(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            let stream = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                accepted = self.listener.accept() => accepted?.0,
            };
            if let Err(e) = handle(&self.controller, stream).await {
                warn!(error = %e, "Control connection failed");
            }
        }
    }
}

impl Drop for ControlPlane {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Run the handshake on `stream` and, if accepted, the call leg.
pub async fn handle<S>(controller: &SessionController, stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut stream = BufReader::new(stream);
    let mut line = String::new();
    let read = tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.read_line(&mut line)).await;
    let handshake = match read {
        Ok(Ok(0)) => return Ok(()),
        Ok(Ok(_)) => Handshake::parse(&line),
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => Err(Error::Protocol("handshake timeout".into())),
    };
    let handshake = match handshake {
        Ok(h) => h,
        Err(e) => {
            reply(&mut stream, "syntax error").await?;
            return Err(e);
        }
    };
    debug!(?handshake, "Control request");

    let leg = match controller.prepare(&handshake).await {
        Ok(leg) => leg,
        Err(e) => {
            let answer = match e {
                Error::Busy => "busy",
                _ => "ko",
            };
            reply(&mut stream, answer).await?;
            info!(?handshake, answer, "Leg refused");
            return Ok(());
        }
    };
    reply(&mut stream, "ok").await?;

    let buffer_size = controller.config().station.buffer_size;
    let reason = controller.run_leg(leg, Peer::new(stream, buffer_size)).await?;
    info!(?handshake, ?reason, "Leg finished");
    Ok(())
}

async fn reply<S: AsyncWrite + Unpin>(stream: &mut S, answer: &str) -> Result<()> {
    stream.write_all(answer.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    stream.flush().await?;
    Ok(())
}
