//! The telephony side of a call: a duplex raw PCM byte stream.
//!
//! Whoever establishes the PBX leg (the control socket, a test's
//! `tokio::io::duplex`) hands it over as anything that is
//! `AsyncRead + AsyncWrite`. The stream carries PCM in the station format.

use std::io;
use std::time::Duration;

use bytes::Bytes;
use phonepatch_core::PcmFormat;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

/// A byte stream usable as a call leg.
pub trait PeerIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> PeerIo for T {}

/// Result of one read from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerRead {
    Data(Bytes),
    Closed,
}

/// One call leg.
pub struct Peer {
    io: Box<dyn PeerIo>,
    buffer_size: usize,
}

impl Peer {
    /// Wrap `io`; each read returns at most `buffer_size` bytes.
    pub fn new(io: impl PeerIo + 'static, buffer_size: usize) -> Self {
        Peer {
            io: Box::new(io),
            buffer_size: buffer_size.max(1),
        }
    }

    /// Wait for the next buffer. Cancel safe: dropping the future loses
    /// no data.
    pub async fn recv(&mut self) -> io::Result<PeerRead> {
        let mut buf = vec![0u8; self.buffer_size];
        let n = self.io.read(&mut buf).await?;
        if n == 0 {
            return Ok(PeerRead::Closed);
        }
        buf.truncate(n);
        Ok(PeerRead::Data(Bytes::from(buf)))
    }

    /// Write and flush.
    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.io.write_all(data).await?;
        self.io.flush().await
    }

    /// Consume peer input for `period`, answering each buffer with the
    /// same length of silence so the PBX side keeps its timing. A zero
    /// period takes only what is already waiting.
    ///
    /// Returns `false` once the peer has closed.
    pub async fn keepalive(&mut self, format: &PcmFormat, period: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + period;
        loop {
            match tokio::time::timeout_at(deadline, self.recv()).await {
                Err(_) => return Ok(true),
                Ok(Ok(PeerRead::Closed)) => return Ok(false),
                Ok(Ok(PeerRead::Data(data))) => {
                    let silence = format.silence(format.frames_in(data.len()));
                    self.write(&silence).await?;
                }
                Ok(Err(e)) => return Err(e),
            }
        }
    }

    /// Like [`keepalive()`](Peer::keepalive) without answering.
    pub async fn discard(&mut self, period: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + period;
        loop {
            match tokio::time::timeout_at(deadline, self.recv()).await {
                Err(_) => return Ok(true),
                Ok(Ok(PeerRead::Closed)) => return Ok(false),
                Ok(Ok(PeerRead::Data(_))) => {}
                Ok(Err(e)) => return Err(e),
            }
        }
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.io.shutdown().await
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("buffer_size", &self.buffer_size)
            .finish_non_exhaustive()
    }
}
