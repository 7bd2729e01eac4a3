//! Mock [`AudioDevice`] with scripted capture and recorded playback.
//!
//! Reads are paced in (tokio) time by the duration of the audio they
//! return, so tests running on a paused clock see realistic timing
//! without waiting for it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use phonepatch_core::audio::{AudioDevice, PcmFormat};
use phonepatch_core::error::{Error, Result};

/// What a read returns once the scripted input is used up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleInput {
    /// Nothing arrives: every read times out.
    Timeout,
    /// Endless silence.
    Silence,
    /// Endless silence without pacing: every read is ready at once, like
    /// a device with a capture backlog.
    Flood,
    /// The device is gone: reads fail with [`Error::StreamClosed`].
    Closed,
}

#[derive(Debug)]
struct AudioState {
    input: VecDeque<Bytes>,
    idle: IdleInput,
    written: Vec<u8>,
    writes: usize,
    pending_output: usize,
    closed: bool,
}

/// Scripted radio sound device.
#[derive(Debug, Clone)]
pub struct MockAudioDevice {
    format: PcmFormat,
    fragment_size: usize,
    state: Arc<Mutex<AudioState>>,
}

impl MockAudioDevice {
    pub fn new(format: PcmFormat, idle: IdleInput) -> Self {
        MockAudioDevice {
            format,
            fragment_size: 512,
            state: Arc::new(Mutex::new(AudioState {
                input: VecDeque::new(),
                idle,
                written: Vec::new(),
                writes: 0,
                pending_output: 0,
                closed: false,
            })),
        }
    }

    pub fn with_fragment_size(mut self, fragment_size: usize) -> Self {
        self.fragment_size = fragment_size;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AudioState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue captured audio. Reads split it as needed.
    pub fn push_input(&self, data: impl Into<Bytes>) {
        self.lock().input.push_back(data.into());
    }

    pub fn set_idle(&self, idle: IdleInput) {
        self.lock().idle = idle;
    }

    /// Pretend this many bytes are still queued for playback.
    pub fn set_pending_output(&self, bytes: usize) {
        self.lock().pending_output = bytes;
    }

    /// Everything written for playback so far.
    pub fn written(&self) -> Vec<u8> {
        self.lock().written.clone()
    }

    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    pub fn input_remaining(&self) -> usize {
        self.lock().input.iter().map(Bytes::len).sum()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[async_trait]
impl AudioDevice for MockAudioDevice {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    fn pending_output(&self) -> usize {
        self.lock().pending_output
    }

    async fn read(&mut self, max: usize, timeout: Duration) -> Result<Option<Bytes>> {
        // Sleep before taking the chunk so a dropped read loses nothing.
        let (next, idle) = {
            let state = self.lock();
            if state.closed {
                return Err(Error::NotConnected);
            }
            (state.input.front().map(|d| d.len().min(max)), state.idle)
        };

        match (next, idle) {
            (Some(len), _) => {
                tokio::time::sleep(self.format.duration_of(len)).await;
                let mut state = self.lock();
                let Some(front) = state.input.front_mut() else {
                    return Ok(None);
                };
                let chunk = front.split_to(len.min(front.len()));
                if front.is_empty() {
                    state.input.pop_front();
                }
                Ok(Some(chunk))
            }
            (None, IdleInput::Timeout) => {
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
            (None, IdleInput::Silence) => {
                let frames = self.format.frames_in(max);
                tokio::time::sleep(self.format.duration_of(max)).await;
                Ok(Some(Bytes::from(self.format.silence(frames))))
            }
            (None, IdleInput::Flood) => {
                let frames = self.format.frames_in(max);
                Ok(Some(Bytes::from(self.format.silence(frames))))
            }
            (None, IdleInput::Closed) => Err(Error::StreamClosed),
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::NotConnected);
        }
        state.written.extend_from_slice(data);
        state.writes += 1;
        Ok(())
    }

    async fn drain(&mut self) -> Result<()> {
        if self.lock().closed {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.lock().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phonepatch_core::audio::SampleFormat;

    fn format() -> PcmFormat {
        PcmFormat::new(SampleFormat::S16Le, 1, 8000).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn mock_audio_splits_input() {
        let mock = MockAudioDevice::new(format(), IdleInput::Timeout);
        mock.push_input(vec![1u8; 10]);
        let mut device = mock.clone();
        let first = device.read(4, Duration::from_millis(100)).await.unwrap();
        assert_eq!(first.unwrap().len(), 4);
        assert_eq!(mock.input_remaining(), 6);
        let rest = device.read(64, Duration::from_millis(100)).await.unwrap();
        assert_eq!(rest.unwrap().len(), 6);
        assert!(device.read(64, Duration::from_millis(100)).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn mock_audio_closed_stream() {
        let mut device = MockAudioDevice::new(format(), IdleInput::Closed);
        assert!(matches!(
            device.read(64, Duration::from_millis(10)).await,
            Err(Error::StreamClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn mock_audio_read_is_cancel_safe() {
        let mock = MockAudioDevice::new(format(), IdleInput::Timeout);
        mock.push_input(vec![7u8; 1600]);
        let mut device = mock.clone();
        let dropped = tokio::time::timeout(
            Duration::from_millis(1),
            device.read(1600, Duration::from_millis(100)),
        )
        .await;
        assert!(dropped.is_err());
        assert_eq!(mock.input_remaining(), 1600);
    }

    #[tokio::test(start_paused = true)]
    async fn mock_audio_flood_never_waits() {
        let mut device = MockAudioDevice::new(format(), IdleInput::Flood);
        let start = tokio::time::Instant::now();
        for _ in 0..10 {
            let chunk = device.read(320, Duration::from_millis(100)).await.unwrap();
            assert_eq!(chunk.unwrap().len(), 320);
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn mock_audio_records_writes() {
        let mock = MockAudioDevice::new(format(), IdleInput::Timeout);
        let mut device: Box<dyn AudioDevice> = Box::new(mock.clone());
        device.write(&[1, 2]).await.unwrap();
        device.write(&[3]).await.unwrap();
        assert_eq!(mock.written(), vec![1, 2, 3]);
        assert_eq!(mock.write_count(), 2);
    }
}
