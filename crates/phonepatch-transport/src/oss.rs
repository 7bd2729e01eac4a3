//! Raw PCM sound device through the OSS `/dev/dsp` interface.
//!
//! [`OssAudioDevice`] configures the device with `SNDCTL_DSP_*` ioctls and
//! moves audio through two blocking threads bridged to tokio channels,
//! the same way the cpal backend bridges its callbacks:
//!
//! - **capture**: reader thread -> `mpsc::Sender<Bytes>` -> [`read()`](AudioDevice::read)
//! - **playback**: [`write()`](AudioDevice::write) -> `mpsc::Sender<Bytes>` -> writer thread
//!
//! Bytes sitting in the playback channel plus the driver's own queue
//! (`SNDCTL_DSP_GETODELAY`) make up [`pending_output()`](AudioDevice::pending_output).
//!
//! Works with kernel OSS emulation (`snd-pcm-oss`), OSS4 and `padsp`.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use phonepatch_core::audio::{AudioDevice, PcmFormat, SampleFormat};
use phonepatch_core::error::{Error, Result};

/// Capacity of the capture and playback channels, in fragments.
const CHANNEL_BUFFER_SIZE: usize = 32;

/// Interval at which [`drain()`](AudioDevice::drain) checks the playback queue.
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// OSS `AFMT_*` code for a sample format.
fn afmt(format: SampleFormat) -> libc::c_int {
    match format {
        SampleFormat::U8 => 0x0000_0008,
        SampleFormat::S16Le => 0x0000_0010,
        SampleFormat::S16Be => 0x0000_0020,
        SampleFormat::S8 => 0x0000_0040,
        SampleFormat::U16Le => 0x0000_0080,
        SampleFormat::U16Be => 0x0000_0100,
    }
}

/// `SNDCTL_DSP_SETFRAGMENT` argument for a fragment size in bytes.
///
/// The size is rounded down to a power of two, at least 16 bytes; the
/// fragment count is left to the driver.
fn fragment_selector(size: usize) -> libc::c_int {
    let size = size.max(16);
    let shift = usize::BITS - 1 - size.leading_zeros();
    (0x7fff << 16) | shift as libc::c_int
}

#[cfg(target_os = "linux")]
mod dsp {
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::os::fd::AsRawFd;

    // _SIOWR / _SIOR / _SIO('P', nr, int) from <sys/soundcard.h>.
    const SNDCTL_DSP_SYNC: libc::c_ulong = 0x5001;
    const SNDCTL_DSP_SPEED: libc::c_ulong = 0xc004_5002;
    const SNDCTL_DSP_GETBLKSIZE: libc::c_ulong = 0xc004_5004;
    const SNDCTL_DSP_SETFMT: libc::c_ulong = 0xc004_5005;
    const SNDCTL_DSP_CHANNELS: libc::c_ulong = 0xc004_5006;
    const SNDCTL_DSP_SETFRAGMENT: libc::c_ulong = 0xc004_500a;
    const SNDCTL_DSP_GETODELAY: libc::c_ulong = 0x8004_5017;

    fn check(rc: libc::c_int) -> io::Result<()> {
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// An open `/dev/dsp` style device.
    pub struct Dsp {
        file: File,
    }

    impl Dsp {
        pub fn open(path: &str) -> io::Result<Dsp> {
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            Ok(Dsp { file })
        }

        /// Exchange an `int` with the driver; returns what it settled on.
        fn exchange(&self, request: libc::c_ulong, value: libc::c_int) -> io::Result<libc::c_int> {
            let mut value = value;
            // SAFETY: the request reads and writes exactly one int.
            check(unsafe {
                libc::ioctl(self.file.as_raw_fd(), request as _, &mut value as *mut libc::c_int)
            })?;
            Ok(value)
        }

        pub fn set_fragment(&self, selector: libc::c_int) -> io::Result<()> {
            self.exchange(SNDCTL_DSP_SETFRAGMENT, selector).map(|_| ())
        }

        pub fn set_format(&self, afmt: libc::c_int) -> io::Result<libc::c_int> {
            self.exchange(SNDCTL_DSP_SETFMT, afmt)
        }

        pub fn set_channels(&self, channels: libc::c_int) -> io::Result<libc::c_int> {
            self.exchange(SNDCTL_DSP_CHANNELS, channels)
        }

        pub fn set_speed(&self, rate: libc::c_int) -> io::Result<libc::c_int> {
            self.exchange(SNDCTL_DSP_SPEED, rate)
        }

        pub fn block_size(&self) -> io::Result<usize> {
            Ok(self.exchange(SNDCTL_DSP_GETBLKSIZE, 0)?.max(0) as usize)
        }

        pub fn output_delay(&self) -> io::Result<usize> {
            Ok(self.exchange(SNDCTL_DSP_GETODELAY, 0)?.max(0) as usize)
        }

        pub fn sync(&self) -> io::Result<()> {
            // SAFETY: SNDCTL_DSP_SYNC takes no argument.
            check(unsafe { libc::ioctl(self.file.as_raw_fd(), SNDCTL_DSP_SYNC as _) })
        }

        pub fn try_clone(&self) -> io::Result<Dsp> {
            Ok(Dsp {
                file: self.file.try_clone()?,
            })
        }

        pub fn file(&self) -> &File {
            &self.file
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::OssAudioDevice;

#[cfg(target_os = "linux")]
mod linux {
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use tokio::sync::mpsc;

    use super::*;
    use super::dsp::Dsp;

    /// A full-duplex OSS sound device.
    pub struct OssAudioDevice {
        path: String,
        format: PcmFormat,
        fragment_size: usize,
        dsp: Option<Arc<Dsp>>,
        capture: Option<mpsc::Receiver<Bytes>>,
        playback: Option<mpsc::Sender<Bytes>>,
        leftover: Bytes,
        queued: Arc<AtomicUsize>,
        running: Arc<AtomicBool>,
    }

    impl OssAudioDevice {
        /// Open and configure `path` for `format`.
        ///
        /// `fragment_size` of zero keeps the driver's default. Fails with
        /// [`Error::Unsupported`] if the driver settles on a different
        /// sample format, channel count or a rate off by more than 1%.
        pub fn open(path: &str, format: PcmFormat, fragment_size: usize) -> Result<Self> {
            tracing::debug!(device = %path, format = %format.sample_format().name(),
                channels = format.channels(), rate = format.sample_rate(), "Opening sound device");
            let io_err = |what: &str, e: std::io::Error| {
                Error::Transport(format!("{path}: {what}: {e}"))
            };
            let dsp = Dsp::open(path).map_err(|e| io_err("open", e))?;

            if fragment_size > 0 {
                if let Err(e) = dsp.set_fragment(fragment_selector(fragment_size)) {
                    tracing::warn!(device = %path, error = %e, "Fragment size not accepted");
                }
            }
            let wanted = afmt(format.sample_format());
            let got = dsp.set_format(wanted).map_err(|e| io_err("set format", e))?;
            if got != wanted {
                return Err(Error::Unsupported(format!(
                    "{path}: sample format {} not supported",
                    format.sample_format().name()
                )));
            }
            let channels = dsp
                .set_channels(libc::c_int::from(format.channels()))
                .map_err(|e| io_err("set channels", e))?;
            if channels != libc::c_int::from(format.channels()) {
                return Err(Error::Unsupported(format!(
                    "{path}: {} channels not supported",
                    format.channels()
                )));
            }
            let wanted_rate = format.sample_rate() as libc::c_int;
            let rate = dsp.set_speed(wanted_rate).map_err(|e| io_err("set speed", e))?;
            if (rate - wanted_rate).abs() * 100 > wanted_rate {
                return Err(Error::Unsupported(format!(
                    "{path}: sample rate {wanted_rate} not supported (got {rate})"
                )));
            }
            let block = dsp.block_size().map_err(|e| io_err("get block size", e))?;
            let fragment_size = if block > 0 { block } else { fragment_size.max(256) };

            let dsp = Arc::new(dsp);
            let running = Arc::new(AtomicBool::new(true));
            let queued = Arc::new(AtomicUsize::new(0));

            let (capture_tx, capture_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
            let reader = dsp.try_clone().map_err(|e| io_err("dup", e))?;
            let reader_running = Arc::clone(&running);
            let reader_path = path.to_string();
            thread::Builder::new()
                .name("oss-capture".into())
                .spawn(move || capture_loop(reader, fragment_size, capture_tx, reader_running, reader_path))
                .map_err(Error::Io)?;

            let (playback_tx, playback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
            let writer = dsp.try_clone().map_err(|e| io_err("dup", e))?;
            let writer_queued = Arc::clone(&queued);
            let writer_path = path.to_string();
            thread::Builder::new()
                .name("oss-playback".into())
                .spawn(move || playback_loop(writer, playback_rx, writer_queued, writer_path))
                .map_err(Error::Io)?;

            tracing::info!(device = %path, fragment_size, "Sound device opened");
            Ok(OssAudioDevice {
                path: path.to_string(),
                format,
                fragment_size,
                dsp: Some(dsp),
                capture: Some(capture_rx),
                playback: Some(playback_tx),
                leftover: Bytes::new(),
                queued,
                running,
            })
        }

        pub fn path(&self) -> &str {
            &self.path
        }
    }

    fn capture_loop(
        dsp: Dsp,
        fragment_size: usize,
        tx: mpsc::Sender<Bytes>,
        running: Arc<AtomicBool>,
        path: String,
    ) {
        let mut file = dsp.file();
        let mut buf = vec![0u8; fragment_size];
        while running.load(Ordering::Relaxed) {
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!(device = %path, error = %e, "Sound device read failed");
                    break;
                }
            }
        }
        tracing::debug!(device = %path, "Capture thread finished");
    }

    fn playback_loop(
        dsp: Dsp,
        mut rx: mpsc::Receiver<Bytes>,
        queued: Arc<AtomicUsize>,
        path: String,
    ) {
        let mut file = dsp.file();
        while let Some(data) = rx.blocking_recv() {
            let result = file.write_all(&data);
            queued.fetch_sub(data.len(), Ordering::Relaxed);
            if let Err(e) = result {
                tracing::error!(device = %path, error = %e, "Sound device write failed");
                break;
            }
        }
        tracing::debug!(device = %path, "Playback thread finished");
    }

    #[async_trait]
    impl AudioDevice for OssAudioDevice {
        fn format(&self) -> PcmFormat {
            self.format
        }

        fn fragment_size(&self) -> usize {
            self.fragment_size
        }

        fn pending_output(&self) -> usize {
            let in_driver = self
                .dsp
                .as_ref()
                .and_then(|dsp| dsp.output_delay().ok())
                .unwrap_or(0);
            self.queued.load(Ordering::Relaxed) + in_driver
        }

        async fn read(&mut self, max: usize, timeout: Duration) -> Result<Option<Bytes>> {
            if self.leftover.is_empty() {
                let capture = self.capture.as_mut().ok_or(Error::NotConnected)?;
                match tokio::time::timeout(timeout, capture.recv()).await {
                    Ok(Some(data)) => self.leftover = data,
                    Ok(None) => return Err(Error::StreamClosed),
                    Err(_) => return Ok(None),
                }
            }
            let take = max.min(self.leftover.len());
            Ok(Some(self.leftover.split_to(take)))
        }

        async fn write(&mut self, data: &[u8]) -> Result<()> {
            let playback = self.playback.as_ref().ok_or(Error::NotConnected)?;
            self.queued.fetch_add(data.len(), Ordering::Relaxed);
            playback
                .send(Bytes::copy_from_slice(data))
                .await
                .map_err(|_| Error::StreamClosed)
        }

        async fn drain(&mut self) -> Result<()> {
            let dsp = self.dsp.clone().ok_or(Error::NotConnected)?;
            while self.queued.load(Ordering::Relaxed) > 0 {
                if self.playback.as_ref().is_some_and(|tx| tx.is_closed()) {
                    return Err(Error::StreamClosed);
                }
                tokio::time::sleep(DRAIN_POLL).await;
            }
            tokio::task::spawn_blocking(move || dsp.sync())
                .await
                .map_err(|e| Error::Transport(format!("drain task failed: {e}")))??;
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            if self.dsp.is_none() {
                return Err(Error::NotConnected);
            }
            self.running.store(false, Ordering::Relaxed);
            self.playback = None;
            self.capture = None;
            self.leftover = Bytes::new();
            self.dsp = None;
            tracing::info!(device = %self.path, "Sound device closed");
            Ok(())
        }
    }
}

/// OSS device access is only built for Linux.
#[cfg(not(target_os = "linux"))]
pub struct OssAudioDevice;

#[cfg(not(target_os = "linux"))]
impl OssAudioDevice {
    pub fn open(path: &str, _format: PcmFormat, _fragment_size: usize) -> Result<Self> {
        Err(Error::Unsupported(format!("OSS sound devices need Linux: {path}")))
    }
}
