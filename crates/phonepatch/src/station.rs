//! The radio side of the daemon: control port, sound device and the
//! receive-side analysis that runs on every captured buffer.
//!
//! Whoever holds the station owns the radio. The session controller keeps
//! it behind a mutex and hands it to one activity at a time.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use phonepatch_core::ctcss::same_tone;
use phonepatch_core::{
    AudioDevice, CtcssDetector, CtcssEncoder, DtmfDecoder, DtmfSymbol, PcmFormat, RadioControl,
};
use phonepatch_transport::{OssAudioDevice, RadioPort};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{secs, AudioBackend, Config};
use crate::error::{Error, Result};
use crate::gates::CarrierGate;
use crate::peer::Peer;
use crate::prompt::PromptRenderer;

/// How far playback may run ahead of real time.
const PLAY_LEAD: Duration = Duration::from_millis(100);

/// What one captured buffer contained.
#[derive(Debug, Clone, Default)]
pub struct Heard {
    /// DTMF symbols committed in this buffer (only while the carrier is open).
    pub keys: Vec<DtmfSymbol>,
    /// Locked CTCSS tone after this buffer.
    pub tone: Option<f32>,
    pub carrier: bool,
    pub audio: Option<Bytes>,
}

/// Where and how to play a prompt.
#[derive(Default)]
pub struct PlayOptions<'a> {
    pub to_radio: bool,
    pub to_peer: bool,
    pub max_time: Option<Duration>,
    /// Loop until `max_time` or `abort`.
    pub repeat: bool,
    /// Transmit tone mixed into the radio copy.
    pub tone: Option<&'a mut CtcssEncoder>,
    /// Checked before every buffer.
    pub abort: Option<&'a (dyn Fn() -> bool + Send + Sync)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    Played,
    Aborted,
    PeerClosed,
    /// Nothing to play: the prompt rendered empty or had no target.
    Empty,
}

pub struct Station {
    pub(crate) config: Arc<Config>,
    pub(crate) format: PcmFormat,
    pub(crate) radio: Box<dyn RadioControl>,
    pub(crate) audio: Box<dyn AudioDevice>,
    pub(crate) carrier: CarrierGate,
    pub(crate) decoder: DtmfDecoder,
    ctcss: CtcssDetector,
    renderer: PromptRenderer,
}

impl Station {
    /// Open the configured radio interface and sound device.
    pub async fn open(config: Arc<Config>) -> Result<Station> {
        let format = config.pcm_format()?;
        let radio = RadioPort::open(&config.radio.spec()).await?;
        info!(kind = radio.kind(), device = %config.radio.device, "Radio interface open");

        let audio: Box<dyn AudioDevice> = match config.audio.backend {
            AudioBackend::Oss => Box::new(OssAudioDevice::open(
                &config.audio.device,
                format,
                config.audio.fragment_size,
            )?),
            #[cfg(feature = "audio")]
            AudioBackend::Cpal => Box::new(phonepatch_transport::CpalAudioDevice::open(
                &config.audio.device,
                format,
                config.audio.fragment_size,
            )?),
            #[cfg(not(feature = "audio"))]
            AudioBackend::Cpal => {
                return Err(Error::Config(
                    "cpal backend requires the `audio` feature".into(),
                ))
            }
        };
        info!(device = %config.audio.device, %format, "Sound device open");
        Station::new(config, Box::new(radio), audio)
    }

    /// Assemble a station from already open devices.
    pub fn new(
        config: Arc<Config>,
        radio: Box<dyn RadioControl>,
        audio: Box<dyn AudioDevice>,
    ) -> Result<Station> {
        let format = audio.format();
        if format != config.pcm_format()? {
            return Err(Error::Config(format!(
                "sound device format {format} differs from configuration"
            )));
        }
        let decoder = DtmfDecoder::new(format, config.dtmf.sensitivity)?;

        let mut tones: Vec<f32> = Vec::new();
        for freq in config.extensions.iter().filter_map(|e| e.ctcss_rx_frequency()) {
            if !tones.iter().any(|&t| same_tone(t, freq)) {
                tones.push(freq);
            }
        }
        let ctcss = CtcssDetector::new(
            format.sample_rate(),
            tones,
            secs(config.ctcss.min_lock_time),
            config.ctcss.threshold,
        );

        Ok(Station {
            carrier: CarrierGate::new(&config.carrier),
            renderer: PromptRenderer::new(&config.station, &config.prompts, format),
            config,
            format,
            radio,
            audio,
            decoder,
            ctcss,
        })
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn format(&self) -> PcmFormat {
        self.format
    }

    pub fn renderer(&self) -> &PromptRenderer {
        &self.renderer
    }

    /// Start DTMF detection afresh.
    pub fn reset_decoder(&mut self) -> Result<()> {
        self.decoder = DtmfDecoder::new(self.format, self.config.dtmf.sensitivity)?;
        Ok(())
    }

    /// Forget any CTCSS lock.
    pub fn reset_tone(&mut self) {
        self.ctcss.clear();
    }

    /// Read one buffer from the radio and analyse it.
    pub async fn hear(&mut self, timeout: Duration) -> Result<Heard> {
        let Some(data) = self
            .audio
            .read(self.config.station.buffer_size, timeout)
            .await?
        else {
            return Ok(Heard::default());
        };
        let open = self
            .carrier
            .update(self.radio.as_mut(), &self.format, &data, Instant::now())
            .await?;
        let samples = self.format.decode_mono(&data);
        let tone = self.ctcss.feed(&samples);
        let keys = if open {
            self.decoder.decode_samples(&samples)
        } else {
            Vec::new()
        };
        for key in &keys {
            debug!(symbol = %key, "DTMF key");
        }
        Ok(Heard {
            keys,
            tone,
            carrier: open,
            audio: Some(data),
        })
    }

    /// Play rendered prompt audio.
    ///
    /// PTT is keyed for the whole playback when the radio is a target and
    /// released after the sound device has drained, whatever the outcome.
    /// A peer that is present but not a target is kept alive with silence.
    pub async fn play(
        &mut self,
        audio: &[u8],
        mut peer: Option<&mut Peer>,
        opts: PlayOptions<'_>,
    ) -> Result<PlayOutcome> {
        let to_radio = opts.to_radio;
        let to_peer = opts.to_peer && peer.is_some();
        if audio.is_empty() || !(to_radio || to_peer) {
            return Ok(PlayOutcome::Empty);
        }
        if to_radio {
            self.radio.set_ptt(true).await?;
            tokio::time::sleep(secs(self.config.ptt.txdelay)).await;
        }
        let result = self.play_chunks(audio, peer.as_deref_mut(), to_peer, opts).await;
        if to_radio {
            let drained = self.audio.drain().await;
            self.radio.set_ptt(false).await?;
            self.carrier.reset();
            drained?;
        }
        let outcome = result?;
        debug!(?outcome, bytes = audio.len(), "Prompt played");
        Ok(outcome)
    }

    async fn play_chunks(
        &mut self,
        audio: &[u8],
        mut peer: Option<&mut Peer>,
        to_peer: bool,
        opts: PlayOptions<'_>,
    ) -> Result<PlayOutcome> {
        let PlayOptions {
            to_radio,
            max_time,
            repeat,
            mut tone,
            abort,
            ..
        } = opts;
        let frame = self.format.frame_bytes();
        let chunk_len = (self.config.station.buffer_size / frame * frame).max(frame);
        let start = Instant::now();
        let mut sent = 0usize;

        loop {
            for chunk in audio.chunks(chunk_len) {
                if abort.is_some_and(|f| f()) {
                    return Ok(PlayOutcome::Aborted);
                }
                if max_time.is_some_and(|m| start.elapsed() >= m) {
                    return Ok(PlayOutcome::Played);
                }
                if to_radio {
                    let mut buf = chunk.to_vec();
                    if let Some(encoder) = tone.as_deref_mut() {
                        encoder.mix(&self.format, &mut buf);
                    }
                    self.audio.write(&buf).await?;
                }
                if let Some(p) = peer.as_deref_mut() {
                    let alive = if to_peer {
                        match p.write(chunk).await {
                            Ok(()) => p.discard(Duration::ZERO).await,
                            Err(e) => Err(e),
                        }
                    } else {
                        p.keepalive(&self.format, Duration::ZERO).await
                    };
                    match alive {
                        Ok(true) => {}
                        Ok(false) => return Ok(PlayOutcome::PeerClosed),
                        Err(e) => {
                            warn!(error = %e, "Peer failed during prompt");
                            return Ok(PlayOutcome::PeerClosed);
                        }
                    }
                }
                sent += chunk.len();
                let due = start + self.format.duration_of(sent).saturating_sub(PLAY_LEAD);
                tokio::time::sleep_until(due).await;
            }
            if !repeat {
                return Ok(PlayOutcome::Played);
            }
        }
    }

    /// Unkey and release both devices.
    pub async fn close(&mut self) -> Result<()> {
        if let Err(e) = self.radio.set_ptt(false).await {
            debug!(error = %e, "PTT release on close failed");
        }
        let radio = self.radio.close().await;
        let audio = self.audio.close().await;
        info!("Radio released");
        radio?;
        audio?;
        Ok(())
    }
}

impl std::fmt::Debug for Station {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Station")
            .field("format", &self.format)
            .field("carrier", &self.carrier.mode())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use phonepatch_core::DtmfGenerator;
    use phonepatch_test_harness::{IdleInput, MockAudioDevice, MockRadioControl};
    use tokio::io::AsyncReadExt;

    pub(crate) fn station_with(
        config: Config,
        idle: IdleInput,
    ) -> (Station, MockRadioControl, MockAudioDevice) {
        let radio = MockRadioControl::new();
        let audio = MockAudioDevice::new(PcmFormat::telephony(), idle);
        let station = Station::new(
            Arc::new(config),
            Box::new(radio.clone()),
            Box::new(audio.clone()),
        )
        .unwrap();
        (station, radio, audio)
    }

    #[tokio::test(start_paused = true)]
    async fn play_keys_ptt_around_radio_audio() {
        let (mut station, radio, audio) = station_with(Config::default(), IdleInput::Timeout);
        let prompt = vec![0x10u8; 2000];

        let outcome = station
            .play(
                &prompt,
                None,
                PlayOptions {
                    to_radio: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome, PlayOutcome::Played);
        assert_eq!(audio.written(), prompt);
        assert_eq!(radio.ptt_history(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn tone_is_mixed_into_radio_copy_only() {
        let (mut station, _radio, audio) = station_with(Config::default(), IdleInput::Timeout);
        let (local, mut remote) = tokio::io::duplex(64 * 1024);
        let mut peer = Peer::new(local, 512);
        let prompt = station.format().silence(800);
        let mut tone = CtcssEncoder::new(100.0, 0.2);

        station
            .play(
                &prompt,
                Some(&mut peer),
                PlayOptions {
                    to_radio: true,
                    to_peer: true,
                    tone: Some(&mut tone),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(station.format().peak(&audio.written()) > 0.1);
        let mut echoed = vec![0xffu8; prompt.len()];
        remote.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, prompt);
    }

    #[tokio::test(start_paused = true)]
    async fn repeat_stops_at_max_time() {
        let (mut station, _radio, audio) = station_with(Config::default(), IdleInput::Timeout);
        let prompt = station.format().silence(800); // 0.1 s

        let outcome = station
            .play(
                &prompt,
                None,
                PlayOptions {
                    to_radio: true,
                    repeat: true,
                    max_time: Some(Duration::from_secs(1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome, PlayOutcome::Played);
        let played = station.format().duration_of(audio.written().len());
        assert!(played >= Duration::from_secs(1));
        assert!(played <= Duration::from_millis(1300));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_predicate_stops_playback() {
        let (mut station, radio, _audio) = station_with(Config::default(), IdleInput::Timeout);
        let prompt = vec![0u8; 4000];
        let abort = || true;

        let outcome = station
            .play(
                &prompt,
                None,
                PlayOptions {
                    to_radio: true,
                    abort: Some(&abort),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome, PlayOutcome::Aborted);
        assert!(!radio.ptt());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_prompt_does_not_key() {
        let (mut station, radio, _audio) = station_with(Config::default(), IdleInput::Timeout);
        let outcome = station
            .play(
                &[],
                None,
                PlayOptions {
                    to_radio: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, PlayOutcome::Empty);
        assert!(radio.ptt_history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hear_decodes_dtmf() {
        let (mut station, _radio, audio) = station_with(Config::default(), IdleInput::Timeout);
        let generator = DtmfGenerator::new(station.format(), 0);
        for buf in generator
            .encode_str("5", Duration::from_millis(200), Duration::ZERO, 0.5)
            .unwrap()
        {
            audio.push_input(buf);
        }

        let mut keys = Vec::new();
        while audio.input_remaining() > 0 {
            keys.extend(station.hear(Duration::from_millis(100)).await.unwrap().keys);
        }
        assert_eq!(keys, vec![DtmfSymbol::Five]);
    }

    #[tokio::test]
    async fn format_mismatch_rejected() {
        let audio = MockAudioDevice::new(
            PcmFormat::new(phonepatch_core::SampleFormat::U8, 1, 8000).unwrap(),
            IdleInput::Timeout,
        );
        let result = Station::new(
            Arc::new(Config::default()),
            Box::new(MockRadioControl::new()),
            Box::new(audio),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
