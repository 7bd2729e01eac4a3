//! The call state machine.
//!
//! The idle loop listens to the radio for triggers and runs the
//! radio-originated steps (dial collection, placing an outcall). Call legs
//! from the PBX arrive through the control plane, which claims the radio
//! from the idle loop and then runs the leg here. Only one session holds
//! the station at a time.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use phonepatch_core::ctcss::same_tone;
use phonepatch_core::{CtcssEncoder, DtmfSymbol};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bridge::{run_bridge, BreakReason};
use crate::claim::{ClaimGuard, ClaimKind, RadioClaim, CLAIM_TIMEOUT};
use crate::config::{secs, AnswerMode, Config, Extension, OutcallTrigger};
use crate::control::Handshake;
use crate::dialing::{resolve_dial, DialCollector, DialProgress, DialTarget};
use crate::error::{Error, Result};
use crate::peer::Peer;
use crate::prompt::PromptCache;
use crate::shell;
use crate::spool::{self, SpoolEntry};
use crate::station::{PlayOptions, PlayOutcome, Station};

/// Longest a single listening read waits.
const LISTEN_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incall,
    Outcall,
}

/// One call attempt.
#[derive(Debug)]
pub struct CallSession {
    pub direction: Direction,
    pub extension: Extension,
    /// Tone mixed into everything transmitted for this call.
    pub ctcss_tx: Option<CtcssEncoder>,
    pub prompts: PromptCache,
    pub break_reason: Option<BreakReason>,
}

impl CallSession {
    pub fn new(direction: Direction, extension: Extension) -> Self {
        CallSession {
            direction,
            ctcss_tx: extension.ctcss_encoder(),
            extension,
            prompts: PromptCache::default(),
            break_reason: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    DialCollecting,
    PlacingOutcall,
    AwaitingIncallAnswer,
    Active,
}

/// Published on the controller's event channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    State(SessionState),
    Triggered { extension: String },
    Digit(DtmfSymbol),
    Dialing { number: String },
    Spooled(PathBuf),
    Answered { extension: String },
    Ended(BreakReason),
}

/// How an outcall attempt left the idle loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcallOutcome {
    /// The PBX connected; the session waits for the control plane.
    Connected,
    /// The attempt ended normally (refused, cancelled, unanswered).
    Handled,
}

/// A validated call leg, ready to run.
#[derive(Debug)]
pub struct PreparedLeg {
    session: CallSession,
    _claim: ClaimGuard,
}

enum Trigger {
    Dial(Option<Extension>),
    Autodial(Extension, String),
}

struct Inner {
    config: Arc<Config>,
    station: tokio::sync::Mutex<Station>,
    claim: RadioClaim,
    events: broadcast::Sender<SessionEvent>,
    pending_outcall: Mutex<Option<CallSession>>,
    cancel: CancellationToken,
}

/// Runs sessions against one station. Clones share the station.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    pub fn new(station: Station, cancel: CancellationToken) -> Self {
        let (events, _) = broadcast::channel(64);
        SessionController {
            inner: Arc::new(Inner {
                config: station.config().clone(),
                station: tokio::sync::Mutex::new(station),
                claim: RadioClaim::new(),
                events,
                pending_outcall: Mutex::new(None),
                cancel,
            }),
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.claim.is_accepting()
    }

    fn emit(&self, event: SessionEvent) {
        // Nobody listening is fine.
        let _ = self.inner.events.send(event);
    }

    fn set_state(&self, state: SessionState) {
        debug!(?state, "Session state");
        self.emit(SessionEvent::State(state));
    }

    // -----------------------------------------------------------------
    // Idle loop
    // -----------------------------------------------------------------

    /// Listen for triggers until cancelled. Errors reading the radio end
    /// the loop; failures inside a radio-originated session are logged and
    /// listening resumes.
    pub async fn run(&self) -> Result<()> {
        let cancel = self.inner.cancel.clone();
        self.inner.claim.set_accepting(true);
        self.set_state(SessionState::Idle);
        info!(station = %self.inner.config.station.name, "Listening");

        let result = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }
            if self.inner.claim.yield_if_requested(&cancel).await {
                self.set_state(SessionState::Idle);
                continue;
            }
            let mut station = self.inner.station.lock().await;
            let trigger = match self.listen(&mut station).await {
                Ok(trigger) => trigger,
                Err(e) => break Err(e),
            };
            let Some(trigger) = trigger else {
                continue;
            };
            let outcome = match trigger {
                Trigger::Dial(preset) => self.dial_session(&mut station, preset).await,
                Trigger::Autodial(ext, number) => {
                    match resolve_dial(&self.inner.config, Some(&ext), &number) {
                        Some(target) => self.place_outcall(&mut station, target).await,
                        None => Ok(OutcallOutcome::Handled),
                    }
                }
            };
            if let Err(e) = outcome {
                error!(error = %e, "Session aborted");
            }
            station.reset_tone();
            if let Err(e) = station.reset_decoder() {
                break Err(e);
            }
            drop(station);
            if !self.inner.claim.is_requested() {
                self.set_state(SessionState::Idle);
            }
        };
        self.inner.claim.set_accepting(false);
        result
    }

    /// One listening read. Returns a trigger when one was heard.
    async fn listen(&self, station: &mut Station) -> Result<Option<Trigger>> {
        let config = &self.inner.config;
        let heard = station.hear(LISTEN_POLL).await?;

        if config.outcall.enabled {
            if let Some(ask) = config.dtmf.askfortone_button {
                if heard.keys.contains(&ask) && self.dtmf_outcalls_allowed() {
                    info!(symbol = %ask, "Dial tone requested");
                    self.emit(SessionEvent::Triggered {
                        extension: String::new(),
                    });
                    return Ok(Some(Trigger::Dial(None)));
                }
            }
        }

        if let Some(tone) = heard.tone {
            let ext = config.extensions.iter().find(|e| {
                e.outcall_trigger == OutcallTrigger::Ctcss
                    && e.outcall_enabled
                    && e.ctcss_rx_frequency().is_some_and(|rx| same_tone(rx, tone))
            });
            if let Some(ext) = ext {
                if !config.outcall.enabled {
                    debug!(extension = %ext.id, "Outcalls disabled, ignoring tone");
                    return Ok(None);
                }
                info!(extension = %ext.id, tone, "CTCSS trigger");
                self.emit(SessionEvent::Triggered {
                    extension: ext.id.clone(),
                });
                return Ok(Some(match &ext.autodial {
                    Some(number) => Trigger::Autodial(ext.clone(), number.clone()),
                    None => Trigger::Dial(Some(ext.clone())),
                }));
            }
        }
        Ok(None)
    }

    fn dtmf_outcalls_allowed(&self) -> bool {
        let extensions = &self.inner.config.extensions;
        extensions.is_empty()
            || extensions
                .iter()
                .any(|e| e.outcall_trigger == OutcallTrigger::Dtmf && e.outcall_enabled)
    }

    // -----------------------------------------------------------------
    // Dial collection
    // -----------------------------------------------------------------

    async fn dial_session(
        &self,
        station: &mut Station,
        preset: Option<Extension>,
    ) -> Result<OutcallOutcome> {
        self.set_state(SessionState::DialCollecting);
        let config = self.inner.config.clone();
        let mut session = CallSession::new(
            Direction::Outcall,
            preset.clone().unwrap_or_default(),
        );
        let username = session.extension.username(&config.station).to_owned();

        let tone = session
            .prompts
            .render(station.renderer(), &config.prompts.tone, &username)
            .await;
        station
            .play(
                &tone,
                None,
                PlayOptions {
                    to_radio: true,
                    repeat: true,
                    max_time: Some(secs(config.prompts.tone_time)),
                    tone: session.ctcss_tx.as_mut(),
                    ..Default::default()
                },
            )
            .await?;

        let Some(number) = self.collect_number(station, preset.as_ref()).await? else {
            self.play_to_radio(station, &mut session, &config.prompts.tone_timeout)
                .await?;
            return Ok(OutcallOutcome::Handled);
        };
        match resolve_dial(&config, preset.as_ref(), &number) {
            Some(target) => self.place_outcall(station, target).await,
            None => {
                warn!(number = %number, "Dialed number matches no extension");
                self.play_to_radio(station, &mut session, &config.prompts.outcall_refused)
                    .await?;
                Ok(OutcallOutcome::Handled)
            }
        }
    }

    /// Collect keys until the outcall key. `None` on timeout.
    ///
    /// Does not yield the radio to control plane requests: a call leg
    /// arriving mid-dial is answered `busy`.
    async fn collect_number(
        &self,
        station: &mut Station,
        preset: Option<&Extension>,
    ) -> Result<Option<String>> {
        let config = &self.inner.config;
        let ext = preset.cloned().unwrap_or_default();
        let mut collector = DialCollector::new(
            ext.clear_button(&config.dtmf),
            ext.outcall_button(&config.dtmf),
            config.dtmf.noisy_button,
        );
        station.reset_decoder()?;
        let deadline = Instant::now() + secs(config.dtmf.tone_timeout);

        while Instant::now() < deadline && !self.inner.cancel.is_cancelled() {
            let heard = station.hear(LISTEN_POLL).await?;
            for key in heard.keys {
                self.emit(SessionEvent::Digit(key));
                match collector.push(key) {
                    DialProgress::Complete(number) => {
                        info!(number = %number, "Number dialed");
                        return Ok(Some(number));
                    }
                    DialProgress::Cleared => debug!("Dialing cleared"),
                    DialProgress::Collecting => {}
                }
            }
        }
        info!("Dial timeout");
        Ok(None)
    }

    // -----------------------------------------------------------------
    // Outcall placement
    // -----------------------------------------------------------------

    /// Check, spool and ring an outcall until the PBX connects it, gives
    /// up on it, or the radio user hangs up.
    async fn place_outcall(
        &self,
        station: &mut Station,
        target: DialTarget,
    ) -> Result<OutcallOutcome> {
        self.set_state(SessionState::PlacingOutcall);
        self.emit(SessionEvent::Dialing {
            number: target.number.clone(),
        });
        let config = self.inner.config.clone();
        let outcall = &config.outcall;
        let mut session = CallSession::new(Direction::Outcall, target.extension.clone());
        info!(extension = %target.extension.id, number = %target.number, "Placing outcall");

        if let Some(check) = &outcall.pbx_check_command {
            if !shell::succeeds(check).await {
                warn!("PBX not available");
                self.play_to_radio(station, &mut session, &config.prompts.pbx_inactive)
                    .await?;
                return Ok(OutcallOutcome::Handled);
            }
        }
        if let Some(script) = &outcall.check_script {
            let command = script.replace("%x", &shell::quote(&target.number));
            if !shell::succeeds(&command).await {
                info!(number = %target.number, "Outcall refused by check script");
                self.play_to_radio(station, &mut session, &config.prompts.outcall_refused)
                    .await?;
                return Ok(OutcallOutcome::Handled);
            }
        }

        let entry = SpoolEntry::for_target(&config, &target);
        let path = entry.submit(&config.station.run_dir, &config.station.spool_dir)?;
        self.emit(SessionEvent::Spooled(path.clone()));

        let rung = self.ring(station, &mut session, &path).await;
        match rung {
            Ok(OutcallOutcome::Connected) => {
                info!("Outcall connected");
                *self.lock_pending() = Some(session);
                Ok(OutcallOutcome::Connected)
            }
            other => {
                spool::withdraw(&path)?;
                other
            }
        }
    }

    async fn ring(
        &self,
        station: &mut Station,
        session: &mut CallSession,
        path: &std::path::Path,
    ) -> Result<OutcallOutcome> {
        let config = self.inner.config.clone();
        let outcall = &config.outcall;
        let username = session.extension.username(&config.station).to_owned();
        let hangup = session.extension.hangup_button(&config.dtmf);
        let give_up = Instant::now()
            + Duration::from_secs(outcall.timeout.into())
            + secs(outcall.ring_wait);

        let claim = self.inner.claim.clone();
        let cancel = self.inner.cancel.clone();
        let spooled = path.to_path_buf();
        let abort = move || claim.is_requested() || cancel.is_cancelled() || !spooled.exists();
        let ring = session
            .prompts
            .render(station.renderer(), &config.prompts.ring, &username)
            .await;

        loop {
            if self.inner.claim.is_requested() {
                if self.inner.claim.kind() == Some(ClaimKind::Outcall) {
                    return Ok(OutcallOutcome::Connected);
                }
                info!("Incall arrived while ringing, dropping outcall");
                return Ok(OutcallOutcome::Handled);
            }
            if self.inner.cancel.is_cancelled() {
                return Ok(OutcallOutcome::Handled);
            }
            if !path.exists() || Instant::now() >= give_up {
                info!("Outcall not answered");
                self.play_to_radio(station, session, &config.prompts.ring_timeout)
                    .await?;
                return Ok(OutcallOutcome::Handled);
            }
            station
                .play(
                    &ring,
                    None,
                    PlayOptions {
                        to_radio: true,
                        repeat: true,
                        max_time: Some(secs(outcall.ring_time)),
                        tone: session.ctcss_tx.as_mut(),
                        abort: Some(&abort),
                        ..Default::default()
                    },
                )
                .await?;
            if self
                .wait_for_key(station, hangup, secs(outcall.ring_wait), &abort)
                .await?
            {
                info!("Outcall cancelled from the radio");
                return Ok(OutcallOutcome::Handled);
            }
        }
    }

    /// Listen for `key` for up to `period`. True if it was heard.
    async fn wait_for_key(
        &self,
        station: &mut Station,
        key: Option<DtmfSymbol>,
        period: Duration,
        abort: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<bool> {
        let deadline = Instant::now() + period;
        while Instant::now() < deadline && !abort() {
            let heard = station.hear(LISTEN_POLL).await?;
            if key.is_some_and(|k| heard.keys.contains(&k)) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // -----------------------------------------------------------------
    // Call legs from the control plane
    // -----------------------------------------------------------------

    /// Claim the radio and validate a leg. Fails with [`Error::Busy`] when
    /// the radio is not handed over in time and [`Error::Refused`] when
    /// the leg cannot be taken.
    pub async fn prepare(&self, request: &Handshake) -> Result<PreparedLeg> {
        if !self.is_accepting() {
            return Err(Error::Refused);
        }
        let (kind, incall) = match request {
            Handshake::Incall(id) => {
                let ext = self.inner.config.extension(id).ok_or_else(|| {
                    warn!(extension = %id, "Incall for unknown extension");
                    Error::Refused
                })?;
                if !ext.incall_enabled {
                    info!(extension = %id, "Incalls disabled");
                    return Err(Error::Refused);
                }
                (ClaimKind::Incall, Some(ext.clone()))
            }
            Handshake::Outcall => (ClaimKind::Outcall, None),
        };
        let claim = self.inner.claim.request(kind, CLAIM_TIMEOUT).await?;
        let session = match incall {
            Some(ext) => CallSession::new(Direction::Incall, ext),
            // The ringing outcall stores its session before yielding.
            None => self.lock_pending().take().ok_or_else(|| {
                warn!("Outcall leg without a pending outcall");
                Error::Refused
            })?,
        };
        Ok(PreparedLeg {
            session,
            _claim: claim,
        })
    }

    /// Run a prepared leg to completion. Returns the break reason, or
    /// `None` when an incall was never answered.
    pub async fn run_leg(&self, leg: PreparedLeg, mut peer: Peer) -> Result<Option<BreakReason>> {
        let PreparedLeg {
            mut session,
            _claim,
        } = leg;
        let mut station = self.inner.station.lock().await;

        if session.direction == Direction::Incall
            && !self.await_incall_answer(&mut station, &mut session, &mut peer).await?
        {
            let _ = peer.shutdown().await;
            return Ok(None);
        }

        self.set_state(SessionState::Active);
        self.emit(SessionEvent::Answered {
            extension: session.extension.id.clone(),
        });
        let reason = run_bridge(&mut station, &mut session, &mut peer).await;
        station.reset_tone();
        let reset = station.reset_decoder();
        if let Err(e) = peer.shutdown().await {
            debug!(error = %e, "Peer shutdown failed");
        }
        let reason = reason?;
        reset?;
        self.emit(SessionEvent::Ended(reason));
        Ok(Some(reason))
    }

    /// Report an incoming call on the radio until it is answered the way
    /// the extension expects or the report timeout passes.
    async fn await_incall_answer(
        &self,
        station: &mut Station,
        session: &mut CallSession,
        peer: &mut Peer,
    ) -> Result<bool> {
        let config = self.inner.config.clone();
        let ext = session.extension.clone();
        self.set_state(SessionState::AwaitingIncallAnswer);
        let format = station.format();
        let username = ext.username(&config.station).to_owned();
        let answer = ext.answer_button(&config.dtmf);
        let rx = ext.ctcss_rx_frequency();
        let deadline = Instant::now() + secs(ext.incall_report_timeout);
        let report = session
            .prompts
            .render(
                station.renderer(),
                ext.incall_report_prompt(&config.prompts),
                &username,
            )
            .await;
        station.reset_decoder()?;
        station.reset_tone();
        info!(extension = %ext.id, mode = ?ext.incall_answer, "Incoming call");

        if ext.incall_answer == AnswerMode::Open {
            // Both ends hear the report once, then the call is up.
            let played = station
                .play(
                    &report,
                    Some(&mut *peer),
                    PlayOptions {
                        to_radio: true,
                        to_peer: true,
                        tone: session.ctcss_tx.as_mut(),
                        ..Default::default()
                    },
                )
                .await?;
            if played == PlayOutcome::PeerClosed {
                info!("Caller hung up during report");
                return Ok(false);
            }
            return Ok(true);
        }

        loop {
            if Instant::now() >= deadline {
                info!(extension = %ext.id, "Incall not answered");
                let timeout = session
                    .prompts
                    .render(
                        station.renderer(),
                        ext.incall_timeout_prompt(&config.prompts),
                        &username,
                    )
                    .await;
                station
                    .play(
                        &timeout,
                        Some(&mut *peer),
                        PlayOptions {
                            to_radio: true,
                            tone: session.ctcss_tx.as_mut(),
                            ..Default::default()
                        },
                    )
                    .await?;
                return Ok(false);
            }

            let played = station
                .play(
                    &report,
                    Some(&mut *peer),
                    PlayOptions {
                        to_radio: true,
                        tone: session.ctcss_tx.as_mut(),
                        ..Default::default()
                    },
                )
                .await?;
            if played == PlayOutcome::PeerClosed {
                info!("Caller hung up before answer");
                return Ok(false);
            }

            let until = deadline.min(Instant::now() + secs(ext.incall_report_wait));
            while Instant::now() < until {
                let heard = station.hear(LISTEN_POLL).await?;
                match peer.keepalive(&format, Duration::ZERO).await {
                    Ok(true) => {}
                    Ok(false) | Err(_) => {
                        info!("Caller hung up before answer");
                        return Ok(false);
                    }
                }
                let answered = match ext.incall_answer {
                    AnswerMode::Dtmf => heard.keys.contains(&answer),
                    AnswerMode::Ctcss => heard
                        .tone
                        .zip(rx)
                        .is_some_and(|(heard, rx)| same_tone(heard, rx)),
                    AnswerMode::Open => true,
                };
                if answered {
                    info!(extension = %ext.id, "Incall answered");
                    return Ok(true);
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // One-shot and shutdown
    // -----------------------------------------------------------------

    /// Place one outcall to `number` as if it had been dialed, hand the
    /// radio to the leg if the PBX connects it, and return when done.
    pub async fn test_outcall(&self, number: &str) -> Result<OutcallOutcome> {
        let target = resolve_dial(&self.inner.config, None, number)
            .ok_or_else(|| Error::Config(format!("no extension for number {number}")))?;
        self.inner.claim.set_accepting(true);
        let outcome = {
            let mut station = self.inner.station.lock().await;
            self.place_outcall(&mut station, target).await
        };
        // A connected leg, or an incall that arrived while ringing.
        self.inner.claim.yield_if_requested(&self.inner.cancel).await;
        self.inner.claim.set_accepting(false);
        outcome
    }

    /// Stop taking legs and release the radio. Waits for a running session.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.claim.set_accepting(false);
        self.inner.cancel.cancel();
        self.inner.station.lock().await.close().await
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<CallSession>> {
        self.inner
            .pending_outcall
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    async fn play_to_radio(
        &self,
        station: &mut Station,
        session: &mut CallSession,
        prompt: &str,
    ) -> Result<PlayOutcome> {
        let username = session
            .extension
            .username(&self.inner.config.station)
            .to_owned();
        let audio = session
            .prompts
            .render(station.renderer(), prompt, &username)
            .await;
        station
            .play(
                &audio,
                None,
                PlayOptions {
                    to_radio: true,
                    tone: session.ctcss_tx.as_mut(),
                    ..Default::default()
                },
            )
            .await
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("station", &self.inner.config.station.name)
            .field("claim", &self.inner.claim.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::station::tests::station_with;
    use phonepatch_core::{DtmfGenerator, PcmFormat};
    use phonepatch_test_harness::{IdleInput, MockAudioDevice};
    use tokio::io::AsyncReadExt;

    fn tone_audio(freq: f32, seconds: f64) -> Vec<u8> {
        let format = PcmFormat::telephony();
        let mut audio = format.silence((seconds * 8000.0) as usize);
        CtcssEncoder::new(freq, 0.3).mix(&format, &mut audio);
        audio
    }

    fn push_keys(audio: &MockAudioDevice, keys: &str) {
        let generator = DtmfGenerator::new(PcmFormat::telephony(), 512);
        for buf in generator
            .encode_str(keys, Duration::from_millis(150), Duration::from_millis(150), 0.5)
            .unwrap()
        {
            audio.push_input(buf);
        }
        audio.push_input(PcmFormat::telephony().silence(1600));
    }

    async fn wait_for(
        events: &mut broadcast::Receiver<SessionEvent>,
        seen: &mut Vec<SessionEvent>,
        done: impl Fn(&SessionEvent) -> bool,
    ) {
        loop {
            let event = events.recv().await.unwrap();
            let finished = done(&event);
            seen.push(event);
            if finished {
                return;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ctcss_autodial_skips_dial_collection() {
        let spool = tempfile::tempdir().unwrap();
        let run = tempfile::tempdir().unwrap();
        let config = Config::parse(&format!(
            r#"
            [station]
            spool_dir = "{}"
            run_dir = "{}"

            [[extension]]
            id = "200"
            outcall_trigger = "ctcss"
            ctcss_rx = "100.0"
            autodial = "5551234"
            "#,
            spool.path().display(),
            run.path().display(),
        ))
        .unwrap();
        let (station, _radio, audio) = station_with(config, IdleInput::Timeout);
        audio.push_input(tone_audio(100.0, 2.0));

        let cancel = CancellationToken::new();
        let controller = SessionController::new(station, cancel.clone());
        let mut events = controller.subscribe();
        let idle = tokio::spawn({
            let controller = controller.clone();
            async move { controller.run().await }
        });

        let mut seen = Vec::new();
        wait_for(&mut events, &mut seen, |e| matches!(e, SessionEvent::Spooled(_))).await;

        assert!(seen.contains(&SessionEvent::State(SessionState::PlacingOutcall)));
        assert!(!seen.contains(&SessionEvent::State(SessionState::DialCollecting)));
        assert!(seen.contains(&SessionEvent::Dialing {
            number: "5551234".into()
        }));
        let Some(SessionEvent::Spooled(path)) = seen.last() else {
            panic!("no spool event");
        };
        let entry = std::fs::read_to_string(path).unwrap();
        assert!(entry.contains("Channel: SIP/5551234\n"));
        assert!(entry.contains("Extension: 200\n"));

        cancel.cancel();
        idle.await.unwrap().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn dtmf_trigger_collects_number() {
        let spool = tempfile::tempdir().unwrap();
        let run = tempfile::tempdir().unwrap();
        let config = Config::parse(&format!(
            r#"
            [station]
            spool_dir = "{}"
            run_dir = "{}"

            [dtmf]
            noisy_button = "D"
            "#,
            spool.path().display(),
            run.path().display(),
        ))
        .unwrap();
        let (station, _radio, audio) = station_with(config, IdleInput::Timeout);
        push_keys(&audio, "*");

        let cancel = CancellationToken::new();
        let controller = SessionController::new(station, cancel.clone());
        let mut events = controller.subscribe();
        let idle = tokio::spawn({
            let controller = controller.clone();
            async move { controller.run().await }
        });

        let mut seen = Vec::new();
        wait_for(&mut events, &mut seen, |e| {
            *e == SessionEvent::State(SessionState::DialCollecting)
        })
        .await;
        push_keys(&audio, "1D1D2#");
        wait_for(&mut events, &mut seen, |e| matches!(e, SessionEvent::Spooled(_))).await;

        assert!(seen.contains(&SessionEvent::Dialing { number: "12".into() }));
        cancel.cancel();
        idle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn dial_timeout_returns_to_idle() {
        let mut config = Config::default();
        config.dtmf.tone_timeout = 2.0;
        let (station, _radio, audio) = station_with(config, IdleInput::Timeout);
        push_keys(&audio, "*");

        let cancel = CancellationToken::new();
        let controller = SessionController::new(station, cancel.clone());
        let mut events = controller.subscribe();
        let idle = tokio::spawn({
            let controller = controller.clone();
            async move { controller.run().await }
        });

        let mut seen = Vec::new();
        wait_for(&mut events, &mut seen, |e| {
            *e == SessionEvent::State(SessionState::DialCollecting)
        })
        .await;
        wait_for(&mut events, &mut seen, |e| {
            *e == SessionEvent::State(SessionState::Idle)
        })
        .await;
        assert!(!seen.iter().any(|e| matches!(e, SessionEvent::Dialing { .. })));
        cancel.cancel();
        idle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn open_incall_bridges_until_peer_leaves() {
        let config = Config::parse(
            r#"
            [prompts]
            tts_command = "cat"

            [[extension]]
            id = "200"
            incall_answer = "open"
            "#,
        )
        .unwrap();
        let (station, _radio, audio) = station_with(config, IdleInput::Timeout);
        let cancel = CancellationToken::new();
        let controller = SessionController::new(station, cancel.clone());
        let mut events = controller.subscribe();
        let idle = tokio::spawn({
            let controller = controller.clone();
            async move { controller.run().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let leg = controller
            .prepare(&Handshake::Incall("200".into()))
            .await
            .unwrap();
        let (local, mut remote) = tokio::io::duplex(64 * 1024);
        let runner = tokio::spawn({
            let controller = controller.clone();
            async move { controller.run_leg(leg, Peer::new(local, 512)).await }
        });

        let mut seen = Vec::new();
        wait_for(&mut events, &mut seen, |e| {
            matches!(e, SessionEvent::Answered { .. })
        })
        .await;

        // "cat" echoes the text back as PCM, so both ends got it verbatim.
        let report = b"Incoming call for phonepatch";
        let mut heard = vec![0u8; report.len()];
        remote.read_exact(&mut heard).await.unwrap();
        assert_eq!(heard, report);
        assert!(audio.written().starts_with(report));

        drop(remote);
        assert_eq!(runner.await.unwrap().unwrap(), Some(BreakReason::Peer));

        cancel.cancel();
        idle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn incall_during_ring_withdraws_outcall() {
        let spool = tempfile::tempdir().unwrap();
        let run = tempfile::tempdir().unwrap();
        let config = Config::parse(&format!(
            r#"
            [station]
            spool_dir = "{}"
            run_dir = "{}"

            [[extension]]
            id = "200"
            outcall_trigger = "ctcss"
            ctcss_rx = "100.0"
            autodial = "5551234"

            [[extension]]
            id = "300"
            incall_answer = "open"
            "#,
            spool.path().display(),
            run.path().display(),
        ))
        .unwrap();
        let (station, _radio, audio) = station_with(config, IdleInput::Timeout);
        audio.push_input(tone_audio(100.0, 2.0));

        let cancel = CancellationToken::new();
        let controller = SessionController::new(station, cancel.clone());
        let mut events = controller.subscribe();
        let idle = tokio::spawn({
            let controller = controller.clone();
            async move { controller.run().await }
        });

        let mut seen = Vec::new();
        wait_for(&mut events, &mut seen, |e| matches!(e, SessionEvent::Spooled(_))).await;
        let Some(SessionEvent::Spooled(path)) = seen.last().cloned() else {
            panic!("no spool event");
        };
        // Let the ringing outcall use up the tone so it cannot trigger again.
        while audio.input_remaining() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(path.exists());

        let leg = controller
            .prepare(&Handshake::Incall("300".into()))
            .await
            .unwrap();
        assert!(!path.exists());

        let (local, remote) = tokio::io::duplex(64 * 1024);
        drop(remote);
        let reason = controller
            .run_leg(leg, Peer::new(local, 512))
            .await
            .unwrap();
        assert_eq!(reason, Some(BreakReason::Peer));

        // Nothing was left pending for a later outcall leg.
        let result = controller.prepare(&Handshake::Outcall).await;
        assert!(matches!(result, Err(Error::Refused)));

        cancel.cancel();
        idle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_extension_refused() {
        let (station, _radio, _audio) = station_with(Config::default(), IdleInput::Timeout);
        let cancel = CancellationToken::new();
        let controller = SessionController::new(station, cancel.clone());
        let idle = tokio::spawn({
            let controller = controller.clone();
            async move { controller.run().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = controller.prepare(&Handshake::Incall("999".into())).await;
        assert!(matches!(result, Err(Error::Refused)));

        cancel.cancel();
        idle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn legs_refused_when_not_listening() {
        let (station, _radio, _audio) = station_with(Config::default(), IdleInput::Timeout);
        let controller = SessionController::new(station, CancellationToken::new());
        let result = controller.prepare(&Handshake::Outcall).await;
        assert!(matches!(result, Err(Error::Refused)));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_dtmf_incall_times_out() {
        let config = Config::parse(
            r#"
            [[extension]]
            id = "200"
            incall_answer = "dtmf"
            incall_report_wait = 1.0
            incall_report_timeout = 3.0
            "#,
        )
        .unwrap();
        let (station, _radio, _audio) = station_with(config, IdleInput::Timeout);
        let cancel = CancellationToken::new();
        let controller = SessionController::new(station, cancel.clone());
        let idle = tokio::spawn({
            let controller = controller.clone();
            async move { controller.run().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let leg = controller
            .prepare(&Handshake::Incall("200".into()))
            .await
            .unwrap();
        let (local, _remote) = tokio::io::duplex(64 * 1024);
        let start = Instant::now();
        let reason = controller
            .run_leg(leg, Peer::new(local, 512))
            .await
            .unwrap();
        assert_eq!(reason, None);
        assert!(start.elapsed() >= Duration::from_secs(3));

        cancel.cancel();
        idle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn dtmf_answer_connects_incall() {
        let config = Config::parse(
            r#"
            [[extension]]
            id = "200"
            incall_answer = "dtmf"
            answer = "5"
            "#,
        )
        .unwrap();
        let (station, _radio, audio) = station_with(config, IdleInput::Timeout);
        let cancel = CancellationToken::new();
        let controller = SessionController::new(station, cancel.clone());
        let mut events = controller.subscribe();
        let idle = tokio::spawn({
            let controller = controller.clone();
            async move { controller.run().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let leg = controller
            .prepare(&Handshake::Incall("200".into()))
            .await
            .unwrap();
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let runner = tokio::spawn({
            let controller = controller.clone();
            async move { controller.run_leg(leg, Peer::new(local, 512)).await }
        });

        let mut seen = Vec::new();
        wait_for(&mut events, &mut seen, |e| {
            *e == SessionEvent::State(SessionState::AwaitingIncallAnswer)
        })
        .await;
        push_keys(&audio, "5");
        wait_for(&mut events, &mut seen, |e| {
            matches!(e, SessionEvent::Answered { .. })
        })
        .await;
        drop(remote);
        assert_eq!(runner.await.unwrap().unwrap(), Some(BreakReason::Peer));

        cancel.cancel();
        idle.await.unwrap().unwrap();
    }
}
