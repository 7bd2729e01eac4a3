//! The audio bridge: moves PCM between the radio and the telephony peer
//! for the life of a call.
//!
//! Peer readiness is checked before radio readiness on every turn, so a
//! talkative radio cannot starve the peer's inactivity timer.

use std::time::Duration;

use bytes::Bytes;
use phonepatch_core::{CtcssEncoder, DtmfSymbol};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::secs;
use crate::error::Result;
use crate::gates::VoxGate;
use crate::peer::{Peer, PeerRead};
use crate::session::CallSession;
use crate::station::{PlayOptions, Station};

/// Longest a single radio read waits.
const RADIO_POLL: Duration = Duration::from_millis(100);

/// Why a bridged call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakReason {
    /// The call length limit was reached.
    Timeout,
    /// The radio user sent the hangup key.
    User,
    /// The peer closed or went quiet.
    Peer,
    /// The sound device stopped delivering.
    Radio,
}

/// Bridge audio until a break condition, then play the end prompt where
/// it can still be heard.
pub async fn run_bridge(
    station: &mut Station,
    session: &mut CallSession,
    peer: &mut Peer,
) -> Result<BreakReason> {
    station.reset_decoder()?;
    info!(extension = %session.extension.id, direction = ?session.direction, "Bridge up");

    let pumped = pump(station, session, peer).await;
    if station.radio.get_ptt().unwrap_or(false) {
        station.radio.set_ptt(false).await?;
    }
    let reason = pumped?;
    info!(?reason, "Bridge down");
    session.break_reason = Some(reason);

    let (to_radio, to_peer) = match reason {
        BreakReason::Timeout | BreakReason::User => (true, true),
        BreakReason::Peer => (true, false),
        BreakReason::Radio => (false, false),
    };
    if to_radio || to_peer {
        let config = station.config().clone();
        let prompt = session.extension.end_prompt(&config.prompts);
        let username = session.extension.username(&config.station);
        let audio = session
            .prompts
            .render(station.renderer(), prompt, username)
            .await;
        let played = station
            .play(
                &audio,
                to_peer.then_some(&mut *peer),
                PlayOptions {
                    to_radio,
                    to_peer,
                    tone: session.ctcss_tx.as_mut(),
                    ..Default::default()
                },
            )
            .await;
        if let Err(e) = played {
            warn!(error = %e, "End prompt failed");
        }
    }
    Ok(reason)
}

async fn pump(
    station: &mut Station,
    session: &mut CallSession,
    peer: &mut Peer,
) -> Result<BreakReason> {
    let config = station.config().clone();
    let hangup = session.extension.hangup_button(&config.dtmf);
    let peer_timeout = secs(config.telephony.peer_timeout);
    let call_deadline = config
        .telephony
        .call_limit
        .map(|limit| Instant::now() + secs(limit));
    let buffer_size = config.station.buffer_size;
    let mut peer_deadline = Instant::now() + peer_timeout;
    let mut vox = VoxGate::new(&config.ptt);

    loop {
        // A sound device that is always ready would starve the timer arms
        // below, so both deadlines are also checked here.
        let now = Instant::now();
        if call_deadline.is_some_and(|deadline| now >= deadline) {
            return Ok(BreakReason::Timeout);
        }
        if now >= peer_deadline {
            debug!(?peer_timeout, "Peer inactive");
            return Ok(BreakReason::Peer);
        }

        tokio::select! {
            biased;

            read = peer.recv() => match read {
                Ok(PeerRead::Data(data)) => {
                    peer_deadline = Instant::now() + peer_timeout;
                    to_radio(station, &mut vox, session.ctcss_tx.as_mut(), data).await?;
                }
                Ok(PeerRead::Closed) => {
                    debug!("Peer closed");
                    return Ok(BreakReason::Peer);
                }
                Err(e) => {
                    debug!(error = %e, "Peer read failed");
                    return Ok(BreakReason::Peer);
                }
            },

            read = station.audio.read(buffer_size, RADIO_POLL) => match read {
                Ok(Some(data)) => {
                    if let Some(reason) = from_radio(station, peer, hangup, data).await? {
                        return Ok(reason);
                    }
                }
                Ok(None) => {}
                Err(phonepatch_core::Error::StreamClosed) => return Ok(BreakReason::Radio),
                Err(e) => return Err(e.into()),
            },

            () = tokio::time::sleep_until(peer_deadline) => {
                debug!(?peer_timeout, "Peer inactive");
                return Ok(BreakReason::Peer);
            }

            () = until(call_deadline) => return Ok(BreakReason::Timeout),
        }
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Peer to radio: gain, VOX keying, overflow guard, transmit tone.
async fn to_radio(
    station: &mut Station,
    vox: &mut VoxGate,
    tone: Option<&mut CtcssEncoder>,
    data: Bytes,
) -> Result<()> {
    let format = station.format;
    let mut buf = data.to_vec();
    format.apply_gain(&mut buf, station.config.telephony.radio_gain);

    let key = vox.update(format.peak(&buf), Instant::now());
    if key != station.radio.get_ptt()? {
        trace!(ptt = key, "VOX");
        station.radio.set_ptt(key).await?;
        if !key {
            station.carrier.reset();
        }
    }
    if !key {
        return Ok(());
    }

    let pending = station.audio.pending_output();
    if pending > 2 * station.audio.fragment_size() {
        debug!(pending, bytes = buf.len(), "Radio output backed up, dropping buffer");
        return Ok(());
    }
    if let Some(encoder) = tone {
        encoder.mix(&format, &mut buf);
    }
    station.audio.write(&buf).await?;
    Ok(())
}

/// Radio to peer: level ceiling, carrier gate, hangup detection, gain.
async fn from_radio(
    station: &mut Station,
    peer: &mut Peer,
    hangup: Option<DtmfSymbol>,
    data: Bytes,
) -> Result<Option<BreakReason>> {
    let format = station.format;
    let telephony = &station.config.telephony;
    let (limit, gain) = (telephony.radio_level_limit, telephony.telephony_gain);
    let mut buf = data.to_vec();
    format.limit(&mut buf, limit);

    let open = station
        .carrier
        .update(station.radio.as_mut(), &format, &buf, Instant::now())
        .await?;
    if open {
        if let Some(hangup) = hangup {
            if station.decoder.decode(&buf).contains(&hangup) {
                info!(symbol = %hangup, "Hangup key");
                return Ok(Some(BreakReason::User));
            }
        }
        format.apply_gain(&mut buf, gain);
    } else {
        buf = format.silence(format.frames_in(buf.len()));
    }

    if let Err(e) = peer.write(&buf).await {
        debug!(error = %e, "Peer write failed");
        return Ok(Some(BreakReason::Peer));
    }
    Ok(None)
}
