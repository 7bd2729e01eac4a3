//! Radio handoff between the idle loop and the control plane.
//!
//! The idle loop owns the radio while listening for triggers. A call leg
//! arriving on the control socket asks for it by moving the claim from
//! `None` to `Requested`; the idle loop notices at its next poll, moves it
//! to `Active` and parks until the leg's [`ClaimGuard`] is dropped.
//!
//! A claim records which kind of leg asked, so a ringing outcall can tell
//! its own connected leg from an unrelated incall.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Poll interval on both sides of the handoff.
pub const CLAIM_POLL: Duration = Duration::from_millis(10);

/// Longest a requester waits for the idle loop to yield.
pub const CLAIM_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClaimState {
    #[default]
    None,
    Requested,
    Active,
}

/// The kind of leg behind a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimKind {
    Incall,
    Outcall,
}

#[derive(Debug, Default)]
struct ClaimInner {
    state: ClaimState,
    kind: Option<ClaimKind>,
    accepting: bool,
}

/// Shared handoff flag. Clones refer to the same claim.
#[derive(Debug, Clone, Default)]
pub struct RadioClaim {
    inner: Arc<Mutex<ClaimInner>>,
}

impl RadioClaim {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ClaimInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ClaimState {
        self.lock().state
    }

    pub fn is_requested(&self) -> bool {
        self.state() == ClaimState::Requested
    }

    /// The kind of the pending or active claim.
    pub fn kind(&self) -> Option<ClaimKind> {
        let inner = self.lock();
        match inner.state {
            ClaimState::None => None,
            _ => inner.kind,
        }
    }

    /// Whether call legs are taken at all.
    pub fn is_accepting(&self) -> bool {
        self.lock().accepting
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.lock().accepting = accepting;
    }

    /// Ask for the radio and wait up to `timeout` for it to be handed
    /// over. Fails with [`Error::Busy`] if another claim is in progress or
    /// the holder does not yield in time.
    pub async fn request(&self, kind: ClaimKind, timeout: Duration) -> Result<ClaimGuard> {
        {
            let mut inner = self.lock();
            if inner.state != ClaimState::None {
                return Err(Error::Busy);
            }
            inner.state = ClaimState::Requested;
            inner.kind = Some(kind);
        }
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut inner = self.lock();
                match inner.state {
                    ClaimState::Active => {
                        debug!("Radio claim granted");
                        return Ok(ClaimGuard {
                            claim: self.clone(),
                        });
                    }
                    ClaimState::Requested if Instant::now() >= deadline => {
                        inner.state = ClaimState::None;
                        inner.kind = None;
                        debug!("Radio claim timed out");
                        return Err(Error::Busy);
                    }
                    _ => {}
                }
            }
            tokio::time::sleep(CLAIM_POLL).await;
        }
    }

    /// Called by the radio holder between activities. If a claim is
    /// pending, grant it and wait until the claimant is done (or `cancel`
    /// fires). Returns whether the radio was handed over.
    pub async fn yield_if_requested(&self, cancel: &CancellationToken) -> bool {
        {
            let mut inner = self.lock();
            if inner.state != ClaimState::Requested {
                return false;
            }
            inner.state = ClaimState::Active;
        }
        debug!("Radio handed over");
        while self.state() == ClaimState::Active && !cancel.is_cancelled() {
            tokio::time::sleep(CLAIM_POLL).await;
        }
        debug!("Radio back");
        true
    }
}

/// Proof of an active claim. Dropping it returns the radio.
#[derive(Debug)]
pub struct ClaimGuard {
    claim: RadioClaim,
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let mut inner = self.claim.lock();
        inner.state = ClaimState::None;
        inner.kind = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn request_times_out_without_holder() {
        let claim = RadioClaim::new();
        let start = Instant::now();
        let result = claim.request(ClaimKind::Incall, CLAIM_TIMEOUT).await;
        assert!(matches!(result, Err(Error::Busy)));
        assert!(start.elapsed() >= CLAIM_TIMEOUT);
        assert_eq!(claim.state(), ClaimState::None);
    }

    #[tokio::test(start_paused = true)]
    async fn holder_yields_until_guard_dropped() {
        let claim = RadioClaim::new();
        let cancel = CancellationToken::new();
        assert!(!claim.yield_if_requested(&cancel).await);

        let requester = claim.clone();
        let leg = tokio::spawn(async move {
            let guard = requester.request(ClaimKind::Outcall, CLAIM_TIMEOUT).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
            drop(guard);
        });

        while !claim.is_requested() {
            tokio::time::sleep(CLAIM_POLL).await;
        }
        assert_eq!(claim.kind(), Some(ClaimKind::Outcall));
        let start = Instant::now();
        assert!(claim.yield_if_requested(&cancel).await);
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert_eq!(claim.state(), ClaimState::None);
        assert_eq!(claim.kind(), None);
        leg.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn second_request_is_busy() {
        let claim = RadioClaim::new();
        let first = claim.clone();
        let pending = tokio::spawn(async move {
            first
                .request(ClaimKind::Incall, CLAIM_TIMEOUT)
                .await
                .is_ok()
        });
        while !claim.is_requested() {
            tokio::time::sleep(CLAIM_POLL).await;
        }
        assert!(matches!(
            claim.request(ClaimKind::Incall, CLAIM_TIMEOUT).await,
            Err(Error::Busy)
        ));
        assert!(!pending.await.unwrap());
    }

    #[test]
    fn accepting_flag() {
        let claim = RadioClaim::new();
        assert!(!claim.is_accepting());
        claim.clone().set_accepting(true);
        assert!(claim.is_accepting());
    }
}
