//! ==============================================================================
//! session.rs - single-client session gate
//! ==============================================================================
//!
//! purpose:
//!     only one browser gets the live feed at a time. the gate is a two-state
//!     machine, EMPTY or OCCUPIED, and is the only writer of "current session".
//!
//! transitions:
//!     EMPTY    + admit        -> OCCUPIED
//!     OCCUPIED + admit        -> OCCUPIED, new occupant (preempt policy)
//!                                refused with GateError::Occupied (reject policy)
//!     OCCUPIED + stop         -> EMPTY
//!     OCCUPIED + disconnect   -> EMPTY   (SessionHandle dropped)
//!     OCCUPIED + stale        -> EMPTY   (reaper, no touch() within stale_timeout)
//!
//!     leaving OCCUPIED always fires the old occupant's termination signal, so
//!     whatever it is awaiting in the dispatcher wakes up with the reason.
//!
//! relationships:
//!     - used by: server.rs (admit on /mon.sse, stop on /mon/stop)
//!     - used by: dispatcher.rs (touch + termination wait)
//!     - reaper spawned from main.rs
//!
//! ==============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{GateError, Termination};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// what to do with a connection that arrives while the gate is occupied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionPolicy {
    /// newest connection wins, the old one is ended with `Preempted`
    #[default]
    Preempt,
    /// first connection keeps the feed until it stops or goes away
    Reject,
}

/// point-in-time view of the current session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub peer: Option<SocketAddr>,
    pub admitted_at: Instant,
    pub last_activity: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateState {
    Empty,
    Occupied(SessionInfo),
}

struct Occupant {
    info: SessionInfo,
    signal: watch::Sender<Option<Termination>>,
}

impl Occupant {
    fn end(self, reason: Termination) -> SessionId {
        // receiver may already be gone (handle dropped); nothing to wake then
        let _ = self.signal.send(Some(reason));
        self.info.id
    }
}

struct GateInner {
    next_id: u64,
    current: Option<Occupant>,
}

#[derive(Clone)]
pub struct SessionGate {
    inner: Arc<Mutex<GateInner>>,
    policy: AdmissionPolicy,
    stale_timeout: Duration,
}

impl SessionGate {
    pub fn new(policy: AdmissionPolicy, stale_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(GateInner { next_id: 1, current: None })),
            policy,
            stale_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    pub fn stale_timeout(&self) -> Duration {
        self.stale_timeout
    }

    /// install a new session, applying the admission policy to any occupant
    pub fn admit(&self, peer: Option<SocketAddr>) -> Result<SessionHandle, GateError> {
        let mut inner = self.lock();

        if let Some(current) = inner.current.as_ref() {
            if self.policy == AdmissionPolicy::Reject {
                tracing::info!(occupant = %current.info.id, ?peer, "feed busy, refusing connection");
                return Err(GateError::Occupied(current.info.id));
            }
        }

        let id = SessionId(inner.next_id);
        inner.next_id += 1;

        let now = Instant::now();
        let (tx, rx) = watch::channel(None);
        let previous = inner.current.replace(Occupant {
            info: SessionInfo { id, peer, admitted_at: now, last_activity: now },
            signal: tx,
        });

        if let Some(old) = previous {
            let old_id = old.end(Termination::Preempted);
            tracing::info!(session = %id, preempted = %old_id, ?peer, "session preempted");
        } else {
            tracing::info!(session = %id, ?peer, "session admitted");
        }

        Ok(SessionHandle { id, gate: self.clone(), signal: rx })
    }

    /// explicit stop from the client. `None` stops whoever holds the feed.
    ///
    /// returns the stopped session; stopping an empty gate, or naming a
    /// session that is no longer current, is a no-op.
    pub fn stop(&self, id: Option<SessionId>) -> Option<SessionId> {
        let stopped = self.end_if(|info| id.map_or(true, |id| info.id == id), Termination::Stopped);
        match stopped {
            Some(id) => tracing::info!(session = %id, "session stopped by client"),
            None => tracing::debug!(requested = ?id, "stop ignored, no matching session"),
        }
        stopped
    }

    /// transport went away; only acts if `id` is still the occupant
    pub fn disconnect(&self, id: SessionId) -> bool {
        let ended = self.end_if(|info| info.id == id, Termination::Disconnected).is_some();
        if ended {
            tracing::info!(session = %id, "session disconnected");
        }
        ended
    }

    /// record activity. fails if `id` no longer holds the feed.
    pub fn touch(&self, id: SessionId) -> Result<(), Termination> {
        let mut inner = self.lock();
        match inner.current.as_mut() {
            Some(occ) if occ.info.id == id => {
                occ.info.last_activity = Instant::now();
                Ok(())
            }
            _ => Err(Termination::Disconnected),
        }
    }

    /// evict the occupant if it has been idle for longer than the stale timeout
    pub fn reap_stale(&self) -> Option<SessionId> {
        let timeout = self.stale_timeout;
        let now = Instant::now();
        let reaped = self.end_if(|info| now.duration_since(info.last_activity) > timeout, Termination::Stale);
        if let Some(id) = reaped {
            tracing::warn!(session = %id, ?timeout, "session went stale, evicting");
        }
        reaped
    }

    pub fn state(&self) -> GateState {
        match self.lock().current.as_ref() {
            Some(occ) => GateState::Occupied(occ.info.clone()),
            None => GateState::Empty,
        }
    }

    pub fn current(&self) -> Option<SessionId> {
        self.lock().current.as_ref().map(|occ| occ.info.id)
    }

    fn end_if(&self, pred: impl FnOnce(&SessionInfo) -> bool, reason: Termination) -> Option<SessionId> {
        let mut inner = self.lock();
        if !inner.current.as_ref().is_some_and(|occ| pred(&occ.info)) {
            return None;
        }
        inner.current.take().map(|occ| occ.end(reason))
    }

    /// sweep for stale sessions every `period`, for the life of the process
    pub async fn run_reaper(self, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.reap_stale();
        }
    }
}

/// ownership of the feed for one connection
///
/// dropping the handle is the transport-level disconnect: if this session is
/// still the occupant the gate goes back to EMPTY.
pub struct SessionHandle {
    id: SessionId,
    gate: SessionGate,
    signal: watch::Receiver<Option<Termination>>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn touch(&self) -> Result<(), Termination> {
        if let Some(reason) = self.termination() {
            return Err(reason);
        }
        self.gate.touch(self.id)
    }

    /// reason this session ended, if it has
    pub fn termination(&self) -> Option<Termination> {
        *self.signal.borrow()
    }

    /// resolves once the gate ends this session
    pub async fn terminated(&mut self) -> Termination {
        loop {
            let seen = *self.signal.borrow_and_update();
            if let Some(reason) = seen {
                return reason;
            }
            if self.signal.changed().await.is_err() {
                // sender dropped without a reason: the gate let go of us
                return self.termination().unwrap_or(Termination::Disconnected);
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.gate.disconnect(self.id);
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> SessionGate {
        SessionGate::new(AdmissionPolicy::Preempt, Duration::from_secs(5))
    }

    #[test]
    fn test_starts_empty() {
        assert_eq!(gate().state(), GateState::Empty);
    }

    #[tokio::test]
    async fn test_admit_occupies() {
        let g = gate();
        let a = g.admit(None).unwrap();
        assert_eq!(g.current(), Some(a.id()));
        assert!(a.termination().is_none());
    }

    #[tokio::test]
    async fn test_preempt_replaces_and_signals_old() {
        let g = gate();
        let mut a = g.admit(None).unwrap();
        let b = g.admit(None).unwrap();

        assert_eq!(g.current(), Some(b.id()));
        assert_eq!(a.terminated().await, Termination::Preempted);
        assert_eq!(a.touch(), Err(Termination::Preempted));
        assert!(b.touch().is_ok());
    }

    #[tokio::test]
    async fn test_dropping_preempted_handle_keeps_new_occupant() {
        let g = gate();
        let a = g.admit(None).unwrap();
        let b = g.admit(None).unwrap();
        drop(a);
        assert_eq!(g.current(), Some(b.id()));
    }

    #[tokio::test]
    async fn test_reject_policy_refuses_second_connection() {
        // alternative single-owner semantics: first come keeps the feed
        let g = SessionGate::new(AdmissionPolicy::Reject, Duration::from_secs(5));
        let a = g.admit(None).unwrap();
        assert_eq!(g.admit(None).err(), Some(GateError::Occupied(a.id())));
        assert!(a.termination().is_none());

        drop(a);
        assert!(g.admit(None).is_ok());
    }

    #[tokio::test]
    async fn test_stop_empties_gate() {
        let g = gate();
        let mut a = g.admit(None).unwrap();
        assert_eq!(g.stop(Some(a.id())), Some(a.id()));
        assert_eq!(g.state(), GateState::Empty);
        assert_eq!(a.terminated().await, Termination::Stopped);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let g = gate();
        assert_eq!(g.stop(None), None);
        assert_eq!(g.stop(Some(SessionId(42))), None);

        let a = g.admit(None).unwrap();
        // a stale id from an older tab must not kick the current one
        assert_eq!(g.stop(Some(SessionId(a.id().0 + 100))), None);
        assert_eq!(g.current(), Some(a.id()));
    }

    #[tokio::test]
    async fn test_drop_is_disconnect() {
        let g = gate();
        let a = g.admit(None).unwrap();
        drop(a);
        assert_eq!(g.state(), GateState::Empty);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_goes_stale() {
        let g = gate();
        let mut a = g.admit(None).unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(g.reap_stale(), None);

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(g.reap_stale(), Some(a.id()));
        assert_eq!(a.terminated().await, Termination::Stale);

        // next connection is admitted straight away
        let b = g.admit(None).unwrap();
        assert_eq!(g.current(), Some(b.id()));
        assert!(b.termination().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_keeps_session_alive() {
        let g = gate();
        let a = g.admit(None).unwrap();
        for _ in 0..10 {
            tokio::time::advance(Duration::from_secs(2)).await;
            a.touch().unwrap();
            assert_eq!(g.reap_stale(), None);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_task_evicts() {
        let g = gate();
        let mut a = g.admit(None).unwrap();
        tokio::spawn(g.clone().run_reaper(Duration::from_secs(1)));

        let reason = tokio::time::timeout(Duration::from_secs(10), a.terminated()).await.unwrap();
        assert_eq!(reason, Termination::Stale);
        assert_eq!(g.state(), GateState::Empty);
    }

    #[tokio::test]
    async fn test_at_most_one_occupant_under_churn() {
        let g = gate();
        let mut live: Vec<SessionHandle> = Vec::new();
        for i in 0..50 {
            match i % 4 {
                0 | 1 => live.push(g.admit(None).unwrap()),
                2 => {
                    g.stop(None);
                }
                _ => {
                    if !live.is_empty() {
                        live.remove(0);
                    }
                }
            }
            let unterminated = live.iter().filter(|h| h.termination().is_none()).count();
            assert!(unterminated <= 1, "step {i}: {unterminated} live sessions");
            match g.state() {
                GateState::Empty => assert_eq!(unterminated, 0),
                GateState::Occupied(info) => {
                    let holder = live.iter().find(|h| h.termination().is_none()).unwrap();
                    assert_eq!(holder.id(), info.id);
                }
            }
        }
    }
}
