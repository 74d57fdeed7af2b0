//! Call session handles: the observable side of the call state machine,
//! and the transient offer surfaced to incoming-call listeners.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use serde_json::Value;
use tracing::warn;

use tether_core::{CallId, CallState, PeerIdentity};

use crate::media::MediaStream;
use crate::peer::{apply_actions, run_deferred, run_media, PeerError, PeerShared};

pub type StateListener = Arc<dyn Fn(CallState) + Send + Sync>;

/// Stateful handle to one voice/video exchange. State moves
/// `connecting -> connected -> ended`; `ended` is terminal and observed by
/// listeners exactly once.
pub struct CallSession {
    id: CallId,
    peer: PeerIdentity,
    has_video: bool,
    shared: Weak<PeerShared>,
    local: MediaStream,
    remote: StdMutex<Option<MediaStream>>,
    state: StdMutex<CallState>,
    reason: StdMutex<Option<String>>,
    muted: AtomicBool,
    video_enabled: AtomicBool,
    ended_notified: AtomicBool,
    listeners: StdMutex<Vec<(u64, StateListener)>>,
    next_listener: AtomicU64,
}

impl CallSession {
    pub(crate) fn new(
        shared: Weak<PeerShared>,
        id: CallId,
        peer: PeerIdentity,
        has_video: bool,
        local: MediaStream,
    ) -> Self {
        Self {
            id,
            peer,
            has_video,
            shared,
            local,
            remote: StdMutex::new(None),
            state: StdMutex::new(CallState::Connecting),
            reason: StdMutex::new(None),
            muted: AtomicBool::new(false),
            video_enabled: AtomicBool::new(has_video),
            ended_notified: AtomicBool::new(false),
            listeners: StdMutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    pub fn peer_id(&self) -> &PeerIdentity {
        &self.peer
    }

    pub fn has_video(&self) -> bool {
        self.has_video
    }

    pub fn state(&self) -> CallState {
        *self.state.lock().unwrap()
    }

    /// Why the session ended, once it has.
    pub fn ended_reason(&self) -> Option<String> {
        self.reason.lock().unwrap().clone()
    }

    pub fn local_stream(&self) -> MediaStream {
        self.local.clone()
    }

    pub fn remote_stream(&self) -> Option<MediaStream> {
        self.remote.lock().unwrap().clone()
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn is_video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::SeqCst)
    }

    /// Flip mute and return the new muted state. Flips `enabled` on the
    /// local audio tracks; capture is never released by this. No-op once
    /// the session ended.
    pub async fn toggle_mute(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return self.is_muted();
        };
        let (muted, deferred) = {
            let mut inner = shared.state.lock().await;
            match inner.core.toggle_mute(self.id) {
                Ok((muted, actions)) => {
                    let deferred = apply_actions(&shared, &mut inner, actions);
                    (muted, deferred)
                }
                Err(_) => (self.is_muted(), Vec::new()),
            }
        };
        run_deferred(&shared, deferred);
        muted
    }

    /// Flip video and return whether video is now enabled. No-op on an
    /// audio-only session, and once the session ended.
    pub async fn toggle_video(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return self.is_video_enabled();
        };
        let (enabled, deferred) = {
            let mut inner = shared.state.lock().await;
            match inner.core.toggle_video(self.id) {
                Ok((enabled, actions)) => {
                    let deferred = apply_actions(&shared, &mut inner, actions);
                    (enabled, deferred)
                }
                Err(_) => (self.is_video_enabled(), Vec::new()),
            }
        };
        run_deferred(&shared, deferred);
        enabled
    }

    /// Hang up. Rides the same terminal path as a remote close; local
    /// capture is stopped exactly once either way.
    pub async fn hang_up(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let deferred = {
            let mut inner = shared.state.lock().await;
            let actions = inner.core.end_call(self.id, "hung up");
            apply_actions(&shared, &mut inner, actions)
        };
        run_deferred(&shared, deferred);
    }

    /// Register a state-change listener; returns an id for removal.
    /// Listeners run synchronously in subscription order on every
    /// transition; one panicking does not block the others.
    pub fn on_state_change<F>(&self, listener: F) -> u64
    where
        F: Fn(CallState) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .lock()
            .unwrap()
            .push((id, Arc::new(listener)));
        id
    }

    pub fn off_state_change(&self, id: u64) {
        self.listeners.lock().unwrap().retain(|(l, _)| *l != id);
    }

    pub(crate) fn record_state(&self, state: CallState, reason: Option<String>) {
        *self.state.lock().unwrap() = state;
        if let Some(reason) = reason {
            *self.reason.lock().unwrap() = Some(reason);
        }
    }

    pub(crate) fn set_remote(&self, stream: MediaStream) {
        *self.remote.lock().unwrap() = Some(stream);
    }

    pub(crate) fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    pub(crate) fn set_video_enabled(&self, enabled: bool) {
        self.video_enabled.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn notify(&self, state: CallState) {
        match state {
            // Terminal: observed exactly once, whatever raced it there.
            CallState::Ended => {
                if self.ended_notified.swap(true, Ordering::SeqCst) {
                    return;
                }
            }
            // A transition that is no longer current was outrun; skip it.
            _ => {
                if *self.state.lock().unwrap() != state {
                    return;
                }
            }
        }
        let listeners: Vec<StateListener> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(state))).is_err() {
                warn!("call state listener panicked");
            }
        }
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// A call request from a remote peer, alive between the incoming-call
/// notification and the accept/reject decision. Every registered listener
/// sees every offer; the active-call invariant lets only one `answer`
/// succeed.
pub struct IncomingCall {
    shared: Weak<PeerShared>,
    offer: CallId,
    caller: PeerIdentity,
    video: bool,
    metadata: Value,
}

impl IncomingCall {
    pub(crate) fn new(
        shared: Weak<PeerShared>,
        offer: CallId,
        caller: PeerIdentity,
        video: bool,
        metadata: Value,
    ) -> Self {
        Self {
            shared,
            offer,
            caller,
            video,
            metadata,
        }
    }

    pub fn caller(&self) -> &PeerIdentity {
        &self.caller
    }

    pub fn has_video(&self) -> bool {
        self.video
    }

    pub fn metadata(&self) -> &Value {
        &self.metadata
    }

    /// Accept the offer. Returns the session in `connecting`; remote media
    /// is not guaranteed synchronously, so observe state changes rather
    /// than assuming it is present when this resolves. Rejects when a call
    /// is already active (closing the offered media session first).
    pub async fn answer(&self) -> Result<Arc<CallSession>, PeerError> {
        let shared = self.shared.upgrade().ok_or(PeerError::Destroyed)?;
        let (reserved, media) = {
            let mut inner = shared.state.lock().await;
            let reserved = inner.core.accept_offer(self.offer);
            let media = inner.offer_media.remove(&self.offer);
            (reserved, media)
        };
        let call = match reserved {
            Ok(call) => call,
            Err(err) => {
                if let Some(media) = media {
                    let session = media.session;
                    tokio::spawn(async move { session.close().await });
                }
                return Err(err.into());
            }
        };
        let Some(mut media) = media else {
            // The offer's transport side is already gone.
            let mut inner = shared.state.lock().await;
            inner.core.abort_call(call);
            return Err(PeerError::CallEnded("offer withdrawn".to_string()));
        };
        // Media acquisition happens only after the slot is won.
        let local = match shared.media.acquire(true, self.video) {
            Ok(stream) => stream,
            Err(err) => {
                {
                    let mut inner = shared.state.lock().await;
                    inner.core.abort_call(call);
                }
                let session = media.session;
                tokio::spawn(async move { session.close().await });
                return Err(PeerError::Media(err.to_string()));
            }
        };
        let session = Arc::new(CallSession::new(
            self.shared.clone(),
            call,
            self.caller.clone(),
            self.video,
            local.clone(),
        ));
        {
            let mut inner = shared.state.lock().await;
            if inner.core.call_state(call).is_none() {
                // Destroyed while capture was being acquired.
                drop(inner);
                local.stop_all();
                let closing = media.session;
                tokio::spawn(async move { closing.close().await });
                return Err(PeerError::CallEnded("ended during setup".to_string()));
            }
            inner.sessions.insert(call, session.clone());
            inner.media_sessions.insert(call, media.session.clone());
            if let Some(events) = media.events.take() {
                tokio::spawn(run_media(shared.clone(), call, events));
            }
        }
        let answering = media.session;
        let answered_on = shared.clone();
        tokio::spawn(async move {
            if answering.answer(local).await.is_err() {
                let deferred = {
                    let mut inner = answered_on.state.lock().await;
                    let actions = inner.core.end_call(call, "answer failed");
                    apply_actions(&answered_on, &mut inner, actions)
                };
                run_deferred(&answered_on, deferred);
            }
        });
        Ok(session)
    }

    /// Decline the offer and close the offered media session.
    /// Fire-and-forget.
    pub fn reject(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let offer = self.offer;
        tokio::spawn(async move {
            let media = {
                let mut inner = shared.state.lock().await;
                inner.core.reject_offer(offer);
                inner.offer_media.remove(&offer)
            };
            if let Some(media) = media {
                media.session.close().await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn scratch_call_id() -> CallId {
        let mut core = tether_core::SessionCore::new(PeerIdentity::from("scratch"));
        core.begin_call(PeerIdentity::from("remote"), false, Value::Null)
            .unwrap()
    }

    fn orphan_session() -> CallSession {
        CallSession::new(
            Weak::new(),
            scratch_call_id(),
            PeerIdentity::from("remote"),
            false,
            MediaStream::capture(true, false),
        )
    }

    #[test]
    fn listeners_run_in_subscription_order() {
        let session = orphan_session();
        let order = Arc::new(Mutex::new(Vec::new()));
        let a = order.clone();
        session.on_state_change(move |_| a.lock().unwrap().push("first"));
        let b = order.clone();
        session.on_state_change(move |_| b.lock().unwrap().push("second"));
        session.record_state(CallState::Connected, None);
        session.notify(CallState::Connected);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn panicking_listener_does_not_block_the_rest() {
        let session = orphan_session();
        session.on_state_change(|_| panic!("listener bug"));
        let seen = Arc::new(Mutex::new(0));
        let s = seen.clone();
        session.on_state_change(move |_| *s.lock().unwrap() += 1);
        session.record_state(CallState::Ended, Some("hung up".to_string()));
        session.notify(CallState::Ended);
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn ended_is_observed_exactly_once() {
        let session = orphan_session();
        let seen = Arc::new(Mutex::new(0));
        let s = seen.clone();
        session.on_state_change(move |state| {
            if state == CallState::Ended {
                *s.lock().unwrap() += 1;
            }
        });
        session.record_state(CallState::Ended, Some("closed by remote peer".to_string()));
        session.notify(CallState::Ended);
        session.notify(CallState::Ended);
        assert_eq!(*seen.lock().unwrap(), 1);
        assert_eq!(
            session.ended_reason().as_deref(),
            Some("closed by remote peer")
        );
    }

    #[test]
    fn stale_transition_is_skipped() {
        let session = orphan_session();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        session.on_state_change(move |state| s.lock().unwrap().push(state));
        session.record_state(CallState::Ended, None);
        // A Connected notification that lost the race to Ended is dropped.
        session.notify(CallState::Connected);
        session.notify(CallState::Ended);
        assert_eq!(*seen.lock().unwrap(), vec![CallState::Ended]);
    }

    #[test]
    fn removed_listener_stops_observing() {
        let session = orphan_session();
        let seen = Arc::new(Mutex::new(0));
        let s = seen.clone();
        let id = session.on_state_change(move |_| *s.lock().unwrap() += 1);
        session.off_state_change(id);
        session.record_state(CallState::Connected, None);
        session.notify(CallState::Connected);
        assert_eq!(*seen.lock().unwrap(), 0);
    }
}
