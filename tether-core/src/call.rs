//! Call-session state: single active call, pending offers, one terminal path.

use std::collections::HashMap;

use serde_json::Value;

use crate::identity::{CallId, PeerIdentity};

/// Observable call session state. `Ended` is terminal; no transition leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Connecting,
    Connected,
    Ended,
}

/// Which side set the session up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Outbound,
    Inbound,
}

/// Media track kind, as far as this layer distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    #[error("already in a call")]
    AlreadyInCall,
    #[error("unknown call")]
    UnknownCall,
    #[error("unknown or already consumed call offer")]
    UnknownOffer,
    #[error("peer session closed")]
    Closed,
}

/// One live (or reserved) call session.
#[derive(Debug)]
pub(crate) struct ActiveCall {
    pub id: CallId,
    pub peer: PeerIdentity,
    pub direction: CallDirection,
    pub has_video: bool,
    pub metadata: Value,
    pub state: CallState,
    pub muted: bool,
    pub video_enabled: bool,
    /// Tick at which an unanswered outbound call is forced to end.
    pub answer_deadline: Option<u64>,
}

/// A call request from a remote peer awaiting accept or reject.
#[derive(Debug)]
pub(crate) struct PendingOffer {
    pub from: PeerIdentity,
    pub video: bool,
    pub metadata: Value,
}

/// Owns the single-active-call slot and the offer table. The slot is
/// reserved by a check-then-set before any media is acquired, so a losing
/// racer between an outbound call and an inbound answer never acquires
/// anything it would have to release.
#[derive(Debug, Default)]
pub(crate) struct CallRegistry {
    active: Option<ActiveCall>,
    offers: HashMap<CallId, PendingOffer>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&mut self, call: ActiveCall) -> Result<(), CallError> {
        if self.active.is_some() {
            return Err(CallError::AlreadyInCall);
        }
        self.active = Some(call);
        Ok(())
    }

    /// Free the slot if `id` holds it. Returns the released call.
    pub fn release(&mut self, id: CallId) -> Option<ActiveCall> {
        match &self.active {
            Some(a) if a.id == id => self.active.take(),
            _ => None,
        }
    }

    pub fn active(&self) -> Option<&ActiveCall> {
        self.active.as_ref()
    }

    pub fn get_mut(&mut self, id: CallId) -> Option<&mut ActiveCall> {
        self.active.as_mut().filter(|a| a.id == id)
    }

    pub fn add_offer(&mut self, id: CallId, offer: PendingOffer) {
        self.offers.insert(id, offer);
    }

    pub fn take_offer(&mut self, id: CallId) -> Option<PendingOffer> {
        self.offers.remove(&id)
    }

    pub fn clear_offers(&mut self) {
        self.offers.clear();
    }

    /// Active call whose no-answer deadline has passed, if any.
    pub fn expired(&self, tick: u64) -> Option<CallId> {
        self.active
            .as_ref()
            .filter(|a| a.state == CallState::Connecting)
            .filter(|a| a.answer_deadline.is_some_and(|d| tick >= d))
            .map(|a| a.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(id: u64) -> ActiveCall {
        ActiveCall {
            id: CallId(id),
            peer: PeerIdentity::from("remote"),
            direction: CallDirection::Outbound,
            has_video: false,
            metadata: Value::Null,
            state: CallState::Connecting,
            muted: false,
            video_enabled: false,
            answer_deadline: Some(30),
        }
    }

    #[test]
    fn slot_holds_one_call() {
        let mut reg = CallRegistry::new();
        reg.reserve(call(1)).unwrap();
        assert_eq!(reg.reserve(call(2)), Err(CallError::AlreadyInCall));
        assert!(reg.release(CallId(1)).is_some());
        reg.reserve(call(2)).unwrap();
    }

    #[test]
    fn release_ignores_other_ids() {
        let mut reg = CallRegistry::new();
        reg.reserve(call(1)).unwrap();
        assert!(reg.release(CallId(9)).is_none());
        assert!(reg.active().is_some());
    }

    #[test]
    fn offers_are_consumed_once() {
        let mut reg = CallRegistry::new();
        reg.add_offer(
            CallId(3),
            PendingOffer {
                from: PeerIdentity::from("caller"),
                video: true,
                metadata: json!({"topic": "standup"}),
            },
        );
        assert!(reg.take_offer(CallId(3)).is_some());
        assert!(reg.take_offer(CallId(3)).is_none());
    }

    #[test]
    fn deadline_only_fires_while_connecting() {
        let mut reg = CallRegistry::new();
        reg.reserve(call(1)).unwrap();
        assert_eq!(reg.expired(29), None);
        assert_eq!(reg.expired(30), Some(CallId(1)));
        reg.get_mut(CallId(1)).unwrap().state = CallState::Connected;
        assert_eq!(reg.expired(30), None);
    }

    #[test]
    fn already_in_a_call_message() {
        assert_eq!(CallError::AlreadyInCall.to_string(), "already in a call");
    }
}

#[cfg(test)]
mod flow_tests {
    use super::*;
    use crate::core::{Action, SessionCore, DEFAULT_CALL_TIMEOUT_TICKS};
    use serde_json::{json, Value};

    fn ready(id: &str) -> SessionCore {
        let mut core = SessionCore::new(PeerIdentity::from(id));
        let _ = core.connect().unwrap();
        let _ = core.on_transport_open();
        core
    }

    fn ended_reason(actions: &[Action]) -> String {
        for action in actions {
            if let Action::CallStateChanged {
                state: CallState::Ended,
                reason: Some(reason),
                ..
            } = action
            {
                return reason.clone();
            }
        }
        panic!("expected an Ended transition in {actions:?}");
    }

    #[test]
    fn outbound_call_connects_on_remote_media() {
        let mut core = ready("a");
        let call = core
            .begin_call(PeerIdentity::from("b"), true, json!({"topic": "sync"}))
            .unwrap();
        let actions = core.local_media_ready(call);
        match &actions[..] {
            [Action::OpenMedia {
                to, video, metadata, ..
            }] => {
                assert_eq!(to, &PeerIdentity::from("b"));
                assert!(*video);
                assert_eq!(metadata["topic"], "sync");
            }
            other => panic!("expected OpenMedia, got {other:?}"),
        }
        let actions = core.on_media_stream(call);
        assert!(matches!(
            actions[..],
            [Action::CallStateChanged {
                state: CallState::Connected,
                ..
            }]
        ));
        assert_eq!(core.call_state(call), Some(CallState::Connected));
        assert_eq!(core.active_call_id(), Some(call));
        // Connected clears the no-answer deadline.
        for _ in 0..DEFAULT_CALL_TIMEOUT_TICKS + 5 {
            assert!(core.tick().is_empty());
        }
    }

    #[test]
    fn second_call_is_rejected_while_one_is_active() {
        let mut core = ready("a");
        let _ = core
            .begin_call(PeerIdentity::from("b"), false, Value::Null)
            .unwrap();
        let err = core
            .begin_call(PeerIdentity::from("c"), false, Value::Null)
            .unwrap_err();
        assert_eq!(err, CallError::AlreadyInCall);
    }

    #[test]
    fn call_answer_race_outbound_first() {
        let mut core = ready("a");
        let _ = core
            .begin_call(PeerIdentity::from("b"), false, Value::Null)
            .unwrap();
        let (offer, _) = core.on_media_offer(PeerIdentity::from("c"), false, Value::Null);
        assert_eq!(core.accept_offer(offer), Err(CallError::AlreadyInCall));
        // The offer was consumed by the losing answer.
        assert_eq!(core.accept_offer(offer), Err(CallError::UnknownOffer));
    }

    #[test]
    fn call_answer_race_inbound_first() {
        let mut core = ready("a");
        let (offer, _) = core.on_media_offer(PeerIdentity::from("c"), false, Value::Null);
        let _ = core.accept_offer(offer).unwrap();
        let err = core
            .begin_call(PeerIdentity::from("b"), false, Value::Null)
            .unwrap_err();
        assert_eq!(err, CallError::AlreadyInCall);
    }

    #[test]
    fn unanswered_call_times_out_with_no_answer() {
        let mut core = ready("a");
        let call = core
            .begin_call(PeerIdentity::from("b"), false, Value::Null)
            .unwrap();
        let _ = core.local_media_ready(call);
        let mut fired = Vec::new();
        for _ in 0..DEFAULT_CALL_TIMEOUT_TICKS {
            fired = core.tick();
            if !fired.is_empty() {
                break;
            }
        }
        assert_eq!(ended_reason(&fired), "no answer");
        assert!(fired.iter().any(|a| matches!(a, Action::CloseMedia { .. })));
        assert!(fired
            .iter()
            .any(|a| matches!(a, Action::StopLocalMedia { .. })));
        assert_eq!(core.active_call_id(), None);
    }

    #[test]
    fn remote_close_ends_exactly_once() {
        let mut core = ready("a");
        let call = core
            .begin_call(PeerIdentity::from("b"), false, Value::Null)
            .unwrap();
        let _ = core.on_media_stream(call);
        let actions = core.on_media_closed(call);
        assert_eq!(ended_reason(&actions), "closed by remote peer");
        assert!(core.on_media_closed(call).is_empty());
        assert!(core.end_call(call, "hung up").is_empty());
    }

    #[test]
    fn hangup_and_remote_close_share_the_terminal_path() {
        let mut core = ready("a");
        let call = core
            .begin_call(PeerIdentity::from("b"), false, Value::Null)
            .unwrap();
        let actions = core.end_call(call, "hung up");
        assert_eq!(ended_reason(&actions), "hung up");
        // The media-close event arriving afterwards finds nothing to end.
        assert!(core.on_media_closed(call).is_empty());
        assert_eq!(core.active_call_id(), None);
    }

    #[test]
    fn answered_offer_connects_without_a_deadline() {
        let mut core = ready("b");
        let (offer, actions) =
            core.on_media_offer(PeerIdentity::from("a"), false, json!({"from": "a"}));
        match &actions[..] {
            [Action::NotifyIncomingCall { video, caller, .. }] => {
                assert!(!video);
                assert_eq!(caller, &PeerIdentity::from("a"));
            }
            other => panic!("expected NotifyIncomingCall, got {other:?}"),
        }
        let call = core.accept_offer(offer).unwrap();
        // Remote media is not synchronous with answering.
        assert_eq!(core.call_state(call), Some(CallState::Connecting));
        for _ in 0..DEFAULT_CALL_TIMEOUT_TICKS + 5 {
            assert!(core.tick().is_empty());
        }
        let _ = core.on_media_stream(call);
        assert_eq!(core.call_state(call), Some(CallState::Connected));
    }

    #[test]
    fn rejected_offer_is_gone() {
        let mut core = ready("b");
        let (offer, _) = core.on_media_offer(PeerIdentity::from("a"), true, Value::Null);
        core.reject_offer(offer);
        assert_eq!(core.accept_offer(offer), Err(CallError::UnknownOffer));
        assert_eq!(core.active_call_id(), None);
    }

    #[test]
    fn double_toggle_mute_restores_original_state() {
        let mut core = ready("a");
        let call = core
            .begin_call(PeerIdentity::from("b"), false, Value::Null)
            .unwrap();
        let (muted, actions) = core.toggle_mute(call).unwrap();
        assert!(muted);
        assert!(matches!(
            actions[..],
            [Action::SetTracksEnabled {
                kind: TrackKind::Audio,
                enabled: false,
                ..
            }]
        ));
        let (muted, actions) = core.toggle_mute(call).unwrap();
        assert!(!muted);
        assert!(matches!(
            actions[..],
            [Action::SetTracksEnabled {
                kind: TrackKind::Audio,
                enabled: true,
                ..
            }]
        ));
    }

    #[test]
    fn video_toggle_is_a_noop_on_audio_only_sessions() {
        let mut core = ready("a");
        let call = core
            .begin_call(PeerIdentity::from("b"), false, Value::Null)
            .unwrap();
        let (enabled, actions) = core.toggle_video(call).unwrap();
        assert!(!enabled);
        assert!(actions.is_empty());
    }

    #[test]
    fn video_toggle_flips_when_video_was_requested() {
        let mut core = ready("a");
        let call = core
            .begin_call(PeerIdentity::from("b"), true, Value::Null)
            .unwrap();
        let (enabled, _) = core.toggle_video(call).unwrap();
        assert!(!enabled);
        let (enabled, actions) = core.toggle_video(call).unwrap();
        assert!(enabled);
        assert!(matches!(
            actions[..],
            [Action::SetTracksEnabled {
                kind: TrackKind::Video,
                enabled: true,
                ..
            }]
        ));
    }

    #[test]
    fn aborted_reservation_frees_the_slot() {
        let mut core = ready("a");
        let call = core
            .begin_call(PeerIdentity::from("b"), false, Value::Null)
            .unwrap();
        core.abort_call(call);
        assert!(core
            .begin_call(PeerIdentity::from("c"), false, Value::Null)
            .is_ok());
    }

    #[test]
    fn media_error_carries_the_message_into_the_reason() {
        let mut core = ready("a");
        let call = core
            .begin_call(PeerIdentity::from("b"), false, Value::Null)
            .unwrap();
        let actions = core.on_media_error(call, "ICE failed");
        assert!(ended_reason(&actions).contains("ICE failed"));
    }
}
