//! Host-driven API: SessionCore receives transport and media events from the
//! host, returns actions for the host to perform. Time is an abstract tick
//! counter advanced by the host; one tick is one protocol time unit.

use std::collections::HashMap;

use serde_json::{json, Value};

use crate::call::{ActiveCall, CallDirection, CallError, CallRegistry, CallState, TrackKind};
use crate::identity::{CallId, ConnId, CorrelationId, PeerIdentity};
use crate::protocol::{Envelope, EnvelopeKind, STATUS_HANDLER_ERROR, STATUS_NOT_FOUND, STATUS_OK};
use crate::wire;

/// Default timeout for outstanding requests, in ticks.
pub const DEFAULT_REQUEST_TIMEOUT_TICKS: u64 = 30;

/// Default no-answer timeout for outbound calls, in ticks.
pub const DEFAULT_CALL_TIMEOUT_TICKS: u64 = 30;

/// Backoff before a reconnect attempt, in ticks.
pub const RECONNECT_BACKOFF_TICKS: u64 = 1;

/// Transport lifecycle error classes, as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Network,
    ServerError,
    SocketError,
    SocketClosed,
    /// The chosen identity is already taken on the signaling endpoint.
    UnavailableId,
    Other,
}

impl TransportErrorKind {
    /// Recoverable classes schedule a reconnect; the rest park the
    /// supervisor until the host calls `connect()` again.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            TransportErrorKind::Network
                | TransportErrorKind::ServerError
                | TransportErrorKind::SocketError
                | TransportErrorKind::SocketClosed
        )
    }
}

/// Why a request completed unsuccessfully.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RequestError {
    #[error("request to {target} on {path} timed out")]
    Timeout { target: PeerIdentity, path: String },
    #[error("request failed with status {status}: {payload}")]
    Status { status: u16, payload: Value },
    #[error("connection closed before response")]
    ConnectionClosed,
    #[error("connection error: {0}")]
    ConnectionError(String),
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("peer session destroyed")]
    Destroyed,
}

/// The core was shut down; nothing further can be started on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("peer session closed")]
pub struct CoreClosed;

/// What the host's handler run produced for one inbound request.
#[derive(Debug)]
pub enum HandlerOutcome {
    Ok(Value),
    NotFound,
    Failed(String),
}

/// Per-peer request outcome counters. Success means the peer answered,
/// whatever the status; failure means it never did.
#[derive(Debug, Default, Clone)]
pub struct PeerMetrics {
    pub completed: u64,
    pub failures: u64,
}

impl PeerMetrics {
    fn record_success(&mut self) {
        self.completed = self.completed.saturating_add(1);
    }

    fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }
}

/// Action for the host to perform.
#[derive(Debug)]
pub enum Action {
    /// Create a new transport handle bound to the core's identity.
    ConnectTransport,
    /// Best-effort close of the current handle; errors are swallowed.
    DiscardTransport,
    /// The current handle reported open; resolve ready waiters.
    TransportReady,
    /// The current handle failed before opening; fail ready waiters.
    TransportFailed {
        kind: TransportErrorKind,
        message: String,
    },
    /// Open one logical connection for a single request/response exchange.
    OpenConnection { conn: ConnId, to: PeerIdentity },
    SendFrame { conn: ConnId, frame: Vec<u8> },
    CloseConnection { conn: ConnId },
    /// Resolve the waiter for one `begin_request`. Fires exactly once per
    /// request.
    CompleteRequest {
        correlation: CorrelationId,
        result: Result<Value, RequestError>,
    },
    /// Run the handler for an inbound request and report back through
    /// `finish_inbound`.
    InboundRequest {
        conn: ConnId,
        caller: PeerIdentity,
        correlation: CorrelationId,
        path: String,
        payload: Value,
    },
    /// Surface a call offer to the incoming-call listeners.
    NotifyIncomingCall {
        offer: CallId,
        caller: PeerIdentity,
        video: bool,
        metadata: Value,
    },
    /// Open a media session to the callee, attaching the call metadata
    /// out-of-band.
    OpenMedia {
        call: CallId,
        to: PeerIdentity,
        video: bool,
        metadata: Value,
    },
    CloseMedia { call: CallId },
    /// Flip `enabled` on local tracks of `kind`; never stops capture.
    SetTracksEnabled {
        call: CallId,
        kind: TrackKind,
        enabled: bool,
    },
    /// Stop all local capture tracks. Emitted once, on the terminal
    /// transition.
    StopLocalMedia { call: CallId },
    CallStateChanged {
        call: CallId,
        state: CallState,
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportPhase {
    Idle,
    Connecting,
    Ready,
    /// Reconnect scheduled; further disconnects are ignored until it fires.
    Backoff { until_tick: u64 },
    /// Unrecoverable transport error; waits for an explicit `connect()`.
    Parked,
    Closed,
}

struct PendingRequest {
    conn: ConnId,
    target: PeerIdentity,
    path: String,
    payload: Value,
    deadline: u64,
}

struct InboundConn {
    remote: PeerIdentity,
    /// Requests whose handler is still running: correlation -> path.
    requests: HashMap<CorrelationId, String>,
}

/// Main coordinator: reconnection supervisor, request correlator and
/// inbound dispatcher sharing one peer identity, plus the call registry.
pub struct SessionCore {
    identity: PeerIdentity,
    phase: TransportPhase,
    fatal: Option<(TransportErrorKind, String)>,
    tick_count: u64,
    next_id: u64,
    next_seq: u64,
    pending: HashMap<CorrelationId, PendingRequest>,
    conn_corr: HashMap<ConnId, CorrelationId>,
    inbound: HashMap<ConnId, InboundConn>,
    calls: CallRegistry,
    peer_metrics: HashMap<PeerIdentity, PeerMetrics>,
    request_timeout_ticks: u64,
    call_timeout_ticks: u64,
    reconnect_backoff_ticks: u64,
}

impl SessionCore {
    pub fn new(identity: PeerIdentity) -> Self {
        Self {
            identity,
            phase: TransportPhase::Idle,
            fatal: None,
            tick_count: 0,
            next_id: 0,
            next_seq: 0,
            pending: HashMap::new(),
            conn_corr: HashMap::new(),
            inbound: HashMap::new(),
            calls: CallRegistry::new(),
            peer_metrics: HashMap::new(),
            request_timeout_ticks: DEFAULT_REQUEST_TIMEOUT_TICKS,
            call_timeout_ticks: DEFAULT_CALL_TIMEOUT_TICKS,
            reconnect_backoff_ticks: RECONNECT_BACKOFF_TICKS,
        }
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// Set custom request timeout in ticks.
    pub fn set_request_timeout(&mut self, ticks: u64) {
        self.request_timeout_ticks = ticks;
    }

    /// Set custom no-answer timeout for outbound calls in ticks.
    pub fn set_call_timeout(&mut self, ticks: u64) {
        self.call_timeout_ticks = ticks;
    }

    pub fn is_ready(&self) -> bool {
        self.phase == TransportPhase::Ready
    }

    pub fn is_closed(&self) -> bool {
        self.phase == TransportPhase::Closed
    }

    /// Last unrecoverable transport error, if the supervisor is parked on one.
    pub fn fatal_error(&self) -> Option<(TransportErrorKind, String)> {
        self.fatal.clone()
    }

    /// Per-peer request metrics.
    pub fn peer_metrics(&self) -> &HashMap<PeerIdentity, PeerMetrics> {
        &self.peer_metrics
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    // --- reconnection supervisor ---

    /// Ask the host for a transport handle. No-op while an attempt or a
    /// scheduled reconnect is already in flight.
    pub fn connect(&mut self) -> Result<Vec<Action>, CoreClosed> {
        match self.phase {
            TransportPhase::Closed => Err(CoreClosed),
            TransportPhase::Idle | TransportPhase::Parked => {
                self.fatal = None;
                self.phase = TransportPhase::Connecting;
                Ok(vec![Action::ConnectTransport])
            }
            _ => Ok(Vec::new()),
        }
    }

    pub fn on_transport_open(&mut self) -> Vec<Action> {
        if self.phase != TransportPhase::Connecting {
            return Vec::new();
        }
        self.phase = TransportPhase::Ready;
        vec![Action::TransportReady]
    }

    pub fn on_transport_error(&mut self, kind: TransportErrorKind, message: &str) -> Vec<Action> {
        if self.phase == TransportPhase::Closed {
            return Vec::new();
        }
        let mut actions = Vec::new();
        if self.phase == TransportPhase::Connecting {
            actions.push(Action::TransportFailed {
                kind,
                message: message.to_string(),
            });
        }
        if kind.is_recoverable() {
            actions.extend(self.schedule_reconnect());
        } else {
            self.fatal = Some((kind, message.to_string()));
            self.phase = TransportPhase::Parked;
        }
        actions
    }

    pub fn on_transport_disconnected(&mut self) -> Vec<Action> {
        if self.phase == TransportPhase::Closed {
            return Vec::new();
        }
        let mut actions = Vec::new();
        if self.phase == TransportPhase::Connecting {
            actions.push(Action::TransportFailed {
                kind: TransportErrorKind::SocketClosed,
                message: "disconnected before open".to_string(),
            });
        }
        actions.extend(self.schedule_reconnect());
        actions
    }

    /// The handle closed underneath us; same recovery path as a disconnect.
    pub fn on_transport_closed(&mut self) -> Vec<Action> {
        self.on_transport_disconnected()
    }

    fn schedule_reconnect(&mut self) -> Vec<Action> {
        match self.phase {
            TransportPhase::Backoff { .. } | TransportPhase::Closed => Vec::new(),
            _ => {
                self.phase = TransportPhase::Backoff {
                    until_tick: self.tick_count.saturating_add(self.reconnect_backoff_ticks),
                };
                vec![Action::DiscardTransport]
            }
        }
    }

    // --- request correlator ---

    /// Start one request: register a pending entry with a deadline and ask
    /// the host for a fresh connection. Connections are never reused.
    pub fn begin_request(
        &mut self,
        to: PeerIdentity,
        path: impl Into<String>,
        payload: Value,
    ) -> Result<(CorrelationId, Vec<Action>), CoreClosed> {
        if self.phase == TransportPhase::Closed {
            return Err(CoreClosed);
        }
        let path = path.into();
        self.next_seq += 1;
        let correlation = CorrelationId::next(&self.identity, self.next_seq);
        let conn = ConnId(self.next_id());
        self.conn_corr.insert(conn, correlation.clone());
        self.pending.insert(
            correlation.clone(),
            PendingRequest {
                conn,
                target: to.clone(),
                path,
                payload,
                deadline: self.tick_count.saturating_add(self.request_timeout_ticks),
            },
        );
        Ok((correlation, vec![Action::OpenConnection { conn, to }]))
    }

    pub fn on_connection_open(&mut self, conn: ConnId) -> Vec<Action> {
        let Some(correlation) = self.conn_corr.get(&conn).cloned() else {
            return vec![Action::CloseConnection { conn }];
        };
        let Some(request) = self.pending.get(&correlation) else {
            return vec![Action::CloseConnection { conn }];
        };
        let envelope = Envelope::request(
            correlation.clone(),
            request.path.clone(),
            request.payload.clone(),
        );
        match wire::encode_envelope(&envelope) {
            Ok(frame) => vec![Action::SendFrame { conn, frame }],
            Err(err) => {
                let mut actions = vec![Action::CloseConnection { conn }];
                actions.extend(
                    self.complete_request(&correlation, Err(RequestError::Encode(err.to_string()))),
                );
                actions
            }
        }
    }

    /// The host could not open the connection at all.
    pub fn on_connection_failed(&mut self, conn: ConnId, message: &str) -> Vec<Action> {
        self.fail_by_conn(conn, RequestError::TransportUnavailable(message.to_string()))
    }

    pub fn on_connection_error(&mut self, conn: ConnId, message: &str) -> Vec<Action> {
        self.fail_by_conn(conn, RequestError::ConnectionError(message.to_string()))
    }

    pub fn on_connection_closed(&mut self, conn: ConnId) -> Vec<Action> {
        self.fail_by_conn(conn, RequestError::ConnectionClosed)
    }

    fn fail_by_conn(&mut self, conn: ConnId, error: RequestError) -> Vec<Action> {
        if self.inbound.remove(&conn).is_some() {
            return Vec::new();
        }
        let Some(correlation) = self.conn_corr.get(&conn).cloned() else {
            return Vec::new();
        };
        self.complete_request(&correlation, Err(error))
    }

    /// Remove the pending entry and emit its one completion.
    fn complete_request(
        &mut self,
        correlation: &CorrelationId,
        result: Result<Value, RequestError>,
    ) -> Vec<Action> {
        let Some(request) = self.pending.remove(correlation) else {
            return Vec::new();
        };
        self.conn_corr.remove(&request.conn);
        let metrics = self.peer_metrics.entry(request.target).or_default();
        match &result {
            // A status response means the peer answered; only silence and
            // dead connections count against it.
            Ok(_) | Err(RequestError::Status { .. }) => metrics.record_success(),
            Err(RequestError::Destroyed) => {}
            Err(_) => metrics.record_failure(),
        }
        vec![Action::CompleteRequest {
            correlation: correlation.clone(),
            result,
        }]
    }

    // --- inbound dispatcher ---

    /// A remote peer opened a connection to us.
    pub fn on_connection_accepted(&mut self, remote: PeerIdentity) -> (ConnId, Vec<Action>) {
        let conn = ConnId(self.next_id());
        if self.phase == TransportPhase::Closed {
            return (conn, vec![Action::CloseConnection { conn }]);
        }
        self.inbound.insert(
            conn,
            InboundConn {
                remote,
                requests: HashMap::new(),
            },
        );
        (conn, Vec::new())
    }

    /// A message arrived on a connection. Undecodable or mismatched frames
    /// are dropped; the host logs them.
    pub fn on_frame(&mut self, conn: ConnId, bytes: &[u8]) -> Vec<Action> {
        let Ok(envelope) = wire::decode_envelope(bytes) else {
            return Vec::new();
        };
        if let Some(correlation) = self.conn_corr.get(&conn).cloned() {
            // Our own request connection: only the matching response counts.
            if envelope.kind != EnvelopeKind::Response
                || envelope.correlation_id != correlation
            {
                return Vec::new();
            }
            let Some(body) = envelope.response else {
                return Vec::new();
            };
            let result = if body.is_success() {
                Ok(body.payload)
            } else {
                Err(RequestError::Status {
                    status: body.status,
                    payload: body.payload,
                })
            };
            let mut actions = vec![Action::CloseConnection { conn }];
            actions.extend(self.complete_request(&correlation, result));
            return actions;
        }
        if let Some(inbound) = self.inbound.get_mut(&conn) {
            if envelope.kind != EnvelopeKind::Request {
                return Vec::new();
            }
            let Some(body) = envelope.request else {
                return Vec::new();
            };
            inbound
                .requests
                .insert(envelope.correlation_id.clone(), body.path.clone());
            return vec![Action::InboundRequest {
                conn,
                caller: inbound.remote.clone(),
                correlation: envelope.correlation_id,
                path: body.path,
                payload: body.payload,
            }];
        }
        Vec::new()
    }

    /// Report the handler outcome for one inbound request. Builds the
    /// response envelope; nothing is emitted if the connection has closed.
    pub fn finish_inbound(
        &mut self,
        conn: ConnId,
        correlation: CorrelationId,
        outcome: HandlerOutcome,
    ) -> Vec<Action> {
        let Some(inbound) = self.inbound.get_mut(&conn) else {
            return Vec::new();
        };
        let Some(path) = inbound.requests.remove(&correlation) else {
            return Vec::new();
        };
        let (status, payload) = match outcome {
            HandlerOutcome::Ok(value) => (STATUS_OK, value),
            HandlerOutcome::NotFound => (
                STATUS_NOT_FOUND,
                json!({ "error": format!("Path not found: {path}") }),
            ),
            HandlerOutcome::Failed(message) => {
                (STATUS_HANDLER_ERROR, json!({ "error": message }))
            }
        };
        let envelope = Envelope::response(correlation, status, payload);
        match wire::encode_envelope(&envelope) {
            Ok(frame) => vec![Action::SendFrame { conn, frame }],
            Err(_) => Vec::new(),
        }
    }

    // --- call sessions ---

    /// Reserve the active-call slot for an outbound call. Happens before
    /// media acquisition, so a loser of the call/answer race acquires
    /// nothing.
    pub fn begin_call(
        &mut self,
        to: PeerIdentity,
        video: bool,
        metadata: Value,
    ) -> Result<CallId, CallError> {
        if self.phase == TransportPhase::Closed {
            return Err(CallError::Closed);
        }
        let id = CallId(self.next_id());
        let deadline = self.tick_count.saturating_add(self.call_timeout_ticks);
        self.calls.reserve(ActiveCall {
            id,
            peer: to,
            direction: CallDirection::Outbound,
            has_video: video,
            metadata,
            state: CallState::Connecting,
            muted: false,
            video_enabled: video,
            answer_deadline: Some(deadline),
        })?;
        Ok(id)
    }

    /// Local capture is in hand; open the media session.
    pub fn local_media_ready(&mut self, call: CallId) -> Vec<Action> {
        let Some(active) = self.calls.get_mut(call) else {
            return Vec::new();
        };
        if active.direction != CallDirection::Outbound || active.state != CallState::Connecting {
            return Vec::new();
        }
        vec![Action::OpenMedia {
            call,
            to: active.peer.clone(),
            video: active.has_video,
            metadata: active.metadata.clone(),
        }]
    }

    /// Release a reservation whose media acquisition failed. No session was
    /// ever observable, so no state change is emitted.
    pub fn abort_call(&mut self, call: CallId) {
        self.calls.release(call);
    }

    /// A remote peer offered a media session.
    pub fn on_media_offer(
        &mut self,
        from: PeerIdentity,
        video: bool,
        metadata: Value,
    ) -> (CallId, Vec<Action>) {
        let offer = CallId(self.next_id());
        if self.phase == TransportPhase::Closed {
            return (offer, Vec::new());
        }
        self.calls.add_offer(
            offer,
            crate::call::PendingOffer {
                from: from.clone(),
                video,
                metadata: metadata.clone(),
            },
        );
        (
            offer,
            vec![Action::NotifyIncomingCall {
                offer,
                caller: from,
                video,
                metadata,
            }],
        )
    }

    /// Consume the offer and reserve the active-call slot. The offer is
    /// consumed even when the reservation loses to an existing call; the
    /// host then closes the offered media session.
    pub fn accept_offer(&mut self, offer: CallId) -> Result<CallId, CallError> {
        if self.phase == TransportPhase::Closed {
            return Err(CallError::Closed);
        }
        let pending = self.calls.take_offer(offer).ok_or(CallError::UnknownOffer)?;
        self.calls.reserve(ActiveCall {
            id: offer,
            peer: pending.from,
            direction: CallDirection::Inbound,
            has_video: pending.video,
            metadata: pending.metadata,
            state: CallState::Connecting,
            muted: false,
            video_enabled: pending.video,
            // Answered legs wait on remote media with no deadline; only the
            // caller side arms the no-answer timer.
            answer_deadline: None,
        })?;
        Ok(offer)
    }

    pub fn reject_offer(&mut self, offer: CallId) {
        let _ = self.calls.take_offer(offer);
    }

    /// Remote media arrived: the session is connected.
    pub fn on_media_stream(&mut self, call: CallId) -> Vec<Action> {
        let Some(active) = self.calls.get_mut(call) else {
            return Vec::new();
        };
        if active.state != CallState::Connecting {
            return Vec::new();
        }
        active.state = CallState::Connected;
        active.answer_deadline = None;
        vec![Action::CallStateChanged {
            call,
            state: CallState::Connected,
            reason: None,
        }]
    }

    pub fn on_media_closed(&mut self, call: CallId) -> Vec<Action> {
        self.end_call(call, "closed by remote peer")
    }

    pub fn on_media_error(&mut self, call: CallId, message: &str) -> Vec<Action> {
        self.end_call(call, &format!("media error: {message}"))
    }

    /// The one path to terminal state, shared by hangup, remote close,
    /// media error, no-answer expiry and shutdown. Idempotent.
    pub fn end_call(&mut self, call: CallId, reason: &str) -> Vec<Action> {
        if self.calls.release(call).is_none() {
            return Vec::new();
        }
        vec![
            Action::CloseMedia { call },
            Action::StopLocalMedia { call },
            Action::CallStateChanged {
                call,
                state: CallState::Ended,
                reason: Some(reason.to_string()),
            },
        ]
    }

    pub fn toggle_mute(&mut self, call: CallId) -> Result<(bool, Vec<Action>), CallError> {
        let active = self.calls.get_mut(call).ok_or(CallError::UnknownCall)?;
        active.muted = !active.muted;
        let muted = active.muted;
        Ok((
            muted,
            vec![Action::SetTracksEnabled {
                call,
                kind: TrackKind::Audio,
                enabled: !muted,
            }],
        ))
    }

    pub fn toggle_video(&mut self, call: CallId) -> Result<(bool, Vec<Action>), CallError> {
        let active = self.calls.get_mut(call).ok_or(CallError::UnknownCall)?;
        if !active.has_video {
            // Audio-only session: nothing to toggle.
            return Ok((active.video_enabled, Vec::new()));
        }
        active.video_enabled = !active.video_enabled;
        let enabled = active.video_enabled;
        Ok((
            enabled,
            vec![Action::SetTracksEnabled {
                call,
                kind: TrackKind::Video,
                enabled,
            }],
        ))
    }

    pub fn active_call_id(&self) -> Option<CallId> {
        self.calls.active().map(|a| a.id)
    }

    pub fn call_state(&self, call: CallId) -> Option<CallState> {
        self.calls.active().filter(|a| a.id == call).map(|a| a.state)
    }

    // --- clock and teardown ---

    /// Advance the clock one tick: fire a scheduled reconnect, expire
    /// request deadlines and the no-answer deadline.
    pub fn tick(&mut self) -> Vec<Action> {
        if self.phase == TransportPhase::Closed {
            return Vec::new();
        }
        self.tick_count = self.tick_count.saturating_add(1);
        let mut actions = Vec::new();

        if let TransportPhase::Backoff { until_tick } = self.phase {
            if self.tick_count >= until_tick {
                self.phase = TransportPhase::Connecting;
                actions.push(Action::ConnectTransport);
            }
        }

        let expired: Vec<CorrelationId> = self
            .pending
            .iter()
            .filter(|(_, p)| self.tick_count >= p.deadline)
            .map(|(c, _)| c.clone())
            .collect();
        for correlation in expired {
            if let Some(request) = self.pending.get(&correlation) {
                actions.push(Action::CloseConnection { conn: request.conn });
                let error = RequestError::Timeout {
                    target: request.target.clone(),
                    path: request.path.clone(),
                };
                actions.extend(self.complete_request(&correlation, Err(error)));
            }
        }

        if let Some(call) = self.calls.expired(self.tick_count) {
            actions.extend(self.end_call(call, "no answer"));
        }

        actions
    }

    /// Terminal teardown: fail everything outstanding, close everything
    /// tracked, discard the transport. Idempotent.
    pub fn shutdown(&mut self) -> Vec<Action> {
        if self.phase == TransportPhase::Closed {
            return Vec::new();
        }
        self.phase = TransportPhase::Closed;
        let mut actions = Vec::new();
        let outstanding: Vec<CorrelationId> = self.pending.keys().cloned().collect();
        for correlation in outstanding {
            if let Some(request) = self.pending.get(&correlation) {
                actions.push(Action::CloseConnection { conn: request.conn });
            }
            actions.extend(self.complete_request(&correlation, Err(RequestError::Destroyed)));
        }
        let inbound: Vec<ConnId> = self.inbound.keys().copied().collect();
        for conn in inbound {
            actions.push(Action::CloseConnection { conn });
        }
        self.inbound.clear();
        if let Some(call) = self.active_call_id() {
            actions.extend(self.end_call(call, "destroyed"));
        }
        self.calls.clear_offers();
        actions.push(Action::DiscardTransport);
        actions
    }
}
