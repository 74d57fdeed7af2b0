//! Peer: the public async surface. Owns the session core behind a mutex,
//! the current transport handle, and the waiter maps that bridge core
//! actions back to async callers.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use tether_core::{
    Action, CallError, CallId, CallState, ConnId, CorrelationId, HandlerOutcome, PeerIdentity,
    RequestError, SessionCore, TrackKind, TransportErrorKind,
};

use crate::config::{Config, Endpoint};
use crate::media::MediaSource;
use crate::session::{CallSession, IncomingCall};
use crate::transport::{
    Connection, ConnectionEvent, Connector, MediaEvent, MediaSession, TransportEvent,
    TransportHandle,
};

/// Error surfaced by the public peer surface.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("transport error ({kind:?}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("media acquisition failed: {0}")]
    Media(String),
    #[error("call ended: {0}")]
    CallEnded(String),
    #[error("peer destroyed")]
    Destroyed,
}

/// Failure reported by a request handler; becomes a 500 response.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError(message.into())
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send>>;
type Handler = Arc<dyn Fn(PeerIdentity, Value) -> HandlerFuture + Send + Sync>;
type IncomingListener = Arc<dyn Fn(Arc<IncomingCall>) + Send + Sync>;

/// Options for an outbound call: request video, attach free-form metadata.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub video: bool,
    pub metadata: Value,
}

/// Media handles of a not-yet-answered offer, parked until the application
/// answers or rejects it.
pub(crate) struct OfferMedia {
    pub session: Arc<dyn MediaSession>,
    pub events: Option<mpsc::UnboundedReceiver<MediaEvent>>,
}

pub(crate) struct Inner {
    pub core: SessionCore,
    /// Current handle; superseded (not mutated) on reconnect.
    pub transport: Option<Arc<dyn TransportHandle>>,
    /// Bumped on every replacement; pumps for superseded handles stop when
    /// their number no longer matches.
    pub transport_seq: u64,
    pub ready_waiters: Vec<oneshot::Sender<Result<(), PeerError>>>,
    pub request_waiters: HashMap<CorrelationId, oneshot::Sender<Result<Value, PeerError>>>,
    pub call_waiters: HashMap<CallId, oneshot::Sender<Result<(), PeerError>>>,
    pub connections: HashMap<ConnId, Arc<dyn Connection>>,
    pub media_sessions: HashMap<CallId, Arc<dyn MediaSession>>,
    pub sessions: HashMap<CallId, Arc<CallSession>>,
    pub offer_media: HashMap<CallId, OfferMedia>,
}

pub(crate) struct PeerShared {
    pub identity: PeerIdentity,
    pub endpoint: Endpoint,
    pub connector: Arc<dyn Connector>,
    pub media: Arc<dyn MediaSource>,
    pub state: Mutex<Inner>,
    pub handlers: StdMutex<HashMap<String, Handler>>,
    pub incoming_listeners: StdMutex<Vec<(u64, IncomingListener)>>,
    pub next_listener: AtomicU64,
    pub destroyed: AtomicBool,
}

/// Application callbacks collected while the state lock was held; run after
/// it is released so a listener can call back into the peer.
pub(crate) enum Deferred {
    Incoming(Arc<IncomingCall>),
    State {
        session: Arc<CallSession>,
        state: CallState,
    },
}

pub(crate) fn run_deferred(shared: &Arc<PeerShared>, deferred: Vec<Deferred>) {
    for item in deferred {
        match item {
            Deferred::State { session, state } => session.notify(state),
            Deferred::Incoming(call) => {
                let listeners: Vec<IncomingListener> = shared
                    .incoming_listeners
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|(_, l)| l.clone())
                    .collect();
                for listener in listeners {
                    let call = call.clone();
                    if catch_unwind(AssertUnwindSafe(|| listener(call))).is_err() {
                        warn!("incoming-call listener panicked");
                    }
                }
            }
        }
    }
}

/// Perform the core's actions. Async effects go to detached tasks so the
/// state lock is never held across an await; application callbacks are
/// returned as deferred work.
pub(crate) fn apply_actions(
    shared: &Arc<PeerShared>,
    inner: &mut Inner,
    actions: Vec<Action>,
) -> Vec<Deferred> {
    let mut deferred = Vec::new();
    let mut queue: VecDeque<Action> = actions.into();
    while let Some(action) = queue.pop_front() {
        match action {
            Action::ConnectTransport => {
                debug!(identity = %shared.identity, "requesting transport handle");
                tokio::spawn(run_connect(shared.clone()));
            }
            Action::DiscardTransport => {
                if let Some(handle) = inner.transport.take() {
                    tokio::spawn(async move { handle.close().await });
                }
            }
            Action::TransportReady => {
                for tx in inner.ready_waiters.drain(..) {
                    let _ = tx.send(Ok(()));
                }
            }
            Action::TransportFailed { kind, message } => {
                warn!(?kind, %message, "transport failed before open");
                for tx in inner.ready_waiters.drain(..) {
                    let _ = tx.send(Err(PeerError::Transport {
                        kind,
                        message: message.clone(),
                    }));
                }
            }
            Action::OpenConnection { conn, to } => match inner.transport.clone() {
                Some(handle) => {
                    tokio::spawn(run_open(shared.clone(), handle, conn, to));
                }
                None => {
                    let more = inner.core.on_connection_failed(conn, "no transport handle");
                    queue.extend(more);
                }
            },
            Action::SendFrame { conn, frame } => {
                if let Some(connection) = inner.connections.get(&conn).cloned() {
                    tokio::spawn(async move {
                        if let Err(err) = connection.send(frame).await {
                            debug!(%conn, %err, "send failed; the connection event settles it");
                        }
                    });
                }
            }
            Action::CloseConnection { conn } => {
                if let Some(connection) = inner.connections.remove(&conn) {
                    tokio::spawn(async move { connection.close().await });
                }
            }
            Action::CompleteRequest {
                correlation,
                result,
            } => {
                if let Some(tx) = inner.request_waiters.remove(&correlation) {
                    let _ = tx.send(result.map_err(PeerError::from));
                }
            }
            Action::InboundRequest {
                conn,
                caller,
                correlation,
                path,
                payload,
            } => {
                let handler = shared.handlers.lock().unwrap().get(&path).cloned();
                debug!(%caller, %path, found = handler.is_some(), "dispatching inbound request");
                tokio::spawn(run_handler(
                    shared.clone(),
                    conn,
                    correlation,
                    handler,
                    caller,
                    payload,
                ));
            }
            Action::NotifyIncomingCall {
                offer,
                caller,
                video,
                metadata,
            } => {
                let call = Arc::new(IncomingCall::new(
                    Arc::downgrade(shared),
                    offer,
                    caller,
                    video,
                    metadata,
                ));
                deferred.push(Deferred::Incoming(call));
            }
            Action::OpenMedia {
                call,
                to,
                video,
                metadata,
            } => {
                let local = inner.sessions.get(&call).map(|s| s.local_stream());
                match (inner.transport.clone(), local) {
                    (Some(handle), Some(local)) => {
                        tokio::spawn(run_open_media(
                            shared.clone(),
                            handle,
                            call,
                            to,
                            local,
                            video,
                            metadata,
                        ));
                    }
                    _ => {
                        let more = inner.core.end_call(call, "transport unavailable");
                        queue.extend(more);
                    }
                }
            }
            Action::CloseMedia { call } => {
                if let Some(session) = inner.media_sessions.remove(&call) {
                    tokio::spawn(async move { session.close().await });
                }
            }
            Action::SetTracksEnabled {
                call,
                kind,
                enabled,
            } => {
                if let Some(session) = inner.sessions.get(&call) {
                    session.local_stream().set_enabled(kind, enabled);
                    match kind {
                        TrackKind::Audio => session.set_muted(!enabled),
                        TrackKind::Video => session.set_video_enabled(enabled),
                    }
                }
            }
            Action::StopLocalMedia { call } => {
                if let Some(session) = inner.sessions.get(&call) {
                    session.local_stream().stop_all();
                }
            }
            Action::CallStateChanged {
                call,
                state,
                reason,
            } => {
                match state {
                    CallState::Connected => {
                        if let Some(tx) = inner.call_waiters.remove(&call) {
                            let _ = tx.send(Ok(()));
                        }
                    }
                    CallState::Ended => {
                        if let Some(tx) = inner.call_waiters.remove(&call) {
                            let reason =
                                reason.clone().unwrap_or_else(|| "ended".to_string());
                            let _ = tx.send(Err(PeerError::CallEnded(reason)));
                        }
                    }
                    CallState::Connecting => {}
                }
                if let Some(session) = inner.sessions.get(&call).cloned() {
                    debug!(%call, ?state, "call state changed");
                    session.record_state(state, reason);
                    deferred.push(Deferred::State {
                        session,
                        state,
                    });
                    if state == CallState::Ended {
                        inner.sessions.remove(&call);
                    }
                }
            }
        }
    }
    deferred
}

async fn run_connect(shared: Arc<PeerShared>) {
    let result = shared
        .connector
        .connect(&shared.identity, &shared.endpoint)
        .await;
    let deferred = {
        let mut inner = shared.state.lock().await;
        match result {
            Ok(binding) => {
                if inner.core.is_closed() {
                    let handle = binding.handle;
                    tokio::spawn(async move { handle.close().await });
                    return;
                }
                inner.transport_seq += 1;
                let seq = inner.transport_seq;
                inner.transport = Some(Arc::from(binding.handle));
                tokio::spawn(run_transport(shared.clone(), seq, binding.events));
                Vec::new()
            }
            Err(err) => {
                let actions = inner.core.on_transport_error(err.kind, &err.message);
                apply_actions(&shared, &mut inner, actions)
            }
        }
    };
    run_deferred(&shared, deferred);
}

async fn run_transport(
    shared: Arc<PeerShared>,
    seq: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let deferred = {
            let mut inner = shared.state.lock().await;
            if inner.transport_seq != seq {
                // Superseded handle; whatever it still emits is void.
                break;
            }
            let actions = match event {
                TransportEvent::Open => inner.core.on_transport_open(),
                TransportEvent::Disconnected => inner.core.on_transport_disconnected(),
                TransportEvent::Error(err) => {
                    inner.core.on_transport_error(err.kind, &err.message)
                }
                TransportEvent::Closed => inner.core.on_transport_closed(),
                TransportEvent::Connection(incoming) => {
                    let (conn, actions) =
                        inner.core.on_connection_accepted(incoming.remote.clone());
                    inner.connections.insert(conn, Arc::from(incoming.connection));
                    tokio::spawn(run_connection(shared.clone(), conn, incoming.events));
                    actions
                }
                TransportEvent::MediaOffer(incoming) => {
                    if inner.core.is_closed() {
                        let session = incoming.session;
                        tokio::spawn(async move { session.close().await });
                        Vec::new()
                    } else {
                        let (offer, actions) = inner.core.on_media_offer(
                            incoming.from.clone(),
                            incoming.video,
                            incoming.metadata.clone(),
                        );
                        inner.offer_media.insert(
                            offer,
                            OfferMedia {
                                session: Arc::from(incoming.session),
                                events: Some(incoming.events),
                            },
                        );
                        actions
                    }
                }
            };
            apply_actions(&shared, &mut inner, actions)
        };
        run_deferred(&shared, deferred);
    }
}

async fn run_connection(
    shared: Arc<PeerShared>,
    conn: ConnId,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    while let Some(event) = events.recv().await {
        let done = matches!(event, ConnectionEvent::Closed | ConnectionEvent::Error(_));
        let deferred = {
            let mut inner = shared.state.lock().await;
            let actions = match event {
                ConnectionEvent::Open => inner.core.on_connection_open(conn),
                ConnectionEvent::Data(bytes) => inner.core.on_frame(conn, &bytes),
                ConnectionEvent::Closed => {
                    inner.connections.remove(&conn);
                    inner.core.on_connection_closed(conn)
                }
                ConnectionEvent::Error(message) => {
                    inner.connections.remove(&conn);
                    inner.core.on_connection_error(conn, &message)
                }
            };
            apply_actions(&shared, &mut inner, actions)
        };
        run_deferred(&shared, deferred);
        if done {
            return;
        }
    }
    // Sender gone without a close event: same cleanup path.
    let deferred = {
        let mut inner = shared.state.lock().await;
        if inner.connections.remove(&conn).is_some() {
            let actions = inner.core.on_connection_closed(conn);
            apply_actions(&shared, &mut inner, actions)
        } else {
            Vec::new()
        }
    };
    run_deferred(&shared, deferred);
}

async fn run_open(
    shared: Arc<PeerShared>,
    handle: Arc<dyn TransportHandle>,
    conn: ConnId,
    to: PeerIdentity,
) {
    let result = handle.open(&to).await;
    let deferred = {
        let mut inner = shared.state.lock().await;
        let actions = match result {
            Ok(binding) => {
                inner.connections.insert(conn, Arc::from(binding.connection));
                tokio::spawn(run_connection(shared.clone(), conn, binding.events));
                Vec::new()
            }
            Err(err) => inner.core.on_connection_failed(conn, &err.message),
        };
        apply_actions(&shared, &mut inner, actions)
    };
    run_deferred(&shared, deferred);
}

async fn run_open_media(
    shared: Arc<PeerShared>,
    handle: Arc<dyn TransportHandle>,
    call: CallId,
    to: PeerIdentity,
    local: crate::media::MediaStream,
    video: bool,
    metadata: Value,
) {
    let result = handle.open_media(&to, local, video, metadata).await;
    let deferred = {
        let mut inner = shared.state.lock().await;
        let actions = match result {
            Ok(binding) => {
                if inner.core.call_state(call).is_none() {
                    // Ended (or timed out) while the session was opening.
                    let session = binding.session;
                    tokio::spawn(async move { session.close().await });
                    Vec::new()
                } else {
                    inner.media_sessions.insert(call, Arc::from(binding.session));
                    tokio::spawn(run_media(shared.clone(), call, binding.events));
                    Vec::new()
                }
            }
            Err(err) => inner
                .core
                .end_call(call, &format!("media session failed: {}", err.message)),
        };
        apply_actions(&shared, &mut inner, actions)
    };
    run_deferred(&shared, deferred);
}

pub(crate) async fn run_media(
    shared: Arc<PeerShared>,
    call: CallId,
    mut events: mpsc::UnboundedReceiver<MediaEvent>,
) {
    while let Some(event) = events.recv().await {
        let deferred = {
            let mut inner = shared.state.lock().await;
            let actions = match event {
                MediaEvent::Stream(stream) => {
                    if let Some(session) = inner.sessions.get(&call) {
                        session.set_remote(stream);
                    }
                    inner.core.on_media_stream(call)
                }
                MediaEvent::Closed => inner.core.on_media_closed(call),
                MediaEvent::Error(message) => inner.core.on_media_error(call, &message),
            };
            apply_actions(&shared, &mut inner, actions)
        };
        run_deferred(&shared, deferred);
    }
}

async fn run_handler(
    shared: Arc<PeerShared>,
    conn: ConnId,
    correlation: CorrelationId,
    handler: Option<Handler>,
    caller: PeerIdentity,
    payload: Value,
) {
    let outcome = match handler {
        None => HandlerOutcome::NotFound,
        Some(handler) => {
            // A panicking handler must still produce a response; running it
            // in its own task contains the panic at the join.
            match tokio::spawn(handler(caller, payload)).await {
                Ok(Ok(value)) => HandlerOutcome::Ok(value),
                Ok(Err(err)) => HandlerOutcome::Failed(err.to_string()),
                Err(_) => HandlerOutcome::Failed("handler panicked".to_string()),
            }
        }
    };
    let deferred = {
        let mut inner = shared.state.lock().await;
        let actions = inner.core.finish_inbound(conn, correlation, outcome);
        apply_actions(&shared, &mut inner, actions)
    };
    run_deferred(&shared, deferred);
}

async fn run_ticker(shared: Arc<PeerShared>, period: Duration) {
    let mut timer = tokio::time::interval(period);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        timer.tick().await;
        let deferred = {
            let mut inner = shared.state.lock().await;
            if inner.core.is_closed() {
                break;
            }
            let actions = inner.core.tick();
            apply_actions(&shared, &mut inner, actions)
        };
        run_deferred(&shared, deferred);
    }
}

/// One logical peer: a stable identity, a supervised transport binding, and
/// the request/response and call primitives on top of it.
pub struct Peer {
    shared: Arc<PeerShared>,
}

impl Peer {
    /// Create a peer and start its supervisor and clock. Must be called
    /// from within a tokio runtime.
    pub fn new(config: Config, connector: Arc<dyn Connector>, media: Arc<dyn MediaSource>) -> Peer {
        let identity = config
            .identity
            .clone()
            .map(PeerIdentity::from)
            .unwrap_or_else(PeerIdentity::generate);
        let mut core = SessionCore::new(identity.clone());
        core.set_request_timeout(config.request_timeout_ticks);
        core.set_call_timeout(config.call_timeout_ticks);
        let shared = Arc::new(PeerShared {
            identity,
            endpoint: config.endpoint.clone(),
            connector,
            media,
            state: Mutex::new(Inner {
                core,
                transport: None,
                transport_seq: 0,
                ready_waiters: Vec::new(),
                request_waiters: HashMap::new(),
                call_waiters: HashMap::new(),
                connections: HashMap::new(),
                media_sessions: HashMap::new(),
                sessions: HashMap::new(),
                offer_media: HashMap::new(),
            }),
            handlers: StdMutex::new(HashMap::new()),
            incoming_listeners: StdMutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            destroyed: AtomicBool::new(false),
        });
        let startup = shared.clone();
        tokio::spawn(async move {
            let deferred = {
                let mut inner = startup.state.lock().await;
                match inner.core.connect() {
                    Ok(actions) => apply_actions(&startup, &mut inner, actions),
                    Err(_) => Vec::new(),
                }
            };
            run_deferred(&startup, deferred);
        });
        tokio::spawn(run_ticker(
            shared.clone(),
            Duration::from_millis(config.tick_interval_ms.max(1)),
        ));
        Peer { shared }
    }

    pub fn peer_id(&self) -> &PeerIdentity {
        &self.shared.identity
    }

    /// Resolves once the transport reports open. Fails on a pre-open
    /// transport error, a parked unrecoverable error, or after destroy.
    pub async fn when_ready(&self) -> Result<(), PeerError> {
        let rx = {
            let mut inner = self.shared.state.lock().await;
            if inner.core.is_ready() {
                return Ok(());
            }
            if inner.core.is_closed() || self.shared.destroyed.load(Ordering::SeqCst) {
                return Err(PeerError::Destroyed);
            }
            if let Some((kind, message)) = inner.core.fatal_error() {
                return Err(PeerError::Transport { kind, message });
            }
            let (tx, rx) = oneshot::channel();
            inner.ready_waiters.push(tx);
            rx
        };
        rx.await.map_err(|_| PeerError::Destroyed)?
    }

    /// Send one request and await the unboxed response payload. Rejects on
    /// non-2xx status, timeout, or transport failure.
    pub async fn send(
        &self,
        to: impl Into<PeerIdentity>,
        path: &str,
        payload: Value,
    ) -> Result<Value, PeerError> {
        self.when_ready().await?;
        let to = to.into();
        let (rx, deferred) = {
            let mut inner = self.shared.state.lock().await;
            let (correlation, actions) = inner
                .core
                .begin_request(to, path, payload)
                .map_err(|_| PeerError::Destroyed)?;
            let (tx, rx) = oneshot::channel();
            inner.request_waiters.insert(correlation, tx);
            let deferred = apply_actions(&self.shared, &mut inner, actions);
            (rx, deferred)
        };
        run_deferred(&self.shared, deferred);
        rx.await.map_err(|_| PeerError::Destroyed)?
    }

    /// Register a handler for `path`; the last registration wins.
    pub fn register_handler<F, Fut>(&self, path: &str, handler: F)
    where
        F: Fn(PeerIdentity, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |caller, payload| Box::pin(handler(caller, payload)));
        self.shared
            .handlers
            .lock()
            .unwrap()
            .insert(path.to_string(), handler);
    }

    pub fn unregister_handler(&self, path: &str) {
        self.shared.handlers.lock().unwrap().remove(path);
    }

    /// Start a call and await the connected session. Rejects immediately
    /// when a call is already active; rejects with the end reason when the
    /// session ends before connecting (including "no answer").
    pub async fn call(
        &self,
        to: impl Into<PeerIdentity>,
        options: CallOptions,
    ) -> Result<Arc<CallSession>, PeerError> {
        self.when_ready().await?;
        let to = to.into();
        // Reserve the single-call slot before touching capture devices, so
        // a losing racer has nothing to release.
        let call = {
            let mut inner = self.shared.state.lock().await;
            inner
                .core
                .begin_call(to.clone(), options.video, options.metadata.clone())?
        };
        let local = match self.shared.media.acquire(true, options.video) {
            Ok(stream) => stream,
            Err(err) => {
                let mut inner = self.shared.state.lock().await;
                inner.core.abort_call(call);
                return Err(PeerError::Media(err.to_string()));
            }
        };
        let (session, rx, deferred) = {
            let mut inner = self.shared.state.lock().await;
            if inner.core.call_state(call).is_none() {
                // Destroyed (or expired) while capture was being acquired.
                local.stop_all();
                return Err(PeerError::CallEnded("ended during setup".to_string()));
            }
            let session = Arc::new(CallSession::new(
                Arc::downgrade(&self.shared),
                call,
                to,
                options.video,
                local,
            ));
            inner.sessions.insert(call, session.clone());
            let (tx, rx) = oneshot::channel();
            inner.call_waiters.insert(call, tx);
            let actions = inner.core.local_media_ready(call);
            let deferred = apply_actions(&self.shared, &mut inner, actions);
            (session, rx, deferred)
        };
        run_deferred(&self.shared, deferred);
        rx.await.map_err(|_| PeerError::Destroyed)??;
        Ok(session)
    }

    /// Register an incoming-call listener; returns an id for removal.
    /// Every listener observes every offer.
    pub fn on_incoming_call<F>(&self, listener: F) -> u64
    where
        F: Fn(Arc<IncomingCall>) + Send + Sync + 'static,
    {
        let id = self.shared.next_listener.fetch_add(1, Ordering::SeqCst);
        self.shared
            .incoming_listeners
            .lock()
            .unwrap()
            .push((id, Arc::new(listener)));
        id
    }

    pub fn off_incoming_call(&self, id: u64) {
        self.shared
            .incoming_listeners
            .lock()
            .unwrap()
            .retain(|(l, _)| *l != id);
    }

    pub async fn active_call(&self) -> Option<Arc<CallSession>> {
        let inner = self.shared.state.lock().await;
        inner
            .core
            .active_call_id()
            .and_then(|id| inner.sessions.get(&id).cloned())
    }

    /// Terminal teardown: fail outstanding requests, hang up the active
    /// call, drop handlers and listeners, discard the transport. Idempotent.
    pub async fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let deferred = {
            let mut inner = self.shared.state.lock().await;
            let actions = inner.core.shutdown();
            let deferred = apply_actions(&self.shared, &mut inner, actions);
            for tx in inner.ready_waiters.drain(..) {
                let _ = tx.send(Err(PeerError::Destroyed));
            }
            for (_, media) in inner.offer_media.drain() {
                let session = media.session;
                tokio::spawn(async move { session.close().await });
            }
            deferred
        };
        self.shared.handlers.lock().unwrap().clear();
        self.shared.incoming_listeners.lock().unwrap().clear();
        run_deferred(&self.shared, deferred);
    }
}
