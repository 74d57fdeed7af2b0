//! In-process transport: a hub pairing peers by identity, for tests and
//! single-process demos. Connections and media sessions are channel pairs;
//! the "signaling server" is a map.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use tether_core::{PeerIdentity, TransportErrorKind};

use crate::config::Endpoint;
use crate::media::MediaStream;
use crate::transport::{
    Connection, ConnectionBinding, ConnectionEvent, Connector, IncomingConnection, IncomingMedia,
    MediaBinding, MediaEvent, MediaSession, TransportBinding, TransportError, TransportEvent,
    TransportHandle,
};

#[derive(Default)]
struct HubState {
    peers: HashMap<PeerIdentity, Registration>,
    black_holes: HashSet<PeerIdentity>,
}

struct Registration {
    token: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
}

/// The in-process signaling hub. Peers registered on the same hub reach
/// each other by identity.
pub struct MemoryHub {
    state: Mutex<HubState>,
    next_token: AtomicU64,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryHub {
            state: Mutex::new(HubState::default()),
            next_token: AtomicU64::new(1),
        })
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector { hub: self.clone() })
    }

    /// Simulate the signaling link dropping for one peer: it is
    /// unregistered and told it was disconnected, and may reconnect under
    /// the same identity.
    pub fn drop_peer(&self, id: &PeerIdentity) {
        let entry = self.state.lock().unwrap().peers.remove(id);
        if let Some(entry) = entry {
            let _ = entry.events.send(TransportEvent::Disconnected);
        }
    }

    /// Swallow connection opens towards `id`: the opened connection never
    /// reports open and never errors, so requests to it run into their
    /// deadline.
    pub fn black_hole(&self, id: &PeerIdentity) {
        self.state.lock().unwrap().black_holes.insert(id.clone());
    }

    fn unregister(&self, id: &PeerIdentity, token: u64) {
        let mut state = self.state.lock().unwrap();
        if state.peers.get(id).is_some_and(|r| r.token == token) {
            state.peers.remove(id);
        }
    }
}

struct MemoryConnector {
    hub: Arc<MemoryHub>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        identity: &PeerIdentity,
        _endpoint: &Endpoint,
    ) -> Result<TransportBinding, TransportError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let token = self.hub.next_token.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.hub.state.lock().unwrap();
            if state.peers.contains_key(identity) {
                return Err(TransportError::new(
                    TransportErrorKind::UnavailableId,
                    format!("identity already taken: {identity}"),
                ));
            }
            state.peers.insert(
                identity.clone(),
                Registration {
                    token,
                    events: events_tx.clone(),
                },
            );
        }
        let _ = events_tx.send(TransportEvent::Open);
        Ok(TransportBinding {
            handle: Box::new(MemoryHandle {
                hub: self.hub.clone(),
                identity: identity.clone(),
                token,
                closed: AtomicBool::new(false),
                conn_ends: Mutex::new(Vec::new()),
            }),
            events: events_rx,
        })
    }
}

struct MemoryHandle {
    hub: Arc<MemoryHub>,
    identity: PeerIdentity,
    token: u64,
    closed: AtomicBool,
    /// Both ends of every connection this handle opened, so closing the
    /// handle fails whatever is still in flight on it.
    conn_ends: Mutex<Vec<mpsc::UnboundedSender<ConnectionEvent>>>,
}

enum OpenTarget {
    Found(mpsc::UnboundedSender<TransportEvent>),
    BlackHole,
    Missing,
}

#[async_trait]
impl TransportHandle for MemoryHandle {
    async fn open(&self, to: &PeerIdentity) -> Result<ConnectionBinding, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::new(
                TransportErrorKind::SocketClosed,
                "transport handle closed",
            ));
        }
        let target = {
            let state = self.hub.state.lock().unwrap();
            if state.black_holes.contains(to) {
                OpenTarget::BlackHole
            } else {
                match state.peers.get(to) {
                    Some(r) => OpenTarget::Found(r.events.clone()),
                    None => OpenTarget::Missing,
                }
            }
        };
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        match target {
            OpenTarget::Missing => Err(TransportError::new(
                TransportErrorKind::Network,
                format!("unknown peer: {to}"),
            )),
            OpenTarget::BlackHole => {
                // Keep the event channel alive so the connection just hangs.
                self.conn_ends.lock().unwrap().push(local_tx);
                Ok(ConnectionBinding {
                    connection: Box::new(DeadConnection),
                    events: local_rx,
                })
            }
            OpenTarget::Found(remote_events) => {
                let (remote_tx, remote_rx) = mpsc::unbounded_channel();
                let local_conn = MemoryConnection {
                    peer_end: remote_tx.clone(),
                    local_end: local_tx.clone(),
                };
                let remote_conn = MemoryConnection {
                    peer_end: local_tx.clone(),
                    local_end: remote_tx.clone(),
                };
                let incoming = IncomingConnection {
                    remote: self.identity.clone(),
                    connection: Box::new(remote_conn),
                    events: remote_rx,
                };
                if remote_events
                    .send(TransportEvent::Connection(incoming))
                    .is_err()
                {
                    return Err(TransportError::new(
                        TransportErrorKind::Network,
                        format!("peer gone: {to}"),
                    ));
                }
                let _ = local_tx.send(ConnectionEvent::Open);
                self.conn_ends
                    .lock()
                    .unwrap()
                    .extend([local_tx, remote_tx]);
                Ok(ConnectionBinding {
                    connection: Box::new(local_conn),
                    events: local_rx,
                })
            }
        }
    }

    async fn open_media(
        &self,
        to: &PeerIdentity,
        local: MediaStream,
        video: bool,
        metadata: Value,
    ) -> Result<MediaBinding, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::new(
                TransportErrorKind::SocketClosed,
                "transport handle closed",
            ));
        }
        let target = {
            let state = self.hub.state.lock().unwrap();
            state.peers.get(to).map(|r| r.events.clone())
        };
        let Some(remote_events) = target else {
            return Err(TransportError::new(
                TransportErrorKind::Network,
                format!("unknown peer: {to}"),
            ));
        };
        let (caller_tx, caller_rx) = mpsc::unbounded_channel();
        let (callee_tx, callee_rx) = mpsc::unbounded_channel();
        let link = Arc::new(MediaLink {
            state: Mutex::new(LinkState {
                caller_events: caller_tx,
                callee_events: callee_tx,
                caller_stream: Some(local),
                closed: false,
            }),
        });
        let offer = IncomingMedia {
            from: self.identity.clone(),
            video,
            metadata,
            session: Box::new(MemoryMediaSession {
                link: link.clone(),
                inbound: true,
            }),
            events: callee_rx,
        };
        if remote_events.send(TransportEvent::MediaOffer(offer)).is_err() {
            return Err(TransportError::new(
                TransportErrorKind::Network,
                format!("peer gone: {to}"),
            ));
        }
        Ok(MediaBinding {
            session: Box::new(MemoryMediaSession {
                link,
                inbound: false,
            }),
            events: caller_rx,
        })
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.hub.unregister(&self.identity, self.token);
        let ends: Vec<_> = self.conn_ends.lock().unwrap().drain(..).collect();
        for end in ends {
            let _ = end.send(ConnectionEvent::Closed);
        }
    }
}

struct MemoryConnection {
    peer_end: mpsc::UnboundedSender<ConnectionEvent>,
    local_end: mpsc::UnboundedSender<ConnectionEvent>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.peer_end
            .send(ConnectionEvent::Data(frame))
            .map_err(|_| {
                TransportError::new(TransportErrorKind::SocketClosed, "connection closed")
            })
    }

    async fn close(&self) {
        let _ = self.peer_end.send(ConnectionEvent::Closed);
        let _ = self.local_end.send(ConnectionEvent::Closed);
    }
}

/// A connection into a black hole: sends vanish, events never come.
struct DeadConnection;

#[async_trait]
impl Connection for DeadConnection {
    async fn send(&self, _frame: Vec<u8>) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self) {}
}

struct MediaLink {
    state: Mutex<LinkState>,
}

struct LinkState {
    caller_events: mpsc::UnboundedSender<MediaEvent>,
    callee_events: mpsc::UnboundedSender<MediaEvent>,
    caller_stream: Option<MediaStream>,
    closed: bool,
}

struct MemoryMediaSession {
    link: Arc<MediaLink>,
    inbound: bool,
}

#[async_trait]
impl MediaSession for MemoryMediaSession {
    async fn answer(&self, local: MediaStream) -> Result<(), TransportError> {
        if !self.inbound {
            return Err(TransportError::new(
                TransportErrorKind::Other,
                "not an inbound media session",
            ));
        }
        let state = self.link.state.lock().unwrap();
        if state.closed {
            return Err(TransportError::new(
                TransportErrorKind::SocketClosed,
                "media session closed",
            ));
        }
        // Each side's remote stream is the other side's local one.
        let _ = state.caller_events.send(MediaEvent::Stream(local));
        if let Some(caller_stream) = state.caller_stream.clone() {
            let _ = state.callee_events.send(MediaEvent::Stream(caller_stream));
        }
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.link.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.closed = true;
        let _ = state.caller_events.send(MediaEvent::Closed);
        let _ = state.callee_events.send(MediaEvent::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn wait_connection(
        events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    ) -> IncomingConnection {
        loop {
            match events.recv().await.expect("transport events open") {
                TransportEvent::Connection(incoming) => return incoming,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn peers_pair_and_exchange_messages() {
        let hub = MemoryHub::new();
        let connector = hub.connector();
        let a = connector
            .connect(&PeerIdentity::from("a"), &Endpoint::default())
            .await
            .unwrap();
        let mut b = connector
            .connect(&PeerIdentity::from("b"), &Endpoint::default())
            .await
            .unwrap();

        let mut conn = a.handle.open(&PeerIdentity::from("b")).await.unwrap();
        assert!(matches!(
            conn.events.recv().await.unwrap(),
            ConnectionEvent::Open
        ));
        conn.connection.send(b"hello".to_vec()).await.unwrap();

        let mut incoming = wait_connection(&mut b.events).await;
        assert_eq!(incoming.remote, PeerIdentity::from("a"));
        match incoming.events.recv().await.unwrap() {
            ConnectionEvent::Data(bytes) => assert_eq!(bytes, b"hello"),
            _ => panic!("expected data"),
        }

        incoming.connection.send(b"hi back".to_vec()).await.unwrap();
        match conn.events.recv().await.unwrap() {
            ConnectionEvent::Data(bytes) => assert_eq!(bytes, b"hi back"),
            _ => panic!("expected data"),
        }

        conn.connection.close().await;
        assert!(matches!(
            incoming.events.recv().await.unwrap(),
            ConnectionEvent::Closed
        ));
    }

    #[tokio::test]
    async fn duplicate_identity_is_unavailable() {
        let hub = MemoryHub::new();
        let connector = hub.connector();
        let _a = connector
            .connect(&PeerIdentity::from("dup"), &Endpoint::default())
            .await
            .unwrap();
        let err = match connector
            .connect(&PeerIdentity::from("dup"), &Endpoint::default())
            .await
        {
            Err(err) => err,
            Ok(_) => panic!("second registration should fail"),
        };
        assert_eq!(err.kind, TransportErrorKind::UnavailableId);
    }

    #[tokio::test]
    async fn dropped_peer_can_reconnect_with_the_same_identity() {
        let hub = MemoryHub::new();
        let connector = hub.connector();
        let mut a = connector
            .connect(&PeerIdentity::from("a"), &Endpoint::default())
            .await
            .unwrap();
        assert!(matches!(
            a.events.recv().await.unwrap(),
            TransportEvent::Open
        ));
        hub.drop_peer(&PeerIdentity::from("a"));
        assert!(matches!(
            a.events.recv().await.unwrap(),
            TransportEvent::Disconnected
        ));
        // The identity is free again immediately.
        let _again = connector
            .connect(&PeerIdentity::from("a"), &Endpoint::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn closing_a_handle_fails_its_open_connections() {
        let hub = MemoryHub::new();
        let connector = hub.connector();
        let a = connector
            .connect(&PeerIdentity::from("a"), &Endpoint::default())
            .await
            .unwrap();
        let _b = connector
            .connect(&PeerIdentity::from("b"), &Endpoint::default())
            .await
            .unwrap();
        let mut conn = a.handle.open(&PeerIdentity::from("b")).await.unwrap();
        assert!(matches!(
            conn.events.recv().await.unwrap(),
            ConnectionEvent::Open
        ));
        a.handle.close().await;
        assert!(matches!(
            conn.events.recv().await.unwrap(),
            ConnectionEvent::Closed
        ));
    }
}
