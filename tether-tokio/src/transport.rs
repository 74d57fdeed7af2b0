//! Transport capability surface: what this layer consumes from the
//! underlying peer-to-peer transport. Consumed, not implemented; the
//! in-process hub in `memory` is the test-side exception.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use tether_core::{PeerIdentity, TransportErrorKind};

use crate::config::Endpoint;
use crate::media::MediaStream;

/// Failure surfaced by a transport capability call or lifecycle event.
#[derive(Debug, Clone, thiserror::Error)]
#[error("transport error ({kind:?}): {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Creates transport handles bound to a peer identity. One handle per
/// supervisor attempt; a reconnect discards the old handle and asks for a
/// new one with the same identity.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        identity: &PeerIdentity,
        endpoint: &Endpoint,
    ) -> Result<TransportBinding, TransportError>;
}

/// A live transport handle plus its lifecycle event stream.
pub struct TransportBinding {
    pub handle: Box<dyn TransportHandle>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait TransportHandle: Send + Sync + 'static {
    /// Open one logical connection for a single request/response exchange.
    async fn open(&self, to: &PeerIdentity) -> Result<ConnectionBinding, TransportError>;

    /// Open a media session, attaching the local stream and the call
    /// metadata out-of-band.
    async fn open_media(
        &self,
        to: &PeerIdentity,
        local: MediaStream,
        video: bool,
        metadata: Value,
    ) -> Result<MediaBinding, TransportError>;

    /// Best-effort close; errors are swallowed.
    async fn close(&self);
}

/// Lifecycle events of one transport handle.
pub enum TransportEvent {
    Open,
    Disconnected,
    Error(TransportError),
    Closed,
    Connection(IncomingConnection),
    MediaOffer(IncomingMedia),
}

/// A logical connection opened towards us by a remote peer.
pub struct IncomingConnection {
    pub remote: PeerIdentity,
    pub connection: Box<dyn Connection>,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

/// A logical connection we opened, plus its event stream.
pub struct ConnectionBinding {
    pub connection: Box<dyn Connection>,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Send one discrete message.
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError>;
    async fn close(&self);
}

pub enum ConnectionEvent {
    Open,
    Data(Vec<u8>),
    Closed,
    Error(String),
}

/// A media session offered to us by a remote peer.
pub struct IncomingMedia {
    pub from: PeerIdentity,
    pub video: bool,
    pub metadata: Value,
    pub session: Box<dyn MediaSession>,
    pub events: mpsc::UnboundedReceiver<MediaEvent>,
}

/// A media session we opened, plus its event stream.
pub struct MediaBinding {
    pub session: Box<dyn MediaSession>,
    pub events: mpsc::UnboundedReceiver<MediaEvent>,
}

#[async_trait]
pub trait MediaSession: Send + Sync + 'static {
    /// Accept an inbound media session, supplying the local stream. Remote
    /// media arrives asynchronously through the event stream.
    async fn answer(&self, local: MediaStream) -> Result<(), TransportError>;
    async fn close(&self);
}

pub enum MediaEvent {
    /// Remote media arrived.
    Stream(MediaStream),
    Closed,
    Error(String),
}
