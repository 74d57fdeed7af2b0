//! Tokio host binding for the Tether peer-session protocol: drives the
//! sans-IO session core over a pluggable transport capability and exposes
//! the async peer surface.

pub mod config;
pub mod media;
pub mod memory;
pub mod peer;
pub mod session;
pub mod transport;

pub use config::{Config, Endpoint};
pub use media::{MediaError, MediaSource, MediaStream, MediaTrack, SyntheticMedia};
pub use memory::MemoryHub;
pub use peer::{CallOptions, HandlerError, Peer, PeerError};
pub use session::{CallSession, IncomingCall};
pub use transport::{
    Connection, ConnectionBinding, ConnectionEvent, Connector, IncomingConnection, IncomingMedia,
    MediaBinding, MediaEvent, MediaSession, TransportBinding, TransportError, TransportEvent,
    TransportHandle,
};

pub use tether_core::{CallState, PeerIdentity, TrackKind, TransportErrorKind};
