//! Tether peer-session protocol reference implementation.
//! Host-driven: no I/O; the host passes transport events and receives actions.

pub mod call;
pub mod core;
pub mod identity;
pub mod protocol;
pub mod wire;

pub use self::core::{
    Action, CoreClosed, HandlerOutcome, PeerMetrics, RequestError, SessionCore,
    TransportErrorKind, DEFAULT_CALL_TIMEOUT_TICKS, DEFAULT_REQUEST_TIMEOUT_TICKS,
    RECONNECT_BACKOFF_TICKS,
};
pub use call::{CallError, CallState, TrackKind};
pub use identity::{CallId, ConnId, CorrelationId, PeerIdentity};
pub use protocol::{Envelope, EnvelopeKind, RequestBody, ResponseBody};
pub use wire::{decode_envelope, encode_envelope, EnvelopeDecodeError, EnvelopeEncodeError};
