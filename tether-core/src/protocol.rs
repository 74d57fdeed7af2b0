//! Tether wire protocol: request/response envelopes exchanged over one
//! logical connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::CorrelationId;

/// Status on a successful handler response.
pub const STATUS_OK: u16 = 200;
/// Status when no handler is registered for the requested path.
pub const STATUS_NOT_FOUND: u16 = 404;
/// Status when the handler failed.
pub const STATUS_HANDLER_ERROR: u16 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Request,
    Response,
}

/// Wire unit exchanged over one logical connection. Exactly one of
/// `request`/`response` is set, per `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub correlation_id: CorrelationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestBody {
    pub path: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseBody {
    pub status: u16,
    pub payload: Value,
}

impl Envelope {
    pub fn request(correlation_id: CorrelationId, path: impl Into<String>, payload: Value) -> Self {
        Envelope {
            kind: EnvelopeKind::Request,
            correlation_id,
            request: Some(RequestBody {
                path: path.into(),
                payload,
            }),
            response: None,
        }
    }

    pub fn response(correlation_id: CorrelationId, status: u16, payload: Value) -> Self {
        Envelope {
            kind: EnvelopeKind::Response,
            correlation_id,
            request: None,
            response: Some(ResponseBody { status, payload }),
        }
    }
}

impl ResponseBody {
    /// Success range is [200, 300).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}
