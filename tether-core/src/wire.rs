//! Envelope codec: one JSON document per transport message. The transport
//! is message-oriented, so there is no framing or partial-read state here.

use crate::protocol::Envelope;

/// Upper bound on an encoded envelope.
pub const MAX_ENVELOPE_LEN: usize = 16 * 1024 * 1024; // 16 MiB

/// Encode an envelope into the bytes of one transport message.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, EnvelopeEncodeError> {
    let bytes = serde_json::to_vec(envelope).map_err(EnvelopeEncodeError::Encode)?;
    if bytes.len() > MAX_ENVELOPE_LEN {
        return Err(EnvelopeEncodeError::TooLarge);
    }
    Ok(bytes)
}

/// Error encoding an envelope (serialization or size limit).
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeEncodeError {
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("envelope too large")]
    TooLarge,
}

/// Decode one transport message into an envelope.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, EnvelopeDecodeError> {
    if bytes.len() > MAX_ENVELOPE_LEN {
        return Err(EnvelopeDecodeError::TooLarge);
    }
    serde_json::from_slice(bytes).map_err(EnvelopeDecodeError::Decode)
}

/// Error decoding a transport message (size limit or malformed JSON).
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeDecodeError {
    #[error("envelope too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{CorrelationId, PeerIdentity};
    use serde_json::json;

    fn corr() -> CorrelationId {
        CorrelationId::next(&PeerIdentity::from("p"), 1)
    }

    #[test]
    fn roundtrip_request() {
        let env = Envelope::request(corr(), "/files/list", json!({"dir": "/tmp"}));
        let bytes = encode_envelope(&env).unwrap();
        let back = decode_envelope(&bytes).unwrap();
        assert_eq!(back.correlation_id, env.correlation_id);
        assert_eq!(back.request.unwrap().payload, json!({"dir": "/tmp"}));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(
            decode_envelope(b"not json"),
            Err(EnvelopeDecodeError::Decode(_))
        ));
    }

    #[test]
    fn oversized_message_rejected_before_parsing() {
        let bytes = vec![b' '; MAX_ENVELOPE_LEN + 1];
        assert!(matches!(
            decode_envelope(&bytes),
            Err(EnvelopeDecodeError::TooLarge)
        ));
    }
}
