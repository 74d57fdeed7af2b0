//! Peer identity and the identifiers handed out by the session core.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical peer identity: an opaque string, generated locally when the host
/// does not supply one. Stable across reconnects; the transport never
/// assigns it, which is what keeps the identity alive when the transport
/// handle is replaced.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    /// Generate a fresh random identity (v4 UUID).
    pub fn generate() -> Self {
        PeerIdentity(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PeerIdentity {
    fn from(s: String) -> Self {
        PeerIdentity(s)
    }
}

impl From<&str> for PeerIdentity {
    fn from(s: &str) -> Self {
        PeerIdentity(s.to_string())
    }
}

impl From<&PeerIdentity> for PeerIdentity {
    fn from(id: &PeerIdentity) -> Self {
        id.clone()
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Correlation ID: matches one outbound request to its one inbound response.
/// `<identity>-<seq>-<salt>`: the sequence separates concurrent requests from
/// the same peer, the salt separates peers that picked colliding identities.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub(crate) fn next(identity: &PeerIdentity, seq: u64) -> Self {
        let salt: u32 = rand::random();
        CorrelationId(format!("{}-{}-{:08x}", identity.as_str(), seq, salt))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle for one logical connection tracked by the core. The host routes
/// connection events back with it.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct ConnId(pub(crate) u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Handle for one call session or a not-yet-answered call offer.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct CallId(pub(crate) u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_identities_are_unique() {
        let a = PeerIdentity::generate();
        let b = PeerIdentity::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn correlation_id_embeds_identity_and_sequence() {
        let id = PeerIdentity::from("alice");
        let c = CorrelationId::next(&id, 7);
        assert!(c.as_str().starts_with("alice-7-"));
    }

    #[test]
    fn correlation_ids_differ_even_with_same_sequence() {
        let id = PeerIdentity::from("alice");
        let a = CorrelationId::next(&id, 1);
        let b = CorrelationId::next(&id, 1);
        assert_ne!(a, b);
    }
}
