//! Handshake envelopes and their verification.
//!
//! Each side sends a `HANDSHAKE` envelope carrying its node id, username and
//! both public keys, with a fresh random challenge in the nonce field, signed
//! by the key it claims. Each side then answers with an `ACK` whose nonce
//! echoes the peer's challenge. A side only trusts the peer once the peer's
//! handshake signature verifies under the claimed key and the peer's `ACK`
//! echoes our own challenge under that same key.

use crate::crypto::{LocalIdentity, X25519_KEY_LENGTH};
use crate::transport::{Envelope, EnvelopeKind};
use crate::utils::{CryptoError, ProtocolError, Result};
use crate::PROTOCOL_VERSION;
use rand::rngs::OsRng;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of a handshake challenge in bytes
pub const CHALLENGE_LENGTH: usize = 32;

/// Public identity announced in a handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
struct HandshakeBody {
    protocol_version: u32,
    username: String,
    #[serde(with = "serde_bytes")]
    encryption_public: Vec<u8>,
    #[serde(with = "serde_bytes")]
    signing_public: Vec<u8>,
}

/// Identity of the remote end, proven by the handshake
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerIdentity {
    /// Remote node identifier
    pub node_id: String,
    /// Username the peer announced
    pub username: String,
    /// X25519 public key
    pub encryption_public: [u8; X25519_KEY_LENGTH],
    /// Ed25519 public key
    pub signing_public: [u8; 32],
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.node_id.get(..8).unwrap_or(&self.node_id);
        write!(f, "{} ({})", self.username, short)
    }
}

/// Fresh per-connection challenge
pub struct Challenge([u8; CHALLENGE_LENGTH]);

impl Challenge {
    /// Draw a new challenge from the OS RNG
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; CHALLENGE_LENGTH];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| CryptoError::RngUnavailable {
                reason: e.to_string(),
            })?;
        Ok(Self(bytes))
    }

    /// Challenge bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Build our signed `HANDSHAKE` envelope
pub fn hello(local: &LocalIdentity, to_node_id: &str, challenge: &Challenge) -> Result<Envelope> {
    let body = HandshakeBody {
        protocol_version: PROTOCOL_VERSION,
        username: local.username().to_string(),
        encryption_public: local.keys().encryption_public().to_vec(),
        signing_public: local.keys().signing_public().to_vec(),
    };
    let mut encoded = Vec::new();
    ciborium::into_writer(&body, &mut encoded).map_err(|e| ProtocolError::MalformedFrame {
        reason: e.to_string(),
    })?;

    let mut envelope = Envelope::new(
        EnvelopeKind::Handshake,
        local.node_id(),
        to_node_id.to_string(),
        challenge.as_bytes().to_vec(),
        encoded,
    );
    envelope.sign(local);
    Ok(envelope)
}

/// Verify a peer's `HANDSHAKE` envelope and extract its identity.
///
/// `expected` is the identity an outbound connection was opened for; the
/// announced identity must match it exactly.
pub fn verify_hello(
    envelope: &Envelope,
    local: &LocalIdentity,
    expected: Option<&PeerIdentity>,
) -> Result<PeerIdentity> {
    if envelope.kind != EnvelopeKind::Handshake {
        return Err(failed(format!("expected HANDSHAKE, got {}", envelope.kind_name())));
    }
    if envelope.from_node_id.is_empty() || envelope.from_node_id == local.node_id() {
        return Err(failed("invalid sender node id"));
    }
    if envelope.to_node_id != local.node_id() {
        return Err(failed("handshake addressed to another node"));
    }
    if envelope.nonce.len() != CHALLENGE_LENGTH {
        return Err(failed("challenge has wrong length"));
    }

    let body: HandshakeBody = ciborium::from_reader(envelope.ciphertext.as_slice())
        .map_err(|e| failed(format!("unreadable handshake body: {e}")))?;
    if body.protocol_version != PROTOCOL_VERSION {
        return Err(failed(format!(
            "unsupported protocol version {}",
            body.protocol_version
        )));
    }
    if body.username.is_empty() {
        return Err(failed("empty username"));
    }

    let encryption_public = <[u8; X25519_KEY_LENGTH]>::try_from(body.encryption_public.as_slice())
        .map_err(|_| failed("encryption key has wrong length"))?;
    let signing_public = <[u8; 32]>::try_from(body.signing_public.as_slice())
        .map_err(|_| failed("signing key has wrong length"))?;

    if !envelope.verify_signature(&signing_public) {
        return Err(failed("signature does not verify under the claimed signing key"));
    }

    let peer = PeerIdentity {
        node_id: envelope.from_node_id.clone(),
        username: body.username,
        encryption_public,
        signing_public,
    };

    if let Some(expected) = expected {
        if peer.node_id != expected.node_id
            || peer.signing_public != expected.signing_public
            || peer.encryption_public != expected.encryption_public
        {
            return Err(failed(format!(
                "peer identity {peer} does not match expected {expected}"
            )));
        }
    }

    Ok(peer)
}

/// Build our `ACK` echoing the peer's challenge
pub fn ack(local: &LocalIdentity, peer: &PeerIdentity, peer_challenge: &[u8]) -> Envelope {
    let mut envelope = Envelope::new(
        EnvelopeKind::Ack,
        local.node_id(),
        peer.node_id.clone(),
        peer_challenge.to_vec(),
        Vec::new(),
    );
    envelope.sign(local);
    envelope
}

/// Verify the peer's `ACK` of our challenge
pub fn verify_ack(
    envelope: &Envelope,
    local: &LocalIdentity,
    peer: &PeerIdentity,
    challenge: &Challenge,
) -> Result<()> {
    if envelope.kind != EnvelopeKind::Ack {
        return Err(failed(format!("expected ACK, got {}", envelope.kind_name())));
    }
    if envelope.from_node_id != peer.node_id || envelope.to_node_id != local.node_id() {
        return Err(failed("ACK routing does not match the handshake"));
    }
    if envelope.nonce != challenge.as_bytes() {
        return Err(failed("ACK does not echo our challenge"));
    }
    if !envelope.verify_signature(&peer.signing_public) {
        return Err(failed("ACK signature does not verify"));
    }
    Ok(())
}

fn failed<S: Into<String>>(reason: S) -> crate::ChatError {
    ProtocolError::HandshakeFailed {
        reason: reason.into(),
    }
    .into()
}
