//! Wire envelope definitions and signing.
//!
//! Every unit exchanged between peers is an [`Envelope`]. Binary fields are
//! CBOR byte strings and the map is keyed by field name, so a missing or
//! mistyped field is detected on decode instead of being misread.

use crate::crypto::{CipherCodec, LocalIdentity, X25519_KEY_LENGTH};
use crate::utils::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Domain separation tag for envelope signatures
const SIGNING_CONTEXT: &[u8] = b"p2pchat-envelope-v1";

/// Envelope discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeKind {
    /// Identity announcement during the handshake
    Handshake,
    /// Encrypted chat message
    Message,
    /// Handshake challenge acknowledgment
    Ack,
}

impl EnvelopeKind {
    fn tag(self) -> u8 {
        match self {
            Self::Handshake => 1,
            Self::Message => 2,
            Self::Ack => 3,
        }
    }
}

/// The structured unit exchanged over the peer wire protocol.
///
/// For `MESSAGE` envelopes `ciphertext` is the sealed chat payload and
/// `nonce` its encryption nonce. For `HANDSHAKE` envelopes `ciphertext`
/// carries the sender's public identity and `nonce` a fresh challenge; for
/// `ACK` envelopes `nonce` echoes the peer's challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Envelope type
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// Sender node identifier
    pub from_node_id: String,
    /// Recipient node identifier (empty when not yet known)
    pub to_node_id: String,
    /// Encryption nonce or handshake challenge
    #[serde(with = "serde_bytes")]
    pub nonce: Vec<u8>,
    /// Payload bytes
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
    /// Ed25519 signature over [`Envelope::signing_bytes`]
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl Envelope {
    /// Build an unsigned envelope stamped with the current time
    pub fn new(
        kind: EnvelopeKind,
        from_node_id: String,
        to_node_id: String,
        nonce: Vec<u8>,
        ciphertext: Vec<u8>,
    ) -> Self {
        Self {
            kind,
            from_node_id,
            to_node_id,
            nonce,
            ciphertext,
            signature: Vec::new(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Encrypt `plaintext` for a recipient and sign the result
    pub fn seal_message(
        sender: &LocalIdentity,
        to_node_id: &str,
        recipient_public: &[u8; X25519_KEY_LENGTH],
        plaintext: &[u8],
    ) -> Result<Self> {
        let sealed = sender.keys().seal_for(plaintext, recipient_public)?;
        let mut envelope = Self::new(
            EnvelopeKind::Message,
            sender.node_id(),
            to_node_id.to_string(),
            sealed.nonce.to_vec(),
            sealed.ciphertext,
        );
        envelope.sign(sender);
        Ok(envelope)
    }

    /// Decrypt a `MESSAGE` payload addressed to `recipient`
    pub fn open_message(
        &self,
        recipient: &LocalIdentity,
        sender_public: &[u8; X25519_KEY_LENGTH],
    ) -> Result<Vec<u8>> {
        recipient
            .keys()
            .open_from(&self.ciphertext, &self.nonce, sender_public)
    }

    /// Bytes covered by the signature.
    ///
    /// Covers the type, both node ids, nonce, ciphertext and timestamp, each
    /// variable-length field prefixed with its length so no two distinct
    /// envelopes share a signing input.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            SIGNING_CONTEXT.len()
                + 1
                + 16
                + self.from_node_id.len()
                + self.to_node_id.len()
                + self.nonce.len()
                + self.ciphertext.len()
                + 8,
        );
        out.extend_from_slice(SIGNING_CONTEXT);
        out.push(self.kind.tag());
        for field in [
            self.from_node_id.as_bytes(),
            self.to_node_id.as_bytes(),
            self.nonce.as_slice(),
            self.ciphertext.as_slice(),
        ] {
            out.extend_from_slice(&(field.len() as u32).to_be_bytes());
            out.extend_from_slice(field);
        }
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out
    }

    /// Sign the envelope with the sender's signing key
    pub fn sign(&mut self, sender: &LocalIdentity) {
        self.signature = sender.keys().sign(&self.signing_bytes()).to_vec();
    }

    /// Check the signature against a known signing key
    pub fn verify_signature(&self, signing_public: &[u8]) -> bool {
        CipherCodec::verify(&self.signing_bytes(), &self.signature, signing_public)
    }

    /// Reject envelopes stamped further in the future than `max_skew`
    pub fn check_timestamp(&self, max_skew: Duration) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let skew = i64::try_from(max_skew.as_millis()).unwrap_or(i64::MAX);
        if self.timestamp > now.saturating_add(skew) {
            return Err(ProtocolError::StaleEnvelope {
                reason: format!("timestamp {} is ahead of local clock", self.timestamp),
            }
            .into());
        }
        Ok(())
    }

    /// Serialize to the CBOR body used inside frames and the offline queue
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        ciborium::into_writer(self, &mut out).map_err(|e| ProtocolError::MalformedFrame {
            reason: e.to_string(),
        })?;
        Ok(out)
    }

    /// Parse a CBOR body
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::MalformedFrame` for missing or wrong-typed fields
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| {
            ProtocolError::MalformedFrame {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Type name for logging
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            EnvelopeKind::Handshake => "HANDSHAKE",
            EnvelopeKind::Message => "MESSAGE",
            EnvelopeKind::Ack => "ACK",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NodeKeys;
    use crate::ChatError;

    fn identity(name: &str) -> LocalIdentity {
        LocalIdentity::new(name, NodeKeys::generate().unwrap())
    }

    #[test]
    fn test_seal_verify_open() {
        let alice = identity("alice");
        let bob = identity("bob");

        let envelope = Envelope::seal_message(
            &alice,
            &bob.node_id(),
            &bob.keys().encryption_public(),
            b"hello",
        )
        .unwrap();

        assert_eq!(envelope.kind, EnvelopeKind::Message);
        assert!(envelope.verify_signature(&alice.keys().signing_public()));
        let plaintext = envelope
            .open_message(&bob, &alice.keys().encryption_public())
            .unwrap();
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn test_signature_covers_routing_fields() {
        let alice = identity("alice");
        let bob = identity("bob");
        let original = Envelope::seal_message(
            &alice,
            &bob.node_id(),
            &bob.keys().encryption_public(),
            b"hello",
        )
        .unwrap();
        let key = alice.keys().signing_public();

        let mut redirected = original.clone();
        redirected.to_node_id = "someone-else".to_string();
        assert!(!redirected.verify_signature(&key));

        let mut spoofed = original.clone();
        spoofed.from_node_id = "someone-else".to_string();
        assert!(!spoofed.verify_signature(&key));

        let mut retimed = original.clone();
        retimed.timestamp += 1;
        assert!(!retimed.verify_signature(&key));

        let mut renonced = original.clone();
        renonced.nonce[0] ^= 1;
        assert!(!renonced.verify_signature(&key));

        let mut retyped = original;
        retyped.kind = EnvelopeKind::Ack;
        assert!(!retyped.verify_signature(&key));
    }

    #[test]
    fn test_bytes_round_trip() {
        let alice = identity("alice");
        let mut envelope = Envelope::new(
            EnvelopeKind::Handshake,
            alice.node_id(),
            String::new(),
            vec![9; 32],
            Vec::new(),
        );
        envelope.sign(&alice);

        let decoded = Envelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_missing_field_is_malformed() {
        #[derive(Serialize)]
        struct Partial {
            #[serde(rename = "type")]
            kind: EnvelopeKind,
            from_node_id: String,
        }

        let mut bytes = Vec::new();
        ciborium::into_writer(
            &Partial {
                kind: EnvelopeKind::Message,
                from_node_id: "a".to_string(),
            },
            &mut bytes,
        )
        .unwrap();

        assert!(matches!(
            Envelope::from_bytes(&bytes),
            Err(ChatError::Protocol(ProtocolError::MalformedFrame { .. }))
        ));
    }

    #[test]
    fn test_wrong_typed_field_is_malformed() {
        let value = ciborium::Value::Map(vec![
            ("type".into(), "MESSAGE".into()),
            ("from_node_id".into(), "a".into()),
            ("to_node_id".into(), "b".into()),
            ("nonce".into(), ciborium::Value::Bytes(vec![1; 24])),
            ("ciphertext".into(), ciborium::Value::Bytes(vec![])),
            ("signature".into(), ciborium::Value::Bytes(vec![])),
            ("timestamp".into(), "yesterday".into()),
        ]);
        let mut bytes = Vec::new();
        ciborium::into_writer(&value, &mut bytes).unwrap();

        assert!(Envelope::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_future_timestamp_rejected() {
        let alice = identity("alice");
        let mut envelope = Envelope::new(
            EnvelopeKind::Message,
            alice.node_id(),
            "b".to_string(),
            Vec::new(),
            Vec::new(),
        );
        assert!(envelope.check_timestamp(Duration::from_secs(300)).is_ok());

        envelope.timestamp += 3_600_000;
        assert!(envelope.check_timestamp(Duration::from_secs(300)).is_err());
    }
}
