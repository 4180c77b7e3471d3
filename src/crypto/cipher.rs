//! Authenticated public-key encryption and detached signatures.
//!
//! Encryption is a static-static X25519 agreement between the sender's secret
//! key and the recipient's public key, expanded with HKDF-SHA256 into a
//! direction-bound XChaCha20-Poly1305 key. The nonce is always drawn from the
//! OS RNG inside [`CipherCodec::encrypt`]; callers cannot supply one.

use crate::crypto::X25519_KEY_LENGTH;
use crate::utils::{CryptoError, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey, SIGNATURE_LENGTH};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand_core::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

/// Length of an encryption nonce in bytes
pub const NONCE_LENGTH: usize = 24;

/// HKDF info prefix for message keys
const BOX_KEY_INFO: &[u8] = b"p2pchat-box-v1";

/// Ciphertext plus the nonce it was sealed under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    /// Encrypted payload including the authentication tag
    pub ciphertext: Vec<u8>,
    /// Nonce used for this payload
    pub nonce: [u8; NONCE_LENGTH],
}

/// Stateless encryption and signature operations
pub struct CipherCodec;

impl CipherCodec {
    /// Encrypt `plaintext` from the holder of `sender_secret` to the holder of
    /// `recipient_public`.
    ///
    /// # Errors
    ///
    /// Fails if the RNG is unavailable or the recipient key is a low-order
    /// point that would yield a non-contributory shared secret.
    pub fn encrypt(
        plaintext: &[u8],
        sender_secret: &StaticSecret,
        recipient_public: &[u8; X25519_KEY_LENGTH],
    ) -> Result<Sealed> {
        let sender_public = PublicKey::from(sender_secret).to_bytes();
        let cipher = Self::box_cipher(sender_secret, recipient_public, &sender_public, recipient_public)
            .map_err(|_| CryptoError::EncryptionFailed {
                reason: "recipient key is not usable".to_string(),
            })?;

        let mut nonce = [0u8; NONCE_LENGTH];
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|e| CryptoError::RngUnavailable {
                reason: e.to_string(),
            })?;

        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed {
                reason: "AEAD seal failed".to_string(),
            })?;

        Ok(Sealed { ciphertext, nonce })
    }

    /// Decrypt a payload sealed by the holder of `sender_public` for the
    /// holder of `recipient_secret`.
    ///
    /// Never returns partial output: any tag mismatch, wrong key or malformed
    /// nonce yields `CryptoError::DecryptionFailed`.
    pub fn decrypt(
        ciphertext: &[u8],
        nonce: &[u8],
        sender_public: &[u8; X25519_KEY_LENGTH],
        recipient_secret: &StaticSecret,
    ) -> Result<Vec<u8>> {
        if nonce.len() != NONCE_LENGTH {
            return Err(CryptoError::DecryptionFailed.into());
        }

        let recipient_public = PublicKey::from(recipient_secret).to_bytes();
        let cipher = Self::box_cipher(recipient_secret, sender_public, sender_public, &recipient_public)?;

        cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed.into())
    }

    /// Produce a detached Ed25519 signature over `message`
    pub fn sign(message: &[u8], signing_key: &SigningKey) -> [u8; SIGNATURE_LENGTH] {
        signing_key.sign(message).to_bytes()
    }

    /// Check a detached signature.
    ///
    /// Malformed keys or signatures simply fail verification; callers must
    /// drop whatever the signature was meant to authenticate.
    pub fn verify(message: &[u8], signature: &[u8], signing_public: &[u8]) -> bool {
        let Ok(public) = <[u8; 32]>::try_from(signing_public) else {
            return false;
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&public) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        verifying_key.verify_strict(message, &signature).is_ok()
    }

    fn box_cipher(
        own_secret: &StaticSecret,
        their_public: &[u8; X25519_KEY_LENGTH],
        sender_public: &[u8; X25519_KEY_LENGTH],
        recipient_public: &[u8; X25519_KEY_LENGTH],
    ) -> Result<XChaCha20Poly1305> {
        let shared = own_secret.diffie_hellman(&PublicKey::from(*their_public));
        if !shared.was_contributory() {
            return Err(CryptoError::DecryptionFailed.into());
        }

        let mut info = Vec::with_capacity(BOX_KEY_INFO.len() + 2 * X25519_KEY_LENGTH);
        info.extend_from_slice(BOX_KEY_INFO);
        info.extend_from_slice(sender_public);
        info.extend_from_slice(recipient_public);

        let mut key = [0u8; 32];
        Hkdf::<Sha256>::new(None, shared.as_bytes())
            .expand(&info, &mut key)
            .map_err(|_| CryptoError::EncryptionFailed {
                reason: "key derivation failed".to_string(),
            })?;

        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
        key.zeroize();
        Ok(cipher)
    }
}
