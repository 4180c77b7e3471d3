//! Node key material and the on-disk key file.
//!
//! A node owns one X25519 keypair for encryption and one Ed25519 keypair for
//! signatures, plus a stable `node_id` that is independent of its username.
//! Secret material stays inside this process; the key file is written
//! atomically and readable only by the owning user.

use crate::crypto::{init, CipherCodec, Sealed};
use crate::utils::{CryptoError, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::{SigningKey, VerifyingKey, PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH};
use rand::rngs::OsRng;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::Path;
use uuid::Uuid;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of an X25519 key in bytes
pub const X25519_KEY_LENGTH: usize = 32;

/// Key file format version
const KEY_FILE_VERSION: u32 = 1;

/// The node's encryption and signing keypairs plus its stable identifier
#[derive(Clone)]
pub struct NodeKeys {
    node_id: Uuid,
    encryption_secret: StaticSecret,
    encryption_public: PublicKey,
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

/// On-disk representation; every key is an opaque base64 byte string
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct KeyFile {
    version: u32,
    node_id: String,
    encryption_public: String,
    encryption_secret: String,
    signing_public: String,
    signing_secret: String,
}

impl NodeKeys {
    /// Generate fresh keypairs from the operating system CSPRNG
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::RngUnavailable` if the RNG cannot be used
    pub fn generate() -> Result<Self> {
        init()?;

        let mut encryption_seed = [0u8; X25519_KEY_LENGTH];
        let mut signing_seed = [0u8; SECRET_KEY_LENGTH];
        fill_random(&mut encryption_seed)?;
        fill_random(&mut signing_seed)?;

        let keys = Self::from_parts(Uuid::new_v4(), encryption_seed, signing_seed);
        encryption_seed.zeroize();
        signing_seed.zeroize();
        Ok(keys)
    }

    fn from_parts(
        node_id: Uuid,
        encryption_seed: [u8; X25519_KEY_LENGTH],
        signing_seed: [u8; SECRET_KEY_LENGTH],
    ) -> Self {
        let encryption_secret = StaticSecret::from(encryption_seed);
        let encryption_public = PublicKey::from(&encryption_secret);
        let signing_key = SigningKey::from_bytes(&signing_seed);
        let verifying_key = signing_key.verifying_key();

        Self {
            node_id,
            encryption_secret,
            encryption_public,
            signing_key,
            verifying_key,
        }
    }

    /// Write both keypairs to `path`, replacing any existing file atomically
    ///
    /// The file is first written to a temporary file in the same directory
    /// and then renamed over the target, so a crash never leaves a truncated
    /// key file behind.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let record = KeyFile {
            version: KEY_FILE_VERSION,
            node_id: self.node_id.to_string(),
            encryption_public: STANDARD.encode(self.encryption_public.as_bytes()),
            encryption_secret: STANDARD.encode(self.encryption_secret.to_bytes()),
            signing_public: STANDARD.encode(self.verifying_key.as_bytes()),
            signing_secret: STANDARD.encode(self.signing_key.to_bytes()),
        };
        let mut json = serde_json::to_vec_pretty(&record)?;

        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        restrict_permissions(file.path())?;
        file.write_all(&json)?;
        json.zeroize();
        file.as_file().sync_all()?;
        file.persist(path).map_err(|e| e.error)?;

        log::debug!("Saved node keys to {}", path.display());
        Ok(())
    }

    /// Read and validate keypairs from `path`
    ///
    /// # Errors
    ///
    /// - `CryptoError::KeyFileNotFound` if the file is absent
    /// - `CryptoError::InvalidKeyFormat` if any key has the wrong length, or
    ///   a stored public key does not belong to its secret key
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut contents = match std::fs::read(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CryptoError::KeyFileNotFound {
                    path: path.display().to_string(),
                }
                .into());
            }
            Err(e) => return Err(e.into()),
        };

        let parsed: std::result::Result<KeyFile, _> = serde_json::from_slice(&contents);
        contents.zeroize();
        let record = parsed.map_err(|e| CryptoError::InvalidKeyFormat {
            reason: format!("unreadable key file: {e}"),
        })?;

        let node_id = Uuid::parse_str(&record.node_id).map_err(|_| CryptoError::InvalidKeyFormat {
            reason: "node_id is not a UUID".to_string(),
        })?;

        let mut encryption_seed: [u8; X25519_KEY_LENGTH] =
            decode_fixed("encryption_secret", &record.encryption_secret)?;
        let mut signing_seed: [u8; SECRET_KEY_LENGTH] =
            decode_fixed("signing_secret", &record.signing_secret)?;
        let encryption_public: [u8; X25519_KEY_LENGTH] =
            decode_fixed("encryption_public", &record.encryption_public)?;
        let signing_public: [u8; PUBLIC_KEY_LENGTH] =
            decode_fixed("signing_public", &record.signing_public)?;

        let keys = Self::from_parts(node_id, encryption_seed, signing_seed);
        encryption_seed.zeroize();
        signing_seed.zeroize();

        if keys.encryption_public() != encryption_public {
            return Err(CryptoError::InvalidKeyFormat {
                reason: "encryption_public does not match encryption_secret".to_string(),
            }
            .into());
        }
        if keys.signing_public() != signing_public {
            return Err(CryptoError::InvalidKeyFormat {
                reason: "signing_public does not match signing_secret".to_string(),
            }
            .into());
        }

        Ok(keys)
    }

    /// Load keys from `path`, generating and saving new ones if it is absent
    ///
    /// Returns the keys and whether they were freshly generated. A present
    /// but corrupt file is an error; it is never silently replaced.
    pub fn load_or_generate<P: AsRef<Path>>(path: P) -> Result<(Self, bool)> {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(keys) => Ok((keys, false)),
            Err(crate::ChatError::Crypto(CryptoError::KeyFileNotFound { .. })) => {
                log::info!("No key file at {}, generating a new identity", path.display());
                let keys = Self::generate()?;
                keys.save(path)?;
                Ok((keys, true))
            }
            Err(e) => Err(e),
        }
    }

    /// Stable node identifier
    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    /// X25519 public key
    pub fn encryption_public(&self) -> [u8; X25519_KEY_LENGTH] {
        self.encryption_public.to_bytes()
    }

    /// Ed25519 public key
    pub fn signing_public(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.to_bytes()
    }

    /// Encrypt `plaintext` for the holder of `recipient_public`
    pub fn seal_for(&self, plaintext: &[u8], recipient_public: &[u8; X25519_KEY_LENGTH]) -> Result<Sealed> {
        CipherCodec::encrypt(plaintext, &self.encryption_secret, recipient_public)
    }

    /// Decrypt a payload sent by the holder of `sender_public`
    pub fn open_from(
        &self,
        ciphertext: &[u8],
        nonce: &[u8],
        sender_public: &[u8; X25519_KEY_LENGTH],
    ) -> Result<Vec<u8>> {
        CipherCodec::decrypt(ciphertext, nonce, sender_public, &self.encryption_secret)
    }

    /// Produce a detached Ed25519 signature
    pub fn sign(&self, message: &[u8]) -> [u8; ed25519_dalek::SIGNATURE_LENGTH] {
        CipherCodec::sign(message, &self.signing_key)
    }
}

impl fmt::Debug for NodeKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeKeys")
            .field("node_id", &self.node_id)
            .field("encryption_public", &hex::encode(self.encryption_public()))
            .field("signing_public", &hex::encode(self.signing_public()))
            .field("secrets", &"[REDACTED]")
            .finish()
    }
}

/// The loaded identity of the local node
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    username: String,
    keys: NodeKeys,
}

impl LocalIdentity {
    /// Bind a username to a set of keys
    pub fn new<S: Into<String>>(username: S, keys: NodeKeys) -> Self {
        Self {
            username: username.into(),
            keys,
        }
    }

    /// Registered username
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Stable node identifier as sent on the wire
    pub fn node_id(&self) -> String {
        self.keys.node_id().to_string()
    }

    /// Underlying key material
    pub fn keys(&self) -> &NodeKeys {
        &self.keys
    }
}

impl fmt::Display for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.username, &self.node_id()[..8])
    }
}

fn fill_random(buf: &mut [u8]) -> Result<()> {
    OsRng.try_fill_bytes(buf).map_err(|e| {
        CryptoError::RngUnavailable {
            reason: e.to_string(),
        }
        .into()
    })
}

fn decode_fixed<const N: usize>(field: &str, encoded: &str) -> Result<[u8; N]> {
    let mut bytes = STANDARD
        .decode(encoded)
        .map_err(|_| CryptoError::InvalidKeyFormat {
            reason: format!("{field} is not valid base64"),
        })?;
    let result = <[u8; N]>::try_from(bytes.as_slice()).map_err(|_| CryptoError::InvalidKeyFormat {
        reason: format!("{field}: expected {N} bytes, got {}", bytes.len()),
    });
    bytes.zeroize();
    Ok(result?)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
