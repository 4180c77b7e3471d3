//! Error types and handling for the chat node.
//!
//! Errors are grouped by the layer that produces them. Cryptographic and
//! protocol errors are handled close to where they occur (the offending
//! connection is dropped, nothing is delivered); network and directory errors
//! propagate to the node, which decides the fallback policy.

use thiserror::Error;

/// Result type alias for the chat library
pub type Result<T> = std::result::Result<T, ChatError>;

/// Top-level error type for all node operations
#[derive(Error, Debug, Clone)]
pub enum ChatError {
    /// Cryptographic failures (bad keys, authentication failures, RNG)
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Wire protocol violations
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Peer connectivity errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Directory service errors
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// Configuration and setup errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The directory has no record for the requested user
    #[error("Cannot resolve recipient: {username}")]
    UnknownFriend { username: String },

    /// Neither direct delivery nor the offline queue accepted the message
    #[error("Delivery failed: {reason}")]
    DeliveryFailed { reason: String },

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Base64 encoding/decoding errors
    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Generic error for unexpected conditions
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

/// Cryptographic operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key material has the wrong length or encoding
    #[error("Invalid key format: {reason}")]
    InvalidKeyFormat { reason: String },

    /// Key file is absent
    #[error("Key file not found: {path}")]
    KeyFileNotFound { path: String },

    /// Authentication tag mismatch or undecryptable payload
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Encryption operation failure
    #[error("Encryption failed: {reason}")]
    EncryptionFailed { reason: String },

    /// Signature verification failure
    #[error("Signature verification failed")]
    SignatureVerification,

    /// The operating system RNG could not be used
    #[error("RNG unavailable: {reason}")]
    RngUnavailable { reason: String },
}

/// Wire protocol errors; any of these terminates the offending connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Declared frame length exceeds the configured maximum
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Frame body is not a well-formed envelope
    #[error("Malformed frame: {reason}")]
    MalformedFrame { reason: String },

    /// Handshake did not complete with a verified identity
    #[error("Handshake failed: {reason}")]
    HandshakeFailed { reason: String },

    /// Envelope type or addressing is not valid in the current state
    #[error("Unexpected envelope: {reason}")]
    UnexpectedEnvelope { reason: String },

    /// Envelope timestamp is outside the accepted window
    #[error("Stale envelope: {reason}")]
    StaleEnvelope { reason: String },

    /// Envelope was already delivered once
    #[error("Replay detected from {node_id}")]
    ReplayDetected { node_id: String },
}

/// Peer connectivity errors; these trigger the offline fallback
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Connection refused or otherwise failed
    #[error("Peer unreachable at {address}: {reason}")]
    PeerUnreachable { address: String, reason: String },

    /// Connect or handshake did not complete in time
    #[error("Connection timeout: {operation}")]
    ConnectTimeout { operation: String },

    /// Session closed before the write was accepted
    #[error("Peer unavailable: {peer}")]
    PeerUnavailable { peer: String },

    /// Address could not be parsed or resolved
    #[error("Invalid address: {address}")]
    InvalidAddress { address: String },

    /// Other transport failure
    #[error("Transport error: {reason}")]
    Transport { reason: String },
}

/// Directory service errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// Service could not be reached
    #[error("Directory unavailable: {reason}")]
    Unavailable { reason: String },

    /// Service answered with an unexpected status or body
    #[error("Bad directory response: {reason}")]
    BadResponse { reason: String },
}

/// Configuration and setup errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// Missing required configuration
    #[error("Missing configuration: {field}")]
    MissingField { field: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Configuration parsing error
    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Directory creation failure
    #[error("Failed to create directory: {path}")]
    DirectoryCreation { path: String },
}

impl ChatError {
    /// Creates a new unexpected error with a custom message
    pub fn unexpected<S: Into<String>>(msg: S) -> Self {
        Self::Unexpected(msg.into())
    }

    /// Returns true if retrying later may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Directory(DirectoryError::Unavailable { .. }) | Self::Io(_)
        )
    }

    /// Returns true if this error indicates tampering or an untrusted peer
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            Self::Crypto(CryptoError::SignatureVerification)
                | Self::Crypto(CryptoError::DecryptionFailed)
                | Self::Protocol(ProtocolError::HandshakeFailed { .. })
                | Self::Protocol(ProtocolError::ReplayDetected { .. })
        )
    }

    /// Returns true if a failed direct send should go to the offline queue
    pub fn triggers_offline_fallback(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Protocol(_) | Self::Io(_))
    }
}

impl From<std::io::Error> for ChatError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for DirectoryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() || err.is_status() {
            Self::BadResponse {
                reason: err.to_string(),
            }
        } else {
            Self::Unavailable {
                reason: err.to_string(),
            }
        }
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        Self::Directory(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ChatError::Crypto(CryptoError::InvalidKeyFormat {
            reason: "expected 32 bytes".to_string(),
        });
        assert!(error.to_string().contains("Invalid key format"));

        let error = ChatError::UnknownFriend {
            username: "mallory".to_string(),
        };
        assert_eq!(error.to_string(), "Cannot resolve recipient: mallory");
    }

    #[test]
    fn test_fallback_classification() {
        let refused = ChatError::Network(NetworkError::PeerUnreachable {
            address: "127.0.0.1:1".to_string(),
            reason: "connection refused".to_string(),
        });
        assert!(refused.triggers_offline_fallback());
        assert!(refused.is_recoverable());

        let unknown = ChatError::UnknownFriend {
            username: "nobody".to_string(),
        };
        assert!(!unknown.triggers_offline_fallback());

        let directory = ChatError::Directory(DirectoryError::Unavailable {
            reason: "timeout".to_string(),
        });
        assert!(!directory.triggers_offline_fallback());
        assert!(directory.is_recoverable());
    }

    #[test]
    fn test_security_violations() {
        let sig_error = ChatError::Crypto(CryptoError::SignatureVerification);
        assert!(sig_error.is_security_violation());
        assert!(!sig_error.is_recoverable());

        let decrypt_error = ChatError::Crypto(CryptoError::DecryptionFailed);
        assert!(decrypt_error.is_security_violation());

        let timeout = ChatError::Network(NetworkError::ConnectTimeout {
            operation: "connect".to_string(),
        });
        assert!(!timeout.is_security_violation());
    }
}
