//! Directory service interface and an in-memory implementation.
//!
//! The directory maps usernames to node ids, public keys and network
//! addresses, and holds an offline queue of sealed envelopes for users that
//! could not be reached directly.

use crate::crypto::X25519_KEY_LENGTH;
use crate::utils::{ChatError, DirectoryError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// What a node publishes about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Unique handle
    pub username: String,
    /// Stable node identifier
    pub node_id: String,
    /// X25519 public key
    pub encryption_public: [u8; X25519_KEY_LENGTH],
    /// Ed25519 public key
    pub signing_public: [u8; 32],
    /// `host:port` peers should dial
    pub address: String,
}

/// A user as known to the directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryRecord {
    /// Unique handle
    pub username: String,
    /// Stable node identifier
    pub node_id: String,
    /// X25519 public key
    pub encryption_public: [u8; X25519_KEY_LENGTH],
    /// Ed25519 public key
    pub signing_public: [u8; 32],
    /// Last registered `host:port`
    pub address: String,
    /// Last registration or heartbeat
    pub last_seen: DateTime<Utc>,
}

/// A queued message as handed back by the directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineMessage {
    /// Sender username as recorded by the directory (not authenticated)
    pub from: String,
    /// Opaque payload pushed by the sender
    pub ciphertext: Vec<u8>,
}

/// Remote directory and offline queue.
///
/// Implementations must not block the caller's executor thread.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Publish or replace this node's record
    async fn register(&self, registration: &Registration) -> Result<()>;

    /// Refresh `last_seen` and the advertised address
    async fn heartbeat(&self, username: &str, address: &str) -> Result<()>;

    /// Look up a user; `Ok(None)` when the directory has no record
    async fn lookup(&self, username: &str) -> Result<Option<DirectoryRecord>>;

    /// Queue a payload for a user that is not reachable
    async fn push_offline_message(&self, to: &str, from: &str, ciphertext: &[u8]) -> Result<()>;

    /// Fetch and remove every queued payload for `username`
    async fn fetch_offline_messages(&self, username: &str) -> Result<Vec<OfflineMessage>>;
}

#[derive(Default)]
struct MemoryState {
    users: HashMap<String, DirectoryRecord>,
    queues: HashMap<String, Vec<OfflineMessage>>,
}

/// Directory kept entirely in process memory.
///
/// Several nodes in one process can share an `Arc<MemoryDirectory>`. It can
/// be switched offline to simulate an unreachable service.
pub struct MemoryDirectory {
    state: Mutex<MemoryState>,
    available: AtomicBool,
}

impl MemoryDirectory {
    /// Create an empty, available directory
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Make every call fail with `DirectoryError::Unavailable` (or succeed again)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of queued payloads waiting for `username`
    pub async fn pending_offline(&self, username: &str) -> usize {
        self.state.lock().await.queues.get(username).map_or(0, Vec::len)
    }

    /// Overwrite a user's address, e.g. to point it somewhere unreachable
    pub async fn set_address(&self, username: &str, address: &str) -> bool {
        match self.state.lock().await.users.get_mut(username) {
            Some(record) => {
                record.address = address.to_string();
                true
            }
            None => false,
        }
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DirectoryError::Unavailable {
                reason: "directory is offline".to_string(),
            }
            .into())
        }
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DirectoryClient for MemoryDirectory {
    async fn register(&self, registration: &Registration) -> Result<()> {
        self.ensure_available()?;
        let record = DirectoryRecord {
            username: registration.username.clone(),
            node_id: registration.node_id.clone(),
            encryption_public: registration.encryption_public,
            signing_public: registration.signing_public,
            address: registration.address.clone(),
            last_seen: Utc::now(),
        };
        self.state
            .lock()
            .await
            .users
            .insert(registration.username.clone(), record);
        Ok(())
    }

    async fn heartbeat(&self, username: &str, address: &str) -> Result<()> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let record = state.users.get_mut(username).ok_or_else(|| {
            ChatError::from(DirectoryError::BadResponse {
                reason: format!("{username} is not registered"),
            })
        })?;
        record.address = address.to_string();
        record.last_seen = Utc::now();
        Ok(())
    }

    async fn lookup(&self, username: &str) -> Result<Option<DirectoryRecord>> {
        self.ensure_available()?;
        Ok(self.state.lock().await.users.get(username).cloned())
    }

    async fn push_offline_message(&self, to: &str, from: &str, ciphertext: &[u8]) -> Result<()> {
        self.ensure_available()?;
        self.state
            .lock()
            .await
            .queues
            .entry(to.to_string())
            .or_default()
            .push(OfflineMessage {
                from: from.to_string(),
                ciphertext: ciphertext.to_vec(),
            });
        Ok(())
    }

    async fn fetch_offline_messages(&self, username: &str) -> Result<Vec<OfflineMessage>> {
        self.ensure_available()?;
        Ok(self
            .state
            .lock()
            .await
            .queues
            .remove(username)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(username: &str, address: &str) -> Registration {
        Registration {
            username: username.to_string(),
            node_id: format!("{username}-node"),
            encryption_public: [1; 32],
            signing_public: [2; 32],
            address: address.to_string(),
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let directory = MemoryDirectory::new();
        directory.register(&registration("bob", "10.0.0.2:7000")).await.unwrap();

        let record = directory.lookup("bob").await.unwrap().unwrap();
        assert_eq!(record.node_id, "bob-node");
        assert_eq!(record.address, "10.0.0.2:7000");
        assert!(directory.lookup("carol").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_updates_address() {
        let directory = MemoryDirectory::new();
        directory.register(&registration("bob", "10.0.0.2:7000")).await.unwrap();
        directory.heartbeat("bob", "10.0.0.9:7001").await.unwrap();

        assert_eq!(directory.lookup("bob").await.unwrap().unwrap().address, "10.0.0.9:7001");
        assert!(directory.heartbeat("carol", "x:1").await.is_err());
    }

    #[tokio::test]
    async fn test_offline_queue_is_fetch_and_remove() {
        let directory = MemoryDirectory::new();
        directory.push_offline_message("bob", "alice", b"one").await.unwrap();
        directory.push_offline_message("bob", "alice", b"two").await.unwrap();
        assert_eq!(directory.pending_offline("bob").await, 2);

        let fetched = directory.fetch_offline_messages("bob").await.unwrap();
        assert_eq!(fetched.len(), 2);
        assert_eq!(fetched[0].ciphertext, b"one");
        assert_eq!(fetched[1].from, "alice");

        assert!(directory.fetch_offline_messages("bob").await.unwrap().is_empty());
        assert_eq!(directory.pending_offline("bob").await, 0);
    }

    #[tokio::test]
    async fn test_unavailable_directory() {
        let directory = MemoryDirectory::new();
        directory.set_available(false);

        let result = directory.lookup("bob").await;
        assert!(matches!(
            result,
            Err(ChatError::Directory(DirectoryError::Unavailable { .. }))
        ));

        directory.set_available(true);
        assert!(directory.lookup("bob").await.is_ok());
    }
}
