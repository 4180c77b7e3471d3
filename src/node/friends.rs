//! Friend records and the TTL cache that holds them.

use crate::crypto::X25519_KEY_LENGTH;
use crate::network::DirectoryRecord;
use crate::session::PeerIdentity;
use crate::utils::{ChatError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

/// A peer resolved through the directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Friend {
    /// Unique handle
    pub username: String,
    /// Stable node identifier
    pub node_id: String,
    /// X25519 public key
    #[serde(with = "key_b64")]
    pub encryption_public: [u8; X25519_KEY_LENGTH],
    /// Ed25519 public key
    #[serde(with = "key_b64")]
    pub signing_public: [u8; 32],
    /// Last known `host:port`
    pub address: String,
    /// When the directory last heard from this peer
    pub last_seen: DateTime<Utc>,
    /// When this record was fetched; `None` for records reloaded from disk
    #[serde(skip)]
    fetched_at: Option<Instant>,
}

impl Friend {
    /// Build a fresh record from a directory lookup
    pub fn from_record(record: DirectoryRecord) -> Self {
        Self {
            username: record.username,
            node_id: record.node_id,
            encryption_public: record.encryption_public,
            signing_public: record.signing_public,
            address: record.address,
            last_seen: record.last_seen,
            fetched_at: Some(Instant::now()),
        }
    }

    /// Identity a session with this friend must prove
    pub fn identity(&self) -> PeerIdentity {
        PeerIdentity {
            node_id: self.node_id.clone(),
            username: self.username.clone(),
            encryption_public: self.encryption_public,
            signing_public: self.signing_public,
        }
    }

    /// True if fetched less than `ttl` ago
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.is_some_and(|fetched| fetched.elapsed() < ttl)
    }

    /// True if both public keys equal `other`'s
    pub fn same_keys(&self, other: &Friend) -> bool {
        self.encryption_public == other.encryption_public && self.signing_public == other.signing_public
    }

    /// Short hex fingerprint of the signing key
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.signing_public[..8])
    }
}

mod key_b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(key: &[u8; N], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = STANDARD.decode(text).map_err(D::Error::custom)?;
        <[u8; N]>::try_from(bytes.as_slice())
            .map_err(|_| D::Error::custom(format!("expected {N} key bytes, got {}", bytes.len())))
    }
}

/// Username-keyed friend cache, optionally persisted as JSON.
///
/// Entries are replaced whole, so readers never see a mix of old and new
/// keys for one friend.
pub struct FriendCache {
    entries: RwLock<HashMap<String, Friend>>,
    ttl: Duration,
    path: Option<PathBuf>,
    save_lock: Mutex<()>,
}

impl FriendCache {
    /// Empty in-memory cache
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            path: None,
            save_lock: Mutex::new(()),
        }
    }

    /// Cache backed by `path`, preloaded from it when present.
    ///
    /// Reloaded entries count as stale and are refreshed on first use.
    pub fn open<P: Into<PathBuf>>(ttl: Duration, path: P) -> Result<Self> {
        let path = path.into();
        let mut entries = HashMap::new();
        if path.exists() {
            let contents = std::fs::read(&path)?;
            let friends: Vec<Friend> = serde_json::from_slice(&contents)?;
            log::debug!("Loaded {} friends from {}", friends.len(), path.display());
            entries = friends.into_iter().map(|f| (f.username.clone(), f)).collect();
        }
        Ok(Self {
            entries: RwLock::new(entries),
            ttl,
            path: Some(path),
            save_lock: Mutex::new(()),
        })
    }

    /// Freshness window
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached record regardless of age
    pub async fn get(&self, username: &str) -> Option<Friend> {
        self.entries.read().await.get(username).cloned()
    }

    /// Cached record if still fresh
    pub async fn fresh(&self, username: &str) -> Option<Friend> {
        self.get(username).await.filter(|friend| friend.is_fresh(self.ttl))
    }

    /// Cached record for a node id
    pub async fn by_node_id(&self, node_id: &str) -> Option<Friend> {
        self.entries
            .read()
            .await
            .values()
            .find(|friend| friend.node_id == node_id)
            .cloned()
    }

    /// Insert or replace a record, then persist
    pub async fn upsert(&self, friend: Friend) -> Result<()> {
        {
            let mut entries = self.entries.write().await;
            if let Some(previous) = entries.get(&friend.username) {
                if !previous.same_keys(&friend) || previous.node_id != friend.node_id {
                    log::warn!(
                        "Keys for {} changed (fingerprint {} -> {})",
                        friend.username,
                        previous.fingerprint(),
                        friend.fingerprint()
                    );
                }
            }
            entries.insert(friend.username.clone(), friend);
        }
        self.save().await
    }

    /// All records sorted by username
    pub async fn list(&self) -> Vec<Friend> {
        let mut friends: Vec<_> = self.entries.read().await.values().cloned().collect();
        friends.sort_by(|a, b| a.username.cmp(&b.username));
        friends
    }

    /// Number of records
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// True if there are no records
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Write the cache to its backing file, if it has one
    pub async fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _saving = self.save_lock.lock().await;
        let contents = serde_json::to_vec_pretty(&self.list().await)?;
        let path = path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &contents))
            .await
            .map_err(|e| ChatError::unexpected(e.to_string()))?
    }
}

fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(username: &str, key: u8) -> DirectoryRecord {
        DirectoryRecord {
            username: username.to_string(),
            node_id: format!("{username}-node"),
            encryption_public: [key; 32],
            signing_public: [key.wrapping_add(1); 32],
            address: "127.0.0.1:7000".to_string(),
            last_seen: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_fresh_and_stale() {
        let cache = FriendCache::new(Duration::from_millis(50));
        cache.upsert(Friend::from_record(record("bob", 1))).await.unwrap();

        assert!(cache.fresh("bob").await.is_some());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.fresh("bob").await.is_none());
        assert!(cache.get("bob").await.is_some());
    }

    #[tokio::test]
    async fn test_lookup_by_node_id() {
        let cache = FriendCache::new(Duration::from_secs(60));
        cache.upsert(Friend::from_record(record("bob", 1))).await.unwrap();
        cache.upsert(Friend::from_record(record("carol", 3))).await.unwrap();

        assert_eq!(cache.by_node_id("carol-node").await.unwrap().username, "carol");
        assert!(cache.by_node_id("dave-node").await.is_none());
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_upsert_replaces_whole_entry() {
        let cache = FriendCache::new(Duration::from_secs(60));
        cache.upsert(Friend::from_record(record("bob", 1))).await.unwrap();
        cache.upsert(Friend::from_record(record("bob", 9))).await.unwrap();

        let bob = cache.get("bob").await.unwrap();
        assert_eq!(bob.encryption_public, [9; 32]);
        assert_eq!(bob.signing_public, [10; 32]);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_persisted_entries_reload_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("friends.json");

        let cache = FriendCache::open(Duration::from_secs(60), &path).unwrap();
        cache.upsert(Friend::from_record(record("bob", 1))).await.unwrap();

        let reloaded = FriendCache::open(Duration::from_secs(60), &path).unwrap();
        let bob = reloaded.get("bob").await.unwrap();
        assert_eq!(bob.encryption_public, [1; 32]);
        assert!(reloaded.fresh("bob").await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_upserts_all_saved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("friends.json");
        let cache = std::sync::Arc::new(FriendCache::open(Duration::from_secs(60), &path).unwrap());

        let writers: Vec<_> = (0..12u8)
            .map(|i| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    let friend = Friend::from_record(record(&format!("friend{i}"), i));
                    cache.upsert(friend).await
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let reloaded = FriendCache::open(Duration::from_secs(60), &path).unwrap();
        assert_eq!(reloaded.len().await, 12);
        assert_eq!(reloaded.get("friend7").await.unwrap().encryption_public, [7; 32]);
    }

    #[test]
    fn test_keys_serialized_as_base64() {
        let friend = Friend::from_record(record("bob", 1));
        let json = serde_json::to_value(&friend).unwrap();
        assert!(json["encryption_public"].is_string());

        let mut broken = json.clone();
        broken["signing_public"] = serde_json::Value::String("AAAA".to_string());
        assert!(serde_json::from_value::<Friend>(broken).is_err());
    }
}
