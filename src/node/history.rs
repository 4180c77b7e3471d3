//! Per-peer chat history.
//!
//! Entries are kept in memory and appended to one JSON-lines file per peer.

use crate::utils::{ChatError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Which way a message went
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    /// Written by the local user
    Sent,
    /// Written by the peer
    Received,
}

/// How a message travelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryRoute {
    /// Over a peer session
    Direct,
    /// Through the directory's offline queue
    Offline,
}

/// One recorded message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Local identifier
    pub id: Uuid,
    /// The other party's username
    pub peer: String,
    /// Sent or received
    pub direction: MessageDirection,
    /// Route taken
    pub route: DeliveryRoute,
    /// Message text
    pub text: String,
    /// Sender's timestamp
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    /// New entry stamped with `timestamp`
    pub fn new(
        peer: &str,
        direction: MessageDirection,
        route: DeliveryRoute,
        text: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer: peer.to_string(),
            direction,
            route,
            text: text.to_string(),
            timestamp,
        }
    }
}

/// Chat history store
pub struct ChatHistory {
    dir: Option<PathBuf>,
    entries: RwLock<HashMap<String, Vec<HistoryEntry>>>,
}

impl ChatHistory {
    /// History kept only in memory
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// History persisted under `dir`, loading any existing files
    pub fn open<P: Into<PathBuf>>(dir: P) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut entries: HashMap<String, Vec<HistoryEntry>> = HashMap::new();
        for item in std::fs::read_dir(&dir)? {
            let path = item?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            for entry in read_log(&path)? {
                entries.entry(entry.peer.clone()).or_default().push(entry);
            }
        }
        for messages in entries.values_mut() {
            messages.sort_by_key(|entry| entry.timestamp);
        }

        Ok(Self {
            dir: Some(dir),
            entries: RwLock::new(entries),
        })
    }

    /// Append an entry
    pub async fn record(&self, entry: HistoryEntry) -> Result<()> {
        // Held across the write so lines land in record order.
        let mut entries = self.entries.write().await;
        if let Some(dir) = &self.dir {
            let path = dir.join(log_file_name(&entry.peer));
            let mut line = serde_json::to_vec(&entry)?;
            line.push(b'\n');
            tokio::task::spawn_blocking(move || append_line(&path, &line))
                .await
                .map_err(|e| ChatError::unexpected(e.to_string()))??;
        }
        entries.entry(entry.peer.clone()).or_default().push(entry);
        Ok(())
    }

    /// The most recent `limit` entries with `peer`, oldest first
    pub async fn history(&self, peer: &str, limit: usize) -> Vec<HistoryEntry> {
        let entries = self.entries.read().await;
        let Some(messages) = entries.get(peer) else {
            return Vec::new();
        };
        let start = messages.len().saturating_sub(limit);
        messages[start..].to_vec()
    }

    /// Peers with any recorded history
    pub async fn peers(&self) -> Vec<String> {
        let mut peers: Vec<_> = self.entries.read().await.keys().cloned().collect();
        peers.sort();
        peers
    }
}

fn read_log(path: &Path) -> Result<Vec<HistoryEntry>> {
    let reader = BufReader::new(std::fs::File::open(path)?);
    let mut entries = Vec::new();
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => log::warn!("Skipping line {} of {}: {e}", number + 1, path.display()),
        }
    }
    Ok(entries)
}

fn append_line(path: &Path, line: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line)?;
    Ok(())
}

fn log_file_name(peer: &str) -> String {
    let safe: String = peer
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{safe}.jsonl")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(peer: &str, text: &str, direction: MessageDirection) -> HistoryEntry {
        HistoryEntry::new(peer, direction, DeliveryRoute::Direct, text, Utc::now())
    }

    #[tokio::test]
    async fn test_history_limit_keeps_latest() {
        let history = ChatHistory::in_memory();
        for i in 0..5 {
            history
                .record(entry("bob", &format!("m{i}"), MessageDirection::Sent))
                .await
                .unwrap();
        }

        let latest = history.history("bob", 2).await;
        let texts: Vec<_> = latest.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, ["m3", "m4"]);
        assert!(history.history("carol", 10).await.is_empty());
    }

    #[tokio::test]
    async fn test_history_persists() {
        let dir = tempfile::tempdir().unwrap();
        {
            let history = ChatHistory::open(dir.path()).unwrap();
            history.record(entry("bob", "hi", MessageDirection::Sent)).await.unwrap();
            history
                .record(entry("bob", "hello", MessageDirection::Received))
                .await
                .unwrap();
            history.record(entry("carol", "yo", MessageDirection::Sent)).await.unwrap();
        }

        let reopened = ChatHistory::open(dir.path()).unwrap();
        let bob = reopened.history("bob", 10).await;
        assert_eq!(bob.len(), 2);
        assert_eq!(bob[1].direction, MessageDirection::Received);
        assert_eq!(reopened.peers().await, ["bob", "carol"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_records_all_persist() {
        let dir = tempfile::tempdir().unwrap();
        let history = std::sync::Arc::new(ChatHistory::open(dir.path()).unwrap());

        let writers: Vec<_> = (0..16)
            .map(|i| {
                let history = history.clone();
                tokio::spawn(async move {
                    history
                        .record(entry("bob", &format!("m{i}"), MessageDirection::Received))
                        .await
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }
        assert_eq!(history.history("bob", 100).await.len(), 16);
        drop(history);

        let reopened = ChatHistory::open(dir.path()).unwrap();
        let mut texts: Vec<_> = reopened.history("bob", 100).await.into_iter().map(|e| e.text).collect();
        texts.sort();
        let mut expected: Vec<_> = (0..16).map(|i| format!("m{i}")).collect();
        expected.sort();
        assert_eq!(texts, expected);
    }

    #[tokio::test]
    async fn test_corrupt_line_skipped() {
        let dir = tempfile::tempdir().unwrap();
        {
            let history = ChatHistory::open(dir.path()).unwrap();
            history.record(entry("bob", "kept", MessageDirection::Sent)).await.unwrap();
        }
        let path = dir.path().join("bob.jsonl");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{not json\n").unwrap();

        let reopened = ChatHistory::open(dir.path()).unwrap();
        assert_eq!(reopened.history("bob", 10).await.len(), 1);
    }

    #[test]
    fn test_file_name_is_sanitised() {
        assert_eq!(log_file_name("bob"), "bob.jsonl");
        assert_eq!(log_file_name("../etc/passwd"), "___etc_passwd.jsonl");
    }
}
