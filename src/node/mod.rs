//! The chat node: routing policy between the transport and the directory.
//!
//! A [`Node`] owns the local identity, the peer transport, the friend cache
//! and a handle to the directory. Outbound messages go direct when a session
//! can be had and fall back to the directory's offline queue when it cannot.
//! Inbound envelopes, whether from a session or the offline queue, are only
//! delivered after the sender's signature verifies against the keys the
//! directory holds for it and the payload decrypts.

pub mod friends;
pub mod history;

pub use friends::{Friend, FriendCache};
pub use history::{ChatHistory, DeliveryRoute, HistoryEntry, MessageDirection};

use crate::crypto::{LocalIdentity, NodeKeys};
use crate::network::{DirectoryClient, Registration};
use crate::session::PeerIdentity;
use crate::transport::{Envelope, EnvelopeKind, PeerTransport, TransportEvent};
use crate::utils::{ChatConfig, ChatError, CryptoError, NetworkError, ProtocolError, Result};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// Delivered `(from_node_id, nonce)` pairs remembered for replay detection
const REPLAY_WINDOW: usize = 4096;

/// A verified, decrypted inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    /// Sender username
    pub from: String,
    /// Sender node id
    pub from_node_id: String,
    /// Message text
    pub text: String,
    /// Sender's timestamp
    pub sent_at: DateTime<Utc>,
    /// Session or offline queue
    pub route: DeliveryRoute,
}

/// Outcome of a successful send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryReport {
    /// Written to an established session
    Direct,
    /// Pushed to the directory's offline queue
    Queued,
}

impl fmt::Display for DeliveryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "delivered directly"),
            Self::Queued => write!(f, "queued offline"),
        }
    }
}

/// Snapshot of node state
#[derive(Debug, Clone)]
pub struct NodeStatus {
    /// Local username
    pub username: String,
    /// Local node id
    pub node_id: String,
    /// Bound listener address
    pub listen_address: SocketAddr,
    /// Address published to the directory
    pub advertised_address: String,
    /// Whether the directory has accepted our registration
    pub registered: bool,
    /// Established peer sessions
    pub active_sessions: usize,
    /// Known friends
    pub friends: usize,
    /// Time since start
    pub uptime: Duration,
}

/// One send in progress
struct OutboundIntent<'a> {
    recipient: Friend,
    plaintext: &'a str,
    attempts: u32,
}

impl<'a> OutboundIntent<'a> {
    fn new(recipient: Friend, plaintext: &'a str) -> Self {
        Self {
            recipient,
            plaintext,
            attempts: 0,
        }
    }
}

#[derive(Default)]
struct ReplayGuard {
    seen: HashSet<(String, Vec<u8>)>,
    order: VecDeque<(String, Vec<u8>)>,
}

impl ReplayGuard {
    /// Record a pair; false if it was already present
    fn insert(&mut self, from_node_id: &str, nonce: &[u8]) -> bool {
        let key = (from_node_id.to_string(), nonce.to_vec());
        if !self.seen.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > REPLAY_WINDOW {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

struct NodeInner {
    config: ChatConfig,
    identity: Arc<LocalIdentity>,
    transport: PeerTransport,
    directory: Arc<dyn DirectoryClient>,
    friends: FriendCache,
    history: ChatHistory,
    replay: Mutex<ReplayGuard>,
    deliveries: mpsc::UnboundedSender<DeliveredMessage>,
    advertised_address: String,
    registered: AtomicBool,
    started_at: Instant,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A running chat node
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Start a node: bind the listener, load friends and history, and spawn
    /// the inbound dispatch, heartbeat and offline-poll tasks.
    ///
    /// Returns the node and the stream of delivered messages.
    pub async fn start(
        config: ChatConfig,
        keys: NodeKeys,
        directory: Arc<dyn DirectoryClient>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DeliveredMessage>)> {
        config.validate()?;
        crate::crypto::init()?;

        let identity = Arc::new(LocalIdentity::new(config.node.username.clone(), keys));
        let listen = format!("{}:{}", config.node.listen_host, config.node.listen_port);
        let (transport, events) = PeerTransport::bind(&listen, Arc::clone(&identity), &config.network).await?;
        let advertised_address = advertised_address(&config, transport.local_addr());

        let friends = FriendCache::open(config.directory.friend_ttl(), &config.storage.friends_file)?;
        let history = ChatHistory::open(&config.storage.history_dir)?;
        let (deliveries, delivered) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let node = Self {
            inner: Arc::new(NodeInner {
                config,
                identity,
                transport,
                directory,
                friends,
                history,
                replay: Mutex::new(ReplayGuard::default()),
                deliveries,
                advertised_address,
                registered: AtomicBool::new(false),
                started_at: Instant::now(),
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        };

        let dispatch = tokio::spawn(node.clone().dispatch_events(events));
        let maintenance = tokio::spawn(node.clone().maintain());
        node.inner.tasks.lock().await.extend([dispatch, maintenance]);

        log::info!(
            "Node {} started as {} on {} (advertising {})",
            node.node_id(),
            node.username(),
            node.local_addr(),
            node.inner.advertised_address
        );
        Ok((node, delivered))
    }

    /// Local username
    pub fn username(&self) -> &str {
        self.inner.identity.username()
    }

    /// Local node id
    pub fn node_id(&self) -> String {
        self.inner.identity.node_id()
    }

    /// Local identity
    pub fn identity(&self) -> &LocalIdentity {
        &self.inner.identity
    }

    /// Bound listener address
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.transport.local_addr()
    }

    /// Publish our identity and address to the directory
    pub async fn register(&self) -> Result<()> {
        let keys = self.inner.identity.keys();
        let registration = Registration {
            username: self.username().to_string(),
            node_id: self.node_id(),
            encryption_public: keys.encryption_public(),
            signing_public: keys.signing_public(),
            address: self.inner.advertised_address.clone(),
        };
        self.inner.directory.register(&registration).await?;
        self.inner.registered.store(true, Ordering::SeqCst);
        log::info!("Registered {} at {}", registration.username, registration.address);
        Ok(())
    }

    /// Refresh our directory entry
    pub async fn heartbeat(&self) -> Result<()> {
        self.inner
            .directory
            .heartbeat(self.username(), &self.inner.advertised_address)
            .await?;
        log::debug!("Heartbeat sent");
        Ok(())
    }

    /// Look `username` up in the directory and cache the result
    ///
    /// # Errors
    ///
    /// `ChatError::UnknownFriend` if the directory has no record
    pub async fn add_friend(&self, username: &str) -> Result<Friend> {
        let friend = self.fetch_friend(username).await?;
        log::info!("Added friend {} ({})", friend.username, friend.fingerprint());
        Ok(friend)
    }

    /// Known friends sorted by username
    pub async fn list_friends(&self) -> Vec<Friend> {
        self.inner.friends.list().await
    }

    /// Send `text` to `to`, directly if possible, else through the offline
    /// queue.
    ///
    /// # Errors
    ///
    /// - `ChatError::UnknownFriend` if `to` cannot be resolved
    /// - `ChatError::DeliveryFailed` if direct delivery failed and the
    ///   offline push failed too
    pub async fn send_message(&self, to: &str, text: &str) -> Result<DeliveryReport> {
        if to == self.username() {
            return Err(ChatError::DeliveryFailed {
                reason: "cannot send a message to yourself".to_string(),
            });
        }

        let friend = self.resolve(to).await?;
        let mut intent = OutboundIntent::new(friend, text);

        let report = match self.send_direct(&mut intent).await {
            Ok(()) => DeliveryReport::Direct,
            Err(e) if e.triggers_offline_fallback() => {
                log::warn!(
                    "Direct delivery to {to} failed after {} attempt(s): {e}; using offline queue",
                    intent.attempts
                );
                self.send_offline(&intent).await?;
                DeliveryReport::Queued
            }
            Err(e) => return Err(e),
        };

        let route = match report {
            DeliveryReport::Direct => DeliveryRoute::Direct,
            DeliveryReport::Queued => DeliveryRoute::Offline,
        };
        self.remember(HistoryEntry::new(to, MessageDirection::Sent, route, text, Utc::now()))
            .await;
        Ok(report)
    }

    /// Verify, decrypt and deliver an envelope that arrived over a session.
    ///
    /// `claimed_sender` is the username the sender presented, used to resolve
    /// it through the directory if it is not yet a known friend; it is never
    /// trusted on its own.
    pub async fn receive_envelope(
        &self,
        envelope: Envelope,
        claimed_sender: Option<&str>,
    ) -> Result<DeliveredMessage> {
        self.accept(envelope, claimed_sender, DeliveryRoute::Direct).await
    }

    /// Drain the offline queue, delivering every payload that verifies.
    ///
    /// Returns how many messages were delivered.
    pub async fn fetch_offline_messages(&self) -> Result<usize> {
        let queued = self
            .inner
            .directory
            .fetch_offline_messages(self.username())
            .await?;
        if queued.is_empty() {
            return Ok(0);
        }

        log::info!("Fetched {} offline message(s)", queued.len());
        let mut delivered = 0;
        for message in queued {
            let result = match Envelope::from_bytes(&message.ciphertext) {
                Ok(envelope) => self.accept(envelope, Some(&message.from), DeliveryRoute::Offline).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(_) => delivered += 1,
                Err(e) => log::warn!("Dropped offline message claiming to be from {}: {e}", message.from),
            }
        }
        Ok(delivered)
    }

    /// The most recent `limit` messages exchanged with `peer`
    pub async fn history(&self, peer: &str, limit: usize) -> Vec<HistoryEntry> {
        self.inner.history.history(peer, limit).await
    }

    /// Current state
    pub async fn status(&self) -> NodeStatus {
        NodeStatus {
            username: self.username().to_string(),
            node_id: self.node_id(),
            listen_address: self.local_addr(),
            advertised_address: self.inner.advertised_address.clone(),
            registered: self.inner.registered.load(Ordering::SeqCst),
            active_sessions: self.inner.transport.active_sessions().await.len(),
            friends: self.inner.friends.len().await,
            uptime: self.inner.started_at.elapsed(),
        }
    }

    /// Stop background tasks, close every session and persist friends
    pub async fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        self.inner.transport.close().await;
        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
        }
        if let Err(e) = self.inner.friends.save().await {
            log::warn!("Could not save friends: {e}");
        }
        log::info!("Node {} stopped", self.username());
    }

    async fn fetch_friend(&self, username: &str) -> Result<Friend> {
        let record = self
            .inner
            .directory
            .lookup(username)
            .await?
            .ok_or_else(|| ChatError::UnknownFriend {
                username: username.to_string(),
            })?;
        if record.node_id == self.node_id() {
            return Err(ChatError::DeliveryFailed {
                reason: format!("{username} resolves to this node"),
            });
        }

        let friend = Friend::from_record(record);
        if let Err(e) = self.inner.friends.upsert(friend.clone()).await {
            log::warn!("Could not persist friend {username}: {e}");
        }
        Ok(friend)
    }

    /// Cached friend if fresh, else a directory lookup. A stale entry is used
    /// when the directory cannot be reached.
    async fn resolve(&self, username: &str) -> Result<Friend> {
        if let Some(friend) = self.inner.friends.fresh(username).await {
            return Ok(friend);
        }
        match self.fetch_friend(username).await {
            Ok(friend) => Ok(friend),
            Err(ChatError::Directory(e)) => match self.inner.friends.get(username).await {
                Some(stale) => {
                    log::warn!("Directory unavailable ({e}); using cached record for {username}");
                    Ok(stale)
                }
                None => Err(ChatError::Directory(e)),
            },
            Err(e) => Err(e),
        }
    }

    async fn send_direct(&self, intent: &mut OutboundIntent<'_>) -> Result<()> {
        intent.attempts += 1;
        let friend = &intent.recipient;
        if friend.address.is_empty() {
            return Err(NetworkError::InvalidAddress {
                address: String::new(),
            }
            .into());
        }

        let session = self
            .inner
            .transport
            .session_for(&friend.identity(), &friend.address)
            .await?;
        let envelope = self.seal(intent)?;
        // Each frame write is bounded by the session; this also covers
        // time spent queued behind earlier writes.
        let bound = self.inner.config.network.write_timeout() * 2;
        match tokio::time::timeout(bound, session.send(envelope)).await {
            Ok(written) => written?,
            Err(_) => {
                session.close();
                return Err(NetworkError::ConnectTimeout {
                    operation: format!("send to {}", friend.username),
                }
                .into());
            }
        }
        log::debug!("Sent message to {} over session {}", friend.username, session.id());
        Ok(())
    }

    async fn send_offline(&self, intent: &OutboundIntent<'_>) -> Result<()> {
        let payload = self.seal(intent)?.to_bytes()?;
        self.inner
            .directory
            .push_offline_message(&intent.recipient.username, self.username(), &payload)
            .await
            .map_err(|e| ChatError::DeliveryFailed {
                reason: format!("offline queue rejected the message: {e}"),
            })?;
        log::info!("Queued message for {} offline", intent.recipient.username);
        Ok(())
    }

    fn seal(&self, intent: &OutboundIntent<'_>) -> Result<Envelope> {
        Envelope::seal_message(
            &self.inner.identity,
            &intent.recipient.node_id,
            &intent.recipient.encryption_public,
            intent.plaintext.as_bytes(),
        )
    }

    async fn accept(
        &self,
        envelope: Envelope,
        claimed_sender: Option<&str>,
        route: DeliveryRoute,
    ) -> Result<DeliveredMessage> {
        if envelope.kind != EnvelopeKind::Message {
            return Err(ProtocolError::UnexpectedEnvelope {
                reason: format!("{} is not deliverable", envelope.kind_name()),
            }
            .into());
        }
        if envelope.to_node_id != self.node_id() {
            return Err(ProtocolError::UnexpectedEnvelope {
                reason: format!("addressed to {}", envelope.to_node_id),
            }
            .into());
        }
        envelope.check_timestamp(self.inner.config.network.max_clock_skew())?;

        let sender = self.sender_of(&envelope, claimed_sender).await?;
        if !envelope.verify_signature(&sender.signing_public) {
            return Err(CryptoError::SignatureVerification.into());
        }
        let plaintext = envelope.open_message(&self.inner.identity, &sender.encryption_public)?;
        let text = String::from_utf8(plaintext).map_err(|_| ProtocolError::UnexpectedEnvelope {
            reason: "payload is not UTF-8 text".to_string(),
        })?;

        if !self.inner.replay.lock().await.insert(&envelope.from_node_id, &envelope.nonce) {
            return Err(ProtocolError::ReplayDetected {
                node_id: envelope.from_node_id,
            }
            .into());
        }

        let sent_at = Utc
            .timestamp_millis_opt(envelope.timestamp)
            .single()
            .unwrap_or_else(Utc::now);
        let message = DeliveredMessage {
            from: sender.username.clone(),
            from_node_id: sender.node_id.clone(),
            text,
            sent_at,
            route,
        };
        self.remember(HistoryEntry::new(
            &sender.username,
            MessageDirection::Received,
            route,
            &message.text,
            sent_at,
        ))
        .await;

        log::info!("Message from {} ({:?})", sender.username, route);
        if self.inner.deliveries.send(message.clone()).is_err() {
            log::debug!("No delivery receiver; message from {} only recorded", sender.username);
        }
        Ok(message)
    }

    /// The friend whose keys must authenticate `envelope`
    async fn sender_of(&self, envelope: &Envelope, claimed_sender: Option<&str>) -> Result<Friend> {
        if let Some(friend) = self.inner.friends.by_node_id(&envelope.from_node_id).await {
            return Ok(friend);
        }
        let unknown = || ChatError::UnknownFriend {
            username: claimed_sender.unwrap_or(&envelope.from_node_id).to_string(),
        };
        let claimed = claimed_sender.ok_or_else(unknown)?;
        let friend = self.fetch_friend(claimed).await?;
        if friend.node_id != envelope.from_node_id {
            return Err(unknown());
        }
        Ok(friend)
    }

    async fn remember(&self, entry: HistoryEntry) {
        if let Err(e) = self.inner.history.record(entry).await {
            log::warn!("Could not record history: {e}");
        }
    }

    /// Route inbound envelopes to one worker per sender.
    ///
    /// Resolving an unknown sender may wait on the directory; a worker per
    /// peer keeps that wait from holding up other peers while each peer's
    /// envelopes are still handled in arrival order.
    async fn dispatch_events(self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut inboxes: HashMap<String, mpsc::UnboundedSender<Envelope>> = HashMap::new();
        loop {
            let event = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };
            match event {
                TransportEvent::Envelope { peer, envelope } => {
                    let inbox = inboxes
                        .entry(peer.node_id.clone())
                        .or_insert_with(|| self.clone().spawn_inbox(peer.clone()));
                    if let Err(mpsc::error::SendError(envelope)) = inbox.send(envelope) {
                        // Worker gone; start a fresh one.
                        let inbox = self.clone().spawn_inbox(peer.clone());
                        let _ = inbox.send(envelope);
                        inboxes.insert(peer.node_id.clone(), inbox);
                    }
                }
                TransportEvent::SessionEstablished { peer, direction } => {
                    log::debug!("Session with {peer} up ({direction})");
                }
                TransportEvent::SessionClosed { peer, reason } => {
                    log::debug!("Session with {peer} down: {reason}");
                    // The worker drains what is queued, then exits.
                    inboxes.remove(&peer.node_id);
                }
            }
        }
    }

    fn spawn_inbox(self, peer: PeerIdentity) -> mpsc::UnboundedSender<Envelope> {
        let (inbox, mut envelopes) = mpsc::unbounded_channel::<Envelope>();
        tokio::spawn(async move {
            while let Some(envelope) = envelopes.recv().await {
                if let Err(e) = self.receive_envelope(envelope, Some(&peer.username)).await {
                    log::warn!("Dropped envelope from {peer}: {e}");
                }
            }
        });
        inbox
    }

    async fn maintain(self) {
        let directory = &self.inner.config.directory;
        let mut heartbeat = tokio::time::interval(directory.heartbeat_interval());
        let mut poll = tokio::time::interval(directory.offline_poll_interval());
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut shutdown = self.inner.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let result = if self.inner.registered.load(Ordering::SeqCst) {
                        self.heartbeat().await
                    } else {
                        self.register().await
                    };
                    if let Err(e) = result {
                        log::warn!("Directory update failed, retrying next cycle: {e}");
                    }
                }
                _ = poll.tick() => {
                    if let Err(e) = self.fetch_offline_messages().await {
                        log::warn!("Offline queue poll failed, retrying next cycle: {e}");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

/// Configured advertise address, else the bound address with an unspecified
/// IP replaced by loopback.
fn advertised_address(config: &ChatConfig, bound: SocketAddr) -> String {
    if let Some(address) = &config.node.advertise_address {
        return address.clone();
    }
    if bound.ip().is_unspecified() {
        log::warn!("Listening on all interfaces; set node.advertise_address so peers can reach this node");
        return format!("127.0.0.1:{}", bound.port());
    }
    bound.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MemoryDirectory;
    use crate::utils::StorageConfig;

    fn config(username: &str, dir: &std::path::Path) -> ChatConfig {
        let mut config = ChatConfig::default();
        config.node.username = username.to_string();
        config.node.listen_host = "127.0.0.1".to_string();
        config.node.listen_port = 0;
        config.storage = StorageConfig::under(dir.join(username));
        config
    }

    async fn start_with(
        config: ChatConfig,
        directory: &Arc<MemoryDirectory>,
    ) -> (Node, mpsc::UnboundedReceiver<DeliveredMessage>) {
        let directory: Arc<dyn DirectoryClient> = directory.clone();
        let (node, delivered) = Node::start(config, NodeKeys::generate().unwrap(), directory)
            .await
            .unwrap();
        node.register().await.unwrap();
        (node, delivered)
    }

    async fn start(
        username: &str,
        dir: &std::path::Path,
        directory: &Arc<MemoryDirectory>,
    ) -> (Node, mpsc::UnboundedReceiver<DeliveredMessage>) {
        start_with(config(username, dir), directory).await
    }

    #[test]
    fn test_replay_guard_window() {
        let mut guard = ReplayGuard::default();
        assert!(guard.insert("a", &[1]));
        assert!(!guard.insert("a", &[1]));
        assert!(guard.insert("b", &[1]));

        for i in 0..REPLAY_WINDOW {
            guard.insert("c", &i.to_be_bytes());
        }
        // Oldest entries have been evicted.
        assert!(guard.insert("a", &[1]));
    }

    #[test]
    fn test_advertised_address() {
        let mut config = ChatConfig::default();
        let bound: SocketAddr = "0.0.0.0:7000".parse().unwrap();
        assert_eq!(advertised_address(&config, bound), "127.0.0.1:7000");

        let bound: SocketAddr = "10.1.2.3:7000".parse().unwrap();
        assert_eq!(advertised_address(&config, bound), "10.1.2.3:7000");

        config.node.advertise_address = Some("chat.example.org:7000".to_string());
        assert_eq!(advertised_address(&config, bound), "chat.example.org:7000");
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let directory: Arc<dyn DirectoryClient> = Arc::new(MemoryDirectory::new());
        let mut bad = config("alice", dir.path());
        bad.node.username = String::new();
        assert!(Node::start(bad, NodeKeys::generate().unwrap(), directory).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_recipient() {
        let dir = tempfile::tempdir().unwrap();
        let directory = Arc::new(MemoryDirectory::new());
        let (alice, _delivered) = start("alice", dir.path(), &directory).await;

        let result = alice.send_message("nobody", "hi").await;
        assert!(matches!(result, Err(ChatError::UnknownFriend { .. })));
        assert!(matches!(
            alice.add_friend("nobody").await,
            Err(ChatError::UnknownFriend { .. })
        ));
        alice.shutdown().await;
    }

    #[tokio::test]
    async fn test_stale_friend_used_when_directory_down() {
        let dir = tempfile::tempdir().unwrap();
        let directory = Arc::new(MemoryDirectory::new());
        let mut stale = config("alice", dir.path());
        stale.directory.friend_ttl_secs = 0;
        let (alice, _a) = start_with(stale, &directory).await;
        let (bob, mut delivered) = start("bob", dir.path(), &directory).await;

        alice.add_friend("bob").await.unwrap();
        bob.add_friend("alice").await.unwrap();
        directory.set_available(false);

        let friend = alice.resolve("bob").await.unwrap();
        assert_eq!(friend.node_id, bob.node_id());

        let report = alice.send_message("bob", "still here").await.unwrap();
        assert_eq!(report, DeliveryReport::Direct);
        let message = tokio::time::timeout(Duration::from_secs(5), delivered.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.text, "still here");

        alice.shutdown().await;
        bob.shutdown().await;
    }

    #[tokio::test]
    async fn test_replayed_envelope_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let directory = Arc::new(MemoryDirectory::new());
        let (alice, _a) = start("alice", dir.path(), &directory).await;
        let (bob, _b) = start("bob", dir.path(), &directory).await;

        let envelope = Envelope::seal_message(
            alice.identity(),
            &bob.node_id(),
            &bob.identity().keys().encryption_public(),
            b"once",
        )
        .unwrap();

        let first = bob.receive_envelope(envelope.clone(), Some("alice")).await.unwrap();
        assert_eq!(first.text, "once");
        assert_eq!(first.from, "alice");
        assert!(matches!(
            bob.receive_envelope(envelope, Some("alice")).await,
            Err(ChatError::Protocol(ProtocolError::ReplayDetected { .. }))
        ));

        alice.shutdown().await;
        bob.shutdown().await;
    }

    #[tokio::test]
    async fn test_self_asserted_sender_not_trusted() {
        let dir = tempfile::tempdir().unwrap();
        let directory = Arc::new(MemoryDirectory::new());
        let (alice, _a) = start("alice", dir.path(), &directory).await;
        let (bob, mut delivered) = start("bob", dir.path(), &directory).await;
        let mallory = LocalIdentity::new("mallory", NodeKeys::generate().unwrap());

        // Mallory claims to be alice but signs with her own key.
        let mut envelope = Envelope::seal_message(
            &mallory,
            &bob.node_id(),
            &bob.identity().keys().encryption_public(),
            b"trust me",
        )
        .unwrap();
        envelope.from_node_id = alice.node_id();
        envelope.sign(&mallory);

        let result = bob.receive_envelope(envelope, Some("alice")).await;
        assert!(matches!(
            result,
            Err(ChatError::Crypto(CryptoError::SignatureVerification))
        ));

        // Unregistered sender with no claimed username.
        let stranger = Envelope::seal_message(
            &mallory,
            &bob.node_id(),
            &bob.identity().keys().encryption_public(),
            b"hello?",
        )
        .unwrap();
        assert!(matches!(
            bob.receive_envelope(stranger, None).await,
            Err(ChatError::UnknownFriend { .. })
        ));
        assert!(delivered.try_recv().is_err());

        alice.shutdown().await;
        bob.shutdown().await;
    }

    #[tokio::test]
    async fn test_status() {
        let dir = tempfile::tempdir().unwrap();
        let directory = Arc::new(MemoryDirectory::new());
        let (alice, _a) = start("alice", dir.path(), &directory).await;
        let (_bob, _b) = start("bob", dir.path(), &directory).await;
        alice.add_friend("bob").await.unwrap();

        let status = alice.status().await;
        assert_eq!(status.username, "alice");
        assert!(status.registered);
        assert_eq!(status.friends, 1);
        assert_eq!(status.listen_address, alice.local_addr());
        assert_eq!(status.advertised_address, alice.local_addr().to_string());

        alice.shutdown().await;
    }
}
