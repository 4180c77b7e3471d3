//! TCP peer transport.
//!
//! [`PeerTransport`] listens for inbound connections, dials peers on demand
//! and keeps at most one established session per peer node. Everything the
//! sessions receive is reported as [`TransportEvent`]s on a single channel.

use crate::crypto::LocalIdentity;
use crate::session::{
    CloseReason, PeerIdentity, PeerSession, SessionDirection, SessionHandle, SessionSettings,
};
use crate::transport::Envelope;
use crate::utils::{NetworkConfig, NetworkError, ProtocolError, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex, RwLock};

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Notifications from the transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A `MESSAGE` envelope arrived on an established session
    Envelope {
        /// Peer the session was established with
        peer: PeerIdentity,
        /// The envelope as received
        envelope: Envelope,
    },
    /// A session was established and registered
    SessionEstablished {
        /// Proven peer identity
        peer: PeerIdentity,
        /// Which side dialled
        direction: SessionDirection,
    },
    /// A registered session ended
    SessionClosed {
        /// Peer the session was with
        peer: PeerIdentity,
        /// Why it ended
        reason: CloseReason,
    },
}

/// Snapshot of one registered session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Session identifier
    pub id: u64,
    /// Proven peer identity
    pub peer: PeerIdentity,
    /// Which side dialled
    pub direction: SessionDirection,
    /// Registration time
    pub established_at: chrono::DateTime<chrono::Utc>,
}

struct Registered {
    handle: SessionHandle,
    established_at: chrono::DateTime<chrono::Utc>,
}

struct Inner {
    local: Arc<LocalIdentity>,
    local_id: String,
    settings: SessionSettings,
    max_sessions: usize,
    local_addr: SocketAddr,
    sessions: RwLock<HashMap<String, Registered>>,
    dialing: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: watch::Sender<bool>,
    next_id: AtomicU64,
}

/// Listens for and dials peer sessions
#[derive(Clone)]
pub struct PeerTransport {
    inner: Arc<Inner>,
}

impl PeerTransport {
    /// Start listening on `listen` and return the transport with its event
    /// stream.
    pub async fn bind(
        listen: &str,
        local: Arc<LocalIdentity>,
        config: &NetworkConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|e| NetworkError::Transport {
                reason: format!("cannot listen on {listen}: {e}"),
            })?;
        let local_addr = listener.local_addr()?;
        let (events, receiver) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            local_id: local.node_id(),
            local,
            settings: SessionSettings::from(config),
            max_sessions: config.max_sessions,
            local_addr,
            sessions: RwLock::new(HashMap::new()),
            dialing: Mutex::new(HashMap::new()),
            events,
            shutdown,
            next_id: AtomicU64::new(1),
        });

        tokio::spawn(accept_loop(Arc::clone(&inner), listener));
        log::info!("Listening for peers on {local_addr}");

        Ok((Self { inner }, receiver))
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// True once [`PeerTransport::close`] has run
    pub fn is_closed(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Established session with `node_id`, if any
    pub async fn established(&self, node_id: &str) -> Option<SessionHandle> {
        self.inner.established(node_id).await
    }

    /// Return the established session to `peer`, dialling `address` if there
    /// is none.
    ///
    /// Concurrent callers for the same peer share one connection attempt. The
    /// attempt is bounded by the connect and handshake timeouts and is
    /// abandoned if the transport is closed meanwhile.
    pub async fn session_for(&self, peer: &PeerIdentity, address: &str) -> Result<SessionHandle> {
        self.ensure_open()?;
        if let Some(handle) = self.inner.established(&peer.node_id).await {
            return Ok(handle);
        }

        let lock = self.inner.dial_lock(&peer.node_id).await;
        let dialled = {
            let _dialing = lock.lock().await;
            self.dial(peer, address).await
        };
        self.inner.release_dial_lock(&peer.node_id, lock).await;
        dialled
    }

    /// Dial and register a session; the caller holds the peer's dial lock
    async fn dial(&self, peer: &PeerIdentity, address: &str) -> Result<SessionHandle> {
        if let Some(handle) = self.inner.established(&peer.node_id).await {
            return Ok(handle);
        }
        if self.inner.session_count().await >= self.inner.max_sessions {
            return Err(NetworkError::Transport {
                reason: format!("session limit of {} reached", self.inner.max_sessions),
            }
            .into());
        }

        let mut shutdown = self.inner.shutdown.subscribe();
        let local = Arc::clone(&self.inner.local);
        let settings = self.inner.settings.clone();
        let dial = async move {
            let mut session = PeerSession::connect(address, local, settings).await?;
            session.handshake(Some(peer)).await?;
            Ok::<_, crate::ChatError>(session)
        };

        let session = tokio::select! {
            dialled = dial => dialled?,
            _ = shutdown.changed() => return Err(closed()),
        };
        self.inner.register(session).await
    }

    /// Snapshot of established sessions
    pub async fn active_sessions(&self) -> Vec<SessionInfo> {
        self.inner
            .sessions
            .read()
            .await
            .values()
            .filter(|entry| entry.handle.is_established())
            .map(|entry| SessionInfo {
                id: entry.handle.id(),
                peer: entry.handle.peer().clone(),
                direction: entry.handle.direction(),
                established_at: entry.established_at,
            })
            .collect()
    }

    /// Stop accepting, abandon pending dials and close every session
    pub async fn close(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        let sessions: Vec<_> = self.inner.sessions.write().await.drain().collect();
        for (_, entry) in &sessions {
            entry.handle.close();
        }
        log::info!("Transport closed ({} sessions)", sessions.len());
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(closed());
        }
        Ok(())
    }
}

impl Inner {
    async fn established(&self, node_id: &str) -> Option<SessionHandle> {
        self.sessions
            .read()
            .await
            .get(node_id)
            .filter(|entry| entry.handle.is_established())
            .map(|entry| entry.handle.clone())
    }

    async fn session_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|entry| entry.handle.is_established())
            .count()
    }

    async fn dial_lock(&self, node_id: &str) -> Arc<Mutex<()>> {
        let mut dialing = self.dialing.lock().await;
        Arc::clone(dialing.entry(node_id.to_string()).or_default())
    }

    /// Drop the peer's dial lock entry once no other dial is waiting on it
    async fn release_dial_lock(&self, node_id: &str, lock: Arc<Mutex<()>>) {
        let mut dialing = self.dialing.lock().await;
        // One reference in the map, one held here.
        if Arc::strong_count(&lock) == 2 {
            dialing.remove(node_id);
        }
    }

    async fn accept_session(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let mut session = PeerSession::accepted(stream, Arc::clone(&self.local), self.settings.clone());
        match session.handshake(None).await {
            Ok(_) => {
                if let Err(e) = self.register(session).await {
                    log::debug!("Inbound session from {remote} not registered: {e}");
                }
            }
            Err(e) => log::warn!("Rejected inbound connection from {remote}: {e}"),
        }
    }

    /// Start a freshly established session and record it, resolving any
    /// duplicate with an existing session to the same peer.
    async fn register<S>(self: &Arc<Self>, session: PeerSession<S>) -> Result<SessionHandle>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let peer = session.peer().cloned().ok_or_else(|| ProtocolError::HandshakeFailed {
            reason: "session is not established".to_string(),
        })?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let events = self.events.clone();
        let sender = peer.clone();
        let (handle, task) = session.start(id, self.shutdown.subscribe(), move |envelope| {
            let _ = events.send(TransportEvent::Envelope {
                peer: sender.clone(),
                envelope,
            });
        })?;

        let winner = {
            let mut sessions = self.sessions.write().await;
            if *self.shutdown.borrow() {
                handle.close();
                None
            } else {
                match sessions.get(&peer.node_id) {
                    Some(existing)
                        if existing.handle.is_established()
                            && !self.replaces(existing.handle.direction(), handle.direction(), &peer) =>
                    {
                        log::debug!(
                            "Keeping {} session {} to {peer}, closing duplicate {}",
                            existing.handle.direction(),
                            existing.handle.id(),
                            id
                        );
                        handle.close();
                        Some(existing.handle.clone())
                    }
                    _ => {
                        if let Some(previous) = sessions.insert(
                            peer.node_id.clone(),
                            Registered {
                                handle: handle.clone(),
                                established_at: chrono::Utc::now(),
                            },
                        ) {
                            log::debug!("Session {id} supersedes session {} to {peer}", previous.handle.id());
                            previous.handle.close();
                        }
                        let _ = self.events.send(TransportEvent::SessionEstablished {
                            peer: peer.clone(),
                            direction: handle.direction(),
                        });
                        Some(handle.clone())
                    }
                }
            }
        };

        let inner = Arc::clone(self);
        let node_id = peer.node_id.clone();
        tokio::spawn(async move {
            let reason = task.await;
            if inner.unregister(&node_id, id).await {
                let _ = inner.events.send(TransportEvent::SessionClosed { peer, reason });
            }
        });

        winner.ok_or_else(closed)
    }

    /// Whether a new session should replace an established one to the same
    /// peer. Same direction: the newer one wins. Otherwise the session opened
    /// by the lexicographically smaller node id wins, so both ends agree.
    fn replaces(&self, existing: SessionDirection, new: SessionDirection, peer: &PeerIdentity) -> bool {
        if existing == new {
            return true;
        }
        let initiator = |direction| match direction {
            SessionDirection::Outbound => self.local_id.as_str(),
            SessionDirection::Inbound => peer.node_id.as_str(),
        };
        initiator(new) < initiator(existing)
    }

    async fn unregister(&self, node_id: &str, id: u64) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(node_id) {
            Some(entry) if entry.handle.id() == id => {
                sessions.remove(node_id);
                true
            }
            _ => false,
        }
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    if inner.session_count().await >= inner.max_sessions {
                        log::warn!("Session limit reached, refusing connection from {remote}");
                        continue;
                    }
                    log::debug!("Accepted connection from {remote}");
                    tokio::spawn(Arc::clone(&inner).accept_session(stream, remote));
                }
                Err(e) => {
                    log::warn!("Accept failed: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    log::debug!("Accept loop on {} stopped", inner.local_addr);
}

fn closed() -> crate::ChatError {
    NetworkError::Transport {
        reason: "transport is closed".to_string(),
    }
    .into()
}
