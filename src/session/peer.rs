//! One authenticated connection to one peer.
//!
//! A [`PeerSession`] owns its byte stream. It runs the handshake, then hands
//! the stream to a single task that reads inbound frames and performs every
//! outbound write. Writers never touch the stream directly; they queue
//! envelopes through a [`SessionHandle`], so concurrent sends to the same peer
//! are written whole and in the order they were queued.

use crate::crypto::LocalIdentity;
use crate::session::handshake::{self, Challenge, PeerIdentity};
use crate::transport::{read_envelope, write_envelope, Envelope, EnvelopeKind, FrameDecoder};
use crate::utils::{ChatError, NetworkConfig, NetworkError, ProtocolError, Result};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout, Instant};

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport connection not yet up
    Connecting,
    /// Identities being exchanged
    Handshaking,
    /// Peer proven; envelopes may flow
    Established,
    /// Terminal
    Closed,
}

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionDirection {
    /// We connected to the peer
    Outbound,
    /// The peer connected to us
    Inbound,
}

impl fmt::Display for SessionDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Outbound => write!(f, "outbound"),
            Self::Inbound => write!(f, "inbound"),
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Remote end closed the stream on a frame boundary
    PeerClosed,
    /// No traffic within the idle timeout
    IdleTimeout,
    /// Closed through its handle
    LocalClose,
    /// Transport shutting down
    Shutdown,
    /// Peer broke the wire protocol
    Protocol(String),
    /// Stream error
    Io(String),
}

impl CloseReason {
    fn from_error(error: &ChatError) -> Self {
        match error {
            ChatError::Io(reason) => Self::Io(reason.clone()),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "closed by peer"),
            Self::IdleTimeout => write!(f, "idle timeout"),
            Self::LocalClose => write!(f, "closed locally"),
            Self::Shutdown => write!(f, "shutdown"),
            Self::Protocol(reason) => write!(f, "protocol violation: {reason}"),
            Self::Io(reason) => write!(f, "I/O error: {reason}"),
        }
    }
}

/// Timeouts and limits applied to a session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Largest accepted frame body
    pub max_frame_size: usize,
    /// Bound on establishing the TCP connection
    pub connect_timeout: Duration,
    /// Bound on the whole handshake exchange
    pub handshake_timeout: Duration,
    /// Session closes after this long without traffic
    pub idle_timeout: Duration,
    /// Bound on writing one frame; a stalled write closes the session
    pub write_timeout: Duration,
}

impl From<&NetworkConfig> for SessionSettings {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            max_frame_size: config.max_frame_size,
            connect_timeout: config.connect_timeout(),
            handshake_timeout: config.handshake_timeout(),
            idle_timeout: config.idle_timeout(),
            write_timeout: config.write_timeout(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&NetworkConfig::default())
    }
}

/// A queued outbound envelope and where to report the write result
#[derive(Debug)]
pub struct OutboundWrite {
    envelope: Envelope,
    done: oneshot::Sender<Result<()>>,
}

/// Instructions for the session task
#[derive(Debug)]
pub enum SessionCommand {
    /// Write one envelope
    Write(OutboundWrite),
    /// Close the session
    Close,
}

/// Cloneable handle to a running session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: u64,
    peer: PeerIdentity,
    direction: SessionDirection,
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    /// Session identifier, unique within the process
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Proven identity of the remote end
    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    /// Which side opened the connection
    pub fn direction(&self) -> SessionDirection {
        self.direction
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// True while the session accepts envelopes
    pub fn is_established(&self) -> bool {
        self.state() == SessionState::Established && !self.commands.is_closed()
    }

    /// Queue an envelope; the returned receiver resolves once it is written.
    ///
    /// Queue position is fixed when this returns, so envelopes queued in
    /// sequence are written in that sequence.
    pub fn enqueue(&self, envelope: Envelope) -> Result<oneshot::Receiver<Result<()>>> {
        let (done, written) = oneshot::channel();
        self.commands
            .send(SessionCommand::Write(OutboundWrite { envelope, done }))
            .map_err(|_| self.unavailable())?;
        Ok(written)
    }

    /// Queue an envelope and wait until it has been written.
    ///
    /// The envelope is queued when this is called, not when the returned
    /// future is first polled.
    pub fn send(&self, envelope: Envelope) -> impl Future<Output = Result<()>> + Send + 'static {
        let queued = self.enqueue(envelope);
        let unavailable = self.unavailable();
        async move { queued?.await.map_err(|_| unavailable)? }
    }

    /// Ask the session to close
    pub fn close(&self) {
        let _ = self.commands.send(SessionCommand::Close);
    }

    fn unavailable(&self) -> ChatError {
        NetworkError::PeerUnavailable {
            peer: self.peer.node_id.clone(),
        }
        .into()
    }
}

/// A connection to one peer, generic over its byte stream
pub struct PeerSession<S> {
    stream: S,
    decoder: FrameDecoder,
    local: Arc<LocalIdentity>,
    settings: SessionSettings,
    direction: SessionDirection,
    state: SessionState,
    peer: Option<PeerIdentity>,
}

impl PeerSession<TcpStream> {
    /// Open a TCP connection to `address` within the connect timeout
    pub async fn connect(address: &str, local: Arc<LocalIdentity>, settings: SessionSettings) -> Result<Self> {
        log::debug!("Connecting to {address}");
        let stream = timeout(settings.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| NetworkError::ConnectTimeout {
                operation: format!("connect to {address}"),
            })?
            .map_err(|e| NetworkError::PeerUnreachable {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream, local, settings, SessionDirection::Outbound))
    }
}

impl<S> PeerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap a connected stream
    pub fn new(stream: S, local: Arc<LocalIdentity>, settings: SessionSettings, direction: SessionDirection) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(settings.max_frame_size),
            local,
            settings,
            direction,
            state: SessionState::Connecting,
            peer: None,
        }
    }

    /// Wrap a stream accepted from a listener
    pub fn accepted(stream: S, local: Arc<LocalIdentity>, settings: SessionSettings) -> Self {
        Self::new(stream, local, settings, SessionDirection::Inbound)
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Which side opened the connection
    pub fn direction(&self) -> SessionDirection {
        self.direction
    }

    /// Proven peer identity, once established
    pub fn peer(&self) -> Option<&PeerIdentity> {
        self.peer.as_ref()
    }

    /// Run the handshake under the handshake timeout.
    ///
    /// Outbound sessions must pass the identity they expect to reach; the
    /// peer must present exactly those keys. On any failure the stream is
    /// shut down and the session is `Closed`.
    pub async fn handshake(&mut self, expected: Option<&PeerIdentity>) -> Result<PeerIdentity> {
        self.state = SessionState::Handshaking;

        let result = match timeout(self.settings.handshake_timeout, self.exchange(expected)).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::ConnectTimeout {
                operation: "handshake".to_string(),
            }
            .into()),
        };

        match result {
            Ok(peer) => {
                log::info!("Session established with {peer} ({})", self.direction);
                self.state = SessionState::Established;
                self.peer = Some(peer.clone());
                Ok(peer)
            }
            Err(e) => {
                log::warn!("Handshake failed ({}): {e}", self.direction);
                self.state = SessionState::Closed;
                let _ = self.stream.shutdown().await;
                Err(e)
            }
        }
    }

    async fn exchange(&mut self, expected: Option<&PeerIdentity>) -> Result<PeerIdentity> {
        let challenge = Challenge::generate()?;

        match self.direction {
            SessionDirection::Outbound => {
                let expected = expected.ok_or_else(|| ProtocolError::HandshakeFailed {
                    reason: "outbound handshake without an expected peer".to_string(),
                })?;

                let hello = handshake::hello(&self.local, &expected.node_id, &challenge)?;
                self.write(&hello).await?;

                let reply = self.read_required().await?;
                let peer = handshake::verify_hello(&reply, &self.local, Some(expected))?;

                let ack = handshake::ack(&self.local, &peer, &reply.nonce);
                self.write(&ack).await?;

                let their_ack = self.read_required().await?;
                handshake::verify_ack(&their_ack, &self.local, &peer, &challenge)?;
                Ok(peer)
            }
            SessionDirection::Inbound => {
                let hello = self.read_required().await?;
                let peer = handshake::verify_hello(&hello, &self.local, expected)?;

                let reply = handshake::hello(&self.local, &peer.node_id, &challenge)?;
                self.write(&reply).await?;

                let their_ack = self.read_required().await?;
                handshake::verify_ack(&their_ack, &self.local, &peer, &challenge)?;

                let ack = handshake::ack(&self.local, &peer, &hello.nonce);
                self.write(&ack).await?;
                Ok(peer)
            }
        }
    }

    async fn write(&mut self, envelope: &Envelope) -> Result<()> {
        write_envelope(&mut self.stream, envelope, self.settings.max_frame_size).await
    }

    async fn read_required(&mut self) -> Result<Envelope> {
        read_envelope(&mut self.stream, &mut self.decoder)
            .await?
            .ok_or_else(|| {
                ProtocolError::HandshakeFailed {
                    reason: "peer closed the connection".to_string(),
                }
                .into()
            })
    }

    /// Start an established session.
    ///
    /// Returns the handle used to queue writes and the session future, which
    /// must be spawned. Every inbound `MESSAGE` is passed to `deliver`. The
    /// future resolves with the reason the session ended; by then any writes
    /// still queued have been failed with `PeerUnavailable`.
    pub fn start<F>(
        self,
        id: u64,
        shutdown: watch::Receiver<bool>,
        deliver: F,
    ) -> Result<(SessionHandle, impl Future<Output = CloseReason> + Send + 'static)>
    where
        F: FnMut(Envelope) + Send + 'static,
    {
        let peer = match (&self.peer, self.state) {
            (Some(peer), SessionState::Established) => peer.clone(),
            _ => {
                return Err(ProtocolError::HandshakeFailed {
                    reason: "session is not established".to_string(),
                }
                .into())
            }
        };

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Established);
        let handle = SessionHandle {
            id,
            peer,
            direction: self.direction,
            commands: commands_tx,
            state: state_rx,
        };

        Ok((handle, self.run(commands_rx, state_tx, shutdown, deliver)))
    }

    async fn run<F>(
        self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        state: watch::Sender<SessionState>,
        mut shutdown: watch::Receiver<bool>,
        mut deliver: F,
    ) -> CloseReason
    where
        F: FnMut(Envelope) + Send + 'static,
    {
        let Self {
            stream,
            mut decoder,
            local,
            settings,
            peer,
            ..
        } = self;
        // Checked in `start`.
        let Some(peer) = peer else {
            state.send_replace(SessionState::Closed);
            return CloseReason::LocalClose;
        };
        let local_id = local.node_id();
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut deadline = Instant::now() + settings.idle_timeout;

        let stopping = *shutdown.borrow();
        let reason = if stopping {
            CloseReason::Shutdown
        } else {
            loop {
                tokio::select! {
                    read = read_envelope(&mut reader, &mut decoder) => match read {
                        Ok(Some(envelope)) => {
                            deadline = Instant::now() + settings.idle_timeout;
                            if let Err(violation) = check_inbound(&envelope, &peer, &local_id) {
                                break CloseReason::Protocol(violation);
                            }
                            deliver(envelope);
                        }
                        Ok(None) => break CloseReason::PeerClosed,
                        Err(e) => break CloseReason::from_error(&e),
                    },
                    command = commands.recv() => match command {
                        Some(SessionCommand::Write(write)) => {
                            deadline = Instant::now() + settings.idle_timeout;
                            let written = timeout(
                                settings.write_timeout,
                                write_envelope(&mut writer, &write.envelope, settings.max_frame_size),
                            )
                            .await;
                            let (result, broken) = match written {
                                Ok(Err(ChatError::Io(reason))) => {
                                    (Err(ChatError::Io(reason.clone())), Some(reason))
                                }
                                Ok(result) => (result, None),
                                Err(_) => (
                                    Err(NetworkError::ConnectTimeout {
                                        operation: format!("write to {peer}"),
                                    }
                                    .into()),
                                    Some("write timed out".to_string()),
                                ),
                            };
                            let _ = write.done.send(result);
                            if let Some(reason) = broken {
                                break CloseReason::Io(reason);
                            }
                        }
                        Some(SessionCommand::Close) | None => break CloseReason::LocalClose,
                    },
                    () = tokio::time::sleep_until(deadline) => break CloseReason::IdleTimeout,
                    _ = shutdown.changed() => break CloseReason::Shutdown,
                }
            }
        };

        state.send_replace(SessionState::Closed);
        commands.close();
        while let Ok(command) = commands.try_recv() {
            if let SessionCommand::Write(write) = command {
                let _ = write.done.send(Err(NetworkError::PeerUnavailable {
                    peer: peer.node_id.clone(),
                }
                .into()));
            }
        }
        // A peer that stopped reading can stall the shutdown flush too.
        let _ = timeout(settings.write_timeout, writer.shutdown()).await;

        log::info!("Session with {peer} closed: {reason}");
        reason
    }
}

fn check_inbound(envelope: &Envelope, peer: &PeerIdentity, local_id: &str) -> std::result::Result<(), String> {
    if envelope.kind != EnvelopeKind::Message {
        return Err(format!("unexpected {} after handshake", envelope.kind_name()));
    }
    if envelope.from_node_id != peer.node_id {
        return Err(format!("envelope claims sender {}", envelope.from_node_id));
    }
    if envelope.to_node_id != local_id {
        return Err(format!("envelope addressed to {}", envelope.to_node_id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NodeKeys;
    use tokio::io::{duplex, DuplexStream};

    fn identity(name: &str) -> Arc<LocalIdentity> {
        Arc::new(LocalIdentity::new(name, NodeKeys::generate().unwrap()))
    }

    fn as_peer(identity: &LocalIdentity) -> PeerIdentity {
        PeerIdentity {
            node_id: identity.node_id(),
            username: identity.username().to_string(),
            encryption_public: identity.keys().encryption_public(),
            signing_public: identity.keys().signing_public(),
        }
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            max_frame_size: crate::MAX_FRAME_SIZE,
            connect_timeout: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(5),
        }
    }

    async fn established(
        alice: &Arc<LocalIdentity>,
        bob: &Arc<LocalIdentity>,
        settings: SessionSettings,
    ) -> (PeerSession<DuplexStream>, PeerSession<DuplexStream>) {
        let (a, b) = duplex(64 * 1024);
        let mut outbound = PeerSession::new(a, alice.clone(), settings.clone(), SessionDirection::Outbound);
        let mut inbound = PeerSession::accepted(b, bob.clone(), settings);
        let expected = as_peer(bob);

        let (out, inc) = tokio::join!(outbound.handshake(Some(&expected)), inbound.handshake(None));
        assert_eq!(out.unwrap(), as_peer(bob));
        assert_eq!(inc.unwrap(), as_peer(alice));
        (outbound, inbound)
    }

    #[tokio::test]
    async fn test_handshake_establishes_both_sides() {
        let alice = identity("alice");
        let bob = identity("bob");

        let (outbound, inbound) = established(&alice, &bob, settings()).await;

        assert_eq!(outbound.state(), SessionState::Established);
        assert_eq!(inbound.state(), SessionState::Established);
        assert_eq!(outbound.peer().unwrap().username, "bob");
        assert_eq!(inbound.peer().unwrap().username, "alice");
    }

    #[tokio::test]
    async fn test_handshake_with_wrong_peer_closes() {
        let alice = identity("alice");
        let bob = identity("bob");
        let carol = identity("carol");
        let (a, b) = duplex(64 * 1024);
        let mut outbound = PeerSession::new(a, alice.clone(), settings(), SessionDirection::Outbound);
        let mut inbound = PeerSession::accepted(b, bob.clone(), settings());

        // Alice thinks she is dialling carol but bob answers.
        let expected = as_peer(&carol);
        let (out, inc) = tokio::join!(outbound.handshake(Some(&expected)), inbound.handshake(None));

        assert!(out.is_err());
        assert!(inc.is_err());
        assert_eq!(outbound.state(), SessionState::Closed);
        assert_eq!(inbound.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_forged_hello_gets_no_reply() {
        let alice = identity("alice");
        let bob = identity("bob");
        let mallory = identity("mallory");
        let (mut raw, b) = duplex(64 * 1024);
        let mut inbound = PeerSession::accepted(b, bob.clone(), settings());

        let challenge = Challenge::generate().unwrap();
        let mut forged = handshake::hello(&alice, &bob.node_id(), &challenge).unwrap();
        forged.signature = mallory.keys().sign(&forged.signing_bytes()).to_vec();
        write_envelope(&mut raw, &forged, crate::MAX_FRAME_SIZE).await.unwrap();

        assert!(inbound.handshake(None).await.is_err());
        assert_eq!(inbound.state(), SessionState::Closed);

        let mut decoder = FrameDecoder::new(crate::MAX_FRAME_SIZE);
        assert_eq!(read_envelope(&mut raw, &mut decoder).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_handshake_times_out() {
        let bob = identity("bob");
        let (_silent, b) = duplex(1024);
        let mut quick = settings();
        quick.handshake_timeout = Duration::from_millis(50);
        let mut inbound = PeerSession::accepted(b, bob, quick);

        let result = inbound.handshake(None).await;
        assert!(matches!(
            result,
            Err(ChatError::Network(NetworkError::ConnectTimeout { .. }))
        ));
        assert_eq!(inbound.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_start_requires_established() {
        let bob = identity("bob");
        let (_a, b) = duplex(1024);
        let session = PeerSession::accepted(b, bob, settings());
        let (_tx, shutdown) = watch::channel(false);

        assert!(session.start(1, shutdown, |_| {}).is_err());
    }

    #[tokio::test]
    async fn test_concurrent_sends_arrive_in_order() {
        let alice = identity("alice");
        let bob = identity("bob");
        let (outbound, inbound) = established(&alice, &bob, settings()).await;
        let (_shutdown_tx, shutdown) = watch::channel(false);

        let (received_tx, mut received_rx) = mpsc::unbounded_channel();
        let (sender, sender_task) = outbound.start(1, shutdown.clone(), |_| {}).unwrap();
        let (_receiver, receiver_task) = inbound
            .start(2, shutdown, move |envelope| {
                let _ = received_tx.send(envelope);
            })
            .unwrap();
        tokio::spawn(sender_task);
        tokio::spawn(receiver_task);

        let bob_public = bob.keys().encryption_public();
        let mut pending = Vec::new();
        for i in 0..50 {
            let text = format!("message {i}");
            let envelope = Envelope::seal_message(&alice, &bob.node_id(), &bob_public, text.as_bytes()).unwrap();
            pending.push(sender.send(envelope));
        }
        for result in futures::future::join_all(pending).await {
            result.unwrap();
        }

        let alice_public = alice.keys().encryption_public();
        for i in 0..50 {
            let envelope = received_rx.recv().await.unwrap();
            let plaintext = envelope.open_message(&bob, &alice_public).unwrap();
            assert_eq!(plaintext, format!("message {i}").as_bytes());
        }
    }

    #[tokio::test]
    async fn test_close_fails_queued_writes() {
        let alice = identity("alice");
        let bob = identity("bob");
        let (outbound, _inbound) = established(&alice, &bob, settings()).await;
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let (handle, task) = outbound.start(1, shutdown, |_| {}).unwrap();

        handle.close();
        let envelope =
            Envelope::seal_message(&alice, &bob.node_id(), &bob.keys().encryption_public(), b"late").unwrap();
        let written = handle.enqueue(envelope).unwrap();

        assert_eq!(task.await, CloseReason::LocalClose);
        assert!(matches!(
            written.await.unwrap(),
            Err(ChatError::Network(NetworkError::PeerUnavailable { .. }))
        ));
        assert_eq!(handle.state(), SessionState::Closed);
        assert!(!handle.is_established());
    }

    #[tokio::test]
    async fn test_stalled_write_closes_session() {
        let alice = identity("alice");
        let bob = identity("bob");
        let mut quick = settings();
        quick.write_timeout = Duration::from_millis(200);

        // Bob completes the handshake and then never reads again.
        let (a, b) = duplex(1024);
        let mut outbound = PeerSession::new(a, alice.clone(), quick.clone(), SessionDirection::Outbound);
        let mut inbound = PeerSession::accepted(b, bob.clone(), quick);
        let expected = as_peer(&bob);
        let (out, inc) = tokio::join!(outbound.handshake(Some(&expected)), inbound.handshake(None));
        out.unwrap();
        inc.unwrap();

        let (_shutdown_tx, shutdown) = watch::channel(false);
        let (handle, task) = outbound.start(1, shutdown, |_| {}).unwrap();
        let task = tokio::spawn(task);

        let bob_public = bob.keys().encryption_public();
        let large = Envelope::seal_message(&alice, &bob.node_id(), &bob_public, &[7u8; 4096]).unwrap();
        let small = Envelope::seal_message(&alice, &bob.node_id(), &bob_public, b"behind").unwrap();
        let first = handle.enqueue(large).unwrap();
        let second = handle.enqueue(small).unwrap();

        let first = timeout(Duration::from_secs(5), first).await.unwrap().unwrap();
        assert!(matches!(
            first,
            Err(ChatError::Network(NetworkError::ConnectTimeout { .. }))
        ));
        assert!(matches!(
            second.await.unwrap(),
            Err(ChatError::Network(NetworkError::PeerUnavailable { .. }))
        ));
        assert!(matches!(task.await.unwrap(), CloseReason::Io(_)));
        assert!(!handle.is_established());
        drop(inbound);
    }

    #[tokio::test]
    async fn test_idle_session_closes() {
        let alice = identity("alice");
        let bob = identity("bob");
        let mut quick = settings();
        quick.idle_timeout = Duration::from_millis(50);
        let (outbound, _inbound) = established(&alice, &bob, quick).await;
        let (_shutdown_tx, shutdown) = watch::channel(false);

        let (_handle, task) = outbound.start(1, shutdown, |_| {}).unwrap();
        assert_eq!(task.await, CloseReason::IdleTimeout);
    }

    #[tokio::test]
    async fn test_shutdown_closes_session() {
        let alice = identity("alice");
        let bob = identity("bob");
        let (outbound, _inbound) = established(&alice, &bob, settings()).await;
        let (shutdown_tx, shutdown) = watch::channel(false);

        let (_handle, task) = outbound.start(1, shutdown, |_| {}).unwrap();
        let task = tokio::spawn(task);
        shutdown_tx.send_replace(true);

        assert_eq!(task.await.unwrap(), CloseReason::Shutdown);
    }

    #[tokio::test]
    async fn test_spoofed_sender_closes_session() {
        let alice = identity("alice");
        let bob = identity("bob");
        let carol = identity("carol");
        let (outbound, inbound) = established(&alice, &bob, settings()).await;
        let (_shutdown_tx, shutdown) = watch::channel(false);

        let (delivered_tx, mut delivered_rx) = mpsc::unbounded_channel::<Envelope>();
        let (sender, sender_task) = outbound.start(1, shutdown.clone(), |_| {}).unwrap();
        let (_receiver, receiver_task) = inbound
            .start(2, shutdown, move |envelope| {
                let _ = delivered_tx.send(envelope);
            })
            .unwrap();
        tokio::spawn(sender_task);

        // Carol's envelope smuggled over alice's session.
        let spoofed =
            Envelope::seal_message(&carol, &bob.node_id(), &bob.keys().encryption_public(), b"hi").unwrap();
        sender.send(spoofed).await.unwrap();

        assert!(matches!(receiver_task.await, CloseReason::Protocol(_)));
        assert!(delivered_rx.recv().await.is_none());
    }
}
