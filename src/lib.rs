//! # p2pchat
//!
//! A peer-to-peer encrypted chat node. Each node owns an X25519 encryption
//! key and an Ed25519 signing key, discovers peers through a remote directory
//! service, talks to reachable peers directly over TCP, and falls back to the
//! directory's offline queue when a peer cannot be reached.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use p2pchat::{ChatConfig, Node, NodeKeys};
//! use p2pchat::network::MemoryDirectory;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = ChatConfig::default();
//!     config.node.username = "alice".to_string();
//!     let directory = Arc::new(MemoryDirectory::new());
//!     let (node, mut deliveries) = Node::start(config, NodeKeys::generate()?, directory).await?;
//!     node.send_message("bob", "hello").await?;
//!     while let Some(message) = deliveries.recv().await {
//!         println!("{}: {}", message.from, message.text);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`crypto`]: key storage, authenticated encryption and signatures
//! - [`transport`]: wire envelope, frame codec and the peer transport
//! - [`session`]: per-connection handshake and session state machine
//! - [`network`]: directory service interface and bindings
//! - [`node`]: send/receive routing policy, friend cache and history
//! - [`utils`]: configuration and error handling

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod crypto;
pub mod network;
pub mod node;
pub mod session;
pub mod transport;
pub mod utils;

pub use crypto::{CipherCodec, LocalIdentity, NodeKeys};
pub use network::{DirectoryClient, DirectoryRecord};
pub use node::{DeliveredMessage, DeliveryReport, Friend, Node, NodeStatus};
pub use transport::{Envelope, EnvelopeKind, PeerTransport};
pub use utils::{ChatConfig, ChatError, Result};

/// Version tag carried in handshakes
pub const PROTOCOL_VERSION: u32 = 1;

/// Default maximum frame body size in bytes (1MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Default configuration values
pub mod defaults {
    /// Default port for inbound peer connections
    pub const DEFAULT_PORT: u16 = 7000;

    /// Default maximum number of concurrent peer sessions
    pub const DEFAULT_MAX_SESSIONS: usize = 64;

    /// Default outbound connect timeout in seconds
    pub const DEFAULT_CONNECT_TIMEOUT: u64 = 5;

    /// Default idle session timeout in seconds
    pub const DEFAULT_IDLE_TIMEOUT: u64 = 300;

    /// Default bound on writing one frame to a peer, in seconds
    pub const DEFAULT_WRITE_TIMEOUT: u64 = 10;

    /// Default heartbeat interval in seconds
    pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 30;

    /// Default friend cache freshness in seconds
    pub const DEFAULT_FRIEND_TTL: u64 = 300;
}
