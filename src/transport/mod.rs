//! Transport layer for peer messaging.
//!
//! This module provides the wire envelope, its length-prefixed framing, and
//! the TCP transport that accepts and dials peer sessions.

pub mod frame;
pub mod p2p;
pub mod protocol;

pub use frame::*;
pub use p2p::{PeerTransport, SessionInfo, TransportEvent};
pub use protocol::*;
