//! Peer sessions and the handshake that establishes them.
//!
//! A session is one authenticated connection to one peer. It moves through
//! `Connecting -> Handshaking -> Established -> Closed` and never leaves
//! `Closed`.

pub mod handshake;
pub mod peer;

pub use handshake::{PeerIdentity, CHALLENGE_LENGTH};
pub use peer::*;
