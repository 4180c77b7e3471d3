//! Cryptographic primitives and identity management.
//!
//! This module holds the node's key material ([`NodeKeys`]), the
//! authenticated public-key encryption and detached signatures used on the
//! wire ([`CipherCodec`]), and the process-wide initialisation guard.

pub mod cipher;
pub mod identity;

pub use cipher::*;
pub use identity::*;

use crate::utils::{CryptoError, Result};
use rand::rngs::OsRng;
use rand_core::RngCore;
use std::sync::OnceLock;

static INIT: OnceLock<std::result::Result<(), CryptoError>> = OnceLock::new();

/// Check once per process that the operating system RNG is usable.
///
/// Repeated calls return the first outcome without re-running the check, and
/// concurrent first calls block until a single check has finished.
///
/// # Errors
///
/// Returns `CryptoError::RngUnavailable` if the RNG cannot produce bytes.
pub fn init() -> Result<()> {
    INIT.get_or_init(|| {
        let mut probe = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut probe)
            .map_err(|e| CryptoError::RngUnavailable {
                reason: e.to_string(),
            })?;
        log::debug!("Cryptographic backend initialised");
        Ok(())
    })
    .clone()
    .map_err(Into::into)
}
