//! Noise-XX secure channel
//!
//! Pattern `Noise_XX_25519_ChaChaPoly_SHA256` via `snow`, with a fixed
//! application prologue mixed into the handshake hash. Transport messages
//! carry an explicit 64-bit little-endian nonce so the receive side can
//! tolerate reordering behind a sliding replay window.

mod replay;
mod session;
pub mod xchacha;

pub use replay::ReplayWindow;
pub use session::{
    HandshakeOutcome, HandshakeRole, NoiseSession, NoiseSessionManager, SessionEndReason,
    SessionState,
};

use sha2::{Digest, Sha256};

use crate::errors::NoiseError;
use crate::types::{Fingerprint, PeerId};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Noise protocol name for all BitChat sessions
pub const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_SHA256";

/// Application identifier and protocol version mixed into the handshake hash
pub const NOISE_PROLOGUE: &[u8] = b"bitchat\x02";

// ----------------------------------------------------------------------------
// Static Key Pair
// ----------------------------------------------------------------------------

/// Long-term X25519 key pair backing a peer's identity
pub struct NoiseKeypair {
    private_key: [u8; 32],
    public_key: [u8; 32],
}

impl NoiseKeypair {
    /// Generate a fresh static key pair
    pub fn generate() -> Result<Self, NoiseError> {
        let builder = snow::Builder::new(
            NOISE_PATTERN
                .parse()
                .map_err(|_| NoiseError::HandshakeFailed {
                    reason: "invalid noise pattern".into(),
                })?,
        );
        let keypair = builder.generate_keypair()?;

        let mut private_key = [0u8; 32];
        let mut public_key = [0u8; 32];
        private_key.copy_from_slice(&keypair.private);
        public_key.copy_from_slice(&keypair.public);
        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Rebuild a key pair from stored private key bytes
    pub fn from_private_key(private_key: [u8; 32], public_key: [u8; 32]) -> Self {
        Self {
            private_key,
            public_key,
        }
    }

    /// Public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        self.public_key
    }

    /// Private key bytes
    pub(crate) fn private_key(&self) -> &[u8; 32] {
        &self.private_key
    }

    /// SHA-256 fingerprint of the public key
    pub fn fingerprint(&self) -> Fingerprint {
        fingerprint_of(&self.public_key)
    }

    /// Short peer ID derived from the fingerprint
    pub fn peer_id(&self) -> PeerId {
        self.fingerprint().to_peer_id()
    }

    /// Overwrite the private key in place
    ///
    /// Called on panic-clear; the keypair is unusable afterwards.
    pub fn wipe(&mut self) {
        self.private_key = [0u8; 32];
        self.public_key = [0u8; 32];
    }
}

impl core::fmt::Debug for NoiseKeypair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NoiseKeypair")
            .field("public_key", &hex::encode(self.public_key))
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Fingerprints
// ----------------------------------------------------------------------------

/// SHA-256 fingerprint of a static public key
pub fn fingerprint_of(public_key: &[u8; 32]) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(public_key);
    let hash = hasher.finalize();

    let mut fingerprint = [0u8; 32];
    fingerprint.copy_from_slice(&hash);
    Fingerprint::new(fingerprint)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation_is_distinct() {
        let a = NoiseKeypair::generate().unwrap();
        let b = NoiseKeypair::generate().unwrap();
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let keypair = NoiseKeypair::generate().unwrap();
        assert_eq!(keypair.fingerprint(), fingerprint_of(&keypair.public_key()));
        assert_eq!(keypair.peer_id(), keypair.fingerprint().to_peer_id());
    }

    #[test]
    fn test_wipe_clears_key_material() {
        let mut keypair = NoiseKeypair::generate().unwrap();
        keypair.wipe();
        assert_eq!(keypair.public_key(), [0u8; 32]);
        assert_eq!(*keypair.private_key(), [0u8; 32]);
    }
}
