//! Local identity: the static Noise key and its derived identifiers

use crate::errors::Result;
use crate::noise::NoiseKeypair;
use crate::types::{Fingerprint, PeerId};

// ----------------------------------------------------------------------------
// Identity
// ----------------------------------------------------------------------------

/// The local long-term identity
///
/// The peer ID is the first 8 bytes of the key fingerprint and is stable for
/// as long as the key is.
pub struct Identity {
    keypair: NoiseKeypair,
    peer_id: PeerId,
    fingerprint: Fingerprint,
}

impl Identity {
    /// Generate a fresh identity
    pub fn generate() -> Result<Self> {
        let keypair = NoiseKeypair::generate()?;
        Ok(Self::from_keypair(keypair))
    }

    /// Wrap an existing keypair
    pub fn from_keypair(keypair: NoiseKeypair) -> Self {
        let fingerprint = keypair.fingerprint();
        let peer_id = fingerprint.to_peer_id();
        Self {
            keypair,
            peer_id,
            fingerprint,
        }
    }

    /// The short mesh identifier
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// The full key fingerprint
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// The static public key
    pub fn public_key(&self) -> [u8; 32] {
        self.keypair.public_key()
    }

    /// Take the keypair for the session manager, consuming the identity
    pub fn into_keypair(self) -> NoiseKeypair {
        self.keypair
    }
}

// ----------------------------------------------------------------------------
// Identity Store
// ----------------------------------------------------------------------------

/// Persistence capability for the identity key
///
/// The core never touches disk itself; hosts provide an implementation and
/// tests use [`InMemoryIdentityStore`].
pub trait IdentityStore: Send + Sync {
    /// Load the stored private and public key, if any
    fn load(&self) -> Result<Option<([u8; 32], [u8; 32])>>;
    /// Persist the key material
    fn save(&self, private_key: &[u8; 32], public_key: &[u8; 32]) -> Result<()>;
    /// Destroy the stored key material
    fn clear(&self) -> Result<()>;
}

/// Volatile store used by tests and ephemeral sessions
#[derive(Default)]
pub struct InMemoryIdentityStore {
    keys: std::sync::Mutex<Option<([u8; 32], [u8; 32])>>,
}

impl IdentityStore for InMemoryIdentityStore {
    fn load(&self) -> Result<Option<([u8; 32], [u8; 32])>> {
        Ok(*self.keys.lock().expect("identity store lock"))
    }

    fn save(&self, private_key: &[u8; 32], public_key: &[u8; 32]) -> Result<()> {
        *self.keys.lock().expect("identity store lock") = Some((*private_key, *public_key));
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.keys.lock().expect("identity store lock") = None;
        Ok(())
    }
}

/// Load the identity from a store, generating and saving one on first run
pub fn load_or_generate(store: &dyn IdentityStore) -> Result<Identity> {
    if let Some((private_key, public_key)) = store.load()? {
        let keypair = NoiseKeypair::from_private_key(private_key, public_key);
        return Ok(Identity::from_keypair(keypair));
    }

    let identity = Identity::generate()?;
    // Freshly generated keys are persisted before first use.
    let keypair = &identity.keypair;
    store.save(keypair.private_key(), &keypair.public_key())?;
    Ok(identity)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_derives_from_fingerprint() {
        let identity = Identity::generate().unwrap();
        assert_eq!(identity.peer_id(), identity.fingerprint().to_peer_id());
    }

    #[test]
    fn test_load_or_generate_is_stable() {
        let store = InMemoryIdentityStore::default();
        let first = load_or_generate(&store).unwrap();
        let second = load_or_generate(&store).unwrap();
        assert_eq!(first.peer_id(), second.peer_id());
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn test_clear_forces_new_identity() {
        let store = InMemoryIdentityStore::default();
        let first = load_or_generate(&store).unwrap();
        store.clear().unwrap();
        let second = load_or_generate(&store).unwrap();
        assert_ne!(first.fingerprint(), second.fingerprint());
    }
}
