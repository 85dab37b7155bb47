//! Favorites and blocks, keyed by stable fingerprints
//!
//! Favorites carry the peer's Nostr public key when one was exchanged,
//! which is what makes a peer relay-reachable. Peer IDs rotate with
//! sessions, so the fingerprint is the primary key and the latest peer ID
//! is an index entry.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use bitchat_core::transport::NostrDirectory;
use bitchat_core::types::{Fingerprint, PeerId};

// ----------------------------------------------------------------------------
// Entries
// ----------------------------------------------------------------------------

/// Favorite state for one identity
#[derive(Debug, Clone, Default)]
pub struct FavoriteEntry {
    /// We favorited them
    pub is_favorite: bool,
    /// They favorited us
    pub favorited_us: bool,
    /// Their announced Nostr public key, hex
    pub nostr_public_key: Option<String>,
    /// Most recent peer ID seen for this identity
    pub last_peer_id: Option<PeerId>,
}

// ----------------------------------------------------------------------------
// Store
// ----------------------------------------------------------------------------

/// In-memory favorites and block list
#[derive(Default)]
pub struct FavoritesStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    favorites: HashMap<Fingerprint, FavoriteEntry>,
    blocked: HashSet<Fingerprint>,
    peer_index: HashMap<PeerId, Fingerprint>,
}

impl FavoritesStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a peer ID with its fingerprint (from an announce)
    pub fn record_peer(&self, peer: PeerId, fingerprint: Fingerprint) {
        let mut inner = self.inner.write().expect("favorites lock");
        inner.peer_index.insert(peer, fingerprint);
        inner
            .favorites
            .entry(fingerprint)
            .or_default()
            .last_peer_id = Some(peer);
    }

    /// Set or clear our favorite mark for an identity
    pub fn set_favorite(&self, fingerprint: Fingerprint, is_favorite: bool) {
        let mut inner = self.inner.write().expect("favorites lock");
        inner.favorites.entry(fingerprint).or_default().is_favorite = is_favorite;
    }

    /// Record a favorite notification received from a peer
    pub fn record_peer_favorite(
        &self,
        peer: PeerId,
        favorited_us: bool,
        nostr_public_key: Option<String>,
    ) {
        let mut inner = self.inner.write().expect("favorites lock");
        let Some(fingerprint) = inner.peer_index.get(&peer).copied() else {
            return;
        };
        let entry = inner.favorites.entry(fingerprint).or_default();
        entry.favorited_us = favorited_us;
        if nostr_public_key.is_some() {
            entry.nostr_public_key = nostr_public_key;
        }
        entry.last_peer_id = Some(peer);
    }

    /// Our favorite mark for an identity
    pub fn is_favorite(&self, fingerprint: Fingerprint) -> bool {
        self.inner
            .read()
            .expect("favorites lock")
            .favorites
            .get(&fingerprint)
            .map(|entry| entry.is_favorite)
            .unwrap_or(false)
    }

    /// Full entry for an identity
    pub fn entry(&self, fingerprint: Fingerprint) -> Option<FavoriteEntry> {
        self.inner
            .read()
            .expect("favorites lock")
            .favorites
            .get(&fingerprint)
            .cloned()
    }

    /// Block an identity
    pub fn block(&self, fingerprint: Fingerprint) {
        self.inner
            .write()
            .expect("favorites lock")
            .blocked
            .insert(fingerprint);
    }

    /// Unblock an identity
    pub fn unblock(&self, fingerprint: Fingerprint) {
        self.inner
            .write()
            .expect("favorites lock")
            .blocked
            .remove(&fingerprint);
    }

    /// True when the identity is blocked
    pub fn is_blocked(&self, fingerprint: Fingerprint) -> bool {
        self.inner
            .read()
            .expect("favorites lock")
            .blocked
            .contains(&fingerprint)
    }

    /// Wipe everything
    pub fn clear(&self) {
        let mut inner = self.inner.write().expect("favorites lock");
        inner.favorites.clear();
        inner.blocked.clear();
        inner.peer_index.clear();
    }
}

impl NostrDirectory for FavoritesStore {
    fn nostr_public_key_for(&self, peer: PeerId) -> Option<String> {
        let inner = self.inner.read().expect("favorites lock");
        let fingerprint = inner.peer_index.get(&peer)?;
        inner
            .favorites
            .get(fingerprint)
            .and_then(|entry| entry.nostr_public_key.clone())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint(n: u8) -> Fingerprint {
        Fingerprint::new([n; 32])
    }

    #[test]
    fn test_favorite_roundtrip() {
        let store = FavoritesStore::new();
        assert!(!store.is_favorite(fingerprint(1)));
        store.set_favorite(fingerprint(1), true);
        assert!(store.is_favorite(fingerprint(1)));
        store.set_favorite(fingerprint(1), false);
        assert!(!store.is_favorite(fingerprint(1)));
    }

    #[test]
    fn test_peer_favorite_carries_nostr_key() {
        let store = FavoritesStore::new();
        let peer = PeerId::new([1; 8]);
        store.record_peer(peer, fingerprint(1));
        store.record_peer_favorite(peer, true, Some("abcdef".into()));

        assert_eq!(store.nostr_public_key_for(peer).as_deref(), Some("abcdef"));
        // Unfavoriting without a key keeps the known key.
        store.record_peer_favorite(peer, false, None);
        assert_eq!(store.nostr_public_key_for(peer).as_deref(), Some("abcdef"));
    }

    #[test]
    fn test_unknown_peer_has_no_key() {
        let store = FavoritesStore::new();
        assert!(store.nostr_public_key_for(PeerId::new([9; 8])).is_none());
    }

    #[test]
    fn test_blocking() {
        let store = FavoritesStore::new();
        store.block(fingerprint(2));
        assert!(store.is_blocked(fingerprint(2)));
        store.unblock(fingerprint(2));
        assert!(!store.is_blocked(fingerprint(2)));
    }

    #[test]
    fn test_peer_id_rotation_keeps_identity() {
        let store = FavoritesStore::new();
        let old_peer = PeerId::new([1; 8]);
        let new_peer = PeerId::new([2; 8]);

        store.record_peer(old_peer, fingerprint(7));
        store.record_peer_favorite(old_peer, true, Some("key".into()));
        store.record_peer(new_peer, fingerprint(7));

        // The new peer ID resolves to the same identity and key.
        assert_eq!(store.nostr_public_key_for(new_peer).as_deref(), Some("key"));
        assert_eq!(
            store.entry(fingerprint(7)).unwrap().last_peer_id,
            Some(new_peer)
        );
    }
}
