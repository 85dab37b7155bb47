//! Peer book: what the mesh knows about its neighbors
//!
//! A link is anonymous until the peer behind it announces itself; from then
//! on the book maps both directions and tracks nickname, static key and
//! last-seen time. Owned by the mesh loop.

use std::collections::HashMap;

use bitchat_core::noise::fingerprint_of;
use bitchat_core::types::{Fingerprint, PeerId, Timestamp};

use crate::link::LinkId;

// ----------------------------------------------------------------------------
// Peer Entry
// ----------------------------------------------------------------------------

/// Everything known about one neighbor
#[derive(Debug, Clone)]
pub struct PeerEntry {
    /// Short mesh identifier
    pub peer_id: PeerId,
    /// Latest announced nickname
    pub nickname: String,
    /// Announced static Noise public key
    pub static_key: [u8; 32],
    /// Link currently carrying this peer, if connected
    pub link: Option<LinkId>,
    /// Last announce or traffic from this peer
    pub last_seen: Timestamp,
}

impl PeerEntry {
    /// Fingerprint of the announced static key
    pub fn fingerprint(&self) -> Fingerprint {
        fingerprint_of(&self.static_key)
    }

    /// True while a link carries this peer
    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }
}

// ----------------------------------------------------------------------------
// Peer Book
// ----------------------------------------------------------------------------

/// Bidirectional link/peer registry
#[derive(Debug, Default)]
pub struct PeerBook {
    peers: HashMap<PeerId, PeerEntry>,
    by_link: HashMap<LinkId, PeerId>,
}

impl PeerBook {
    /// Create an empty book
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an announce, returning true when this peer is new
    pub fn record_announce(
        &mut self,
        peer_id: PeerId,
        nickname: String,
        static_key: [u8; 32],
        link: LinkId,
        now: Timestamp,
    ) -> bool {
        // Re-point the link mapping in case the peer moved links.
        if let Some(entry) = self.peers.get(&peer_id) {
            if let Some(old_link) = entry.link {
                if old_link != link {
                    self.by_link.remove(&old_link);
                }
            }
        }
        self.by_link.insert(link, peer_id);

        let was_known = self.peers.contains_key(&peer_id);
        let was_connected = self
            .peers
            .get(&peer_id)
            .map(|entry| entry.is_connected())
            .unwrap_or(false);
        self.peers.insert(
            peer_id,
            PeerEntry {
                peer_id,
                nickname,
                static_key,
                link: Some(link),
                last_seen: now,
            },
        );
        !was_known || !was_connected
    }

    /// Refresh last-seen on any traffic from the peer
    pub fn touch(&mut self, peer_id: PeerId, now: Timestamp) {
        if let Some(entry) = self.peers.get_mut(&peer_id) {
            entry.last_seen = now;
        }
    }

    /// The peer behind a link, once announced
    pub fn peer_on_link(&self, link: LinkId) -> Option<PeerId> {
        self.by_link.get(&link).copied()
    }

    /// Look up a peer
    pub fn get(&self, peer_id: PeerId) -> Option<&PeerEntry> {
        self.peers.get(&peer_id)
    }

    /// The link currently carrying a peer
    pub fn link_for(&self, peer_id: PeerId) -> Option<LinkId> {
        self.peers.get(&peer_id).and_then(|entry| entry.link)
    }

    /// True while a link carries the peer
    pub fn is_connected(&self, peer_id: PeerId) -> bool {
        self.peers
            .get(&peer_id)
            .map(|entry| entry.is_connected())
            .unwrap_or(false)
    }

    /// Connected, or seen within `window_millis`
    pub fn is_reachable(&self, peer_id: PeerId, now: Timestamp, window_millis: u64) -> bool {
        match self.peers.get(&peer_id) {
            Some(entry) => {
                entry.is_connected() || now.millis_since(entry.last_seen) <= window_millis
            }
            None => false,
        }
    }

    /// Mark a dropped link, returning the peer it carried
    pub fn link_down(&mut self, link: LinkId) -> Option<PeerId> {
        let peer_id = self.by_link.remove(&link)?;
        if let Some(entry) = self.peers.get_mut(&peer_id) {
            entry.link = None;
        }
        Some(peer_id)
    }

    /// All currently connected peers
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|entry| entry.is_connected())
            .map(|entry| entry.peer_id)
            .collect()
    }

    /// All peers connected or seen within `window_millis`
    pub fn reachable_peers(&self, now: Timestamp, window_millis: u64) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|entry| {
                entry.is_connected() || now.millis_since(entry.last_seen) <= window_millis
            })
            .map(|entry| entry.peer_id)
            .collect()
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.peers.clear();
        self.by_link.clear();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerId {
        PeerId::new([n; 8])
    }

    #[test]
    fn test_announce_links_both_directions() {
        let mut book = PeerBook::new();
        let now = Timestamp::from_millis(1_000);

        let is_new = book.record_announce(peer(1), "alice".into(), [1; 32], LinkId(10), now);
        assert!(is_new);
        assert_eq!(book.peer_on_link(LinkId(10)), Some(peer(1)));
        assert_eq!(book.link_for(peer(1)), Some(LinkId(10)));
        assert!(book.is_connected(peer(1)));

        // A repeat announce on the same link is not a new connection.
        let is_new = book.record_announce(peer(1), "alice".into(), [1; 32], LinkId(10), now);
        assert!(!is_new);
    }

    #[test]
    fn test_peer_moving_links() {
        let mut book = PeerBook::new();
        let now = Timestamp::from_millis(0);
        book.record_announce(peer(1), "alice".into(), [1; 32], LinkId(10), now);
        book.record_announce(peer(1), "alice".into(), [1; 32], LinkId(11), now);

        assert_eq!(book.peer_on_link(LinkId(10)), None);
        assert_eq!(book.peer_on_link(LinkId(11)), Some(peer(1)));
        assert_eq!(book.link_for(peer(1)), Some(LinkId(11)));
    }

    #[test]
    fn test_reachability_window() {
        let mut book = PeerBook::new();
        book.record_announce(
            peer(1),
            "alice".into(),
            [1; 32],
            LinkId(10),
            Timestamp::from_millis(0),
        );
        book.link_down(LinkId(10));

        // Disconnected but recently seen.
        assert!(book.is_reachable(peer(1), Timestamp::from_millis(10_000), 30_000));
        // Too long ago.
        assert!(!book.is_reachable(peer(1), Timestamp::from_millis(40_000), 30_000));
        // Unknown peer.
        assert!(!book.is_reachable(peer(2), Timestamp::from_millis(0), 30_000));
    }

    #[test]
    fn test_link_down_reports_peer() {
        let mut book = PeerBook::new();
        let now = Timestamp::from_millis(0);
        book.record_announce(peer(1), "alice".into(), [1; 32], LinkId(10), now);

        assert_eq!(book.link_down(LinkId(10)), Some(peer(1)));
        assert!(!book.is_connected(peer(1)));
        // Entry survives for reachability and store-and-forward.
        assert!(book.get(peer(1)).is_some());

        // An anonymous link going down reports nobody.
        assert_eq!(book.link_down(LinkId(99)), None);
    }
}
