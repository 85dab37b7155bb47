//! Duplicate suppression and TTL routing decisions
//!
//! Every inbound packet is keyed by the first 16 bytes of
//! `SHA-256(senderID || timestamp || first 16 payload bytes)` and checked
//! against a bounded LRU with a freshness window. Fresh packets are then
//! classified: deliver locally, forward with a decremented TTL, both, or
//! drop.

use std::collections::{HashMap, VecDeque};

use sha2::{Digest, Sha256};

use crate::config::DedupConfig;
use crate::packet::BitchatPacket;
use crate::types::{PeerId, TimeSource, Timestamp};

// ----------------------------------------------------------------------------
// Dedup Key
// ----------------------------------------------------------------------------

/// Bytes of packet payload mixed into the dedup key
pub const DEDUP_PAYLOAD_PREFIX: usize = 16;

/// Truncated hash identifying a packet for duplicate suppression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DedupKey([u8; 16]);

impl DedupKey {
    /// Compute the key for a packet
    pub fn for_packet(packet: &BitchatPacket) -> Self {
        let prefix_len = core::cmp::min(packet.payload.len(), DEDUP_PAYLOAD_PREFIX);

        let mut hasher = Sha256::new();
        hasher.update(packet.sender_id.as_bytes());
        hasher.update(packet.timestamp.as_millis().to_be_bytes());
        hasher.update(&packet.payload[..prefix_len]);
        let hash = hasher.finalize();

        let mut key = [0u8; 16];
        key.copy_from_slice(&hash[..16]);
        Self(key)
    }
}

// ----------------------------------------------------------------------------
// Seen Cache
// ----------------------------------------------------------------------------

/// Bounded LRU of recently seen packet keys
///
/// Entries older than the freshness window no longer count as seen; a
/// re-arrival past the window refreshes the entry instead of dropping the
/// packet.
pub struct SeenCache {
    entries: HashMap<DedupKey, Timestamp>,
    order: VecDeque<DedupKey>,
    config: DedupConfig,
}

impl SeenCache {
    /// Create a cache with the given bounds
    pub fn new(config: DedupConfig) -> Self {
        Self {
            entries: HashMap::with_capacity(config.capacity),
            order: VecDeque::with_capacity(config.capacity),
            config,
        }
    }

    /// Record a key, returning true when it was already seen recently
    pub fn check_and_insert(&mut self, key: DedupKey, now: Timestamp) -> bool {
        let window = self.config.window.as_millis() as u64;

        let duplicate = match self.entries.get(&key) {
            Some(&seen_at) => now.millis_since(seen_at) <= window,
            None => false,
        };

        if !duplicate {
            if self.entries.insert(key, now).is_none() {
                self.order.push_back(key);
            }
            while self.entries.len() > self.config.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.entries.remove(&oldest);
                } else {
                    break;
                }
            }
        }

        duplicate
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all tracked keys
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

// ----------------------------------------------------------------------------
// Route Decisions
// ----------------------------------------------------------------------------

/// Why a packet was consumed without action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Seen within the dedup window
    Duplicate,
    /// Our own packet came back around
    Loopback,
    /// Directed elsewhere with no hops left
    Expired,
}

/// What to do with an inbound packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Consume without delivering or forwarding
    Drop(DropReason),
    /// Hand to the local receive path only
    Deliver,
    /// Re-encode with the decremented TTL and flood to other links
    Forward { ttl: u8 },
    /// Deliver locally and flood onward
    DeliverAndForward { ttl: u8 },
}

/// Classifies inbound packets against the local identity and seen cache
pub struct PacketRouter<T: TimeSource> {
    self_id: PeerId,
    cache: SeenCache,
    time_source: T,
}

impl<T: TimeSource> PacketRouter<T> {
    /// Create a router for the local peer
    pub fn new(self_id: PeerId, config: DedupConfig, time_source: T) -> Self {
        Self {
            self_id,
            cache: SeenCache::new(config),
            time_source,
        }
    }

    /// Decide the fate of one inbound packet
    pub fn route(&mut self, packet: &BitchatPacket) -> RouteDecision {
        let now = self.time_source.now();
        let key = DedupKey::for_packet(packet);
        if self.cache.check_and_insert(key, now) {
            return RouteDecision::Drop(DropReason::Duplicate);
        }

        if packet.sender_id == self.self_id {
            return RouteDecision::Drop(DropReason::Loopback);
        }

        let forward_ttl = if packet.ttl.value() > 1 {
            Some(packet.ttl.value() - 1)
        } else {
            None
        };

        if packet.is_directed_at(self.self_id) {
            // Directed at us: consume, never forward.
            return RouteDecision::Deliver;
        }

        if packet.is_broadcast() {
            return match forward_ttl {
                Some(ttl) => RouteDecision::DeliverAndForward { ttl },
                None => RouteDecision::Deliver,
            };
        }

        // Directed at somebody else: relay only.
        match forward_ttl {
            Some(ttl) => RouteDecision::Forward { ttl },
            None => RouteDecision::Drop(DropReason::Expired),
        }
    }

    /// Forget all seen packets
    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::MessageType;
    use crate::types::{ManualTimeSource, Ttl};

    fn packet(sender: PeerId, timestamp: u64, payload: &[u8]) -> BitchatPacket {
        BitchatPacket::new(MessageType::Message, sender, payload.to_vec())
            .with_timestamp(Timestamp::from_millis(timestamp))
    }

    fn router(self_id: PeerId) -> PacketRouter<ManualTimeSource> {
        PacketRouter::new(self_id, DedupConfig::default(), ManualTimeSource::starting_at(0))
    }

    #[test]
    fn test_dedup_key_sensitivity() {
        let a = packet(PeerId::new([1; 8]), 100, b"payload one");
        let same = packet(PeerId::new([1; 8]), 100, b"payload one");
        assert_eq!(DedupKey::for_packet(&a), DedupKey::for_packet(&same));

        let other_sender = packet(PeerId::new([2; 8]), 100, b"payload one");
        let other_time = packet(PeerId::new([1; 8]), 101, b"payload one");
        let other_payload = packet(PeerId::new([1; 8]), 100, b"payload two");
        assert_ne!(DedupKey::for_packet(&a), DedupKey::for_packet(&other_sender));
        assert_ne!(DedupKey::for_packet(&a), DedupKey::for_packet(&other_time));
        assert_ne!(DedupKey::for_packet(&a), DedupKey::for_packet(&other_payload));
    }

    #[test]
    fn test_duplicate_dropped_once_within_window() {
        let self_id = PeerId::new([9; 8]);
        let mut router = router(self_id);
        let incoming = packet(PeerId::new([1; 8]), 100, b"hello");

        assert!(matches!(
            router.route(&incoming),
            RouteDecision::DeliverAndForward { .. }
        ));
        assert_eq!(
            router.route(&incoming),
            RouteDecision::Drop(DropReason::Duplicate)
        );
    }

    #[test]
    fn test_duplicate_allowed_after_window() {
        let self_id = PeerId::new([9; 8]);
        let clock = ManualTimeSource::starting_at(0);
        let mut router =
            PacketRouter::new(self_id, DedupConfig::default(), clock.clone());
        let incoming = packet(PeerId::new([1; 8]), 100, b"hello");

        assert!(!matches!(router.route(&incoming), RouteDecision::Drop(_)));
        clock.advance(61_000);
        assert!(!matches!(router.route(&incoming), RouteDecision::Drop(_)));
    }

    #[test]
    fn test_loopback_suppressed() {
        let self_id = PeerId::new([9; 8]);
        let mut router = router(self_id);
        let own = packet(self_id, 100, b"echo");
        assert_eq!(
            router.route(&own),
            RouteDecision::Drop(DropReason::Loopback)
        );
    }

    #[test]
    fn test_directed_at_self_delivered_not_forwarded() {
        let self_id = PeerId::new([9; 8]);
        let mut router = router(self_id);
        let incoming = packet(PeerId::new([1; 8]), 100, b"for you")
            .with_recipient(self_id)
            .with_ttl(Ttl::new(7));
        assert_eq!(router.route(&incoming), RouteDecision::Deliver);
    }

    #[test]
    fn test_ttl_decrements_exactly_once() {
        let self_id = PeerId::new([9; 8]);
        let mut router = router(self_id);
        let relayed = packet(PeerId::new([1; 8]), 100, b"onward")
            .with_recipient(PeerId::new([2; 8]))
            .with_ttl(Ttl::new(5));
        assert_eq!(router.route(&relayed), RouteDecision::Forward { ttl: 4 });
    }

    #[test]
    fn test_ttl_one_not_forwarded() {
        let self_id = PeerId::new([9; 8]);
        let mut router = router(self_id);

        let broadcast = packet(PeerId::new([1; 8]), 100, b"last hop").with_ttl(Ttl::new(1));
        assert_eq!(router.route(&broadcast), RouteDecision::Deliver);

        let directed = packet(PeerId::new([1; 8]), 101, b"dead end")
            .with_recipient(PeerId::new([2; 8]))
            .with_ttl(Ttl::new(1));
        assert_eq!(
            router.route(&directed),
            RouteDecision::Drop(DropReason::Expired)
        );

        let zero = packet(PeerId::new([1; 8]), 102, b"expired")
            .with_recipient(PeerId::new([2; 8]))
            .with_ttl(Ttl::new(0));
        assert_eq!(router.route(&zero), RouteDecision::Drop(DropReason::Expired));
    }

    #[test]
    fn test_cache_capacity_bounded() {
        let mut cache = SeenCache::new(DedupConfig {
            capacity: 8,
            ..DedupConfig::default()
        });
        let now = Timestamp::from_millis(0);
        for i in 0..100u64 {
            let key = DedupKey::for_packet(&packet(PeerId::new([1; 8]), i, b"x"));
            cache.check_and_insert(key, now);
        }
        assert!(cache.len() <= 8);
    }

    #[test]
    fn test_short_payload_keys_distinct() {
        // Payloads shorter than the prefix still produce distinct keys.
        let a = packet(PeerId::new([1; 8]), 100, b"ab");
        let b = packet(PeerId::new([1; 8]), 100, b"cd");
        assert_ne!(DedupKey::for_packet(&a), DedupKey::for_packet(&b));
    }
}
