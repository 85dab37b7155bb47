//! Fragmentation and reassembly for oversize packets
//!
//! A packet whose encoding exceeds the link MTU is split into Fragment
//! packets. Each fragment payload carries a fixed 13-byte header:
//!
//! ```text
//! fragmentID(8) | index(u16 BE) | total(u16 BE) | innerType(1) | chunk
//! ```
//!
//! All fragments of one reassembly share `(senderID, fragmentID)`. Arrival
//! order is arbitrary and duplicates are idempotent; a malformed fragment
//! poisons only its own group.

use std::collections::HashMap;

use rand::RngCore;

use crate::config::FragmentConfig;
use crate::errors::PacketError;
use crate::packet::{BitchatPacket, MessageType};
use crate::types::{PeerId, TimeSource, Timestamp};
use crate::wire;

// ----------------------------------------------------------------------------
// Fragment Header
// ----------------------------------------------------------------------------

/// Fixed-size header at the front of every fragment payload
pub const FRAGMENT_HEADER_LEN: usize = 8 + 2 + 2 + 1;

/// Parsed fragment payload header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Random group identifier chosen by the sender
    pub fragment_id: [u8; 8],
    /// Zero-based shard index
    pub index: u16,
    /// Total shards in the group
    pub total: u16,
    /// Message type of the packet being reassembled
    pub inner_type: u8,
}

impl FragmentHeader {
    /// Serialize the header followed by `chunk` into one fragment payload
    pub fn encode(&self, chunk: &[u8]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(FRAGMENT_HEADER_LEN + chunk.len());
        payload.extend_from_slice(&self.fragment_id);
        payload.extend_from_slice(&self.index.to_be_bytes());
        payload.extend_from_slice(&self.total.to_be_bytes());
        payload.push(self.inner_type);
        payload.extend_from_slice(chunk);
        payload
    }

    /// Parse a fragment payload into header and chunk
    pub fn decode(payload: &[u8]) -> Result<(Self, &[u8]), PacketError> {
        if payload.len() < FRAGMENT_HEADER_LEN {
            return Err(PacketError::MalformedFragment {
                reason: "payload shorter than fragment header",
            });
        }
        let mut fragment_id = [0u8; 8];
        fragment_id.copy_from_slice(&payload[..8]);
        let index = u16::from_be_bytes([payload[8], payload[9]]);
        let total = u16::from_be_bytes([payload[10], payload[11]]);
        let inner_type = payload[12];
        Ok((
            Self {
                fragment_id,
                index,
                total,
                inner_type,
            },
            &payload[FRAGMENT_HEADER_LEN..],
        ))
    }
}

// ----------------------------------------------------------------------------
// Fragmenter
// ----------------------------------------------------------------------------

/// Split an encoded packet into Fragment packets
///
/// The original packet's sender, TTL, timestamp and recipient are preserved
/// on the outer envelope; its type travels in the fragment header.
pub fn fragment_packet(
    packet: &BitchatPacket,
    max_fragment_data: usize,
) -> Result<Vec<BitchatPacket>, PacketError> {
    let encoded = wire::encode(packet, false)?;
    let total = encoded.len().div_ceil(max_fragment_data);
    if total > u16::MAX as usize {
        return Err(PacketError::PayloadTooLarge {
            max: max_fragment_data * u16::MAX as usize,
            actual: encoded.len(),
        });
    }

    let mut fragment_id = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut fragment_id);

    let mut fragments = Vec::with_capacity(total);
    for (index, chunk) in encoded.chunks(max_fragment_data).enumerate() {
        let header = FragmentHeader {
            fragment_id,
            index: index as u16,
            total: total as u16,
            inner_type: packet.message_type as u8,
        };
        let mut fragment = BitchatPacket::new(
            MessageType::Fragment,
            packet.sender_id,
            header.encode(chunk),
        )
        .with_ttl(packet.ttl)
        .with_timestamp(packet.timestamp);
        if let Some(recipient) = packet.recipient_id {
            fragment = fragment.with_recipient(recipient);
        }
        fragments.push(fragment);
    }

    Ok(fragments)
}

/// True when the encoded packet needs fragmenting for the given MTU
pub fn needs_fragmentation(encoded_len: usize, mtu: usize) -> bool {
    encoded_len > mtu
}

// ----------------------------------------------------------------------------
// Reassembler
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct GroupKey {
    sender: PeerId,
    fragment_id: [u8; 8],
}

/// Per-group reassembly state
#[derive(Debug)]
struct ReassemblyBuffer {
    total: u16,
    inner_type: u8,
    chunks: Vec<Option<Vec<u8>>>,
    received: usize,
    first_seen: Timestamp,
    /// Set once the group saw a conflicting fragment; it can never complete
    poisoned: bool,
}

impl ReassemblyBuffer {
    fn new(header: &FragmentHeader, now: Timestamp) -> Self {
        Self {
            total: header.total,
            inner_type: header.inner_type,
            chunks: vec![None; header.total as usize],
            received: 0,
            first_seen: now,
            poisoned: false,
        }
    }

    fn is_complete(&self) -> bool {
        !self.poisoned && self.received == self.total as usize
    }

    fn assemble(self) -> Vec<u8> {
        let mut assembled = Vec::new();
        for chunk in self.chunks.into_iter().flatten() {
            assembled.extend_from_slice(&chunk);
        }
        assembled
    }
}

/// Reassembles fragment groups into the original packets
///
/// Owned by the mesh loop; not internally synchronized.
pub struct Reassembler<T: TimeSource> {
    groups: HashMap<GroupKey, ReassemblyBuffer>,
    config: FragmentConfig,
    time_source: T,
}

impl<T: TimeSource> Reassembler<T> {
    /// Create a reassembler over the given clock
    pub fn new(config: FragmentConfig, time_source: T) -> Self {
        Self {
            groups: HashMap::new(),
            config,
            time_source,
        }
    }

    /// Process one Fragment packet
    ///
    /// Returns the reassembled original packet when its group completes.
    /// Duplicates return `Ok(None)`. Malformed fragments poison their group
    /// and error; other groups are unaffected.
    pub fn insert(&mut self, fragment: &BitchatPacket) -> Result<Option<BitchatPacket>, PacketError> {
        let now = self.time_source.now();
        self.reap(now);

        let (header, chunk) = FragmentHeader::decode(&fragment.payload)?;
        let key = GroupKey {
            sender: fragment.sender_id,
            fragment_id: header.fragment_id,
        };

        if header.total == 0 || header.index >= header.total {
            // Poison any existing state so stragglers cannot revive the group.
            if let Some(buffer) = self.groups.get_mut(&key) {
                buffer.poisoned = true;
            }
            return Err(PacketError::MalformedFragment {
                reason: "fragment index out of range",
            });
        }

        if !self.groups.contains_key(&key) {
            if self.groups.len() >= self.config.max_groups {
                self.evict_oldest();
            }
            self.groups.insert(key, ReassemblyBuffer::new(&header, now));
        }

        let buffer = self.groups.get_mut(&key).expect("group just inserted");
        if buffer.poisoned {
            return Ok(None);
        }

        if header.total != buffer.total || header.inner_type != buffer.inner_type {
            buffer.poisoned = true;
            return Err(PacketError::MalformedFragment {
                reason: "fragment metadata conflicts with group",
            });
        }

        let slot = &mut buffer.chunks[header.index as usize];
        if slot.is_none() {
            *slot = Some(chunk.to_vec());
            buffer.received += 1;
        }

        if buffer.is_complete() {
            let buffer = self.groups.remove(&key).expect("complete group present");
            let assembled = buffer.assemble();
            let packet = wire::decode(&assembled)?;
            return Ok(Some(packet));
        }

        Ok(None)
    }

    /// Drop groups older than the reassembly timeout
    ///
    /// Runs lazily on every insert; the mesh loop also calls it on its
    /// maintenance tick so idle groups do not linger.
    pub fn reap(&mut self, now: Timestamp) {
        let timeout = self.config.reassembly_timeout.as_millis() as u64;
        self.groups
            .retain(|_, buffer| now.millis_since(buffer.first_seen) <= timeout);
    }

    /// Number of open groups
    pub fn open_groups(&self) -> usize {
        self.groups.len()
    }

    /// Discard all reassembly state
    pub fn clear(&mut self) {
        self.groups.clear();
    }

    fn evict_oldest(&mut self) {
        if let Some(key) = self
            .groups
            .iter()
            .min_by_key(|(_, buffer)| buffer.first_seen)
            .map(|(key, _)| *key)
        {
            self.groups.remove(&key);
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
