//! Packet model for the BitChat wire protocol
//!
//! A [`BitchatPacket`] is the unit handed to the codec in [`crate::wire`];
//! its binary layout is fixed there for cross-implementation compatibility.

use crate::errors::PacketError;
use crate::types::{PeerId, Timestamp, Ttl};

// ----------------------------------------------------------------------------
// Protocol Version
// ----------------------------------------------------------------------------

/// Current wire protocol version; receivers reject anything else
pub const PROTOCOL_VERSION: u8 = 2;

// ----------------------------------------------------------------------------
// Message Types
// ----------------------------------------------------------------------------

/// Message types carried in the packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Periodic identity heartbeat (peer ID, nickname, static key)
    Announce = 0x01,
    /// Public broadcast text
    Message = 0x02,
    /// Private text, carried inside a Noise envelope or a relay gift wrap
    PrivateMessage = 0x03,
    /// File transfer offer with inline content
    FileTransfer = 0x04,
    /// Delivery acknowledgment for a private message
    DeliveryAck = 0x05,
    /// Read receipt for a private message
    ReadReceipt = 0x06,
    /// One shard of a fragmented packet
    Fragment = 0x07,
    /// First or third Noise XX handshake message (initiator -> responder)
    NoiseHandshakeInit = 0x10,
    /// Second Noise XX handshake message (responder -> initiator)
    NoiseHandshakeResp = 0x11,
    /// Encrypted transport message on an established session
    NoiseTransport = 0x12,
    /// Favorite / unfavorite notification
    Favorite = 0x20,
    /// Graceful departure; tears down the session
    Leave = 0x21,
}

impl MessageType {
    /// Convert from the wire byte, rejecting unknown values
    pub fn from_u8(value: u8) -> Result<Self, PacketError> {
        match value {
            0x01 => Ok(Self::Announce),
            0x02 => Ok(Self::Message),
            0x03 => Ok(Self::PrivateMessage),
            0x04 => Ok(Self::FileTransfer),
            0x05 => Ok(Self::DeliveryAck),
            0x06 => Ok(Self::ReadReceipt),
            0x07 => Ok(Self::Fragment),
            0x10 => Ok(Self::NoiseHandshakeInit),
            0x11 => Ok(Self::NoiseHandshakeResp),
            0x12 => Ok(Self::NoiseTransport),
            0x20 => Ok(Self::Favorite),
            0x21 => Ok(Self::Leave),
            value => Err(PacketError::UnsupportedType { value }),
        }
    }
}

// ----------------------------------------------------------------------------
// BitChat Packet
// ----------------------------------------------------------------------------

/// The mesh wire unit
///
/// `recipient_id` of `None` (or the all-zero address) means broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitchatPacket {
    /// Protocol version, currently [`PROTOCOL_VERSION`]
    pub version: u8,
    /// Message type
    pub message_type: MessageType,
    /// Remaining forwarding hops
    pub ttl: Ttl,
    /// Sender-stamped creation time
    pub timestamp: Timestamp,
    /// Originating peer
    pub sender_id: PeerId,
    /// Directed recipient, absent for broadcast
    pub recipient_id: Option<PeerId>,
    /// Length-prefixed payload bytes
    pub payload: Vec<u8>,
    /// Optional signature over the canonical header and payload
    pub signature: Option<[u8; 64]>,
}

impl BitchatPacket {
    /// Create a broadcast packet stamped with the current time
    pub fn new(message_type: MessageType, sender_id: PeerId, payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_type,
            ttl: Ttl::default(),
            timestamp: Timestamp::now(),
            sender_id,
            recipient_id: None,
            payload,
            signature: None,
        }
    }

    /// Direct the packet at a single recipient
    pub fn with_recipient(mut self, recipient_id: PeerId) -> Self {
        self.recipient_id = Some(recipient_id);
        self
    }

    /// Override the TTL
    pub fn with_ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = ttl;
        self
    }

    /// Override the sender timestamp
    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attach a signature
    pub fn with_signature(mut self, signature: [u8; 64]) -> Self {
        self.signature = Some(signature);
        self
    }

    /// True when the packet is addressed to everyone
    pub fn is_broadcast(&self) -> bool {
        match self.recipient_id {
            None => true,
            Some(id) => id.is_broadcast(),
        }
    }

    /// True when the packet is addressed to `peer` specifically
    pub fn is_directed_at(&self, peer: PeerId) -> bool {
        self.recipient_id == Some(peer)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
