//! Typed events flowing up from transports to the runtime and application
//!
//! Transports never call into the router or pipeline directly; they emit
//! events on an mpsc channel owned by the runtime, which fans them out.

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::types::{Fingerprint, PeerId, Timestamp};

// ----------------------------------------------------------------------------
// Public Message
// ----------------------------------------------------------------------------

/// A public broadcast message as surfaced to the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicMessage {
    /// Application message identifier
    pub message_id: String,
    /// Originating peer
    pub sender: PeerId,
    /// Sender nickname, when known from an announce
    pub sender_nickname: Option<String>,
    /// Message body
    pub content: String,
    /// Sender-stamped creation time
    pub timestamp: Timestamp,
}

// ----------------------------------------------------------------------------
// Protocol Events
// ----------------------------------------------------------------------------

/// Everything the core reports upward
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    /// A peer announced itself on a connected link
    PeerConnected {
        peer: PeerId,
        nickname: String,
        fingerprint: Fingerprint,
    },
    /// A peer left or its last link dropped
    PeerDisconnected { peer: PeerId },
    /// Public broadcast text arrived on any transport
    PublicMessageReceived(PublicMessage),
    /// Private text arrived and decrypted
    PrivateMessageReceived {
        peer: PeerId,
        message_id: Uuid,
        content: String,
    },
    /// An inbound file transfer is offered for acceptance
    FileTransferOffered {
        peer: PeerId,
        sender_nickname: String,
        file_name: Option<String>,
        mime_type: Option<String>,
        content: Vec<u8>,
        is_private: bool,
    },
    /// The remote end acknowledged delivery
    DeliveryAcked { peer: PeerId, message_id: Uuid },
    /// The remote end read the message
    ReadReceiptReceived {
        peer: PeerId,
        message_id: Uuid,
        read_at: Timestamp,
    },
    /// A peer favorited or unfavorited us
    FavoriteChanged {
        peer: PeerId,
        is_favorite: bool,
        nostr_public_key: Option<String>,
    },
    /// A Noise session reached transport mode
    SessionEstablished { peer: PeerId },
    /// A Noise session died; queued traffic may need rerouting
    SessionLost { peer: PeerId },
    /// A private message exhausted its deadline without a route
    MessageUnreachable { peer: PeerId, message_id: Uuid },
}

/// Sender half of the event plane
pub type EventSender = mpsc::UnboundedSender<ProtocolEvent>;

/// Receiver half of the event plane
pub type EventReceiver = mpsc::UnboundedReceiver<ProtocolEvent>;

/// Create the event channel wiring transports to the runtime
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
