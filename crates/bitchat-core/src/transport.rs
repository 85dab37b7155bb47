//! Transport abstraction consumed by the message router
//!
//! Each concrete transport (BLE mesh, Nostr relay) exposes the same narrow
//! surface. The router selects the first transport that reports the
//! recipient reachable; everything else about delivery is the transport's
//! business.

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::Result;
use crate::payload::ReceiptPayload;
use crate::types::PeerId;

/// Unified transport interface for routed traffic
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short transport name for logs and errors
    fn name(&self) -> &'static str;

    /// True when this transport can currently deliver to `peer`
    async fn is_peer_reachable(&self, peer: PeerId) -> bool;

    /// Send a private text message to `peer`
    async fn send_private(
        &self,
        peer: PeerId,
        content: String,
        recipient_nickname: String,
        message_id: Uuid,
    ) -> Result<()>;

    /// Broadcast a public text message to everyone in range
    async fn send_broadcast(&self, content: String, message_id: Uuid) -> Result<()>;

    /// Acknowledge delivery of `message_id` to its sender
    async fn send_delivery_ack(&self, peer: PeerId, message_id: Uuid) -> Result<()>;

    /// Send a read receipt to the original sender
    async fn send_read_receipt(&self, peer: PeerId, receipt: ReceiptPayload) -> Result<()>;

    /// Notify `peer` of a favorite status change
    async fn send_favorite_notification(&self, peer: PeerId, is_favorite: bool) -> Result<()>;
}

/// Maps mesh peers to long-term relay (Nostr) public keys
///
/// Fed by favorite exchanges; the relay transport derives reachability
/// from it. Defined here so the favorites store and the relay transport
/// can share it without depending on each other.
pub trait NostrDirectory: Send + Sync {
    /// The peer's announced Nostr public key, hex encoded
    fn nostr_public_key_for(&self, peer: PeerId) -> Option<String>;
}

/// Operational controls the mesh transport exposes beyond routed sends
///
/// Consumed by the runtime for the host-facing control surface; every
/// operation is idempotent and fire-and-forget.
pub trait MeshControl: Send + Sync {
    /// Begin advertising, scanning and announcing
    fn start(&self);
    /// Stop the radio
    fn stop(&self);
    /// Drop every connection immediately
    fn emergency_disconnect(&self);
    /// Wipe key material, sessions and queues
    fn panic_clear(&self);
    /// Change the announced nickname
    fn set_nickname(&self, nickname: String);
    /// Drop all traffic from an identity
    fn block(&self, fingerprint: crate::types::Fingerprint);
    /// Offer a file over the mesh, privately when `peer` is given
    fn send_file_transfer(
        &self,
        file_name: Option<String>,
        mime_type: Option<String>,
        content: Vec<u8>,
        peer: Option<PeerId>,
    );
}
