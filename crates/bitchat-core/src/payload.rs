//! Application payloads carried inside packets
//!
//! The outer wire format is hand-rolled for interop; the structures riding
//! in packet payloads are serde types encoded with bincode. Private
//! payloads travel inside a Noise envelope on mesh or a gift wrap on the
//! relay, never in the clear.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::Result;
use crate::types::Timestamp;

// ----------------------------------------------------------------------------
// Announce
// ----------------------------------------------------------------------------

/// Periodic identity heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnouncePayload {
    /// Human-readable display name
    pub nickname: String,
    /// Static Noise public key; fingerprint and peer ID derive from it
    pub noise_public_key: [u8; 32],
}

// ----------------------------------------------------------------------------
// Private Message
// ----------------------------------------------------------------------------

/// Private text message, decrypted out of a Noise envelope or gift wrap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivatePayload {
    /// Application message identifier, echoed in acks and receipts
    pub message_id: Uuid,
    /// Message body
    pub content: String,
    /// Recipient nickname as the sender knew it
    pub recipient_nickname: String,
}

// ----------------------------------------------------------------------------
// File Transfer
// ----------------------------------------------------------------------------

/// Inline file transfer offer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePayload {
    /// Original file name, if the sender had one
    pub file_name: Option<String>,
    /// MIME type, if known
    pub mime_type: Option<String>,
    /// Raw file content
    pub content: Vec<u8>,
}

// ----------------------------------------------------------------------------
// Acks and Receipts
// ----------------------------------------------------------------------------

/// Delivery acknowledgment for a private message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    /// The acknowledged message
    pub message_id: Uuid,
}

/// Read receipt for a private message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptPayload {
    /// The message that was read
    pub message_id: Uuid,
    /// When the reader opened it
    pub read_at: Timestamp,
}

// ----------------------------------------------------------------------------
// Favorites
// ----------------------------------------------------------------------------

/// Favorite / unfavorite notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FavoritePayload {
    /// True when the sender just favorited us
    pub is_favorite: bool,
    /// Sender's Nostr public key, enabling relay reachability
    pub nostr_public_key: Option<String>,
}

// ----------------------------------------------------------------------------
// Codec Helpers
// ----------------------------------------------------------------------------

/// Encode any payload struct with bincode
pub fn encode<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(payload)?)
}

/// Decode any payload struct with bincode
pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announce_roundtrip() {
        let announce = AnnouncePayload {
            nickname: "alice".into(),
            noise_public_key: [7; 32],
        };
        let bytes = encode(&announce).unwrap();
        let parsed: AnnouncePayload = decode(&bytes).unwrap();
        assert_eq!(parsed, announce);
    }

    #[test]
    fn test_private_payload_roundtrip() {
        let payload = PrivatePayload {
            message_id: Uuid::new_v4(),
            content: "meet at the bridge".into(),
            recipient_nickname: "bob".into(),
        };
        let bytes = encode(&payload).unwrap();
        let parsed: PrivatePayload = decode(&bytes).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn test_file_payload_optional_fields() {
        let payload = FilePayload {
            file_name: None,
            mime_type: Some("image/png".into()),
            content: vec![1, 2, 3],
        };
        let bytes = encode(&payload).unwrap();
        let parsed: FilePayload = decode(&bytes).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let garbage = [0xFFu8; 3];
        assert!(decode::<PrivatePayload>(&garbage).is_err());
    }
}
