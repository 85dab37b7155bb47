//! Sealed gift-wrap envelopes for relay traffic
//!
//! Two encryption layers hide both content and sender: the embedded packet
//! is sealed as an ephemeral DM to the recipient, then the sealed event is
//! wrapped by single-use keys into an outer event tagged to the recipient.
//! Outer timestamps are randomized into the past and carry an expiration
//! tag so relays shed the traffic.

use nostr_sdk::nips::nip04;
use nostr_sdk::prelude::*;
use nostr_sdk::{Event, EventBuilder, Keys, Kind, PublicKey, Tag, Timestamp};
use rand::Rng;

use crate::error::RelayError;

/// Event kind for the sealed inner DM
pub const SEAL_KIND: Kind = Kind::EncryptedDirectMessage;

/// Event kind for the outer wrap
pub const WRAP_KIND: Kind = Kind::GiftWrap;

// ----------------------------------------------------------------------------
// Wrapping
// ----------------------------------------------------------------------------

/// Seal `content` to `recipient` and wrap it with single-use keys
pub fn wrap(
    sender_keys: &Keys,
    recipient: &PublicKey,
    content: &str,
    expiration_seconds: u64,
) -> Result<Event, RelayError> {
    // Inner layer: the DM sealed by the real sender.
    let sealed_content = nip04::encrypt(
        sender_keys
            .secret_key()
            .map_err(|err| RelayError::EncryptionFailed(err.to_string()))?,
        recipient,
        content,
    )
    .map_err(|err| RelayError::EncryptionFailed(err.to_string()))?;

    let seal = EventBuilder::new(SEAL_KIND, sealed_content, [Tag::public_key(*recipient)])
        .to_event(sender_keys)
        .map_err(|err| RelayError::EncryptionFailed(err.to_string()))?;

    // Outer layer: single-use keys wrap the sealed event, so relays see
    // neither the real sender nor the content.
    let wrap_keys = Keys::generate();
    let wrapped_content = nip04::encrypt(
        wrap_keys
            .secret_key()
            .map_err(|err| RelayError::EncryptionFailed(err.to_string()))?,
        recipient,
        seal.as_json(),
    )
    .map_err(|err| RelayError::EncryptionFailed(err.to_string()))?;

    let now = Timestamp::now();
    let mut rng = rand::thread_rng();
    let backdate = rng.gen_range(0..86_400);
    let expiry = now.as_u64() + rng.gen_range(expiration_seconds / 2..=expiration_seconds);

    EventBuilder::new(
        WRAP_KIND,
        wrapped_content,
        [
            Tag::public_key(*recipient),
            Tag::expiration(Timestamp::from(expiry)),
        ],
    )
    .custom_created_at(Timestamp::from(now.as_u64().saturating_sub(backdate)))
    .to_event(&wrap_keys)
    .map_err(|err| RelayError::EncryptionFailed(err.to_string()))
}

// ----------------------------------------------------------------------------
// Unwrapping
// ----------------------------------------------------------------------------

/// Result of unwrapping a gift wrap addressed to us
pub struct Unwrapped {
    /// The real sender's public key, from the sealed layer
    pub sender: PublicKey,
    /// The decrypted content
    pub content: String,
}

/// Unwrap an outer event, returning `None` for events of other kinds
pub fn unwrap(receiver_keys: &Keys, event: &Event) -> Result<Option<Unwrapped>, RelayError> {
    if event.kind != WRAP_KIND {
        return Ok(None);
    }

    let secret_key = receiver_keys
        .secret_key()
        .map_err(|err| RelayError::DecryptionFailed(err.to_string()))?;

    // Outer layer: the wrap keys signed the event; decrypt against them.
    let seal_json = nip04::decrypt(secret_key, &event.pubkey, &event.content)
        .map_err(|err| RelayError::DecryptionFailed(err.to_string()))?;
    let seal: Event = serde_json::from_str(&seal_json)
        .map_err(|err| RelayError::DecryptionFailed(format!("bad seal json: {err}")))?;

    if seal.kind != SEAL_KIND {
        return Err(RelayError::DecryptionFailed(
            "sealed layer has unexpected kind".into(),
        ));
    }
    seal.verify()
        .map_err(|err| RelayError::DecryptionFailed(format!("seal signature invalid: {err}")))?;

    // Inner layer: the real sender sealed the content to us.
    let content = nip04::decrypt(secret_key, &seal.pubkey, &seal.content)
        .map_err(|err| RelayError::DecryptionFailed(err.to_string()))?;

    Ok(Some(Unwrapped {
        sender: seal.pubkey,
        content,
    }))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let alice = Keys::generate();
        let bob = Keys::generate();

        let event = wrap(&alice, &bob.public_key(), "bitchat1:AAAA", 3600).unwrap();
        assert_eq!(event.kind, WRAP_KIND);
        // The outer event is signed by throwaway keys, not by Alice.
        assert_ne!(event.pubkey, alice.public_key());

        let unwrapped = unwrap(&bob, &event).unwrap().unwrap();
        assert_eq!(unwrapped.sender, alice.public_key());
        assert_eq!(unwrapped.content, "bitchat1:AAAA");
    }

    #[test]
    fn test_unwrap_rejects_wrong_recipient() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let eve = Keys::generate();

        let event = wrap(&alice, &bob.public_key(), "secret", 3600).unwrap();
        assert!(unwrap(&eve, &event).is_err());
    }

    #[test]
    fn test_unwrap_ignores_other_kinds() {
        let alice = Keys::generate();
        let note = EventBuilder::text_note("hello", [])
            .to_event(&alice)
            .unwrap();
        assert!(unwrap(&alice, &note).unwrap().is_none());
    }

    #[test]
    fn test_wrap_is_backdated_and_expiring() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let event = wrap(&alice, &bob.public_key(), "x", 3600).unwrap();

        assert!(event.created_at <= Timestamp::now());
        let has_expiration = event
            .tags
            .iter()
            .any(|tag| tag.kind() == nostr_sdk::TagKind::Expiration);
        assert!(has_expiration);
    }
}
