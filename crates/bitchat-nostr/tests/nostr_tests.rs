//! Relay-side round trip without a relay: embed, wrap, unwrap, extract

use uuid::Uuid;

use bitchat_core::payload::{self, PrivatePayload};
use bitchat_core::types::{PeerId, Timestamp};
use bitchat_core::{BitchatPacket, MessageType};
use bitchat_nostr::embed::{embed_packet, extract_packet};
use bitchat_nostr::giftwrap;
use nostr_sdk::Keys;

fn private_packet(sender: PeerId, recipient: PeerId, message_id: Uuid) -> BitchatPacket {
    let bytes = payload::encode(&PrivatePayload {
        message_id,
        content: "routed around the mesh".into(),
        recipient_nickname: "bob".into(),
    })
    .unwrap();
    BitchatPacket::new(MessageType::PrivateMessage, sender, bytes)
        .with_timestamp(Timestamp::from_millis(1_700_000_000_000))
        .with_recipient(recipient)
}

#[test]
fn end_to_end_wrap_and_extract() {
    let alice_keys = Keys::generate();
    let bob_keys = Keys::generate();
    let alice_peer = PeerId::new([1; 8]);
    let bob_peer = PeerId::new([2; 8]);
    let message_id = Uuid::new_v4();

    // Sender side: packet -> embedding -> gift wrap.
    let packet = private_packet(alice_peer, bob_peer, message_id);
    let content = embed_packet(&packet).unwrap();
    let event = giftwrap::wrap(&alice_keys, &bob_keys.public_key(), &content, 3600).unwrap();

    // Receiver side: unwrap -> extract -> decode payload.
    let unwrapped = giftwrap::unwrap(&bob_keys, &event).unwrap().unwrap();
    assert_eq!(unwrapped.sender, alice_keys.public_key());

    let extracted = extract_packet(&unwrapped.content).unwrap().unwrap();
    assert_eq!(extracted, packet);

    let private: PrivatePayload = payload::decode(&extracted.payload).unwrap();
    assert_eq!(private.message_id, message_id);
    assert_eq!(private.content, "routed around the mesh");
}

#[test]
fn third_party_cannot_unwrap() {
    let alice_keys = Keys::generate();
    let bob_keys = Keys::generate();
    let eve_keys = Keys::generate();

    let packet = private_packet(PeerId::new([1; 8]), PeerId::new([2; 8]), Uuid::new_v4());
    let content = embed_packet(&packet).unwrap();
    let event = giftwrap::wrap(&alice_keys, &bob_keys.public_key(), &content, 3600).unwrap();

    assert!(giftwrap::unwrap(&eve_keys, &event).is_err());
}
