//! The relay transport behind the router
//!
//! Reachability is favorites-driven: a peer is relay-reachable exactly when
//! the directory knows a Nostr public key for it. Outbound private traffic
//! is a mesh packet embedded in a gift wrap; inbound gift wraps unwrap to
//! packets and surface as protocol events, exactly as mesh traffic does.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use nostr_sdk::{Client, Filter, Keys, PublicKey, RelayPoolNotification};
use ::url::Url;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use bitchat_core::event::{EventSender, ProtocolEvent};
use bitchat_core::payload::{
    self, AckPayload, FavoritePayload, PrivatePayload, ReceiptPayload,
};
use bitchat_core::types::{PeerId, Timestamp};
use bitchat_core::{BitchatPacket, MessageType, Result, Transport};

use crate::config::RelayConfig;
use crate::embed::{embed_packet, extract_packet};
use crate::error::RelayError;
use crate::giftwrap;

// ----------------------------------------------------------------------------
// Directory
// ----------------------------------------------------------------------------

/// Peer-to-key directory consumed for reachability; implemented by the
/// favorites store
pub use bitchat_core::transport::NostrDirectory;

// ----------------------------------------------------------------------------
// Nostr Transport
// ----------------------------------------------------------------------------

/// Relay fallback transport
pub struct NostrTransport {
    config: RelayConfig,
    keys: Keys,
    local_peer_id: PeerId,
    directory: Arc<dyn NostrDirectory>,
    events: EventSender,
    client: RwLock<Option<Client>>,
    active: AtomicBool,
}

impl NostrTransport {
    /// Create a transport; `start` connects it
    pub fn new(
        keys: Keys,
        local_peer_id: PeerId,
        config: RelayConfig,
        directory: Arc<dyn NostrDirectory>,
        events: EventSender,
    ) -> Self {
        Self {
            config,
            keys,
            local_peer_id,
            directory,
            events,
            client: RwLock::new(None),
            active: AtomicBool::new(false),
        }
    }

    /// Our Nostr public key, hex encoded
    pub fn public_key_hex(&self) -> String {
        self.keys.public_key().to_string()
    }

    /// Connect to the configured relays and start unwrapping inbound wraps
    pub async fn start(&self) -> Result<()> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let client = Client::new(&self.keys);
        for relay_url in &self.config.relay_urls {
            let url = Url::parse(relay_url).map_err(|_| RelayError::InvalidRelayUrl {
                url: relay_url.clone(),
            })?;
            client
                .add_relay(url)
                .await
                .map_err(|err| RelayError::PublishFailed(err.to_string()))?;
        }
        client.connect().await;

        // Gift wraps tagged to our long-term key.
        let wrap_filter = Filter::new()
            .kind(giftwrap::WRAP_KIND)
            .pubkey(self.keys.public_key())
            .since(nostr_sdk::Timestamp::now());
        client.subscribe(vec![wrap_filter], None).await;

        let mut notifications = client.notifications();
        let keys = self.keys.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Ok(notification) = notifications.recv().await {
                match notification {
                    RelayPoolNotification::Event { event, .. } => {
                        Self::on_relay_event(&keys, &events, &event);
                    }
                    RelayPoolNotification::Shutdown => {
                        info!("relay pool shut down");
                        break;
                    }
                    _ => {}
                }
            }
        });

        *self.client.write().await = Some(client);
        info!(
            relays = self.config.relay_urls.len(),
            "relay transport started"
        );
        Ok(())
    }

    /// Disconnect from all relays
    pub async fn stop(&self) -> Result<()> {
        self.active.store(false, Ordering::SeqCst);
        if let Some(client) = self.client.write().await.take() {
            if let Err(err) = client.disconnect().await {
                debug!("relay disconnect: {err}");
            }
        }
        Ok(())
    }

    fn on_relay_event(keys: &Keys, events: &EventSender, event: &Event) {
        let unwrapped = match giftwrap::unwrap(keys, event) {
            Ok(Some(unwrapped)) => unwrapped,
            Ok(None) => return,
            Err(err) => {
                debug!("gift wrap unwrap failed: {err}");
                return;
            }
        };

        let packet = match extract_packet(&unwrapped.content) {
            Ok(Some(packet)) => packet,
            Ok(None) => return,
            Err(err) => {
                debug!("embedded packet rejected: {err}");
                return;
            }
        };

        Self::surface_packet(events, &packet);
    }

    /// Turn an unwrapped packet into the same events mesh traffic produces
    fn surface_packet(events: &EventSender, packet: &BitchatPacket) {
        let peer = packet.sender_id;
        match packet.message_type {
            MessageType::PrivateMessage => {
                if let Ok(private) = payload::decode::<PrivatePayload>(&packet.payload) {
                    let _ = events.send(ProtocolEvent::PrivateMessageReceived {
                        peer,
                        message_id: private.message_id,
                        content: private.content,
                    });
                }
            }
            MessageType::DeliveryAck => {
                if let Ok(ack) = payload::decode::<AckPayload>(&packet.payload) {
                    let _ = events.send(ProtocolEvent::DeliveryAcked {
                        peer,
                        message_id: ack.message_id,
                    });
                }
            }
            MessageType::ReadReceipt => {
                if let Ok(receipt) = payload::decode::<ReceiptPayload>(&packet.payload) {
                    let _ = events.send(ProtocolEvent::ReadReceiptReceived {
                        peer,
                        message_id: receipt.message_id,
                        read_at: receipt.read_at,
                    });
                }
            }
            MessageType::Favorite => {
                if let Ok(favorite) = payload::decode::<FavoritePayload>(&packet.payload) {
                    let _ = events.send(ProtocolEvent::FavoriteChanged {
                        peer,
                        is_favorite: favorite.is_favorite,
                        nostr_public_key: favorite.nostr_public_key,
                    });
                }
            }
            other => debug!(?other, "ignoring relay packet of unexpected type"),
        }
    }

    /// Wrap a packet for `peer` and publish it
    async fn publish_packet(&self, peer: PeerId, packet: &BitchatPacket) -> Result<()> {
        let recipient_hex = self
            .directory
            .nostr_public_key_for(peer)
            .ok_or(RelayError::NoKeyForPeer)?;
        let recipient = PublicKey::from_hex(&recipient_hex)
            .map_err(|err| RelayError::InvalidPublicKey(err.to_string()))?;

        let content = embed_packet(packet)?;
        if content.len() > self.config.max_packet_size {
            return Err(RelayError::MalformedEmbedding("packet too large for relay".into()).into());
        }

        let wrapped = giftwrap::wrap(
            &self.keys,
            &recipient,
            &content,
            self.config.expiration_seconds,
        )?;

        let client = self.client.read().await;
        let client = client.as_ref().ok_or(RelayError::NotStarted)?;
        client
            .send_event(wrapped)
            .await
            .map_err(|err| RelayError::PublishFailed(err.to_string()))?;

        debug!(%peer, "published gift-wrapped packet");
        Ok(())
    }

    fn inner_packet(&self, message_type: MessageType, peer: PeerId, bytes: Vec<u8>) -> BitchatPacket {
        BitchatPacket::new(message_type, self.local_peer_id, bytes)
            .with_timestamp(Timestamp::now())
            .with_recipient(peer)
    }
}

#[async_trait]
impl Transport for NostrTransport {
    fn name(&self) -> &'static str {
        "nostr"
    }

    async fn is_peer_reachable(&self, peer: PeerId) -> bool {
        self.active.load(Ordering::SeqCst) && self.directory.nostr_public_key_for(peer).is_some()
    }

    async fn send_private(
        &self,
        peer: PeerId,
        content: String,
        recipient_nickname: String,
        message_id: Uuid,
    ) -> Result<()> {
        let bytes = payload::encode(&PrivatePayload {
            message_id,
            content,
            recipient_nickname,
        })?;
        let packet = self.inner_packet(MessageType::PrivateMessage, peer, bytes);
        self.publish_packet(peer, &packet).await
    }

    async fn send_broadcast(&self, _content: String, _message_id: Uuid) -> Result<()> {
        // Public messages are mesh-only; the router never sends them here.
        warn!("broadcast attempted on relay transport");
        Err(bitchat_core::TransportError::TransportUnavailable { name: "nostr" }.into())
    }

    async fn send_delivery_ack(&self, peer: PeerId, message_id: Uuid) -> Result<()> {
        let bytes = payload::encode(&AckPayload { message_id })?;
        let packet = self.inner_packet(MessageType::DeliveryAck, peer, bytes);
        self.publish_packet(peer, &packet).await
    }

    async fn send_read_receipt(&self, peer: PeerId, receipt: ReceiptPayload) -> Result<()> {
        let bytes = payload::encode(&receipt)?;
        let packet = self.inner_packet(MessageType::ReadReceipt, peer, bytes);
        self.publish_packet(peer, &packet).await
    }

    async fn send_favorite_notification(&self, peer: PeerId, is_favorite: bool) -> Result<()> {
        let bytes = payload::encode(&FavoritePayload {
            is_favorite,
            nostr_public_key: Some(self.public_key_hex()),
        })?;
        let packet = self.inner_packet(MessageType::Favorite, peer, bytes);
        self.publish_packet(peer, &packet).await
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use bitchat_core::event::event_channel;
    use std::collections::HashMap;

    struct FixedDirectory(HashMap<PeerId, String>);

    impl NostrDirectory for FixedDirectory {
        fn nostr_public_key_for(&self, peer: PeerId) -> Option<String> {
            self.0.get(&peer).cloned()
        }
    }

    fn transport_with(directory: FixedDirectory) -> NostrTransport {
        let (events, _rx) = event_channel();
        NostrTransport::new(
            Keys::generate(),
            PeerId::new([1; 8]),
            RelayConfig::default(),
            Arc::new(directory),
            events,
        )
    }

    #[tokio::test]
    async fn test_reachability_follows_directory() {
        let known = PeerId::new([2; 8]);
        let unknown = PeerId::new([3; 8]);
        let mut map = HashMap::new();
        map.insert(known, Keys::generate().public_key().to_string());

        let transport = transport_with(FixedDirectory(map));
        // Not started yet: nothing is reachable.
        assert!(!transport.is_peer_reachable(known).await);

        transport.active.store(true, Ordering::SeqCst);
        assert!(transport.is_peer_reachable(known).await);
        assert!(!transport.is_peer_reachable(unknown).await);
    }

    #[tokio::test]
    async fn test_send_without_key_fails() {
        let transport = transport_with(FixedDirectory(HashMap::new()));
        let result = transport
            .send_private(PeerId::new([2; 8]), "hi".into(), "bob".into(), Uuid::new_v4())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unwrapped_packet_surfaces_private_message() {
        let (events, mut rx) = event_channel();
        let sender_peer = PeerId::new([9; 8]);
        let message_id = Uuid::new_v4();
        let bytes = payload::encode(&PrivatePayload {
            message_id,
            content: "over the relay".into(),
            recipient_nickname: "us".into(),
        })
        .unwrap();
        let packet = BitchatPacket::new(MessageType::PrivateMessage, sender_peer, bytes)
            .with_recipient(PeerId::new([1; 8]));

        NostrTransport::surface_packet(&events, &packet);
        match rx.recv().await.unwrap() {
            ProtocolEvent::PrivateMessageReceived {
                peer,
                message_id: received,
                content,
            } => {
                assert_eq!(peer, sender_peer);
                assert_eq!(received, message_id);
                assert_eq!(content, "over the relay");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
