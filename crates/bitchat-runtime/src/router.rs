//! Per-recipient transport selection with an outbox for the unreachable
//!
//! Transports are tried in registration order; the first one reporting the
//! peer reachable carries the message. With no route, private messages wait
//! in a per-peer outbox until a favorite-status change (or any later flush)
//! finds one, or their deadline passes. Acks and receipts are best-effort
//! and never queued; broadcasts always go to the mesh transport alone.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use bitchat_core::event::{EventSender, ProtocolEvent};
use bitchat_core::payload::ReceiptPayload;
use bitchat_core::types::{PeerId, TimeSource, Timestamp};
use bitchat_core::{Result, Transport, TransportError};

// ----------------------------------------------------------------------------
// Outbox
// ----------------------------------------------------------------------------

/// A private message waiting for any reachable transport
#[derive(Debug, Clone)]
struct OutboxItem {
    content: String,
    recipient_nickname: String,
    message_id: Uuid,
    deadline: Timestamp,
}

// ----------------------------------------------------------------------------
// Message Router
// ----------------------------------------------------------------------------

/// Routes outbound operations across an ordered list of transports
pub struct MessageRouter<T: TimeSource> {
    transports: Vec<Arc<dyn Transport>>,
    outbox: Mutex<HashMap<PeerId, VecDeque<OutboxItem>>>,
    events: EventSender,
    time_source: T,
    /// How long an outbox item waits before failing as unreachable
    message_ttl_millis: u64,
}

impl<T: TimeSource> MessageRouter<T> {
    /// Create a router over transports in preference order (mesh first)
    pub fn new(
        transports: Vec<Arc<dyn Transport>>,
        events: EventSender,
        time_source: T,
        message_ttl: std::time::Duration,
    ) -> Self {
        Self {
            transports,
            outbox: Mutex::new(HashMap::new()),
            events,
            time_source,
            message_ttl_millis: message_ttl.as_millis() as u64,
        }
    }

    /// First transport that can reach `peer` right now
    async fn route_for(&self, peer: PeerId) -> Option<&Arc<dyn Transport>> {
        for transport in &self.transports {
            if transport.is_peer_reachable(peer).await {
                return Some(transport);
            }
        }
        None
    }

    /// Send a private message, queueing it when no transport can carry it
    pub async fn send_private(
        &self,
        peer: PeerId,
        content: String,
        recipient_nickname: String,
        message_id: Uuid,
    ) -> Result<()> {
        if let Some(transport) = self.route_for(peer).await {
            debug!(%peer, transport = transport.name(), "routing private message");
            return transport
                .send_private(peer, content, recipient_nickname, message_id)
                .await;
        }

        debug!(%peer, %message_id, "no route, queueing in outbox");
        let deadline = self.time_source.now() + self.message_ttl_millis;
        self.outbox
            .lock()
            .await
            .entry(peer)
            .or_default()
            .push_back(OutboxItem {
                content,
                recipient_nickname,
                message_id,
                deadline,
            });
        Ok(())
    }

    /// Broadcast a public message; mesh-only by design
    pub async fn send_public(&self, content: String, message_id: Uuid) -> Result<()> {
        let mesh = self
            .transports
            .first()
            .ok_or(TransportError::TransportUnavailable { name: "mesh" })?;
        mesh.send_broadcast(content, message_id).await
    }

    /// Best-effort delivery ack; never queued
    pub async fn send_delivery_ack(&self, peer: PeerId, message_id: Uuid) -> Result<()> {
        match self.route_for(peer).await {
            Some(transport) => transport.send_delivery_ack(peer, message_id).await,
            None => Err(TransportError::Unreachable { peer }.into()),
        }
    }

    /// Best-effort read receipt; never queued
    pub async fn send_read_receipt(&self, peer: PeerId, receipt: ReceiptPayload) -> Result<()> {
        match self.route_for(peer).await {
            Some(transport) => transport.send_read_receipt(peer, receipt).await,
            None => Err(TransportError::Unreachable { peer }.into()),
        }
    }

    /// Favorite notification over whatever reaches the peer
    pub async fn send_favorite_notification(&self, peer: PeerId, is_favorite: bool) -> Result<()> {
        match self.route_for(peer).await {
            Some(transport) => transport.send_favorite_notification(peer, is_favorite).await,
            None => Err(TransportError::Unreachable { peer }.into()),
        }
    }

    /// Retry everything queued for `peer`
    ///
    /// Items that find a transport are dispatched; the rest stay queued.
    /// Called on favorite-status changes and connectivity events.
    pub async fn flush_outbox(&self, peer: PeerId) {
        let Some(queue) = self.outbox.lock().await.remove(&peer) else {
            return;
        };
        let mut remaining = VecDeque::new();

        for item in queue {
            match self.route_for(peer).await {
                Some(transport) => {
                    info!(%peer, message_id = %item.message_id, transport = transport.name(),
                        "outbox message found a route");
                    if let Err(err) = transport
                        .send_private(
                            peer,
                            item.content.clone(),
                            item.recipient_nickname.clone(),
                            item.message_id,
                        )
                        .await
                    {
                        debug!(%peer, "outbox dispatch failed, requeueing: {err}");
                        remaining.push_back(item);
                    }
                }
                None => remaining.push_back(item),
            }
        }

        if !remaining.is_empty() {
            self.outbox.lock().await.insert(peer, remaining);
        }
    }

    /// Drop expired outbox items, reporting each as unreachable
    pub async fn expire_outbox(&self) {
        let now = self.time_source.now();
        let mut outbox = self.outbox.lock().await;
        for (peer, queue) in outbox.iter_mut() {
            let peer = *peer;
            queue.retain(|item| {
                if item.deadline < now {
                    let _ = self.events.send(ProtocolEvent::MessageUnreachable {
                        peer,
                        message_id: item.message_id,
                    });
                    false
                } else {
                    true
                }
            });
        }
        outbox.retain(|_, queue| !queue.is_empty());
    }

    /// Queued message count for a peer
    pub async fn outbox_len(&self, peer: PeerId) -> usize {
        self.outbox
            .lock()
            .await
            .get(&peer)
            .map(|queue| queue.len())
            .unwrap_or(0)
    }

    /// Drop every queued message
    pub async fn clear(&self) {
        self.outbox.lock().await.clear();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bitchat_core::event::event_channel;
    use bitchat_core::types::ManualTimeSource;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Transport whose reachability is a switch and which records sends
    struct FakeTransport {
        name: &'static str,
        reachable: AtomicBool,
        sent: StdMutex<Vec<Uuid>>,
    }

    impl FakeTransport {
        fn new(name: &'static str, reachable: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                reachable: AtomicBool::new(reachable),
                sent: StdMutex::new(Vec::new()),
            })
        }

        fn sent_ids(&self) -> Vec<Uuid> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn is_peer_reachable(&self, _peer: PeerId) -> bool {
            self.reachable.load(Ordering::SeqCst)
        }

        async fn send_private(
            &self,
            _peer: PeerId,
            _content: String,
            _nickname: String,
            message_id: Uuid,
        ) -> Result<()> {
            self.sent.lock().unwrap().push(message_id);
            Ok(())
        }

        async fn send_broadcast(&self, _content: String, message_id: Uuid) -> Result<()> {
            self.sent.lock().unwrap().push(message_id);
            Ok(())
        }

        async fn send_delivery_ack(&self, _peer: PeerId, message_id: Uuid) -> Result<()> {
            self.sent.lock().unwrap().push(message_id);
            Ok(())
        }

        async fn send_read_receipt(&self, _peer: PeerId, _receipt: ReceiptPayload) -> Result<()> {
            Ok(())
        }

        async fn send_favorite_notification(&self, _peer: PeerId, _is_favorite: bool) -> Result<()> {
            Ok(())
        }
    }

    fn peer() -> PeerId {
        PeerId::new([5; 8])
    }

    #[tokio::test]
    async fn test_first_reachable_transport_wins() {
        let mesh = FakeTransport::new("mesh", true);
        let relay = FakeTransport::new("nostr", true);
        let (events, _rx) = event_channel();
        let router = MessageRouter::new(
            vec![mesh.clone(), relay.clone()],
            events,
            ManualTimeSource::starting_at(0),
            std::time::Duration::from_secs(300),
        );

        let id = Uuid::new_v4();
        router
            .send_private(peer(), "hi".into(), "bob".into(), id)
            .await
            .unwrap();

        assert_eq!(mesh.sent_ids(), vec![id]);
        assert!(relay.sent_ids().is_empty());
    }

    #[tokio::test]
    async fn test_fallback_to_second_transport() {
        let mesh = FakeTransport::new("mesh", false);
        let relay = FakeTransport::new("nostr", true);
        let (events, _rx) = event_channel();
        let router = MessageRouter::new(
            vec![mesh.clone(), relay.clone()],
            events,
            ManualTimeSource::starting_at(0),
            std::time::Duration::from_secs(300),
        );

        let id = Uuid::new_v4();
        router
            .send_private(peer(), "hi".into(), "bob".into(), id)
            .await
            .unwrap();

        assert!(mesh.sent_ids().is_empty());
        assert_eq!(relay.sent_ids(), vec![id]);
    }

    #[tokio::test]
    async fn test_unreachable_peer_queues_then_flushes() {
        let mesh = FakeTransport::new("mesh", false);
        let relay = FakeTransport::new("nostr", false);
        let (events, _rx) = event_channel();
        let router = MessageRouter::new(
            vec![mesh.clone(), relay.clone()],
            events,
            ManualTimeSource::starting_at(0),
            std::time::Duration::from_secs(300),
        );

        let id = Uuid::new_v4();
        router
            .send_private(peer(), "hi".into(), "bob".into(), id)
            .await
            .unwrap();
        assert_eq!(router.outbox_len(peer()).await, 1);

        // Still nothing reachable: flush keeps the item queued.
        router.flush_outbox(peer()).await;
        assert_eq!(router.outbox_len(peer()).await, 1);

        // Favorite exchange made the relay reachable.
        relay.reachable.store(true, Ordering::SeqCst);
        router.flush_outbox(peer()).await;
        assert_eq!(router.outbox_len(peer()).await, 0);
        assert_eq!(relay.sent_ids(), vec![id]);
    }

    #[tokio::test]
    async fn test_expired_outbox_reports_unreachable() {
        let mesh = FakeTransport::new("mesh", false);
        let (events, mut rx) = event_channel();
        let clock = ManualTimeSource::starting_at(0);
        let router = MessageRouter::new(
            vec![mesh],
            events,
            clock.clone(),
            std::time::Duration::from_secs(300),
        );

        let id = Uuid::new_v4();
        router
            .send_private(peer(), "hi".into(), "bob".into(), id)
            .await
            .unwrap();

        clock.advance(301_000);
        router.expire_outbox().await;
        assert_eq!(router.outbox_len(peer()).await, 0);

        match rx.recv().await.unwrap() {
            ProtocolEvent::MessageUnreachable {
                peer: reported,
                message_id,
            } => {
                assert_eq!(reported, peer());
                assert_eq!(message_id, id);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_acks_never_queue() {
        let mesh = FakeTransport::new("mesh", false);
        let (events, _rx) = event_channel();
        let router = MessageRouter::new(
            vec![mesh],
            events,
            ManualTimeSource::starting_at(0),
            std::time::Duration::from_secs(300),
        );

        let result = router.send_delivery_ack(peer(), Uuid::new_v4()).await;
        assert!(result.is_err());
        assert_eq!(router.outbox_len(peer()).await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_is_mesh_only() {
        let mesh = FakeTransport::new("mesh", false);
        let relay = FakeTransport::new("nostr", true);
        let (events, _rx) = event_channel();
        let router = MessageRouter::new(
            vec![mesh.clone(), relay.clone()],
            events,
            ManualTimeSource::starting_at(0),
            std::time::Duration::from_secs(300),
        );

        let id = Uuid::new_v4();
        router.send_public("hello".into(), id).await.unwrap();
        assert_eq!(mesh.sent_ids(), vec![id]);
        assert!(relay.sent_ids().is_empty());
    }
}
