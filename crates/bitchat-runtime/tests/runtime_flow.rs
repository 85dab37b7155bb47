//! Runtime integration: events in, timeline / pending queue / outbox out

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use uuid::Uuid;

use bitchat_core::config::{PendingFileConfig, PipelineConfig};
use bitchat_core::event::{event_channel, ProtocolEvent, PublicMessage};
use bitchat_core::payload::ReceiptPayload;
use bitchat_core::transport::MeshControl;
use bitchat_core::types::{Fingerprint, ManualTimeSource, PeerId, Timestamp};
use bitchat_core::{Result, Transport};
use bitchat_runtime::pipeline::NullSink;
use bitchat_runtime::{
    BitchatRuntime, ChannelKind, FavoritesStore, MessageRouter, PendingFileManager,
    PublicPipeline,
};

// ----------------------------------------------------------------------------
// Fakes
// ----------------------------------------------------------------------------

#[derive(Default)]
struct FakeMesh;

impl MeshControl for FakeMesh {
    fn start(&self) {}
    fn stop(&self) {}
    fn emergency_disconnect(&self) {}
    fn panic_clear(&self) {}
    fn set_nickname(&self, _nickname: String) {}
    fn block(&self, _fingerprint: Fingerprint) {}
    fn send_file_transfer(
        &self,
        _file_name: Option<String>,
        _mime_type: Option<String>,
        _content: Vec<u8>,
        _peer: Option<PeerId>,
    ) {
    }
}

struct SwitchTransport {
    reachable: AtomicBool,
    sent: Mutex<Vec<Uuid>>,
}

impl SwitchTransport {
    fn new(reachable: bool) -> Arc<Self> {
        Arc::new(Self {
            reachable: AtomicBool::new(reachable),
            sent: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Transport for SwitchTransport {
    fn name(&self) -> &'static str {
        "fake"
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

    async fn send_broadcast(&self, _content: String, _message_id: Uuid) -> Result<()> {
        Ok(())
    }

    async fn send_delivery_ack(&self, _peer: PeerId, _message_id: Uuid) -> Result<()> {
        Ok(())
    }

    async fn send_read_receipt(&self, _peer: PeerId, _receipt: ReceiptPayload) -> Result<()> {
        Ok(())
    }

    async fn send_favorite_notification(&self, _peer: PeerId, _is_favorite: bool) -> Result<()> {
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Harness
// ----------------------------------------------------------------------------

struct Fixture {
    runtime: BitchatRuntime<ManualTimeSource>,
    transport: Arc<SwitchTransport>,
    clock: ManualTimeSource,
}

fn fixture(pending_config: PendingFileConfig) -> (Fixture, bitchat_core::event::EventSender) {
    let clock = ManualTimeSource::starting_at(1_700_000_000_000);
    let transport = SwitchTransport::new(false);
    let (events_tx, events_rx) = event_channel();

    let (router_events, _router_rx) = event_channel();
    let router = Arc::new(MessageRouter::new(
        vec![transport.clone() as Arc<dyn Transport>],
        router_events,
        clock.clone(),
        Duration::from_secs(300),
    ));
    let pipeline = Arc::new(PublicPipeline::new(
        PipelineConfig::default(),
        ChannelKind::Mesh,
        Arc::new(NullSink),
        clock.clone(),
    ));
    let pending = Arc::new(PendingFileManager::new(
        pending_config,
        Arc::new(bitchat_runtime::pending::NullFileSink),
        clock.clone(),
    ));
    let favorites = Arc::new(FavoritesStore::new());

    let mut runtime = BitchatRuntime::new(
        router,
        pipeline,
        pending,
        favorites,
        Arc::new(FakeMesh),
    );
    let app_events = runtime.start(events_rx);
    // The application stream is not under test here; keep it alive so the
    // fan-out task does not stop.
    tokio::spawn(async move {
        let mut app_events = app_events;
        while app_events.recv().await.is_some() {}
    });

    (
        Fixture {
            runtime,
            transport,
            clock,
        },
        events_tx,
    )
}

fn file_offer(peer: u8, size: usize) -> ProtocolEvent {
    ProtocolEvent::FileTransferOffered {
        peer: PeerId::new([peer; 8]),
        sender_nickname: "sender".into(),
        file_name: Some(format!("{size}.bin")),
        mime_type: None,
        content: vec![0x11; size],
        is_private: false,
    }
}

async fn settle() {
    // Let the fan-out task drain what we queued.
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// ----------------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn pending_file_eviction_by_size() {
    let (fixture, events) = fixture(PendingFileConfig {
        max_pending_count: 100,
        max_total_bytes: 500,
        ..PendingFileConfig::default()
    });

    events.send(file_offer(1, 200)).unwrap();
    settle().await;
    fixture.clock.advance(10);
    events.send(file_offer(1, 200)).unwrap();
    settle().await;
    fixture.clock.advance(10);
    events.send(file_offer(1, 300)).unwrap();
    settle().await;

    // The oldest 200-byte file was evicted; exactly 500 bytes remain.
    let (count, total) = fixture.runtime.pending_files().stats();
    assert_eq!(count, 2);
    assert_eq!(total, 500);

    let sizes: Vec<usize> = fixture
        .runtime
        .pending_files()
        .all()
        .iter()
        .map(|entry| entry.file_size())
        .collect();
    assert_eq!(sizes, vec![300, 200]);
}

#[tokio::test(start_paused = true)]
async fn pipeline_orders_and_dedups_public_messages() {
    let (fixture, events) = fixture(PendingFileConfig::default());
    let base = 1_700_000_000_000u64;

    let message = |id: &str, offset: u64| {
        ProtocolEvent::PublicMessageReceived(PublicMessage {
            message_id: id.into(),
            sender: PeerId::new([7; 8]),
            sender_nickname: Some("carol".into()),
            content: "Same".into(),
            timestamp: Timestamp::from_millis(base + offset),
        })
    };

    events.send(message("a", 10_000)).unwrap();
    events.send(message("b", 10_200)).unwrap();
    settle().await;

    // Wait out the batch window so the flush timer fires.
    timeout(Duration::from_secs(1), async {
        loop {
            if !fixture.runtime.pipeline().timeline().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("pipeline never flushed");

    let timeline = fixture.runtime.pipeline().timeline();
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].content, "Same");
    assert_eq!(timeline[0].message_id, "a");
}

#[tokio::test(start_paused = true)]
async fn favorite_change_flushes_outbox() {
    let (fixture, events) = fixture(PendingFileConfig::default());
    let peer = PeerId::new([3; 8]);
    let fingerprint = Fingerprint::new([3; 32]);

    // Nothing reachable: the message parks in the outbox.
    let message_id = fixture
        .runtime
        .send_private_message(peer, "waiting for a route", "dave")
        .await
        .unwrap();
    assert!(fixture.transport.sent.lock().unwrap().is_empty());

    // The peer announces and favorites us; reachability appears.
    events
        .send(ProtocolEvent::PeerConnected {
            peer,
            nickname: "dave".into(),
            fingerprint,
        })
        .unwrap();
    fixture.transport.reachable.store(true, Ordering::SeqCst);
    events
        .send(ProtocolEvent::FavoriteChanged {
            peer,
            is_favorite: true,
            nostr_public_key: Some("npubkey".into()),
        })
        .unwrap();
    settle().await;

    assert_eq!(*fixture.transport.sent.lock().unwrap(), vec![message_id]);
}

#[tokio::test(start_paused = true)]
async fn panic_clear_wipes_everything() {
    let (fixture, events) = fixture(PendingFileConfig::default());

    events.send(file_offer(1, 100)).unwrap();
    events
        .send(ProtocolEvent::PublicMessageReceived(PublicMessage {
            message_id: "m".into(),
            sender: PeerId::new([7; 8]),
            sender_nickname: None,
            content: "on the record".into(),
            timestamp: Timestamp::from_millis(1_700_000_000_000),
        }))
        .unwrap();
    settle().await;
    fixture.runtime.pipeline().flush();

    assert_eq!(fixture.runtime.pending_files().stats().0, 1);
    assert_eq!(fixture.runtime.pipeline().timeline().len(), 1);

    fixture.runtime.panic_clear_all_data().await;
    assert_eq!(fixture.runtime.pending_files().stats(), (0, 0));
    assert!(fixture.runtime.pipeline().timeline().is_empty());
}
