//! Runtime wiring: event fan-out, timers and operational controls
//!
//! The runtime owns the receive side of the event plane. Transport events
//! are applied to the favorites store, pipeline, pending-file manager and
//! outbox as they pass through, then re-emitted to the application. Three
//! timers drive the batch flush, outbox expiry and pending-file sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use bitchat_core::event::{EventReceiver, ProtocolEvent};
use bitchat_core::payload::ReceiptPayload;
use bitchat_core::transport::MeshControl;
use bitchat_core::types::{Fingerprint, PeerId, TimeSource};
use bitchat_core::Result;

use crate::favorites::FavoritesStore;
use crate::pending::{PendingFileError, PendingFileManager, PendingFileTransfer};
use crate::pipeline::PublicPipeline;
use crate::router::MessageRouter;

/// How often expired pending files are swept
const PENDING_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// How often the outbox is checked for expired messages
const OUTBOX_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

// ----------------------------------------------------------------------------
// Runtime
// ----------------------------------------------------------------------------

/// Everything above the transports, assembled
pub struct BitchatRuntime<T: TimeSource + Clone + 'static> {
    router: Arc<MessageRouter<T>>,
    pipeline: Arc<PublicPipeline<T>>,
    pending: Arc<PendingFileManager<T>>,
    favorites: Arc<FavoritesStore>,
    mesh: Arc<dyn MeshControl>,
    tasks: Vec<JoinHandle<()>>,
}

impl<T: TimeSource + Clone + 'static> BitchatRuntime<T> {
    /// Assemble a runtime from its parts
    pub fn new(
        router: Arc<MessageRouter<T>>,
        pipeline: Arc<PublicPipeline<T>>,
        pending: Arc<PendingFileManager<T>>,
        favorites: Arc<FavoritesStore>,
        mesh: Arc<dyn MeshControl>,
    ) -> Self {
        Self {
            router,
            pipeline,
            pending,
            favorites,
            mesh,
            tasks: Vec::new(),
        }
    }

    /// Start the mesh, the fan-out task and the timers
    ///
    /// Returns the application-facing event stream: every transport event,
    /// after the runtime has applied it.
    pub fn start(&mut self, transport_events: EventReceiver) -> EventReceiver {
        self.mesh.start();

        let (app_tx, app_rx) = mpsc::unbounded_channel();
        self.tasks.push(tokio::spawn(Self::fan_out(
            transport_events,
            app_tx,
            Arc::clone(&self.router),
            Arc::clone(&self.pipeline),
            Arc::clone(&self.pending),
            Arc::clone(&self.favorites),
        )));

        let pipeline = Arc::clone(&self.pipeline);
        let flush_every = pipeline.batch_window();
        self.tasks.push(tokio::spawn(async move {
            let mut timer = tokio::time::interval(flush_every);
            loop {
                timer.tick().await;
                pipeline.flush();
            }
        }));

        let router = Arc::clone(&self.router);
        self.tasks.push(tokio::spawn(async move {
            let mut timer = tokio::time::interval(OUTBOX_SWEEP_INTERVAL);
            loop {
                timer.tick().await;
                router.expire_outbox().await;
            }
        }));

        let pending = Arc::clone(&self.pending);
        self.tasks.push(tokio::spawn(async move {
            let mut timer = tokio::time::interval(PENDING_SWEEP_INTERVAL);
            loop {
                timer.tick().await;
                pending.expire();
            }
        }));

        info!("runtime started");
        app_rx
    }

    /// Apply each transport event, then forward it to the application
    async fn fan_out(
        mut events: EventReceiver,
        app_tx: mpsc::UnboundedSender<ProtocolEvent>,
        router: Arc<MessageRouter<T>>,
        pipeline: Arc<PublicPipeline<T>>,
        pending: Arc<PendingFileManager<T>>,
        favorites: Arc<FavoritesStore>,
    ) {
        while let Some(event) = events.recv().await {
            match &event {
                ProtocolEvent::PublicMessageReceived(message) => {
                    pipeline.enqueue(message.clone());
                }
                ProtocolEvent::FileTransferOffered {
                    peer,
                    sender_nickname,
                    file_name,
                    mime_type,
                    content,
                    is_private,
                } => {
                    if pending
                        .add(
                            *peer,
                            sender_nickname.clone(),
                            file_name.clone(),
                            mime_type.clone(),
                            content.clone(),
                            *is_private,
                        )
                        .is_none()
                    {
                        debug!(%peer, "file transfer rejected by quota");
                    }
                }
                ProtocolEvent::PeerConnected {
                    peer, fingerprint, ..
                } => {
                    favorites.record_peer(*peer, *fingerprint);
                    // A reconnected peer may unblock queued messages.
                    router.flush_outbox(*peer).await;
                }
                ProtocolEvent::FavoriteChanged {
                    peer,
                    is_favorite,
                    nostr_public_key,
                } => {
                    favorites.record_peer_favorite(
                        *peer,
                        *is_favorite,
                        nostr_public_key.clone(),
                    );
                    // Relay reachability may have just appeared.
                    router.flush_outbox(*peer).await;
                }
                ProtocolEvent::SessionEstablished { peer } => {
                    router.flush_outbox(*peer).await;
                }
                _ => {}
            }

            if app_tx.send(event).is_err() {
                break;
            }
        }
    }

    // ------------------------------------------------------------------
    // Messaging surface
    // ------------------------------------------------------------------

    /// Broadcast a public message over the mesh
    pub async fn send_public_message(&self, content: impl Into<String>) -> Result<Uuid> {
        let message_id = Uuid::new_v4();
        self.router.send_public(content.into(), message_id).await?;
        Ok(message_id)
    }

    /// Send a private message through the first reachable transport
    pub async fn send_private_message(
        &self,
        peer: PeerId,
        content: impl Into<String>,
        recipient_nickname: impl Into<String>,
    ) -> Result<Uuid> {
        let message_id = Uuid::new_v4();
        self.router
            .send_private(peer, content.into(), recipient_nickname.into(), message_id)
            .await?;
        Ok(message_id)
    }

    /// Offer a file over the mesh
    pub fn send_file_transfer(
        &self,
        file_name: Option<String>,
        mime_type: Option<String>,
        content: Vec<u8>,
        peer: Option<PeerId>,
    ) {
        self.mesh.send_file_transfer(file_name, mime_type, content, peer);
    }

    /// Acknowledge delivery of a private message
    pub async fn send_delivery_ack(&self, peer: PeerId, message_id: Uuid) -> Result<()> {
        self.router.send_delivery_ack(peer, message_id).await
    }

    /// Send a read receipt
    pub async fn send_read_receipt(&self, peer: PeerId, receipt: ReceiptPayload) -> Result<()> {
        self.router.send_read_receipt(peer, receipt).await
    }

    // ------------------------------------------------------------------
    // Pending files
    // ------------------------------------------------------------------

    /// The pending-file queue
    pub fn pending_files(&self) -> &PendingFileManager<T> {
        &self.pending
    }

    /// Accept a pending file through a save handler
    pub fn accept_file<F>(&self, id: &str, save: F) -> Result<std::path::PathBuf>
    where
        F: FnOnce(&PendingFileTransfer) -> std::io::Result<std::path::PathBuf>,
    {
        self.pending
            .accept(id, save)
            .map_err(|err: PendingFileError| bitchat_core::BitchatError::Channel {
                message: err.to_string(),
            })
    }

    /// Decline a pending file
    pub fn decline_file(&self, id: &str) -> Result<()> {
        self.pending
            .decline(id)
            .map_err(|err| bitchat_core::BitchatError::Channel {
                message: err.to_string(),
            })
    }

    // ------------------------------------------------------------------
    // Operational controls
    // ------------------------------------------------------------------

    /// Change the announced nickname
    pub fn set_nickname(&self, nickname: impl Into<String>) {
        self.mesh.set_nickname(nickname.into());
    }

    /// Mark or clear a favorite and notify the peer when reachable
    pub async fn set_favorite(&self, fingerprint: Fingerprint, is_favorite: bool) {
        self.favorites.set_favorite(fingerprint, is_favorite);
        if let Some(peer) = self
            .favorites
            .entry(fingerprint)
            .and_then(|entry| entry.last_peer_id)
        {
            if let Err(err) = self
                .router
                .send_favorite_notification(peer, is_favorite)
                .await
            {
                debug!(%peer, "favorite notification not delivered: {err}");
            }
        }
    }

    /// Block an identity everywhere
    pub fn block(&self, fingerprint: Fingerprint) {
        self.favorites.block(fingerprint);
        self.mesh.block(fingerprint);
    }

    /// The favorites store
    pub fn favorites(&self) -> &FavoritesStore {
        &self.favorites
    }

    /// The public timeline pipeline
    pub fn pipeline(&self) -> &PublicPipeline<T> {
        &self.pipeline
    }

    /// Drop every connection immediately
    pub fn emergency_disconnect(&self) {
        self.mesh.emergency_disconnect();
    }

    /// Stop radio operation
    pub fn stop(&self) {
        self.mesh.stop();
    }

    /// Wipe keys, sessions, queues, timeline, files and favorites
    pub async fn panic_clear_all_data(&self) {
        self.mesh.panic_clear();
        self.router.clear().await;
        self.pipeline.clear();
        self.pending.clear_all();
        self.favorites.clear();
        info!("panic clear: all data wiped");
    }
}

impl<T: TimeSource + Clone + 'static> Drop for BitchatRuntime<T> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
