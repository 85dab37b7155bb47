//! The mesh transport: a single-owner loop and its cloneable handle
//!
//! [`MeshTransport`] is the handle the router and application hold; every
//! operation posts a message to the loop task, which owns all mutable state.
//! Inbound frames flow: decode, dedup/TTL routing, fragment reassembly,
//! Noise decrypt, application dispatch. Outbound packets are padded,
//! fragmented when oversize, and written through the [`LinkDriver`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use bitchat_core::config::{DedupConfig, FragmentConfig, MeshConfig, NoiseConfig};
use bitchat_core::dedup::{PacketRouter, RouteDecision};
use bitchat_core::event::{EventSender, ProtocolEvent, PublicMessage};
use bitchat_core::fragment::{fragment_packet, Reassembler};
use bitchat_core::noise::{fingerprint_of, NoiseKeypair, NoiseSessionManager, SessionEndReason};
use bitchat_core::payload::{
    self, AckPayload, AnnouncePayload, FavoritePayload, FilePayload, PrivatePayload,
    ReceiptPayload,
};
use bitchat_core::types::{Fingerprint, PeerId, TimeSource, Timestamp, Ttl};
use bitchat_core::wire;
use bitchat_core::{BitchatPacket, MessageType, Result, Transport, TransportError};

use crate::link::{LinkDriver, LinkEvent, LinkId};
use crate::peers::PeerBook;

// ----------------------------------------------------------------------------
// Options
// ----------------------------------------------------------------------------

/// Everything the mesh loop needs besides the key and the radio
pub struct MeshOptions {
    pub mesh: MeshConfig,
    pub fragment: FragmentConfig,
    pub dedup: DedupConfig,
    pub noise: NoiseConfig,
    /// Initial nickname carried in announces
    pub nickname: String,
    /// Local Nostr public key advertised in favorite notifications
    pub nostr_public_key: Option<String>,
}

impl MeshOptions {
    /// Defaults with the given nickname
    pub fn new(nickname: impl Into<String>) -> Self {
        Self {
            mesh: MeshConfig::default(),
            fragment: FragmentConfig::default(),
            dedup: DedupConfig::default(),
            noise: NoiseConfig::default(),
            nickname: nickname.into(),
            nostr_public_key: None,
        }
    }
}

// ----------------------------------------------------------------------------
// Commands
// ----------------------------------------------------------------------------

/// Messages posted to the mesh loop
enum MeshCommand {
    Start,
    Stop,
    EmergencyDisconnect,
    PanicClear,
    SetNickname(String),
    Block(Fingerprint),
    Unblock(Fingerprint),
    SendPublic {
        content: String,
        message_id: Uuid,
    },
    SendPrivate {
        peer: PeerId,
        content: String,
        recipient_nickname: String,
        message_id: Uuid,
    },
    SendFile {
        peer: Option<PeerId>,
        file_name: Option<String>,
        mime_type: Option<String>,
        content: Vec<u8>,
    },
    SendAck {
        peer: PeerId,
        message_id: Uuid,
    },
    SendReceipt {
        peer: PeerId,
        receipt: ReceiptPayload,
    },
    SendFavorite {
        peer: PeerId,
        is_favorite: bool,
    },
    QueryOpenGroups {
        reply: oneshot::Sender<usize>,
    },
}

// ----------------------------------------------------------------------------
// Shared Snapshot
// ----------------------------------------------------------------------------

/// Cheap, slightly stale view of loop state for synchronous reads
#[derive(Debug, Default)]
struct Snapshot {
    connected: HashSet<PeerId>,
    reachable: HashSet<PeerId>,
    nickname: String,
}

// ----------------------------------------------------------------------------
// Mesh Handle
// ----------------------------------------------------------------------------

/// Cloneable handle to the mesh loop
#[derive(Clone)]
pub struct MeshTransport {
    commands: mpsc::UnboundedSender<MeshCommand>,
    snapshot: Arc<RwLock<Snapshot>>,
    peer_id: PeerId,
    fingerprint: Fingerprint,
}

impl MeshTransport {
    /// Spawn the mesh loop and return its handle
    pub fn spawn<T: TimeSource + Clone + 'static>(
        keypair: NoiseKeypair,
        options: MeshOptions,
        driver: Arc<dyn LinkDriver>,
        events: EventSender,
        time_source: T,
    ) -> Self {
        let fingerprint = keypair.fingerprint();
        let peer_id = fingerprint.to_peer_id();
        let snapshot = Arc::new(RwLock::new(Snapshot {
            nickname: options.nickname.clone(),
            ..Snapshot::default()
        }));

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let mesh_loop = MeshLoop::new(
            keypair,
            options,
            driver,
            events,
            time_source,
            Arc::clone(&snapshot),
        );
        tokio::spawn(mesh_loop.run(command_rx));

        Self {
            commands: command_tx,
            snapshot,
            peer_id,
            fingerprint,
        }
    }

    /// Our short mesh identifier
    pub fn my_peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Our full key fingerprint
    pub fn my_fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Current nickname
    pub fn my_nickname(&self) -> String {
        self.snapshot.read().expect("snapshot lock").nickname.clone()
    }

    /// Change the announced nickname
    pub fn set_nickname(&self, nickname: impl Into<String>) {
        self.send(MeshCommand::SetNickname(nickname.into()));
    }

    /// Start radio operation; idempotent
    pub fn start(&self) {
        self.send(MeshCommand::Start);
    }

    /// Stop radio operation; idempotent
    pub fn stop(&self) {
        self.send(MeshCommand::Stop);
    }

    /// Drop every connection immediately, keeping session state
    pub fn emergency_disconnect(&self) {
        self.send(MeshCommand::EmergencyDisconnect);
    }

    /// Wipe key material, sessions, queues and peer knowledge
    pub fn panic_clear(&self) {
        self.send(MeshCommand::PanicClear);
    }

    /// Drop all traffic from a fingerprint
    pub fn block(&self, fingerprint: Fingerprint) {
        self.send(MeshCommand::Block(fingerprint));
    }

    /// Stop dropping traffic from a fingerprint
    pub fn unblock(&self, fingerprint: Fingerprint) {
        self.send(MeshCommand::Unblock(fingerprint));
    }

    /// True while a link carries the peer
    pub fn is_peer_connected(&self, peer: PeerId) -> bool {
        self.snapshot
            .read()
            .expect("snapshot lock")
            .connected
            .contains(&peer)
    }

    /// Broadcast a public text message; fire-and-forget
    pub fn send_public_message(&self, content: impl Into<String>, message_id: Uuid) {
        self.send(MeshCommand::SendPublic {
            content: content.into(),
            message_id,
        });
    }

    /// Offer a file, privately when `peer` is given, broadcast otherwise
    pub fn send_file_transfer(
        &self,
        file_name: Option<String>,
        mime_type: Option<String>,
        content: Vec<u8>,
        peer: Option<PeerId>,
    ) {
        self.send(MeshCommand::SendFile {
            peer,
            file_name,
            mime_type,
            content,
        });
    }

    /// Open fragment-reassembly groups, for diagnostics and tests
    pub async fn open_reassembly_groups(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        self.send(MeshCommand::QueryOpenGroups { reply });
        rx.await.unwrap_or(0)
    }

    fn send(&self, command: MeshCommand) {
        if self.commands.send(command).is_err() {
            warn!("mesh loop is gone, command dropped");
        }
    }
}

impl bitchat_core::transport::MeshControl for MeshTransport {
    fn start(&self) {
        MeshTransport::start(self);
    }

    fn stop(&self) {
        MeshTransport::stop(self);
    }

    fn emergency_disconnect(&self) {
        MeshTransport::emergency_disconnect(self);
    }

    fn panic_clear(&self) {
        MeshTransport::panic_clear(self);
    }

    fn set_nickname(&self, nickname: String) {
        MeshTransport::set_nickname(self, nickname);
    }

    fn block(&self, fingerprint: Fingerprint) {
        MeshTransport::block(self, fingerprint);
    }

    fn send_file_transfer(
        &self,
        file_name: Option<String>,
        mime_type: Option<String>,
        content: Vec<u8>,
        peer: Option<PeerId>,
    ) {
        MeshTransport::send_file_transfer(self, file_name, mime_type, content, peer);
    }
}

#[async_trait]
impl Transport for MeshTransport {
    fn name(&self) -> &'static str {
        "mesh"
    }

    async fn is_peer_reachable(&self, peer: PeerId) -> bool {
        self.snapshot
            .read()
            .expect("snapshot lock")
            .reachable
            .contains(&peer)
    }

    async fn send_private(
        &self,
        peer: PeerId,
        content: String,
        recipient_nickname: String,
        message_id: Uuid,
    ) -> Result<()> {
        self.commands
            .send(MeshCommand::SendPrivate {
                peer,
                content,
                recipient_nickname,
                message_id,
            })
            .map_err(|_| TransportError::TransportUnavailable { name: "mesh" }.into())
    }

    async fn send_broadcast(&self, content: String, message_id: Uuid) -> Result<()> {
        self.commands
            .send(MeshCommand::SendPublic {
                content,
                message_id,
            })
            .map_err(|_| TransportError::TransportUnavailable { name: "mesh" }.into())
    }

    async fn send_delivery_ack(&self, peer: PeerId, message_id: Uuid) -> Result<()> {
        self.commands
            .send(MeshCommand::SendAck { peer, message_id })
            .map_err(|_| TransportError::TransportUnavailable { name: "mesh" }.into())
    }

    async fn send_read_receipt(&self, peer: PeerId, receipt: ReceiptPayload) -> Result<()> {
        self.commands
            .send(MeshCommand::SendReceipt { peer, receipt })
            .map_err(|_| TransportError::TransportUnavailable { name: "mesh" }.into())
    }

    async fn send_favorite_notification(&self, peer: PeerId, is_favorite: bool) -> Result<()> {
        self.commands
            .send(MeshCommand::SendFavorite { peer, is_favorite })
            .map_err(|_| TransportError::TransportUnavailable { name: "mesh" }.into())
    }
}

// ----------------------------------------------------------------------------
// Pending Private Messages
// ----------------------------------------------------------------------------

/// A private message waiting for an established session
struct PendingPrivate {
    message_id: Uuid,
    /// Encoded inner packet ready for encryption
    inner_frame: Vec<u8>,
    deadline: Timestamp,
}

// ----------------------------------------------------------------------------
// Mesh Loop
// ----------------------------------------------------------------------------

/// The single-owner actor holding all mesh state
struct MeshLoop<T: TimeSource + Clone> {
    peer_id: PeerId,
    nickname: String,
    options: MeshOptions,
    driver: Arc<dyn LinkDriver>,
    events: EventSender,
    time_source: T,
    snapshot: Arc<RwLock<Snapshot>>,

    sessions: NoiseSessionManager<T>,
    router: PacketRouter<T>,
    reassembler: Reassembler<T>,
    peers: PeerBook,
    /// Private messages waiting for their peer's session, per recipient
    pending_private: HashMap<PeerId, Vec<PendingPrivate>>,
    store_forward: HashMap<PeerId, VecDeque<(Timestamp, Vec<u8>)>>,
    blocked: HashSet<Fingerprint>,
    started: bool,
    link_events: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    link_sender: mpsc::UnboundedSender<LinkEvent>,
}

impl<T: TimeSource + Clone + 'static> MeshLoop<T> {
    fn new(
        keypair: NoiseKeypair,
        options: MeshOptions,
        driver: Arc<dyn LinkDriver>,
        events: EventSender,
        time_source: T,
        snapshot: Arc<RwLock<Snapshot>>,
    ) -> Self {
        let peer_id = keypair.peer_id();
        let nickname = options.nickname.clone();
        let sessions = NoiseSessionManager::new(
            keypair,
            options.noise.clone(),
            time_source.clone(),
        );
        let router = PacketRouter::new(peer_id, options.dedup.clone(), time_source.clone());
        let reassembler = Reassembler::new(options.fragment.clone(), time_source.clone());
        let (link_sender, link_receiver) = mpsc::unbounded_channel();
        let link_events = Some(link_receiver);

        Self {
            peer_id,
            nickname,
            options,
            driver,
            events,
            time_source,
            snapshot,
            sessions,
            router,
            reassembler,
            peers: PeerBook::new(),
            pending_private: HashMap::new(),
            store_forward: HashMap::new(),
            blocked: HashSet::new(),
            started: false,
            link_events,
            link_sender,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<MeshCommand>) {
        let mut link_events = self.link_events.take().expect("link receiver taken once");

        let mut announce_timer = tokio::time::interval(self.options.mesh.announce_interval);
        let mut maintenance_timer =
            tokio::time::interval(std::time::Duration::from_secs(1));

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(command) => self.on_command(command).await,
                        None => {
                            debug!("mesh handle dropped, stopping loop");
                            let _ = self.driver.stop().await;
                            break;
                        }
                    }
                }
                event = link_events.recv() => {
                    if let Some(event) = event {
                        self.on_link_event(event).await;
                    }
                }
                _ = announce_timer.tick() => {
                    if self.started {
                        self.broadcast_announce().await;
                    }
                }
                _ = maintenance_timer.tick() => {
                    self.maintain().await;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Command handling
    // ------------------------------------------------------------------

    async fn on_command(&mut self, command: MeshCommand) {
        match command {
            MeshCommand::Start => {
                if self.started {
                    return;
                }
                match self.driver.start(self.link_sender.clone()).await {
                    Ok(()) => {
                        self.started = true;
                        info!(peer = %self.peer_id, "mesh transport started");
                        self.broadcast_announce().await;
                    }
                    Err(err) => warn!("mesh start failed: {err}"),
                }
            }
            MeshCommand::Stop => {
                if !self.started {
                    return;
                }
                // A graceful stop says goodbye so peers tear sessions down
                // instead of waiting out the idle timeout.
                let leave = BitchatPacket::new(MessageType::Leave, self.peer_id, Vec::new())
                    .with_timestamp(self.time_source.now());
                self.broadcast_packet(&leave, None).await;
                self.started = false;
                let _ = self.driver.stop().await;
                info!("mesh transport stopped");
            }
            MeshCommand::EmergencyDisconnect => {
                self.started = false;
                let _ = self.driver.stop().await;
                let connected = self.peers.connected_peers();
                for peer in connected {
                    if let Some(link) = self.peers.link_for(peer) {
                        self.peers.link_down(link);
                    }
                }
                self.refresh_snapshot();
                info!("emergency disconnect complete");
            }
            MeshCommand::PanicClear => {
                self.started = false;
                let _ = self.driver.stop().await;
                self.sessions.panic_clear();
                self.router.clear();
                self.reassembler.clear();
                self.peers.clear();
                self.pending_private.clear();
                self.store_forward.clear();
                self.blocked.clear();
                self.refresh_snapshot();
                info!("panic clear complete");
            }
            MeshCommand::SetNickname(nickname) => {
                self.nickname = nickname;
                self.refresh_snapshot();
                if self.started {
                    self.broadcast_announce().await;
                }
            }
            MeshCommand::Block(fingerprint) => {
                self.blocked.insert(fingerprint);
            }
            MeshCommand::Unblock(fingerprint) => {
                self.blocked.remove(&fingerprint);
            }
            MeshCommand::SendPublic {
                content,
                message_id,
            } => {
                trace!(%message_id, "broadcasting public message");
                let packet = BitchatPacket::new(
                    MessageType::Message,
                    self.peer_id,
                    content.into_bytes(),
                )
                .with_timestamp(self.time_source.now());
                self.broadcast_packet(&packet, None).await;
            }
            MeshCommand::SendPrivate {
                peer,
                content,
                recipient_nickname,
                message_id,
            } => {
                self.send_private(peer, content, recipient_nickname, message_id)
                    .await;
            }
            MeshCommand::SendFile {
                peer,
                file_name,
                mime_type,
                content,
            } => {
                let file = FilePayload {
                    file_name,
                    mime_type,
                    content,
                };
                match peer {
                    Some(peer) => {
                        if let Ok(bytes) = payload::encode(&file) {
                            let inner = BitchatPacket::new(
                                MessageType::FileTransfer,
                                self.peer_id,
                                bytes,
                            )
                            .with_timestamp(self.time_source.now())
                            .with_recipient(peer);
                            self.send_secure(peer, &inner).await;
                        }
                    }
                    None => {
                        if let Ok(bytes) = payload::encode(&file) {
                            let packet = BitchatPacket::new(
                                MessageType::FileTransfer,
                                self.peer_id,
                                bytes,
                            )
                            .with_timestamp(self.time_source.now());
                            self.broadcast_packet(&packet, None).await;
                        }
                    }
                }
            }
            MeshCommand::SendAck { peer, message_id } => {
                if let Ok(bytes) = payload::encode(&AckPayload { message_id }) {
                    let inner =
                        BitchatPacket::new(MessageType::DeliveryAck, self.peer_id, bytes)
                            .with_timestamp(self.time_source.now())
                            .with_recipient(peer);
                    self.send_secure(peer, &inner).await;
                }
            }
            MeshCommand::SendReceipt { peer, receipt } => {
                if let Ok(bytes) = payload::encode(&receipt) {
                    let inner =
                        BitchatPacket::new(MessageType::ReadReceipt, self.peer_id, bytes)
                            .with_timestamp(self.time_source.now())
                            .with_recipient(peer);
                    self.send_secure(peer, &inner).await;
                }
            }
            MeshCommand::SendFavorite { peer, is_favorite } => {
                let favorite = FavoritePayload {
                    is_favorite,
                    nostr_public_key: self.options.nostr_public_key.clone(),
                };
                if let Ok(bytes) = payload::encode(&favorite) {
                    let inner = BitchatPacket::new(MessageType::Favorite, self.peer_id, bytes)
                        .with_timestamp(self.time_source.now())
                        .with_recipient(peer);
                    self.send_secure(peer, &inner).await;
                }
            }
            MeshCommand::QueryOpenGroups { reply } => {
                let _ = reply.send(self.reassembler.open_groups());
            }
        }
    }

    // ------------------------------------------------------------------
    // Link events and inbound frames
    // ------------------------------------------------------------------

    async fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Up { link } => {
                debug!(%link, "link up");
                // Announce straight at the new neighbor; the periodic
                // broadcast will catch everyone else.
                if let Some(frame) = self.announce_frame() {
                    let _ = self.driver.send_frame(link, frame).await;
                }
            }
            LinkEvent::Down { link } => {
                if let Some(peer) = self.peers.link_down(link) {
                    debug!(%link, %peer, "link down");
                    let _ = self.events.send(ProtocolEvent::PeerDisconnected { peer });
                    self.refresh_snapshot();
                }
            }
            LinkEvent::Frame { link, bytes } => {
                self.on_frame(link, bytes).await;
            }
        }
    }

    async fn on_frame(&mut self, link: LinkId, bytes: Vec<u8>) {
        let packet = match wire::decode(&bytes) {
            Ok(packet) => packet,
            Err(err) => {
                debug!(%link, "dropping undecodable frame: {err}");
                return;
            }
        };

        if self.is_blocked_sender(packet.sender_id) {
            trace!(sender = %packet.sender_id, "dropping frame from blocked peer");
            return;
        }

        match self.router.route(&packet) {
            RouteDecision::Drop(reason) => {
                trace!(sender = %packet.sender_id, ?reason, "packet consumed");
            }
            RouteDecision::Deliver => {
                self.deliver(link, packet).await;
            }
            RouteDecision::Forward { ttl } => {
                self.forward(link, packet, ttl).await;
            }
            RouteDecision::DeliverAndForward { ttl } => {
                self.forward(link, packet.clone(), ttl).await;
                self.deliver(link, packet).await;
            }
        }
    }

    async fn forward(&mut self, origin: LinkId, mut packet: BitchatPacket, ttl: u8) {
        packet.ttl = Ttl::new(ttl);
        match wire::encode(&packet, true) {
            Ok(frame) => {
                let _ = self.driver.broadcast_frame(frame, Some(origin)).await;
            }
            Err(err) => debug!("re-encode for forwarding failed: {err}"),
        }
    }

    /// Dispatch a delivered packet, unwrapping fragments and Noise envelopes
    async fn deliver(&mut self, link: LinkId, packet: BitchatPacket) {
        let now = self.time_source.now();
        self.peers.touch(packet.sender_id, now);

        // (packet, arrived through an authenticated Noise envelope)
        let mut queue: VecDeque<(BitchatPacket, bool)> = VecDeque::new();
        queue.push_back((packet, false));

        while let Some((packet, via_noise)) = queue.pop_front() {
            match packet.message_type {
                MessageType::Fragment => match self.reassembler.insert(&packet) {
                    Ok(Some(original)) => queue.push_back((original, via_noise)),
                    Ok(None) => {}
                    Err(err) => debug!(sender = %packet.sender_id, "fragment dropped: {err}"),
                },
                MessageType::NoiseTransport => {
                    let peer = packet.sender_id;
                    match self.sessions.decrypt(peer, &packet.payload) {
                        Ok(plaintexts) => {
                            for plaintext in plaintexts {
                                match wire::decode(&plaintext) {
                                    Ok(inner) => queue.push_back((inner, true)),
                                    Err(err) => {
                                        debug!(%peer, "undecodable noise plaintext: {err}")
                                    }
                                }
                            }
                        }
                        Err(err) => {
                            warn!(%peer, "noise decrypt failed: {err}");
                            if !self.sessions.is_established(peer) {
                                // Fatal for the session; drop it now so
                                // cleanup does not report it twice.
                                self.sessions.remove(peer);
                                let _ = self.events.send(ProtocolEvent::SessionLost { peer });
                            }
                        }
                    }
                }
                MessageType::NoiseHandshakeInit => {
                    self.on_handshake_init(packet.sender_id, &packet.payload).await;
                }
                MessageType::NoiseHandshakeResp => {
                    self.on_handshake_resp(packet.sender_id, &packet.payload).await;
                }
                MessageType::Announce => {
                    self.on_announce(link, &packet).await;
                }
                MessageType::Message => {
                    self.on_public_message(&packet);
                }
                MessageType::PrivateMessage => {
                    self.on_private_message(&packet, via_noise);
                }
                MessageType::FileTransfer => {
                    self.on_file_transfer(&packet, via_noise);
                }
                MessageType::DeliveryAck => {
                    if let Ok(ack) = payload::decode::<AckPayload>(&packet.payload) {
                        let _ = self.events.send(ProtocolEvent::DeliveryAcked {
                            peer: packet.sender_id,
                            message_id: ack.message_id,
                        });
                    }
                }
                MessageType::ReadReceipt => {
                    if let Ok(receipt) = payload::decode::<ReceiptPayload>(&packet.payload) {
                        let _ = self.events.send(ProtocolEvent::ReadReceiptReceived {
                            peer: packet.sender_id,
                            message_id: receipt.message_id,
                            read_at: receipt.read_at,
                        });
                    }
                }
                MessageType::Favorite => {
                    if let Ok(favorite) = payload::decode::<FavoritePayload>(&packet.payload) {
                        let _ = self.events.send(ProtocolEvent::FavoriteChanged {
                            peer: packet.sender_id,
                            is_favorite: favorite.is_favorite,
                            nostr_public_key: favorite.nostr_public_key,
                        });
                    }
                }
                MessageType::Leave => {
                    let peer = packet.sender_id;
                    self.sessions.remove(peer);
                    if let Some(link) = self.peers.link_for(peer) {
                        self.peers.link_down(link);
                    }
                    let _ = self.events.send(ProtocolEvent::PeerDisconnected { peer });
                    self.refresh_snapshot();
                }
            }
        }
    }

    async fn on_announce(&mut self, link: LinkId, packet: &BitchatPacket) {
        let announce = match payload::decode::<AnnouncePayload>(&packet.payload) {
            Ok(announce) => announce,
            Err(err) => {
                debug!("undecodable announce: {err}");
                return;
            }
        };

        let fingerprint = fingerprint_of(&announce.noise_public_key);
        // The peer ID must be the fingerprint prefix of the announced key.
        if fingerprint.to_peer_id() != packet.sender_id {
            debug!(sender = %packet.sender_id, "announce key does not match peer id");
            return;
        }
        if self.blocked.contains(&fingerprint) {
            return;
        }

        let now = self.time_source.now();
        let is_new = self.peers.record_announce(
            packet.sender_id,
            announce.nickname.clone(),
            announce.noise_public_key,
            link,
            now,
        );

        if is_new {
            info!(peer = %packet.sender_id, nickname = %announce.nickname, "peer connected");
            let _ = self.events.send(ProtocolEvent::PeerConnected {
                peer: packet.sender_id,
                nickname: announce.nickname,
                fingerprint,
            });
        }
        self.refresh_snapshot();

        self.replay_store_forward(packet.sender_id, link).await;

        // A waiting private message means we want a session with this peer.
        if self.pending_private.contains_key(&packet.sender_id)
            && !self.sessions.is_established(packet.sender_id)
        {
            self.initiate_handshake(packet.sender_id).await;
        }
    }

    fn on_public_message(&mut self, packet: &BitchatPacket) {
        let content = match String::from_utf8(packet.payload.clone()) {
            Ok(content) => content,
            Err(_) => {
                debug!(sender = %packet.sender_id, "public message is not UTF-8");
                return;
            }
        };
        let nickname = self
            .peers
            .get(packet.sender_id)
            .map(|entry| entry.nickname.clone());
        let message = PublicMessage {
            message_id: format!(
                "{}-{:016x}",
                packet.sender_id,
                packet.timestamp.as_millis()
            ),
            sender: packet.sender_id,
            sender_nickname: nickname,
            content,
            timestamp: packet.timestamp,
        };
        let _ = self
            .events
            .send(ProtocolEvent::PublicMessageReceived(message));
    }

    fn on_private_message(&mut self, packet: &BitchatPacket, via_noise: bool) {
        if !via_noise {
            debug!(sender = %packet.sender_id, "dropping cleartext private message");
            return;
        }
        if let Ok(private) = payload::decode::<PrivatePayload>(&packet.payload) {
            let _ = self.events.send(ProtocolEvent::PrivateMessageReceived {
                peer: packet.sender_id,
                message_id: private.message_id,
                content: private.content,
            });
        }
    }

    fn on_file_transfer(&mut self, packet: &BitchatPacket, via_noise: bool) {
        if let Ok(file) = payload::decode::<FilePayload>(&packet.payload) {
            let sender_nickname = self
                .peers
                .get(packet.sender_id)
                .map(|entry| entry.nickname.clone())
                .unwrap_or_default();
            let _ = self.events.send(ProtocolEvent::FileTransferOffered {
                peer: packet.sender_id,
                sender_nickname,
                file_name: file.file_name,
                mime_type: file.mime_type,
                content: file.content,
                is_private: via_noise,
            });
        }
    }

    // ------------------------------------------------------------------
    // Noise handshakes and secure sends
    // ------------------------------------------------------------------

    async fn on_handshake_init(&mut self, peer: PeerId, message: &[u8]) {
        let remote_static = self.peers.get(peer).map(|entry| entry.static_key);
        match self.sessions.on_handshake_init(peer, message, remote_static) {
            Ok(outcome) => {
                if let Some(reply) = outcome.reply {
                    let packet = BitchatPacket::new(
                        MessageType::NoiseHandshakeResp,
                        self.peer_id,
                        reply,
                    )
                    .with_timestamp(self.time_source.now())
                    .with_recipient(peer);
                    self.send_packet_to_peer(peer, &packet).await;
                }
                if outcome.established {
                    self.on_session_established(peer).await;
                }
            }
            Err(err) => debug!(%peer, "handshake init failed: {err}"),
        }
    }

    async fn on_handshake_resp(&mut self, peer: PeerId, message: &[u8]) {
        match self.sessions.on_handshake_resp(peer, message) {
            Ok(outcome) => {
                if let Some(reply) = outcome.reply {
                    let packet = BitchatPacket::new(
                        MessageType::NoiseHandshakeInit,
                        self.peer_id,
                        reply,
                    )
                    .with_timestamp(self.time_source.now())
                    .with_recipient(peer);
                    self.send_packet_to_peer(peer, &packet).await;
                }
                if outcome.established {
                    self.on_session_established(peer).await;
                }
            }
            Err(err) => debug!(%peer, "handshake response failed: {err}"),
        }
    }

    async fn on_session_established(&mut self, peer: PeerId) {
        info!(%peer, "noise session established");
        let _ = self.events.send(ProtocolEvent::SessionEstablished { peer });
        self.flush_pending(peer).await;
    }

    async fn initiate_handshake(&mut self, peer: PeerId) {
        match self.sessions.initiate(peer) {
            Ok(Some(first)) => {
                let packet = BitchatPacket::new(
                    MessageType::NoiseHandshakeInit,
                    self.peer_id,
                    first,
                )
                .with_timestamp(self.time_source.now())
                .with_recipient(peer);
                self.send_packet_to_peer(peer, &packet).await;
            }
            Ok(None) => {}
            Err(err) => debug!(%peer, "handshake initiation failed: {err}"),
        }
    }

    async fn send_private(
        &mut self,
        peer: PeerId,
        content: String,
        recipient_nickname: String,
        message_id: Uuid,
    ) {
        let private = PrivatePayload {
            message_id,
            content,
            recipient_nickname,
        };
        let bytes = match payload::encode(&private) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("private payload encode failed: {err}");
                return;
            }
        };
        let inner = BitchatPacket::new(MessageType::PrivateMessage, self.peer_id, bytes)
            .with_timestamp(self.time_source.now())
            .with_recipient(peer);

        if self.sessions.is_established(peer) {
            self.send_secure(peer, &inner).await;
            return;
        }

        // Queue the plaintext until a session comes up, then handshake.
        let inner_frame = match wire::encode(&inner, false) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("inner packet encode failed: {err}");
                return;
            }
        };
        let deadline =
            self.time_source.now() + self.options.mesh.private_send_ttl.as_millis() as u64;
        self.pending_private
            .entry(peer)
            .or_default()
            .push(PendingPrivate {
                message_id,
                inner_frame,
                deadline,
            });
        self.initiate_handshake(peer).await;
    }

    /// Encrypt an inner packet to `peer` and send the Noise envelope
    async fn send_secure(&mut self, peer: PeerId, inner: &BitchatPacket) {
        let inner_frame = match wire::encode(inner, false) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("inner packet encode failed: {err}");
                return;
            }
        };
        self.send_secure_frame(peer, inner_frame).await;
    }

    async fn send_secure_frame(&mut self, peer: PeerId, inner_frame: Vec<u8>) {
        let ciphertext = match self.sessions.encrypt(peer, &inner_frame) {
            Ok(ciphertext) => ciphertext,
            Err(err) => {
                debug!(%peer, "encrypt failed, dropping secure frame: {err}");
                return;
            }
        };
        let packet = BitchatPacket::new(MessageType::NoiseTransport, self.peer_id, ciphertext)
            .with_timestamp(self.time_source.now())
            .with_recipient(peer);
        self.send_packet_to_peer(peer, &packet).await;
    }

    async fn flush_pending(&mut self, peer: PeerId) {
        let Some(pending) = self.pending_private.remove(&peer) else {
            return;
        };
        let now = self.time_source.now();
        for item in pending {
            if item.deadline < now {
                let _ = self.events.send(ProtocolEvent::MessageUnreachable {
                    peer,
                    message_id: item.message_id,
                });
                continue;
            }
            self.send_secure_frame(peer, item.inner_frame).await;
        }
    }

    // ------------------------------------------------------------------
    // Outbound frames
    // ------------------------------------------------------------------

    fn announce_frame(&self) -> Option<Vec<u8>> {
        let announce = AnnouncePayload {
            nickname: self.nickname.clone(),
            noise_public_key: self.sessions.local_public_key(),
        };
        let bytes = payload::encode(&announce).ok()?;
        let packet = BitchatPacket::new(MessageType::Announce, self.peer_id, bytes)
            .with_timestamp(self.time_source.now());
        wire::encode(&packet, true).ok()
    }

    async fn broadcast_announce(&mut self) {
        if let Some(frame) = self.announce_frame() {
            let _ = self.driver.broadcast_frame(frame, None).await;
        }
    }

    /// Encode, pad, fragment when oversize, and flood a packet
    async fn broadcast_packet(&mut self, packet: &BitchatPacket, except: Option<LinkId>) {
        let frame = match wire::encode(packet, true) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("encode failed: {err}");
                return;
            }
        };

        if frame.len() <= self.options.mesh.app_mtu {
            let _ = self.driver.broadcast_frame(frame, except).await;
            return;
        }

        match fragment_packet(packet, self.options.fragment.max_fragment_data) {
            Ok(fragments) => {
                for fragment in fragments {
                    if let Ok(frame) = wire::encode(&fragment, true) {
                        let _ = self.driver.broadcast_frame(frame, except).await;
                    }
                }
            }
            Err(err) => warn!("fragmentation failed: {err}"),
        }
    }

    /// Send a directed packet on the peer's link, flooding as fallback
    async fn send_packet_to_peer(&mut self, peer: PeerId, packet: &BitchatPacket) {
        let frame = match wire::encode(packet, true) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("encode failed: {err}");
                return;
            }
        };

        let frames = if frame.len() > self.options.mesh.app_mtu {
            match fragment_packet(packet, self.options.fragment.max_fragment_data) {
                Ok(fragments) => fragments
                    .iter()
                    .filter_map(|fragment| wire::encode(fragment, true).ok())
                    .collect(),
                Err(err) => {
                    warn!("fragmentation failed: {err}");
                    return;
                }
            }
        } else {
            vec![frame]
        };

        match self.peers.link_for(peer) {
            Some(link) => {
                for frame in frames {
                    if let Err(err) = self.driver.send_frame(link, frame).await {
                        debug!(%peer, "direct write failed: {err}");
                    }
                }
            }
            None => {
                // Not directly connected: cache for reconnection and flood
                // in case the mesh can carry it.
                let now = self.time_source.now();
                let cache = self.store_forward.entry(peer).or_default();
                for frame in &frames {
                    if cache.len() >= self.options.mesh.store_forward_capacity {
                        cache.pop_front();
                    }
                    cache.push_back((now, frame.clone()));
                }
                for frame in frames {
                    let _ = self.driver.broadcast_frame(frame, None).await;
                }
            }
        }
    }

    async fn replay_store_forward(&mut self, peer: PeerId, link: LinkId) {
        let Some(cached) = self.store_forward.remove(&peer) else {
            return;
        };
        let now = self.time_source.now();
        let ttl = self.options.mesh.store_forward_ttl.as_millis() as u64;
        for (stored_at, frame) in cached {
            if now.millis_since(stored_at) > ttl {
                continue;
            }
            let _ = self.driver.send_frame(link, frame).await;
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    async fn maintain(&mut self) {
        let now = self.time_source.now();

        self.reassembler.reap(now);

        for (peer, reason) in self.sessions.cleanup() {
            match reason {
                SessionEndReason::HandshakeTimeout => {
                    debug!(%peer, "handshake timed out");
                    // Queued plaintexts stay until their own deadline; a
                    // later announce retries the handshake.
                }
                SessionEndReason::AuthenticationFailed
                | SessionEndReason::IdleTimeout
                | SessionEndReason::PeerLeft
                | SessionEndReason::Cleared => {
                    let _ = self.events.send(ProtocolEvent::SessionLost { peer });
                }
            }
        }

        // Expire private messages past their deadline.
        let mut expired = Vec::new();
        for (peer, queue) in self.pending_private.iter_mut() {
            queue.retain(|item| {
                if item.deadline < now {
                    expired.push((*peer, item.message_id));
                    false
                } else {
                    true
                }
            });
        }
        self.pending_private.retain(|_, queue| !queue.is_empty());
        for (peer, message_id) in expired {
            let _ = self
                .events
                .send(ProtocolEvent::MessageUnreachable { peer, message_id });
        }

        // Flush queues whose session quietly became ready.
        let ready: Vec<PeerId> = self
            .pending_private
            .keys()
            .copied()
            .filter(|peer| self.sessions.is_established(*peer))
            .collect();
        for peer in ready {
            self.flush_pending(peer).await;
        }

        // Age out store-and-forward caches.
        let ttl = self.options.mesh.store_forward_ttl.as_millis() as u64;
        for cache in self.store_forward.values_mut() {
            cache.retain(|(stored_at, _)| now.millis_since(*stored_at) <= ttl);
        }
        self.store_forward.retain(|_, cache| !cache.is_empty());

        self.refresh_snapshot();
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn is_blocked_sender(&self, sender: PeerId) -> bool {
        self.peers
            .get(sender)
            .map(|entry| self.blocked.contains(&entry.fingerprint()))
            .unwrap_or(false)
    }

    fn refresh_snapshot(&self) {
        let now = self.time_source.now();
        let window = self.options.mesh.reachability_window.as_millis() as u64;
        let mut snapshot = self.snapshot.write().expect("snapshot lock");
        snapshot.connected = self.peers.connected_peers().into_iter().collect();
        snapshot.reachable = self.peers.reachable_peers(now, window).into_iter().collect();
        snapshot.nickname = self.nickname.clone();
    }
}
