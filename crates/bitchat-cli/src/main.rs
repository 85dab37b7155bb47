//! Headless BitChat node
//!
//! Wires the BLE mesh transport and the Nostr relay fallback under the
//! runtime, then prints protocol events until interrupted. The chat UI
//! proper is a separate application; this binary exists to run a node and
//! to smoke-test the stack end to end.

mod config;
mod store;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bitchat_core::event::{event_channel, ProtocolEvent};
use bitchat_core::identity::load_or_generate;
use bitchat_mesh::ble::{BleCentral, NoopAdvertiser};
use bitchat_mesh::{MeshOptions, MeshTransport};
use bitchat_nostr::NostrTransport;
use bitchat_runtime::pipeline::NullSink;
use bitchat_runtime::{
    BitchatRuntime, ChannelKind, FavoritesStore, MessageRouter, PendingFileManager,
    PublicPipeline,
};
use bitchat_core::types::SystemTimeSource;
use bitchat_core::Transport;
use bitchat_runtime::pending::NullFileSink;

use config::{default_data_dir, NodeConfig};
use store::FileIdentityStore;

// ----------------------------------------------------------------------------
// Arguments
// ----------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(name = "bitchat", about = "BitChat mesh node")]
struct Args {
    /// Nickname announced to the mesh
    #[arg(short, long)]
    nickname: Option<String>,

    /// Config file path
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Data directory for identity keys
    #[arg(long)]
    data_dir: Option<std::path::PathBuf>,

    /// Additional relay URL (repeatable)
    #[arg(long = "relay")]
    relays: Vec<String>,

    /// Disable the Nostr relay fallback
    #[arg(long)]
    no_relay: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

// ----------------------------------------------------------------------------
// Entry Point
// ----------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let data_dir = args.data_dir.unwrap_or_else(default_data_dir);
    let config_path = args
        .config
        .unwrap_or_else(|| data_dir.join("bitchat.toml"));
    let mut node_config = NodeConfig::load(&config_path)?;
    if let Some(nickname) = args.nickname {
        node_config.nickname = Some(nickname);
    }
    for relay in args.relays {
        node_config.relay.relay_urls.push(relay);
    }
    let nickname = node_config
        .nickname
        .clone()
        .unwrap_or_else(|| "anonymous".to_string());

    // Identity: stable static key under the data directory.
    let identity_store = FileIdentityStore::new(data_dir.clone());
    let identity = load_or_generate(&identity_store).context("loading identity")?;
    info!(peer_id = %identity.peer_id(), fingerprint = %identity.fingerprint(), "identity loaded");

    let time_source = SystemTimeSource;
    let (events_tx, events_rx) = event_channel();

    // Relay keys and favorites-backed directory.
    let favorites = Arc::new(FavoritesStore::new());
    let nostr_keys = nostr_sdk::Keys::generate();

    // Mesh transport over the BLE central driver.
    let mut mesh_options = MeshOptions::new(nickname);
    mesh_options.mesh = node_config.mesh.clone();
    mesh_options.fragment = node_config.fragment.clone();
    mesh_options.dedup = node_config.dedup.clone();
    mesh_options.noise = node_config.noise.clone();
    mesh_options.nostr_public_key = Some(nostr_keys.public_key().to_string());

    let driver = Arc::new(BleCentral::new(Arc::new(NoopAdvertiser)));
    let mesh = MeshTransport::spawn(
        identity.into_keypair(),
        mesh_options,
        driver,
        events_tx.clone(),
        time_source,
    );

    // Relay fallback, reachable wherever favorites know a key.
    let mut transports: Vec<Arc<dyn Transport>> = vec![Arc::new(mesh.clone())];
    let relay = if args.no_relay {
        None
    } else {
        let relay = Arc::new(NostrTransport::new(
            nostr_keys,
            mesh.my_peer_id(),
            node_config.relay.clone(),
            favorites.clone(),
            events_tx.clone(),
        ));
        relay.start().await.context("starting relay transport")?;
        transports.push(relay.clone());
        Some(relay)
    };

    // Runtime assembly.
    let router = Arc::new(MessageRouter::new(
        transports,
        events_tx.clone(),
        time_source,
        node_config.mesh.private_send_ttl,
    ));
    let pipeline = Arc::new(PublicPipeline::new(
        node_config.pipeline.clone(),
        ChannelKind::Mesh,
        Arc::new(NullSink),
        time_source,
    ));
    let pending = Arc::new(PendingFileManager::new(
        node_config.pending_files.clone(),
        Arc::new(NullFileSink),
        time_source,
    ));

    let mut runtime = BitchatRuntime::new(router, pipeline, pending, favorites, Arc::new(mesh));
    let mut app_events = runtime.start(events_rx);

    info!("node running, ctrl-c to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            event = app_events.recv() => {
                match event {
                    Some(event) => print_event(&event),
                    None => break,
                }
            }
        }
    }

    runtime.stop();
    if let Some(relay) = relay {
        let _ = relay.stop().await;
    }
    Ok(())
}

/// Human-readable event log lines
fn print_event(event: &ProtocolEvent) {
    match event {
        ProtocolEvent::PeerConnected { peer, nickname, .. } => {
            println!("* {nickname} ({peer}) joined the mesh");
        }
        ProtocolEvent::PeerDisconnected { peer } => {
            println!("* {peer} left");
        }
        ProtocolEvent::PublicMessageReceived(message) => {
            let from = message
                .sender_nickname
                .clone()
                .unwrap_or_else(|| message.sender.to_string());
            println!("<{from}> {}", message.content);
        }
        ProtocolEvent::PrivateMessageReceived { peer, content, .. } => {
            println!("[dm {peer}] {content}");
        }
        ProtocolEvent::FileTransferOffered {
            peer,
            file_name,
            content,
            ..
        } => {
            println!(
                "* {peer} offers a file {} ({} bytes)",
                file_name.as_deref().unwrap_or("(unnamed)"),
                content.len()
            );
        }
        ProtocolEvent::DeliveryAcked { peer, message_id } => {
            println!("* {peer} received {message_id}");
        }
        ProtocolEvent::ReadReceiptReceived { peer, message_id, .. } => {
            println!("* {peer} read {message_id}");
        }
        ProtocolEvent::SessionEstablished { peer } => {
            println!("* secure channel with {peer}");
        }
        ProtocolEvent::SessionLost { peer } => {
            println!("* secure channel with {peer} lost");
        }
        ProtocolEvent::MessageUnreachable { peer, message_id } => {
            println!("* could not deliver {message_id} to {peer}");
        }
        ProtocolEvent::FavoriteChanged { peer, is_favorite, .. } => {
            let verb = if *is_favorite { "favorited" } else { "unfavorited" };
            println!("* {peer} {verb} you");
        }
    }
}
