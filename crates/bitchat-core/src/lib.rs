//! BitChat core transport and messaging engine
//!
//! This crate provides the protocol layer shared by every BitChat transport:
//! the binary packet codec, fragmentation and reassembly, Noise-XX secure
//! sessions with replay protection, duplicate suppression and TTL routing
//! decisions, and the application payload codecs carried inside packets.
//!
//! Transport implementations (BLE mesh, Nostr relay) and the message router
//! live in sibling crates and consume the types exported here.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod dedup;
pub mod errors;
pub mod event;
pub mod fragment;
pub mod identity;
pub mod noise;
pub mod packet;
pub mod payload;
pub mod transport;
pub mod types;
pub mod wire;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use errors::{BitchatError, NoiseError, PacketError, Result, TransportError};
pub use event::{ProtocolEvent, PublicMessage};
pub use packet::{BitchatPacket, MessageType, PROTOCOL_VERSION};
pub use transport::Transport;
pub use types::{Fingerprint, ManualTimeSource, PeerId, SystemTimeSource, TimeSource, Timestamp, Ttl};
