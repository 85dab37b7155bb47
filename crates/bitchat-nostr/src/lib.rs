//! Nostr relay fallback transport
//!
//! When a peer is out of radio range but has shared its Nostr public key
//! (mutual favorites), private traffic falls back to public relays: the
//! mesh packet is embedded in an encrypted, gift-wrapped ephemeral DM
//! addressed to the peer's long-term key. Inbound gift wraps unwrap to
//! packets and surface through the same event plane as mesh traffic.

pub mod config;
pub mod embed;
pub mod error;
pub mod giftwrap;
pub mod transport;

pub use config::RelayConfig;
pub use error::RelayError;
pub use transport::{NostrDirectory, NostrTransport};
