//! Relay transport configuration

use serde::{Deserialize, Serialize};

/// Relay endpoints and event parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Relay websocket URLs
    pub relay_urls: Vec<String>,
    /// Largest embedded packet accepted, pre-wrapping
    pub max_packet_size: usize,
    /// Gift wrap expiration window in seconds (randomized up to this)
    pub expiration_seconds: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            relay_urls: vec![
                "wss://relay.damus.io".into(),
                "wss://nos.lol".into(),
                "wss://relay.primal.net".into(),
            ],
            max_packet_size: 64 * 1024,
            expiration_seconds: 3600,
        }
    }
}
