//! Configuration for the core engine and its transports
//!
//! Every tunable carries the protocol default; applications override fields
//! through the CLI's TOML layer.

use core::time::Duration;

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Fragmentation
// ----------------------------------------------------------------------------

/// Fragmenter and reassembler tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentConfig {
    /// Maximum data bytes carried per fragment (after the fragment header)
    pub max_fragment_data: usize,
    /// How long an incomplete reassembly buffer may live
    #[serde(with = "duration_millis")]
    pub reassembly_timeout: Duration,
    /// Maximum concurrently open fragment groups
    pub max_groups: usize,
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            max_fragment_data: 400,
            reassembly_timeout: Duration::from_secs(30),
            max_groups: 64,
        }
    }
}

// ----------------------------------------------------------------------------
// Deduplication
// ----------------------------------------------------------------------------

/// Seen-packet cache tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Maximum tracked packet keys
    pub capacity: usize,
    /// Freshness window; older entries no longer count as seen
    #[serde(with = "duration_millis")]
    pub window: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            window: Duration::from_secs(60),
        }
    }
}

// ----------------------------------------------------------------------------
// Noise Sessions
// ----------------------------------------------------------------------------

/// Secure-channel tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoiseConfig {
    /// Sliding replay window size in nonces, per receive direction
    pub replay_window: u64,
    /// How many early (out-of-order) messages are buffered before surfacing
    pub reorder_budget: usize,
    /// Deadline for a handshake to complete
    #[serde(with = "duration_millis")]
    pub handshake_timeout: Duration,
    /// Idle time after which an established session is reaped
    #[serde(with = "duration_millis")]
    pub idle_timeout: Duration,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            replay_window: 1024,
            reorder_budget: 32,
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

// ----------------------------------------------------------------------------
// Mesh Transport
// ----------------------------------------------------------------------------

/// BLE mesh transport tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Effective application MTU after BLE overhead
    pub app_mtu: usize,
    /// Interval between announce heartbeats
    #[serde(with = "duration_millis")]
    pub announce_interval: Duration,
    /// Per-peer outbound write queue depth
    pub write_queue_depth: usize,
    /// How long a private send is retried before failing as unreachable
    #[serde(with = "duration_millis")]
    pub private_send_ttl: Duration,
    /// How recently a peer must have been seen to count as reachable
    #[serde(with = "duration_millis")]
    pub reachability_window: Duration,
    /// Initial reconnect backoff
    #[serde(with = "duration_millis")]
    pub backoff_initial: Duration,
    /// Reconnect backoff ceiling
    #[serde(with = "duration_millis")]
    pub backoff_max: Duration,
    /// Backoff jitter as a fraction of the delay
    pub backoff_jitter: f64,
    /// Packets cached for each recently-seen offline peer
    pub store_forward_capacity: usize,
    /// How long cached packets are kept for offline peers
    #[serde(with = "duration_millis")]
    pub store_forward_ttl: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            app_mtu: 512,
            announce_interval: Duration::from_secs(10),
            write_queue_depth: 128,
            private_send_ttl: Duration::from_secs(300),
            reachability_window: Duration::from_secs(30),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            backoff_jitter: 0.2,
            store_forward_capacity: 100,
            store_forward_ttl: Duration::from_secs(12 * 3600),
        }
    }
}

// ----------------------------------------------------------------------------
// Public Pipeline
// ----------------------------------------------------------------------------

/// Public-message pipeline tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Batching window collecting inbound public messages before a flush
    #[serde(with = "duration_millis")]
    pub batch_window: Duration,
    /// Window within which identical normalized content is a duplicate
    #[serde(with = "duration_millis")]
    pub dedup_window: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_window: Duration::from_millis(100),
            dedup_window: Duration::from_secs(30),
        }
    }
}

// ----------------------------------------------------------------------------
// Pending Files
// ----------------------------------------------------------------------------

/// Bounds for the in-memory hold of inbound file transfers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingFileConfig {
    /// Maximum queued transfers
    pub max_pending_count: usize,
    /// Maximum total content bytes across queued transfers
    pub max_total_bytes: usize,
    /// How long a transfer waits for user acceptance
    #[serde(with = "duration_millis")]
    pub expiration: Duration,
}

impl Default for PendingFileConfig {
    fn default() -> Self {
        Self {
            max_pending_count: 10,
            max_total_bytes: 5 * 1024 * 1024,
            expiration: Duration::from_secs(300),
        }
    }
}

// ----------------------------------------------------------------------------
// Serde Helpers
// ----------------------------------------------------------------------------

/// Durations serialize as integer milliseconds in config files
mod duration_millis {
    use core::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        assert_eq!(FragmentConfig::default().max_fragment_data, 400);
        assert_eq!(DedupConfig::default().capacity, 4096);
        assert_eq!(NoiseConfig::default().replay_window, 1024);
        assert_eq!(MeshConfig::default().write_queue_depth, 128);
        assert_eq!(PendingFileConfig::default().max_pending_count, 10);
        assert_eq!(
            PendingFileConfig::default().max_total_bytes,
            5 * 1024 * 1024
        );
    }

    #[test]
    fn test_duration_millis_roundtrip() {
        let config = PipelineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: PipelineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.batch_window, config.batch_window);
        assert_eq!(parsed.dedup_window, config.dedup_window);
    }
}
