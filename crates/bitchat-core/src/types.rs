//! Core identifier and time types for the BitChat protocol
//!
//! Newtype wrappers keep the 8-byte peer ID, the 32-byte key fingerprint, and
//! the millisecond timestamps from being confused with one another on the way
//! through the codec and session layers.

use core::fmt;
use core::ops::{Add, Sub};
use core::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Peer Identifier
// ----------------------------------------------------------------------------

/// Unique identifier for a peer, the first 8 bytes of the identity fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 8]);

impl PeerId {
    /// The all-zero broadcast address
    pub const BROADCAST: Self = Self([0u8; 8]);

    /// Create a new PeerId from 8 bytes
    pub const fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Create a PeerId from the leading bytes of a longer identifier
    pub fn from_prefix(bytes: &[u8]) -> Self {
        let mut id = [0u8; 8];
        let len = core::cmp::min(bytes.len(), 8);
        id[..len].copy_from_slice(&bytes[..len]);
        Self(id)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// True for the all-zero broadcast address
    pub fn is_broadcast(&self) -> bool {
        self.0 == [0u8; 8]
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for PeerId {
    type Err = crate::BitchatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let clean = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(clean)
            .map_err(|_| crate::BitchatError::invalid_packet("invalid hex in PeerId"))?;
        if bytes.len() != 8 {
            return Err(crate::BitchatError::invalid_packet(
                "PeerId must be exactly 8 bytes",
            ));
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&bytes);
        Ok(Self(id))
    }
}

// ----------------------------------------------------------------------------
// Fingerprint
// ----------------------------------------------------------------------------

/// SHA-256 fingerprint of a peer's static Noise public key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Create a new fingerprint from 32 bytes
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Derive the short peer ID (first 8 bytes of the fingerprint)
    pub fn to_peer_id(&self) -> PeerId {
        PeerId::from_prefix(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for Fingerprint {
    type Err = crate::BitchatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let clean = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(clean)
            .map_err(|_| crate::BitchatError::invalid_packet("invalid hex in Fingerprint"))?;
        if bytes.len() != 32 {
            return Err(crate::BitchatError::invalid_packet(
                "Fingerprint must be exactly 32 bytes",
            ));
        }
        let mut fp = [0u8; 32];
        fp.copy_from_slice(&bytes);
        Ok(Self(fp))
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Milliseconds since the Unix epoch, as stamped by the sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create a timestamp from raw milliseconds
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Get the raw milliseconds
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Milliseconds elapsed since `earlier` (saturating)
    pub fn millis_since(&self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<u64> for Timestamp {
    type Output = Timestamp;

    fn add(self, millis: u64) -> Timestamp {
        Timestamp(self.0.saturating_add(millis))
    }
}

impl Sub for Timestamp {
    type Output = u64;

    fn sub(self, other: Timestamp) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

// ----------------------------------------------------------------------------
// Time-to-Live (TTL)
// ----------------------------------------------------------------------------

/// Remaining forwarding hops for a mesh packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ttl(u8);

impl Ttl {
    /// Default TTL for freshly originated packets
    pub const DEFAULT: Self = Self(7);

    /// Create a TTL from a raw hop count
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    /// Get the raw value
    pub fn value(&self) -> u8 {
        self.0
    }

    /// Decrement by one hop, returning None when exhausted
    pub fn decrement(self) -> Option<Self> {
        if self.0 > 0 {
            Some(Self(self.0 - 1))
        } else {
            None
        }
    }
}

impl Default for Ttl {
    fn default() -> Self {
        Self::DEFAULT
    }
}

// ----------------------------------------------------------------------------
// Time Source
// ----------------------------------------------------------------------------

/// Source of current time for time-dependent protocol state
///
/// Dedup windows, reassembly expiry, session timeouts, outbox deadlines and
/// pending-file expiration all read the clock through this trait so tests can
/// drive virtual time deterministically.
pub trait TimeSource: Send + Sync {
    /// Get the current timestamp
    fn now(&self) -> Timestamp;
}

/// Wall-clock time source for production use
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Manually advanced clock for deterministic tests
#[derive(Debug, Clone, Default)]
pub struct ManualTimeSource {
    millis: Arc<AtomicU64>,
}

impl ManualTimeSource {
    /// Create a clock starting at the given millisecond value
    pub fn starting_at(millis: u64) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(millis)),
        }
    }

    /// Advance the clock by `millis`
    pub fn advance(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }

    /// Set the clock to an absolute value
    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.millis.load(Ordering::SeqCst))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_display_roundtrip() {
        let id = PeerId::new([0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
        assert_eq!(id.to_string(), "1122334455667788");
        assert_eq!("1122334455667788".parse::<PeerId>().unwrap(), id);
    }

    #[test]
    fn test_peer_id_broadcast() {
        assert!(PeerId::BROADCAST.is_broadcast());
        assert!(!PeerId::new([1; 8]).is_broadcast());
    }

    #[test]
    fn test_peer_id_rejects_bad_hex() {
        assert!("112233".parse::<PeerId>().is_err());
        assert!("zzzzzzzzzzzzzzzz".parse::<PeerId>().is_err());
    }

    #[test]
    fn test_fingerprint_to_peer_id() {
        let fp = Fingerprint::new([0xAB; 32]);
        assert_eq!(fp.to_peer_id(), PeerId::new([0xAB; 8]));
        assert_eq!(fp.to_string().len(), 64);
    }

    #[test]
    fn test_ttl_decrement() {
        let mut ttl = Ttl::new(2);
        ttl = ttl.decrement().unwrap();
        assert_eq!(ttl.value(), 1);
        ttl = ttl.decrement().unwrap();
        assert_eq!(ttl.value(), 0);
        assert!(ttl.decrement().is_none());
    }

    #[test]
    fn test_manual_time_source() {
        let clock = ManualTimeSource::starting_at(1_000);
        assert_eq!(clock.now().as_millis(), 1_000);
        clock.advance(500);
        assert_eq!(clock.now().as_millis(), 1_500);

        // Clones share the same underlying clock.
        let other = clock.clone();
        other.advance(500);
        assert_eq!(clock.now().as_millis(), 2_000);
    }
}
