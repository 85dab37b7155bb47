//! Error types for the BitChat core engine
//!
//! Decoding errors on inbound frames are non-fatal: the offending frame is
//! dropped and logged by the caller. Cryptographic failures on an established
//! session are fatal for that session only.

use crate::types::PeerId;

// ----------------------------------------------------------------------------
// Packet Errors
// ----------------------------------------------------------------------------

/// Wire-format and fragmentation error types
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("truncated header (need {needed} bytes, got {got})")]
    TruncatedHeader { needed: usize, got: usize },
    #[error("truncated payload (need {needed} bytes, got {got})")]
    TruncatedPayload { needed: usize, got: usize },
    #[error("unknown protocol version {version}")]
    UnknownVersion { version: u8 },
    #[error("unsupported message type 0x{value:02x}")]
    UnsupportedType { value: u8 },
    #[error("payload too large (max {max}, got {actual})")]
    PayloadTooLarge { max: usize, actual: usize },
    #[error("malformed fragment: {reason}")]
    MalformedFragment { reason: &'static str },
    #[error("fragment group expired before completion")]
    FragmentTimeout,
    #[error("malformed packet: {reason}")]
    Malformed { reason: String },
}

// ----------------------------------------------------------------------------
// Noise Errors
// ----------------------------------------------------------------------------

/// Secure-channel error types
#[derive(Debug, thiserror::Error)]
pub enum NoiseError {
    #[error("handshake with {peer} timed out")]
    HandshakeTimeout { peer: PeerId },
    #[error("handshake failed: {reason}")]
    HandshakeFailed { reason: String },
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("replayed or out-of-window nonce {nonce}")]
    ReplayDetected { nonce: u64 },
    #[error("nonce {nonce} is further ahead than the replay window allows")]
    NonceGapExceeded { nonce: u64 },
    #[error("invalid key length (expected {expected}, got {got})")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("invalid nonce length (expected {expected}, got {got})")]
    InvalidNonceLength { expected: usize, got: usize },
    #[error("no established session with {peer}")]
    SessionNotEstablished { peer: PeerId },
    #[error("noise protocol error: {0}")]
    Snow(#[from] snow::Error),
}

// ----------------------------------------------------------------------------
// Transport Errors
// ----------------------------------------------------------------------------

/// Transport and routing error types
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport {name} is not available")]
    TransportUnavailable { name: &'static str },
    #[error("peer {peer} is unreachable")]
    Unreachable { peer: PeerId },
    #[error("peer {peer} not found")]
    PeerNotFound { peer: PeerId },
    #[error("send failed: write queue full (depth {depth})")]
    SendBufferFull { depth: usize },
    #[error("peer is blocked")]
    Blocked,
    #[error("link closed")]
    LinkClosed,
    #[error("network I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ----------------------------------------------------------------------------
// Unified Error
// ----------------------------------------------------------------------------

/// Core error type for the BitChat engine
#[derive(Debug, thiserror::Error)]
pub enum BitchatError {
    #[error("invalid packet: {0}")]
    Packet(#[from] PacketError),

    #[error("noise error: {0}")]
    Noise(#[from] NoiseError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("channel error: {message}")]
    Channel { message: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },
}

impl From<snow::Error> for BitchatError {
    fn from(err: snow::Error) -> Self {
        BitchatError::Noise(NoiseError::Snow(err))
    }
}

impl BitchatError {
    /// Create a generic malformed-packet error
    pub fn invalid_packet<T: Into<String>>(reason: T) -> Self {
        BitchatError::Packet(PacketError::Malformed {
            reason: reason.into(),
        })
    }

    /// Create a channel error with a message
    pub fn channel<T: Into<String>>(message: T) -> Self {
        BitchatError::Channel {
            message: message.into(),
        }
    }

    /// Create a configuration error with a reason
    pub fn config<T: Into<String>>(reason: T) -> Self {
        BitchatError::Configuration {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = core::result::Result<T, BitchatError>;
