//! Relay transport errors

/// Errors raised by the relay transport
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay client not started")]
    NotStarted,
    #[error("invalid relay url: {url}")]
    InvalidRelayUrl { url: String },
    #[error("no nostr key known for peer")]
    NoKeyForPeer,
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("event rejected by relay: {0}")]
    PublishFailed(String),
    #[error("malformed embedded packet: {0}")]
    MalformedEmbedding(String),
}

impl From<RelayError> for bitchat_core::BitchatError {
    fn from(err: RelayError) -> Self {
        bitchat_core::BitchatError::Channel {
            message: err.to_string(),
        }
    }
}
