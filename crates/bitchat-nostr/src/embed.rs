//! Embedding mesh packets in relay event content
//!
//! The binary wire encoding rides as base64 behind a version prefix so
//! receivers can tell BitChat traffic from ordinary DMs.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use bitchat_core::{wire, BitchatPacket};

use crate::error::RelayError;

/// Content prefix marking an embedded BitChat packet
pub const EMBED_PREFIX: &str = "bitchat1:";

/// Encode a packet for relay transport
pub fn embed_packet(packet: &BitchatPacket) -> Result<String, RelayError> {
    let bytes = wire::encode(packet, false)
        .map_err(|err| RelayError::MalformedEmbedding(err.to_string()))?;
    Ok(format!("{EMBED_PREFIX}{}", BASE64.encode(bytes)))
}

/// Decode relay content back into a packet
///
/// Returns `None` for content without the BitChat prefix, so foreign DMs
/// pass through untouched.
pub fn extract_packet(content: &str) -> Result<Option<BitchatPacket>, RelayError> {
    let Some(encoded) = content.strip_prefix(EMBED_PREFIX) else {
        return Ok(None);
    };
    let bytes = BASE64
        .decode(encoded)
        .map_err(|err| RelayError::MalformedEmbedding(format!("invalid base64: {err}")))?;
    let packet = wire::decode(&bytes)
        .map_err(|err| RelayError::MalformedEmbedding(err.to_string()))?;
    Ok(Some(packet))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use bitchat_core::types::{PeerId, Timestamp};
    use bitchat_core::MessageType;

    #[test]
    fn test_embed_roundtrip() {
        let packet = BitchatPacket::new(
            MessageType::PrivateMessage,
            PeerId::new([3; 8]),
            b"wrapped".to_vec(),
        )
        .with_timestamp(Timestamp::from_millis(77))
        .with_recipient(PeerId::new([4; 8]));

        let content = embed_packet(&packet).unwrap();
        assert!(content.starts_with(EMBED_PREFIX));
        let extracted = extract_packet(&content).unwrap().unwrap();
        assert_eq!(extracted, packet);
    }

    #[test]
    fn test_foreign_content_passes_through() {
        assert!(extract_packet("gm nostr").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_embedding_rejected() {
        assert!(extract_packet("bitchat1:!!!not-base64!!!").is_err());
        let bogus = format!("{EMBED_PREFIX}{}", base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3]));
        assert!(extract_packet(&bogus).is_err());
    }
}
